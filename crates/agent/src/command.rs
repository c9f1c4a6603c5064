//! crates/agent/src/command.rs
//!
//! The logic behind an accepted COMMAND request.

use std::path::{Path, PathBuf};

use modules::{Module, ModuleRegistry};
use protocol::CorrelationId;
use tracing::debug;

/// A queued command: the raw command line, its tokenized arguments,
/// and the registry entry it resolved to (if any).
#[derive(Debug, Clone)]
pub struct Command {
    raw: String,
    correlation_id: CorrelationId,
    args: Vec<String>,
    module: Option<Module>,
    blob_path: Option<PathBuf>,
}

impl Command {
    /// Tokenizes `raw` and resolves its first token (basenamed)
    /// against the registry. An empty or untokenizable command line
    /// resolves to no module and will be answered with "Command not
    /// found" at dispatch time.
    #[must_use]
    pub fn resolve(
        raw: &str,
        correlation_id: CorrelationId,
        blob_path: Option<PathBuf>,
        registry: &ModuleRegistry,
    ) -> Self {
        let tokens = shlex::split(raw).unwrap_or_default();
        let (module, args) = match tokens.split_first() {
            None => {
                debug!(%correlation_id, raw, "command line did not tokenize");
                (None, Vec::new())
            }
            Some((first, rest)) => {
                let name = Path::new(first)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(first);
                (registry.resolve(name), rest.to_vec())
            }
        };
        Self {
            raw: raw.to_string(),
            correlation_id,
            args,
            module,
            blob_path,
        }
    }

    /// The command line exactly as the host sent it.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Correlation id of the originating request.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Arguments following the module name.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The resolved registry entry; `None` means "Command not found".
    #[must_use]
    pub const fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }

    /// Path to the decoded `<binaryData>` temp file, when present.
    #[must_use]
    pub const fn blob_path(&self) -> Option<&PathBuf> {
        self.blob_path.as_ref()
    }

    /// Whether the module demands exclusive execution. Unknown
    /// commands are never blocking.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.module.as_ref().is_some_and(Module::is_blocking)
    }

    /// Whether executing this command is expected to kill or replace
    /// the agent itself.
    #[must_use]
    pub fn is_self_mutating(&self) -> bool {
        self.raw == "restart" || self.is_update_software()
    }

    /// Whether this is an `updateSoftware` invocation, whose output is
    /// delivered through the update log file.
    #[must_use]
    pub fn is_update_software(&self) -> bool {
        self.raw.starts_with("updateSoftware")
    }
}
