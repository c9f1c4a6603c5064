//! crates/agent/src/restart.rs
//!
//! Durable files at the install root: the restart marker that lets a
//! self-replacing command still get its reply after relaunch, the
//! update log that carries that reply's output, and the agent version
//! file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use protocol::CorrelationId;
use tracing::{debug, warn};

/// Agent version file name.
pub const VERSION_FILE: &str = "serclient.version";
/// Single-use restart marker file name.
pub const RESTART_MARKER_FILE: &str = "serclient.restart";
/// Captured output of the most recent update attempt.
pub const UPDATE_LOG_FILE: &str = "updateSoftware.log";

/// Well-known file locations under the install root.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    root: PathBuf,
}

impl InstallPaths {
    /// Creates the path set for an install root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The install root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current agent version from `serclient.version`; zero when the
    /// file is absent or malformed.
    #[must_use]
    pub fn agent_version(&self) -> f64 {
        modules::read_version_file(&self.root.join(VERSION_FILE))
    }

    /// Persists the correlation id of a command that is about to kill
    /// or replace the agent. Written before the child is spawned so
    /// the reply survives the restart.
    pub fn save_restart_marker(&self, correlation_id: CorrelationId) -> io::Result<()> {
        fs::write(self.root.join(RESTART_MARKER_FILE), correlation_id.as_str())
    }

    /// Reads and removes the restart marker. Consumed exactly once on
    /// startup; a marker with unusable contents is still removed.
    #[must_use]
    pub fn consume_restart_marker(&self) -> Option<CorrelationId> {
        let path = self.root.join(RESTART_MARKER_FILE);
        let text = fs::read_to_string(&path).ok()?;
        if let Err(error) = fs::remove_file(&path) {
            warn!(%error, "failed to remove restart marker");
        }
        match CorrelationId::parse(text.trim()) {
            Ok(id) => Some(id),
            Err(error) => {
                warn!(%error, "restart marker held an unusable correlation id");
                None
            }
        }
    }

    /// Removes a stale restart marker. A marker still present after a
    /// restart command finished means the restart did not happen.
    pub fn clear_restart_marker(&self) {
        match fs::remove_file(self.root.join(RESTART_MARKER_FILE)) {
            Ok(()) => debug!("cleared stale restart marker"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(%error, "failed to clear restart marker"),
        }
    }

    /// Reads and removes the update log, returning its contents
    /// (empty when absent).
    #[must_use]
    pub fn take_update_log(&self) -> String {
        let path = self.root.join(UPDATE_LOG_FILE);
        let Ok(text) = fs::read_to_string(&path) else {
            return String::new();
        };
        if let Err(error) = fs::remove_file(&path) {
            warn!(%error, "failed to remove update log");
        }
        text
    }
}
