//! crates/agent/src/config.rs
//!
//! The resolved configuration record.
//!
//! The agent does not parse configuration files; whatever launches it
//! (service wrapper, init script, operator shell) resolves its sources
//! into command-line arguments, and those become an [`AgentConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use logging::LogSettings;
use thiserror::Error;

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Default per-command execution timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(40);

/// Built-in timeout override for `updateSoftware`, which replaces the
/// agent's own files and needs headroom beyond the default.
pub const UPDATE_SOFTWARE_TIMEOUT: Duration = Duration::from_secs(90);

/// Rejected command-line/configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Byte size outside 5..=8.
    #[error("unsupported byte size {0}, expected 5, 6, 7 or 8")]
    ByteSize(u8),
    /// Parity letter the serial stack cannot express.
    #[error("unsupported parity {0:?}, expected N, E or O (mark/space parity is not available)")]
    Parity(String),
    /// Stop bit count the serial stack cannot express.
    #[error("unsupported stop bits {0:?}, expected 1 or 2 (1.5 stop bits is not available)")]
    StopBits(String),
}

/// Parity configured on the serial device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl Parity {
    /// Parses the single-letter form used by the host tooling.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        match text {
            "N" | "n" => Ok(Self::None),
            "E" | "e" => Ok(Self::Even),
            "O" | "o" => Ok(Self::Odd),
            other => Err(ConfigError::Parity(other.to_string())),
        }
    }
}

/// Stop bits configured on the serial device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

impl StopBits {
    /// Parses the numeric form used by the host tooling.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        match text {
            "1" => Ok(Self::One),
            "2" => Ok(Self::Two),
            other => Err(ConfigError::StopBits(other.to_string())),
        }
    }
}

/// Serial device parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyS0`.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits per character, 5..=8.
    pub data_bits: u8,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialSettings {
    /// Validates field combinations that clap cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::ByteSize(self.data_bits));
        }
        Ok(())
    }
}

const fn default_port() -> &'static str {
    if cfg!(windows) { "COM1" } else { "/dev/ttyS0" }
}

/// Everything the dispatcher and supervisors need to know.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Serial device parameters.
    pub serial: SerialSettings,
    /// Install root holding the tier directories and marker files.
    pub root: PathBuf,
    /// Timeout applied to commands without an override.
    pub default_command_timeout: Duration,
    /// Per-alias timeout overrides.
    pub timeout_overrides: HashMap<String, Duration>,
    /// Log sink configuration.
    pub log: LogSettings,
}

impl AgentConfig {
    /// Creates a configuration with shipping defaults rooted at
    /// `root`. The override table is pre-seeded for `updateSoftware`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut timeout_overrides = HashMap::new();
        timeout_overrides.insert("updateSoftware".to_string(), UPDATE_SOFTWARE_TIMEOUT);
        Self {
            serial: SerialSettings::default(),
            root: root.into(),
            default_command_timeout: DEFAULT_COMMAND_TIMEOUT,
            timeout_overrides,
            log: LogSettings::default(),
        }
    }

    /// Execution timeout for the module known to the host as `alias`.
    #[must_use]
    pub fn command_timeout(&self, alias: &str) -> Duration {
        self.timeout_overrides
            .get(alias)
            .copied()
            .unwrap_or(self.default_command_timeout)
    }
}
