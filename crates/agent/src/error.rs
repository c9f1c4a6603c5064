//! crates/agent/src/error.rs
//!
//! Top-level agent errors.
//!
//! Only startup problems surface here: a bad configuration value, a
//! log sink that cannot be installed, or a serial device that will
//! not open. Once the dispatcher is running, command-level failures
//! are reported to the host as RESPONSE packets instead of bubbling
//! up as `Err`.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Fatal agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A configuration value was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Installing the log pipeline failed.
    #[error("logging error: {0}")]
    Logging(#[from] logging::LoggingError),
    /// The serial device could not be opened or configured.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// The control link failed while dispatching.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
