#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Log sink selection for the agent.
//!
//! The agent runs in contexts where stdout may not exist (spawned by
//! a service wrapper in a guest with no console), so the sink is part
//! of the configuration record: stdout by default, a log file, a
//! remote UDP syslog collector, or any combination of file and
//! syslog. Everything funnels through one `tracing` subscriber
//! installed at startup.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default UDP port for remote syslog collectors.
const SYSLOG_PORT: u16 = 514;

/// Priority tag prepended to each syslog datagram (facility `user`,
/// severity `info`).
const SYSLOG_PRI: &str = "<14>";

/// Errors configuring or installing the log pipeline.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log level name is unknown.
    #[error("unknown log level {0:?}")]
    Level(String),
    /// The syslog address did not resolve to a UDP endpoint.
    #[error("invalid syslog address {address:?}: {reason}")]
    SyslogAddress {
        /// Address as configured.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Opening the log file or binding the syslog socket failed.
    #[error("log sink I/O error: {0}")]
    Io(#[from] io::Error),
    /// A subscriber was already installed.
    #[error("log subscriber already installed")]
    AlreadyInstalled,
}

/// Resolved logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Minimum level to emit.
    pub level: LogLevel,
    /// Log file path; `None` logs to stdout.
    pub file: Option<PathBuf>,
    /// Remote syslog collector, `host[:port]`, in addition to the
    /// primary sink.
    pub syslog: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            file: None,
            syslog: None,
        }
    }
}

/// Severity threshold accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Operational messages.
    Info,
    /// Protocol-level detail (the shipping default).
    Debug,
    /// Byte-level detail.
    Trace,
}

impl LogLevel {
    const fn as_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(LoggingError::Level(other.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_level())
    }
}

/// Parses a `host[:port]` syslog address, defaulting the port.
pub fn resolve_syslog_address(address: &str) -> Result<SocketAddr, LoggingError> {
    if address.contains('/') {
        return Err(LoggingError::SyslogAddress {
            address: address.to_string(),
            reason: "local socket paths are not supported, use host[:port]".to_string(),
        });
    }
    let target = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{SYSLOG_PORT}")
    };
    target
        .to_socket_addrs()
        .map_err(|error| LoggingError::SyslogAddress {
            address: address.to_string(),
            reason: error.to_string(),
        })?
        .next()
        .ok_or_else(|| LoggingError::SyslogAddress {
            address: address.to_string(),
            reason: "no addresses resolved".to_string(),
        })
}

/// Installs the global subscriber described by `settings`.
///
/// Must be called once, before any other thread logs.
pub fn init(settings: &LogSettings) -> Result<(), LoggingError> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(settings.level.as_level().into())
        .from_env_lossy();

    let file_writer = match &settings.file {
        Some(path) => Some(SharedFile::open(path)?),
        None => None,
    };
    let stdout_layer = file_writer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(io::stdout));
    let file_layer = file_writer
        .map(|writer| tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer));
    let syslog_layer = match &settings.syslog {
        Some(address) => {
            let writer = SyslogSender::connect(resolve_syslog_address(address)?)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .without_time()
                    .with_writer(writer),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(syslog_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)
}

/// Append-mode log file shared by all subscriber layers.
#[derive(Clone)]
struct SharedFile(Arc<File>);

impl SharedFile {
    fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self(Arc::new(file)))
    }
}

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// One-datagram-per-record UDP syslog writer.
#[derive(Clone)]
struct SyslogSender {
    socket: Arc<UdpSocket>,
}

impl SyslogSender {
    fn connect(target: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(target)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }
}

impl Write for SyslogSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut datagram = Vec::with_capacity(SYSLOG_PRI.len() + buf.len());
        datagram.extend_from_slice(SYSLOG_PRI.as_bytes());
        // Strip the trailing newline; syslog datagrams are unframed.
        let body = buf.strip_suffix(b"\n").unwrap_or(buf);
        datagram.extend_from_slice(body);
        self.socket.send(&datagram)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SyslogSender {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
