//! crates/agent/src/run.rs
//!
//! Command-line surface and process entry point.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;
use protocol::body::build_command_body;
use protocol::framer::{Framer, FramerPoll};
use protocol::reassembly::Reassembler;
use protocol::{CorrelationId, Link, Packet, PacketKind};
use tracing::{error, info};

use crate::config::{AgentConfig, Parity, StopBits};
use crate::dispatcher::Dispatcher;
use crate::error::{AgentError, AgentResult};
use crate::link::SerialLink;

/// Execute commands received through the serial port.
#[derive(Debug, Parser)]
#[command(name = "serclient", version, about)]
struct Cli {
    /// Serial port device
    #[arg(long)]
    port: Option<String>,

    /// Serial port baudrate
    #[arg(long)]
    baudrate: Option<u32>,

    /// Serial port bytesize (5-8)
    #[arg(long)]
    bytesize: Option<u8>,

    /// Serial port parity (N, E, O)
    #[arg(long)]
    parity: Option<String>,

    /// Serial port stopbits (1 or 2)
    #[arg(long)]
    stopbits: Option<String>,

    /// Command execution timeout in seconds
    #[arg(long = "command-timeout")]
    command_timeout: Option<u64>,

    /// Install root holding the module tier directories
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log destination: "stdout" or a file path
    #[arg(long)]
    log: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Also log to a remote syslog server, host[:port]
    #[arg(long = "log-syslog")]
    log_syslog: Option<String>,

    /// Debug: play the host role and send one command packet
    #[arg(long = "debug-command")]
    debug_command: Option<String>,

    /// Debug: file attached to the debug command as binary data
    #[arg(long = "debug-command-binary-data", requires = "debug_command")]
    debug_command_binary_data: Option<PathBuf>,
}

impl Cli {
    fn into_invocation(self) -> AgentResult<Invocation> {
        let root = match self.root {
            Some(root) => root,
            None => default_root(),
        };
        let mut config = AgentConfig::new(root);
        if let Some(port) = self.port {
            config.serial.port = port;
        }
        if let Some(baudrate) = self.baudrate {
            config.serial.baud_rate = baudrate;
        }
        if let Some(bytesize) = self.bytesize {
            config.serial.data_bits = bytesize;
        }
        if let Some(parity) = &self.parity {
            config.serial.parity = Parity::parse(parity)?;
        }
        if let Some(stopbits) = &self.stopbits {
            config.serial.stop_bits = StopBits::parse(stopbits)?;
        }
        config.serial.validate()?;
        if let Some(seconds) = self.command_timeout {
            config.default_command_timeout = Duration::from_secs(seconds);
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.parse()?;
        }
        match self.log.as_deref() {
            None | Some("stdout") => {}
            Some(path) => config.log.file = Some(PathBuf::from(path)),
        }
        config.log.syslog = self.log_syslog;

        let debug = self
            .debug_command
            .map(|command| DebugCommand {
                command,
                binary_data: self.debug_command_binary_data,
            });
        Ok(Invocation { config, debug })
    }
}

struct Invocation {
    config: AgentConfig,
    debug: Option<DebugCommand>,
}

struct DebugCommand {
    command: String,
    binary_data: Option<PathBuf>,
}

/// Parses arguments, installs logging and signal handling, opens the
/// serial device, and runs the dispatcher (or the host-side debug
/// simulator). Returns the process exit code.
pub fn run<I, T>(args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(parse_error) => {
            let _ = parse_error.print();
            return ExitCode::from(2);
        }
    };
    match try_run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(agent_error) => {
            error!(%agent_error, "agent terminated");
            eprintln!("serclient: {agent_error}");
            ExitCode::FAILURE
        }
    }
}

fn try_run(cli: Cli) -> AgentResult<()> {
    let Invocation { config, debug } = cli.into_invocation()?;
    logging::init(&config.log)?;
    info!(
        root = %config.root.display(),
        port = %config.serial.port,
        "configuration resolved"
    );

    // No serial device means no control channel at all: fatal.
    let link = SerialLink::open(&config.serial)?;

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(AgentError::Io)?;
    }

    match debug {
        Some(debug_command) => simulate(link, &debug_command, &stop),
        None => {
            let mut dispatcher = Dispatcher::new(link, config, stop);
            dispatcher.run().map_err(AgentError::Io)
        }
    }
}

fn default_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Host-role simulator: send one COMMAND and print the handshake as
/// it comes back. Development aid, mirrors what the hypervisor does.
fn simulate(mut link: SerialLink, debug: &DebugCommand, stop: &AtomicBool) -> AgentResult<()> {
    let binary = debug
        .binary_data
        .as_deref()
        .map(std::fs::read)
        .transpose()
        .map_err(AgentError::Io)?;
    let id = CorrelationId::from_index(1);
    let body = build_command_body(&debug.command, binary.as_deref());
    link.send_all(&Packet::single(PacketKind::Command, id, body).encode())
        .map_err(AgentError::Io)?;
    println!("sent COMMAND {id}: {}", debug.command);

    let mut framer = Framer::new();
    let mut reassembler = Reassembler::new();
    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
        let packet = match framer.poll(&mut link, Duration::from_secs(1)) {
            Ok(FramerPoll::Frame(packet)) => packet,
            Ok(FramerPoll::Idle | FramerPoll::Stalled(_)) => continue,
            Err(io_error) => return Err(AgentError::Io(io_error)),
        };
        let outcome = reassembler.accept(packet);
        if let Some(ack) = outcome.ack {
            link.send_all(&ack.encode()).map_err(AgentError::Io)?;
        }
        let Some(message) = outcome.message else {
            continue;
        };
        match message.kind {
            PacketKind::Received => {
                println!("agent acknowledged: {}", String::from_utf8_lossy(&message.body));
            }
            PacketKind::AuthResponse => {
                link.send_all(&Packet::auth_response(message.correlation_id).encode())
                    .map_err(AgentError::Io)?;
            }
            PacketKind::Response => {
                println!("{}", String::from_utf8_lossy(&message.body));
                break;
            }
            PacketKind::Ack | PacketKind::Command => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(args: &[&str]) -> AgentResult<Invocation> {
        Cli::try_parse_from(args).expect("parseable").into_invocation()
    }

    #[test]
    fn defaults_apply_without_arguments() {
        let invocation = invocation(&["serclient"]).expect("valid");
        assert_eq!(invocation.config.serial.baud_rate, 57_600);
        assert!(invocation.debug.is_none());
    }

    #[test]
    fn serial_arguments_override_defaults() {
        let invocation = invocation(&[
            "serclient",
            "--port",
            "/dev/ttyS7",
            "--baudrate",
            "115200",
            "--bytesize",
            "7",
            "--parity",
            "E",
            "--stopbits",
            "2",
        ])
        .expect("valid");
        let serial = &invocation.config.serial;
        assert_eq!(serial.port, "/dev/ttyS7");
        assert_eq!(serial.baud_rate, 115_200);
        assert_eq!(serial.data_bits, 7);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, StopBits::Two);
    }

    #[test]
    fn mark_parity_is_a_configuration_error() {
        assert!(invocation(&["serclient", "--parity", "M"]).is_err());
    }

    #[test]
    fn command_timeout_flag_sets_the_default() {
        let invocation =
            invocation(&["serclient", "--command-timeout", "10"]).expect("valid");
        assert_eq!(
            invocation.config.default_command_timeout,
            Duration::from_secs(10)
        );
        // The built-in updateSoftware override is not disturbed.
        assert_eq!(
            invocation.config.command_timeout("updateSoftware"),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn log_stdout_keyword_keeps_stdout_sink() {
        let invocation = invocation(&["serclient", "--log", "stdout"]).expect("valid");
        assert_eq!(invocation.config.log.file, None);

        let invocation =
            invocation(&["serclient", "--log", "/var/log/serclient.log"]).expect("valid");
        assert_eq!(
            invocation.config.log.file,
            Some(PathBuf::from("/var/log/serclient.log"))
        );
    }

    #[test]
    fn debug_command_round_trips() {
        let invocation =
            invocation(&["serclient", "--debug-command", "modulemng list"]).expect("valid");
        let debug = invocation.debug.expect("debug command");
        assert_eq!(debug.command, "modulemng list");
        assert_eq!(debug.binary_data, None);
    }

    #[test]
    fn binary_data_requires_a_debug_command() {
        assert!(
            Cli::try_parse_from(["serclient", "--debug-command-binary-data", "/tmp/x"]).is_err()
        );
    }
}
