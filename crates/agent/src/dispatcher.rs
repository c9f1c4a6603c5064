//! crates/agent/src/dispatcher.rs
//!
//! The single-threaded event loop owning the serial link.
//!
//! Per tick, in order: poll the framer for one packet (bounded wait),
//! classify and handle it, drain the outbound mailbox, emit the idle
//! keepalive if due, then step the command queue subject to the
//! blocking-mode rule. All writes to the link happen here, so packets
//! destined for the host never interleave.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use modules::ModuleRegistry;
use protocol::body::{CommandResponse, parse_command_body};
use protocol::framer::{Framer, FramerPoll};
use protocol::reassembly::Reassembler;
use protocol::{CorrelationId, Link, Packet, PacketKind};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::AgentConfig;
use crate::restart::InstallPaths;
use crate::supervisor::{self, SharedState, Supervisor};

/// Idle time on the link before a zero-id keepalive ACK is emitted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Outbound writes are chunked to this size.
pub const WRITE_CHUNK: usize = 8 * 1024;

/// Bounded wait for inbound traffic per tick.
const POLL_BUDGET: Duration = Duration::from_secs(1);

/// Capacity of the supervisor-to-dispatcher mailbox.
const MAILBOX_CAPACITY: usize = 64;

/// The central event loop wiring framer, reassembler, registry, and
/// supervisors together over one serial link.
pub struct Dispatcher<L: Link> {
    link: L,
    framer: Framer,
    reassembler: Reassembler,
    registry: ModuleRegistry,
    config: AgentConfig,
    shared: Arc<SharedState>,
    outbound: crossbeam_channel::Receiver<Packet>,
    queue: VecDeque<Command>,
    supervisors: Vec<Supervisor>,
    queue_paused: bool,
    stop: Arc<AtomicBool>,
    last_io: Instant,
    idle_timeout: Duration,
    poll_budget: Duration,
}

impl<L: Link> Dispatcher<L> {
    /// Creates a dispatcher over an open link. `stop` is the external
    /// service-stop flag, checked once per tick.
    #[must_use]
    pub fn new(link: L, config: AgentConfig, stop: Arc<AtomicBool>) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(MAILBOX_CAPACITY);
        let shared = Arc::new(SharedState::new(
            sender,
            Arc::clone(&stop),
            InstallPaths::new(&config.root),
        ));
        Self {
            link,
            framer: Framer::new(),
            reassembler: Reassembler::new(),
            registry: ModuleRegistry::new(&config.root),
            config,
            shared,
            outbound: receiver,
            queue: VecDeque::new(),
            supervisors: Vec::new(),
            queue_paused: false,
            stop,
            last_io: Instant::now(),
            idle_timeout: IDLE_TIMEOUT,
            poll_budget: POLL_BUDGET,
        }
    }

    /// Replaces the framer (tests shrink the logic timeout).
    #[must_use]
    pub fn with_framer(mut self, framer: Framer) -> Self {
        self.framer = framer;
        self
    }

    /// Overrides the keepalive idle threshold (tests shrink it).
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Overrides the per-tick inbound wait (tests shrink it).
    #[must_use]
    pub const fn with_poll_budget(mut self, poll_budget: Duration) -> Self {
        self.poll_budget = poll_budget;
        self
    }

    /// Runs until the stop flag is raised. Consumes the restart
    /// marker first so a command that restarted the agent still gets
    /// its reply.
    pub fn run(&mut self) -> io::Result<()> {
        info!(version = self.shared.paths().agent_version(), "agent service started");
        self.recover_restart()?;
        while !self.stop.load(Ordering::Relaxed) {
            self.tick()?;
        }
        info!("stop requested, waiting for supervisors");
        for supervisor in self.supervisors.drain(..) {
            supervisor.join();
        }
        Ok(())
    }

    /// One scheduling round. Exposed for tests that need to observe
    /// intermediate states; production code calls [`run`](Self::run).
    pub fn tick(&mut self) -> io::Result<()> {
        let read_before = self.framer.total_read();
        let poll = self.framer.poll(&mut self.link, self.poll_budget)?;
        if self.framer.total_read() > read_before {
            self.last_io = Instant::now();
        }
        match poll {
            FramerPoll::Idle => {}
            FramerPoll::Frame(packet) => self.handle_frame(packet)?,
            FramerPoll::Stalled(ack) => self.send(&ack)?,
        }

        while let Ok(packet) = self.outbound.try_recv() {
            self.send(&packet)?;
        }

        if self.last_io.elapsed() > self.idle_timeout {
            debug!("link idle, probing with keepalive");
            self.send(&Packet::ack(CorrelationId::ZERO))?;
        }

        self.step_queue()?;
        Ok(())
    }

    fn handle_frame(&mut self, packet: Packet) -> io::Result<()> {
        let outcome = self.reassembler.accept(packet);
        if let Some(ack) = outcome.ack {
            self.send(&ack)?;
        }
        let Some(message) = outcome.message else {
            return Ok(());
        };
        let id = message.correlation_id;
        match message.kind {
            PacketKind::Ack => {
                info!(%id, "ACK received");
                self.send(&Packet::ack(id))?;
            }
            PacketKind::Command => {
                info!(%id, "COMMAND received");
                self.accept_command(&message)?;
            }
            // Flow-control artefact of our own fragmented replies.
            PacketKind::Received => {}
            PacketKind::AuthResponse => {
                info!(%id, "AUTHRESPONSE received");
                self.deliver_response(id)?;
            }
            PacketKind::Response => {
                error!(%id, "unexpected RESPONSE from host, ignoring");
            }
        }
        Ok(())
    }

    /// COMMAND acceptance: parse the body, stash any binary payload,
    /// acknowledge, resolve, and queue. Malformed requests still get
    /// the full two-step reply, with a canned error as the response.
    fn accept_command(&mut self, message: &Packet) -> io::Result<()> {
        let id = message.correlation_id;
        let request = match parse_command_body(&message.body) {
            Ok(request) => request,
            Err(parse_error) => {
                warn!(%id, %parse_error, "rejecting malformed command body");
                return self.reply_canned_error(id);
            }
        };

        let blob_path = match request.binary_data {
            None => None,
            Some(bytes) => {
                let path = std::env::temp_dir().join(id.as_str());
                if let Err(write_error) = std::fs::write(&path, &bytes) {
                    warn!(%id, %write_error, "failed to stage binary payload");
                    return self.reply_canned_error(id);
                }
                Some(path)
            }
        };

        self.send(&Packet::received(id, 1, 1, false))?;

        let command = Command::resolve(&request.command, id, blob_path, &self.registry);
        self.queue.push_back(command);
        Ok(())
    }

    fn reply_canned_error(&mut self, id: CorrelationId) -> io::Result<()> {
        self.shared
            .store_response(id, CommandResponse::canned_error().into_packets(id));
        self.send(&Packet::auth_response(id))
    }

    /// The host claimed a finished response with its AUTHRESPONSE.
    fn deliver_response(&mut self, id: CorrelationId) -> io::Result<()> {
        match self.shared.claim_response(id) {
            Some(packets) => {
                for packet in &packets {
                    self.send(packet)?;
                }
            }
            None => {
                error!(%id, "response requested for an unknown packet id");
                for packet in &CommandResponse::canned_error().into_packets(id) {
                    self.send(packet)?;
                }
            }
        }
        Ok(())
    }

    /// Pops queued commands into supervisors, honoring blocking mode:
    /// a blocking command waits for every running supervisor and then
    /// runs alone; while it runs nothing else starts.
    fn step_queue(&mut self) -> io::Result<()> {
        self.supervisors.retain(|supervisor| !supervisor.is_finished());
        if self.queue_paused {
            if self.supervisors.is_empty() {
                debug!("leaving blocking mode");
                self.queue_paused = false;
            } else {
                return Ok(());
            }
        }
        while let Some(next_is_blocking) = self.queue.front().map(Command::is_blocking) {
            if next_is_blocking {
                self.queue_paused = true;
                if self.supervisors.is_empty() {
                    debug!("spawning blocking command");
                    if let Some(command) = self.queue.pop_front() {
                        self.spawn_command(command);
                    }
                } else {
                    debug!("entering blocking mode");
                }
                break;
            }
            if let Some(command) = self.queue.pop_front() {
                self.spawn_command(command);
            }
        }
        Ok(())
    }

    fn spawn_command(&mut self, command: Command) {
        if command.is_self_mutating() {
            // Persist the id first so the reply survives the restart.
            if let Err(save_error) = self
                .shared
                .paths()
                .save_restart_marker(command.correlation_id())
            {
                warn!(
                    id = %command.correlation_id(),
                    %save_error,
                    "failed to persist restart marker"
                );
            }
        }
        let alias = command.module().map_or_else(String::new, |m| m.alias().to_string());
        let timeout = self.config.command_timeout(&alias);
        let supervisor = supervisor::spawn(command, timeout, Arc::clone(&self.shared));
        self.supervisors.push(supervisor);
    }

    /// Startup half of the restart contract: consume the marker and
    /// stage the synthetic success response carrying the update log.
    fn recover_restart(&mut self) -> io::Result<()> {
        let Some(id) = self.shared.paths().consume_restart_marker() else {
            return Ok(());
        };
        info!(%id, "sending restart/updateSoftware response");
        let log = self.shared.paths().take_update_log();
        self.shared
            .store_response(id, CommandResponse::success("", log).into_packets(id));
        self.send(&Packet::auth_response(id))
    }

    fn send(&mut self, packet: &Packet) -> io::Result<()> {
        info!(
            kind = %packet.kind,
            id = %packet.correlation_id,
            body_len = packet.body.len(),
            "sending packet"
        );
        let encoded = packet.encode();
        let total = encoded.len();
        let mut done = 0usize;
        for chunk in encoded.chunks(WRITE_CHUNK) {
            self.link.send_all(chunk)?;
            done += chunk.len();
            if total > WRITE_CHUNK {
                debug!(done, total, "writing to serial port");
            }
        }
        self.last_io = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_constants_hold() {
        assert_eq!(IDLE_TIMEOUT, Duration::from_secs(900));
        assert_eq!(WRITE_CHUNK, 8192);
    }
}
