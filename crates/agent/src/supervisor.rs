//! crates/agent/src/supervisor.rs
//!
//! Per-command child process supervision.
//!
//! Each accepted command runs on its own short-lived thread that owns
//! the child process. The thread captures merged stdout/stderr through
//! a pair of reader threads funneling into one channel (so output is
//! interleaved in arrival order), enforces the execution deadline, and
//! finishes by storing the RESPONSE packets in the in-flight table and
//! posting an AUTHRESPONSE to the outbound mailbox. The dispatcher is
//! the only other party touching either structure.

use std::collections::HashMap;
use std::io::{self, Read};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use modules::Module;
use protocol::body::CommandResponse;
use protocol::{CorrelationId, Packet};
use tracing::{debug, error, info};

use crate::command::Command;
use crate::restart::InstallPaths;

/// How often a supervisor polls its child for exit and its kill flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read chunk for the output funnel threads.
const OUTPUT_CHUNK: usize = 8 * 1024;

/// State shared between the dispatcher and its supervisors: the
/// in-flight response table, the outbound packet mailbox, the stop
/// flag, and the install-root marker files.
pub struct SharedState {
    in_flight: Mutex<HashMap<CorrelationId, Vec<Packet>>>,
    outbound: crossbeam_channel::Sender<Packet>,
    stop: Arc<AtomicBool>,
    paths: InstallPaths,
}

impl SharedState {
    /// Creates the shared state for one dispatcher.
    #[must_use]
    pub fn new(
        outbound: crossbeam_channel::Sender<Packet>,
        stop: Arc<AtomicBool>,
        paths: InstallPaths,
    ) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            outbound,
            stop,
            paths,
        }
    }

    /// Stores the finished RESPONSE packets for `id`. Write-once per
    /// correlation id by construction: every id has exactly one
    /// producer (its supervisor, or the acceptance/recovery path).
    pub fn store_response(&self, id: CorrelationId, packets: Vec<Packet>) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, packets);
    }

    /// Removes and returns the stored response for `id`.
    #[must_use]
    pub fn claim_response(&self, id: CorrelationId) -> Option<Vec<Packet>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Queues a packet for the dispatcher to serialize onto the link.
    /// Dropped silently when the dispatcher is already gone.
    pub fn post(&self, packet: Packet) {
        if self.outbound.send(packet).is_err() {
            debug!("outbound mailbox closed, dropping packet");
        }
    }

    /// Whether service stop has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Marker files under the install root.
    #[must_use]
    pub const fn paths(&self) -> &InstallPaths {
        &self.paths
    }
}

/// Handle to one running (or finished) supervisor thread.
pub struct Supervisor {
    correlation_id: CorrelationId,
    handle: JoinHandle<()>,
}

impl Supervisor {
    /// Correlation id of the supervised command.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Whether the supervisor thread has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the supervisor thread completes.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!(id = %self.correlation_id, "supervisor thread panicked");
        }
    }
}

/// Spawns the supervisor thread for one accepted command.
#[must_use]
pub fn spawn(command: Command, timeout: Duration, shared: Arc<SharedState>) -> Supervisor {
    let correlation_id = command.correlation_id();
    let handle = thread::spawn(move || run_command(&command, timeout, &shared));
    Supervisor {
        correlation_id,
        handle,
    }
}

struct Execution {
    killed: bool,
    timed_out: bool,
    return_code: i32,
    output: String,
}

fn run_command(command: &Command, timeout: Duration, shared: &SharedState) {
    let id = command.correlation_id();

    let Some(module) = command.module() else {
        info!(%id, raw = command.raw(), "command not found");
        let response = CommandResponse::error(command.raw(), "Command not found", 1);
        shared.store_response(id, response.into_packets(id));
        shared.post(Packet::auth_response(id));
        return;
    };

    info!(
        %id,
        module = module.alias(),
        path = %module.path().display(),
        timeout_secs = timeout.as_secs(),
        "running command"
    );

    let execution = match execute(command, module, timeout, shared) {
        Ok(execution) => execution,
        Err(spawn_error) => {
            debug!(%id, %spawn_error, "error executing command");
            Execution {
                killed: false,
                timed_out: false,
                return_code: 1,
                output: spawn_error.to_string(),
            }
        }
    };

    // A marker still on disk now means the restart did not happen.
    shared.paths().clear_restart_marker();

    // A failed update's report lives in the log file, not on stdout
    // (a successful one killed us before reaching this point).
    let output = if command.is_update_software() {
        let log = shared.paths().take_update_log();
        debug!(%id, "failed updateSoftware attempt, returning its log");
        log
    } else {
        execution.output
    };

    if execution.killed {
        // Service stop: the host gets no reply for a command we
        // terminated ourselves.
        return;
    }

    let response = if execution.timed_out {
        CommandResponse::timeout(command.raw())
    } else if execution.return_code == 0 {
        debug!(%id, "command completed");
        CommandResponse::success(command.raw(), output)
    } else {
        debug!(%id, code = execution.return_code, "non-zero exit status for command");
        CommandResponse::error(command.raw(), output, execution.return_code)
    };
    shared.store_response(id, response.into_packets(id));
    shared.post(Packet::auth_response(id));
}

fn execute(
    command: &Command,
    module: &Module,
    timeout: Duration,
    shared: &SharedState,
) -> io::Result<Execution> {
    let mut child_command = std::process::Command::new(module.path());
    child_command.args(command.args());
    if let Some(blob) = command.blob_path() {
        child_command.arg(blob);
    }
    child_command.env("PYTHONPATH", ".");

    let detached = command.is_self_mutating();
    let (mut child, output_rx) = if detached {
        // The child must outlive the agent it is about to kill:
        // nothing inherited, its own process group.
        child_command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            child_command.process_group(0);
        }
        (child_command.spawn()?, None)
    } else {
        child_command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = child_command.spawn()?;
        let (sender, receiver) = mpsc::channel();
        spawn_output_reader(child.stdout.take(), sender.clone());
        spawn_output_reader(child.stderr.take(), sender);
        (child, Some(receiver))
    };

    let started = Instant::now();
    let mut merged: Vec<u8> = Vec::new();
    let mut killed = false;
    let mut timed_out = false;
    let status = loop {
        if let Some(receiver) = &output_rx {
            while let Ok(chunk) = receiver.try_recv() {
                merged.extend_from_slice(&chunk);
            }
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if shared.stop_requested() {
            killed = true;
            break terminate(&mut child)?;
        }
        if started.elapsed() >= timeout {
            error!(id = %command.correlation_id(), "process timeout");
            timed_out = true;
            break terminate(&mut child)?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    // The readers drop their sender on EOF; drain whatever is left.
    if let Some(receiver) = output_rx {
        for chunk in receiver {
            merged.extend_from_slice(&chunk);
        }
    }

    Ok(Execution {
        killed,
        timed_out,
        return_code: exit_code(status),
        output: String::from_utf8_lossy(&merged).into_owned(),
    })
}

fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    // Kill may race a natural exit; wait reaps either way.
    let _ = child.kill();
    child.wait()
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    1
}

fn spawn_output_reader<R>(source: Option<R>, sender: mpsc::Sender<Vec<u8>>)
where
    R: Read + Send + 'static,
{
    let Some(mut source) = source else {
        return;
    };
    thread::spawn(move || {
        let mut buf = [0u8; OUTPUT_CHUNK];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if sender.send(buf[..read].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
