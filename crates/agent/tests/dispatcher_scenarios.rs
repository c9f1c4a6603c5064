//! End-to-end dispatcher scenarios over an in-memory link.
//!
//! Each test boots a real dispatcher against a scratch install root
//! populated with small shell-script modules, then plays the host
//! role on the other end of the link: framing packets, pacing
//! fragments, and completing the RECEIVED → AUTHRESPONSE → RESPONSE
//! handshake.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use agent::config::AgentConfig;
use agent::dispatcher::Dispatcher;
use protocol::framer::{Framer, FramerPoll};
use protocol::wire::HEADER_LEN;
use protocol::{ChannelLink, CorrelationId, Link, Packet, PacketKind, link_pair};
use tempfile::TempDir;

const PATIENCE: Duration = Duration::from_secs(10);

struct Host {
    link: ChannelLink,
    framer: Framer,
}

impl Host {
    fn send(&mut self, packet: &Packet) {
        self.link.send_all(&packet.encode()).expect("host send");
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.link.send_all(bytes).expect("host send");
    }

    fn command(&mut self, id: CorrelationId, command: &str) {
        let body = protocol::body::build_command_body(command, None);
        self.send(&Packet::single(PacketKind::Command, id, body));
    }

    fn try_recv(&mut self, patience: Duration) -> Option<Packet> {
        let deadline = Instant::now() + patience;
        loop {
            match self
                .framer
                .poll(&mut self.link, Duration::from_millis(50))
                .expect("host link alive")
            {
                FramerPoll::Frame(packet) => return Some(packet),
                FramerPoll::Stalled(_) | FramerPoll::Idle => {}
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    fn recv(&mut self) -> Packet {
        self.try_recv(PATIENCE).expect("packet within patience")
    }

    fn recv_kind(&mut self, kind: PacketKind) -> Packet {
        let packet = self.recv();
        assert_eq!(packet.kind, kind, "unexpected packet: {packet:?}");
        packet
    }

    /// Completes the reply handshake after a command was sent:
    /// AUTHRESPONSE arrives, the host echoes it, the RESPONSE body
    /// comes back (reassembled if fragmented).
    fn claim_response(&mut self, id: CorrelationId) -> String {
        let auth = self.recv_kind(PacketKind::AuthResponse);
        assert_eq!(auth.correlation_id, id);
        self.send(&Packet::auth_response(id));

        let mut body = Vec::new();
        loop {
            let packet = self.recv_kind(PacketKind::Response);
            assert_eq!(packet.correlation_id, id);
            let done = packet.fragment_index == packet.fragment_count;
            body.extend_from_slice(&packet.body);
            if done {
                break;
            }
        }
        String::from_utf8_lossy(&body).into_owned()
    }
}

struct AgentHarness {
    root: TempDir,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl AgentHarness {
    fn install_script(&self, name: &str, script: &str) {
        install_script_at(self.root.path(), name, script);
    }

    fn root(&self) -> &Path {
        self.root.path()
    }
}

impl Drop for AgentHarness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn install_script_at(root: &Path, name: &str, script: &str) {
    let path = root.join("usermodules").join(name);
    fs::write(&path, script).expect("write module");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod module");
}

fn prepare_root() -> TempDir {
    let root = TempDir::new().expect("tempdir");
    for tier in ["internals", "plugins", "usermodules"] {
        fs::create_dir(root.path().join(tier)).expect("tier dir");
    }
    root
}

fn start_agent_with(root: TempDir, configure: impl FnOnce(&mut AgentConfig)) -> (AgentHarness, Host) {
    let mut config = AgentConfig::new(root.path());
    configure(&mut config);
    let (agent_link, host_link) = link_pair();
    let stop = Arc::new(AtomicBool::new(false));
    let mut dispatcher = Dispatcher::new(agent_link, config, Arc::clone(&stop))
        .with_poll_budget(Duration::from_millis(50));
    let handle = std::thread::spawn(move || dispatcher.run());
    (
        AgentHarness {
            root,
            stop,
            handle: Some(handle),
        },
        Host {
            link: host_link,
            framer: Framer::new(),
        },
    )
}

fn start_agent() -> (AgentHarness, Host) {
    start_agent_with(prepare_root(), |_| {})
}

fn id(index: u64) -> CorrelationId {
    CorrelationId::from_index(index)
}

#[test]
fn single_packet_command_completes_the_three_step_handshake() {
    let (harness, mut host) = start_agent();
    harness.install_script("greet.sh", "#!/bin/sh\necho greetings\n");

    host.command(id(1), "greet.sh");

    let received = host.recv_kind(PacketKind::Received);
    assert_eq!(received.correlation_id, id(1));
    assert!(received.is_single());
    assert_eq!(received.body, b"<responseType>Success</responseType>");

    let body = host.claim_response(id(1));
    assert!(body.contains("<responseType>Success</responseType>"));
    assert!(body.contains("<resultCode>0</resultCode>"));
    assert!(body.contains("<outputString>greetings\n</outputString>"));
    assert!(body.contains("<commandName>greet.sh</commandName>"));
}

#[test]
fn corrupted_frame_is_ignored_and_the_retransmission_is_served() {
    let (harness, mut host) = start_agent();
    harness.install_script("greet.sh", "#!/bin/sh\necho greetings\n");

    let packet = Packet::single(
        PacketKind::Command,
        id(2),
        protocol::body::build_command_body("greet.sh", None),
    );
    let mut corrupted = packet.encode();
    corrupted[HEADER_LEN + 4] ^= 0x20;
    host.send_raw(&corrupted);

    // No RECEIVED (nor anything else) may surface for the corrupt frame.
    assert!(host.try_recv(Duration::from_millis(600)).is_none());

    host.send(&packet);
    let received = host.recv_kind(PacketKind::Received);
    assert_eq!(received.correlation_id, id(2));
    let body = host.claim_response(id(2));
    assert!(body.contains("<responseType>Success</responseType>"));
}

#[test]
fn fragmented_command_is_acked_per_fragment_and_executed_whole() {
    let (harness, mut host) = start_agent();
    harness.install_script("greet.sh", "#!/bin/sh\necho greetings\n");

    let body = protocol::body::build_command_body("greet.sh", None);
    let thirds = body.len().div_ceil(3);
    for (index, chunk) in body.chunks(thirds).enumerate() {
        host.send(&Packet {
            kind: PacketKind::Command,
            correlation_id: id(3),
            fragment_index: (index + 1) as u32,
            fragment_count: 3,
            body: chunk.to_vec(),
        });
        // Fragment pacing: one RECEIVED per fragment, final included.
        let ack = host.recv_kind(PacketKind::Received);
        assert_eq!(ack.correlation_id, id(3));
        assert_eq!(ack.fragment_index, (index + 1) as u32);
        assert_eq!(ack.fragment_count, 3);
    }

    // Acceptance of the assembled message acks once more, then the
    // normal handshake follows.
    let accepted = host.recv_kind(PacketKind::Received);
    assert!(accepted.is_single());
    let body = host.claim_response(id(3));
    assert!(body.contains("<outputString>greetings\n</outputString>"));
}

#[test]
fn slow_module_times_out_with_an_empty_timeout_response() {
    let root = prepare_root();
    let (harness, mut host) = start_agent_with(root, |config| {
        config.default_command_timeout = Duration::from_millis(600);
    });
    harness.install_script("sleepy.sh", "#!/bin/sh\nsleep 30\n");

    let started = Instant::now();
    host.command(id(4), "sleepy.sh");
    host.recv_kind(PacketKind::Received);
    let body = host.claim_response(id(4));
    let elapsed = started.elapsed();

    assert!(body.contains("<responseType>TimeOut</responseType>"));
    assert!(body.contains("<resultCode>0</resultCode>"));
    assert!(body.contains("<outputString></outputString>"));
    assert!(body.contains("<resultMessage></resultMessage>"));
    assert!(elapsed >= Duration::from_millis(600), "replied before the deadline");
    assert!(elapsed < Duration::from_secs(20), "kill did not happen at the deadline");
}

#[test]
fn blocking_command_waits_for_running_work_and_runs_alone() {
    let (harness, mut host) = start_agent();
    let root = harness.root().to_path_buf();
    let stamp = |file: &str| format!("date +%s%N > {}/{file}\n", root.display());

    harness.install_script(
        "a.sh",
        &format!("#!/bin/sh\nsleep 1\n{}", stamp("a_end")),
    );
    harness.install_script(
        "b.sh",
        &format!("#!/bin/sh\n{}{}", stamp("b_start"), stamp("b_end")),
    );
    fs::write(root.join("usermodules/b.sh.blocking"), "").expect("sentinel");
    harness.install_script("c.sh", &format!("#!/bin/sh\n{}", stamp("c_start")));

    host.command(id(5), "a.sh");
    host.command(id(6), "b.sh");
    host.command(id(7), "c.sh");

    // Gather the whole conversation: three RECEIVED, then for each
    // command an AUTHRESPONSE we answer, then its RESPONSE.
    let mut responses = 0;
    let deadline = Instant::now() + PATIENCE;
    while responses < 3 {
        assert!(Instant::now() < deadline, "handshake incomplete");
        let Some(packet) = host.try_recv(Duration::from_millis(200)) else {
            continue;
        };
        match packet.kind {
            PacketKind::Received => {}
            PacketKind::AuthResponse => host.send(&Packet::auth_response(packet.correlation_id)),
            PacketKind::Response => responses += 1,
            other => panic!("unexpected {other:?}"),
        }
    }

    let nanos = |file: &str| -> u128 {
        fs::read_to_string(root.join(file))
            .unwrap_or_else(|_| panic!("{file} missing"))
            .trim()
            .parse()
            .expect("timestamp")
    };
    // The blocking command waited for A, and C waited for it.
    assert!(nanos("b_start") >= nanos("a_end"), "B started while A ran");
    assert!(nanos("c_start") >= nanos("b_end"), "C started while B ran");
}

#[test]
fn restart_marker_produces_exactly_one_reply_after_relaunch() {
    let root = prepare_root();
    let marker_id = id(8);
    fs::write(root.path().join("serclient.restart"), marker_id.as_str()).expect("marker");
    fs::write(root.path().join("updateSoftware.log"), "upgraded to 2.0\n").expect("log");

    let (harness, mut host) = start_agent_with(root, |_| {});

    // The relaunched agent speaks first.
    let auth = host.recv_kind(PacketKind::AuthResponse);
    assert_eq!(auth.correlation_id, marker_id);
    host.send(&Packet::auth_response(marker_id));
    let response = host.recv_kind(PacketKind::Response);
    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("<responseType>Success</responseType>"));
    assert!(body.contains("<outputString>upgraded to 2.0\n</outputString>"));

    // Marker and log are consumed.
    assert!(!harness.root().join("serclient.restart").exists());
    assert!(!harness.root().join("updateSoftware.log").exists());
    drop(harness);

    // A second relaunch must not resurrect the id.
    let root = prepare_root();
    let (_harness, mut host) = start_agent_with(root, |_| {});
    assert!(host.try_recv(Duration::from_millis(600)).is_none());
}

#[test]
fn restart_command_persists_the_marker_before_spawning() {
    let (harness, mut host) = start_agent();
    let root = harness.root().to_path_buf();
    // The restart stub copies the marker while it runs: proof the
    // dispatcher persisted it before the spawn.
    let script = format!(
        "#!/bin/sh\ncp {root}/serclient.restart {root}/marker.copy\n",
        root = root.display()
    );
    let path = root.join("internals/restart.py");
    fs::write(&path, script).expect("restart stub");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");

    host.command(id(9), "restart");
    host.recv_kind(PacketKind::Received);
    let body = host.claim_response(id(9));

    // The stub exited instead of killing us, so the attempt reads as
    // a completed command and the stale marker is gone.
    assert!(body.contains("<responseType>Success</responseType>"));
    let copied = fs::read_to_string(root.join("marker.copy")).expect("marker copy");
    assert_eq!(copied, id(9).as_str());
    assert!(!root.join("serclient.restart").exists());
}

#[test]
fn ack_probe_is_echoed_with_the_same_id() {
    let (_harness, mut host) = start_agent();
    host.send(&Packet::ack(id(10)));
    let echo = host.recv_kind(PacketKind::Ack);
    assert_eq!(echo.correlation_id, id(10));
}

#[test]
fn idle_link_triggers_a_zero_id_keepalive() {
    let root = prepare_root();
    let (agent_link, host_link) = link_pair();
    let stop = Arc::new(AtomicBool::new(false));
    let mut dispatcher = Dispatcher::new(
        agent_link,
        AgentConfig::new(root.path()),
        Arc::clone(&stop),
    )
    .with_poll_budget(Duration::from_millis(50))
    .with_idle_timeout(Duration::from_millis(300));
    let handle = std::thread::spawn(move || dispatcher.run());
    let mut host = Host {
        link: host_link,
        framer: Framer::new(),
    };

    let probe = host.recv_kind(PacketKind::Ack);
    assert_eq!(probe.correlation_id, CorrelationId::ZERO);

    stop.store(true, Ordering::Relaxed);
    let _ = handle.join();
}

#[test]
fn malformed_command_body_still_gets_the_two_step_reply() {
    let (_harness, mut host) = start_agent();
    host.send(&Packet::single(
        PacketKind::Command,
        id(11),
        b"<bogus>not a command</bogus>".to_vec(),
    ));

    // No RECEIVED for a rejected body; the canned error goes through
    // the normal claim path.
    let auth = host.recv_kind(PacketKind::AuthResponse);
    assert_eq!(auth.correlation_id, id(11));
    host.send(&Packet::auth_response(id(11)));
    let response = host.recv_kind(PacketKind::Response);
    let body = String::from_utf8_lossy(&response.body);
    assert!(body.contains("<responseType>Error</responseType>"));
    assert!(body.contains("<commandName></commandName>"));
}

#[test]
fn unknown_command_name_reports_command_not_found() {
    let (_harness, mut host) = start_agent();
    host.command(id(12), "definitely-not-installed --flag");
    host.recv_kind(PacketKind::Received);
    let body = host.claim_response(id(12));
    assert!(body.contains("<responseType>Error</responseType>"));
    assert!(body.contains("<resultMessage>Command not found</resultMessage>"));
    assert!(body.contains("<resultCode>1</resultCode>"));
}

#[test]
fn auth_response_for_an_unknown_id_is_answered_with_an_error() {
    let (_harness, mut host) = start_agent();
    host.send(&Packet::auth_response(id(13)));
    let response = host.recv_kind(PacketKind::Response);
    assert_eq!(response.correlation_id, id(13));
    let body = String::from_utf8_lossy(&response.body);
    assert!(body.contains("<responseType>Error</responseType>"));
}

#[test]
fn binary_data_is_staged_and_passed_as_the_last_argument() {
    let (harness, mut host) = start_agent();
    harness.install_script("readblob.sh", "#!/bin/sh\ncat \"$1\"\n");

    let body = protocol::body::build_command_body("readblob.sh", Some(b"attached payload"));
    host.send(&Packet::single(PacketKind::Command, id(14), body));
    host.recv_kind(PacketKind::Received);
    let response = host.claim_response(id(14));
    assert!(response.contains("<outputString>attached payload</outputString>"));
}

#[test]
fn stalled_header_is_answered_with_a_timeout_received() {
    let root = prepare_root();
    let (agent_link, host_link) = link_pair();
    let stop = Arc::new(AtomicBool::new(false));
    let mut dispatcher = Dispatcher::new(
        agent_link,
        AgentConfig::new(root.path()),
        Arc::clone(&stop),
    )
    .with_poll_budget(Duration::from_millis(50))
    .with_framer(Framer::with_logic_timeout(Duration::from_millis(300)));
    let handle = std::thread::spawn(move || dispatcher.run());
    let mut host = Host {
        link: host_link,
        framer: Framer::new(),
    };

    // A valid header whose body never arrives.
    let unfinished = Packet::single(PacketKind::Command, id(15), vec![b'z'; 2048]).encode();
    host.send_raw(&unfinished[..HEADER_LEN + 5]);

    let stalled = host.recv_kind(PacketKind::Received);
    assert_eq!(stalled.correlation_id, id(15));
    assert_eq!(stalled.body, b"<responseType>TimeOut</responseType>");

    stop.store(true, Ordering::Relaxed);
    let _ = handle.join();
}

#[test]
fn large_output_is_fragmented_and_reassembles_to_the_full_payload() {
    let (harness, mut host) = start_agent();
    // ~200 KiB of output forces at least four response fragments.
    harness.install_script(
        "dump.sh",
        "#!/bin/sh\nawk 'BEGIN { for (i = 0; i < 3200; i++) \
         print \"0123456789012345678901234567890123456789012345678901234567890123\" }'\n",
    );

    host.command(id(16), "dump.sh");
    host.recv_kind(PacketKind::Received);
    let body = host.claim_response(id(16));
    assert!(body.starts_with("<response>"));
    assert!(body.ends_with("</response>"));
    // 3200 lines, each holding six non-overlapping repetitions.
    assert_eq!(body.matches("0123456789").count(), 3200 * 6);
}
