//! crates/protocol/src/link.rs
//!
//! Byte-level transport abstraction over the serial device.

use std::io;

/// A byte-oriented, half-trusted transport.
///
/// The production implementation wraps the serial device; tests drive
/// the whole protocol stack through an in-memory pair. Implementations
/// are expected to bound `recv` by a short device timeout (the agent
/// uses one second) and report an elapsed timeout as `Ok(0)` rather
/// than an error, matching how serial reads behave.
pub trait Link: Send {
    /// Reads available bytes into `buf`, blocking at most the device
    /// timeout. Returns the number of bytes read; `Ok(0)` means no
    /// data arrived in time.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer to the device.
    fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    //! In-memory [`Link`] pair for protocol and dispatcher tests.

    use std::collections::VecDeque;
    use std::io;
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::time::Duration;

    use super::Link;

    /// How long the test link waits for bytes before reporting an
    /// empty read, standing in for the serial device timeout.
    const RECV_TIMEOUT: Duration = Duration::from_millis(20);

    /// One end of an in-memory byte pipe.
    ///
    /// Bytes written with [`Link::send_all`] appear on the peer's
    /// [`Link::recv`]. Dropping one end makes the peer's `recv`
    /// return `Ok(0)` forever, which is how an unplugged serial cable
    /// looks to the agent.
    pub struct ChannelLink {
        incoming: Receiver<Vec<u8>>,
        outgoing: Sender<Vec<u8>>,
        pending: VecDeque<u8>,
    }

    /// Creates a connected link pair: `(agent_side, host_side)`.
    #[must_use]
    pub fn link_pair() -> (ChannelLink, ChannelLink) {
        let (to_host, from_agent) = channel();
        let (to_agent, from_host) = channel();
        (
            ChannelLink {
                incoming: from_host,
                outgoing: to_host,
                pending: VecDeque::new(),
            },
            ChannelLink {
                incoming: from_agent,
                outgoing: to_agent,
                pending: VecDeque::new(),
            },
        )
    }

    impl Link for ChannelLink {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.incoming.recv_timeout(RECV_TIMEOUT) {
                    Ok(chunk) => self.pending.extend(chunk),
                    Err(_) => return Ok(0),
                }
            }
            let mut copied = 0;
            while copied < buf.len() {
                let Some(byte) = self.pending.pop_front() else {
                    break;
                };
                buf[copied] = byte;
                copied += 1;
            }
            Ok(copied)
        }

        fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.outgoing
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer link closed"))
        }
    }
}
