//! crates/protocol/src/framer.rs
//!
//! Incremental frame extraction from the raw serial byte stream.
//!
//! The framer owns an unbounded accumulator and knows nothing about
//! message semantics. Garbage is shed one byte at a time followed by a
//! bounded fast-skip to the next frame marker, so a long run of noise
//! costs a single scan rather than one header probe per byte. A header
//! that stays valid while its body never completes is abandoned after
//! the logic timeout, producing a synthetic timeout acknowledgement
//! for the stuck fragment.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::link::Link;
use crate::wire::{self, HEADER_LEN, HEADER_MAGIC, Packet};

/// Upper bound between a valid header appearing and its body/footer
/// completing before the frame is declared stuck.
pub const LOGIC_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum bytes fast-skipped while hunting for the next frame marker
/// after a header defect.
pub const RESYNC_WINDOW: usize = 5000;

/// Device read chunk size.
const READ_CHUNK: usize = 64 * 1024;

/// Outcome of one bounded poll of the link.
#[derive(Debug, PartialEq, Eq)]
pub enum FramerPoll {
    /// No complete frame arrived within the budget.
    Idle,
    /// A well-formed, CRC-valid frame.
    Frame(Packet),
    /// A frame header sat valid for longer than the logic timeout
    /// without its body completing. The carried RECEIVED(timeout)
    /// packet must be written back to the host; the stream resumes
    /// re-synchronization behind the abandoned header byte.
    Stalled(Packet),
}

/// Stream-to-packet framer (accumulator + re-sync discipline).
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    header_since: Option<Instant>,
    logic_timeout: Duration,
    total_read: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Creates a framer with the production logic timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_logic_timeout(LOGIC_TIMEOUT)
    }

    /// Creates a framer with a custom logic timeout. Tests shrink the
    /// timeout to keep stuck-frame scenarios fast.
    #[must_use]
    pub fn with_logic_timeout(logic_timeout: Duration) -> Self {
        Self {
            buffer: Vec::new(),
            header_since: None,
            logic_timeout,
            total_read: 0,
        }
    }

    /// Total bytes ever read from the link. The dispatcher samples
    /// this around each poll to maintain its last-I/O timestamp.
    #[must_use]
    pub const fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Bytes currently buffered but not yet framed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pulls bytes from `link` until a frame completes, the stream
    /// stalls, or `budget` elapses. Device errors are fatal and
    /// propagate unchanged.
    pub fn poll(&mut self, link: &mut dyn Link, budget: Duration) -> io::Result<FramerPoll> {
        let deadline = Instant::now() + budget;
        loop {
            if self.buffer.len() < HEADER_LEN {
                // A partial header cannot be stuck yet.
                self.header_since = None;
                self.fill(link)?;
                if self.buffer.len() < HEADER_LEN {
                    if Instant::now() >= deadline {
                        return Ok(FramerPoll::Idle);
                    }
                    continue;
                }
            }

            match wire::peek_header(&self.buffer) {
                Err(error) => {
                    trace!(%error, "header not well-formed, re-syncing");
                    self.resync();
                    self.header_since = None;
                }
                Ok(header) => {
                    let since = *self.header_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > self.logic_timeout {
                        warn!(
                            id = %header.correlation_id,
                            "logic timeout waiting for frame body, abandoning header"
                        );
                        let ack = Packet::received(
                            header.correlation_id,
                            header.fragment_index,
                            header.fragment_count,
                            true,
                        );
                        self.buffer.drain(..1);
                        self.header_since = None;
                        return Ok(FramerPoll::Stalled(ack));
                    }

                    let frame_len = header.frame_len();
                    if self.buffer.len() < frame_len {
                        self.fill(link)?;
                    } else {
                        match Packet::decode(&self.buffer[..frame_len]) {
                            Ok(packet) => {
                                self.buffer.drain(..frame_len);
                                self.header_since = None;
                                return Ok(FramerPoll::Frame(packet));
                            }
                            Err(error) => {
                                debug!(%error, "frame failed validation, re-syncing");
                                self.buffer.drain(..1);
                                self.header_since = None;
                            }
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(FramerPoll::Idle);
            }
        }
    }

    fn fill(&mut self, link: &mut dyn Link) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let read = link.recv(&mut chunk)?;
        if read > 0 {
            self.buffer.extend_from_slice(&chunk[..read]);
            self.total_read += read as u64;
            trace!(read, buffered = self.buffer.len(), "link bytes buffered");
        }
        Ok(())
    }

    /// Drops the defective leading byte, then fast-skips up to
    /// [`RESYNC_WINDOW`] bytes looking for the next frame marker.
    fn resync(&mut self) {
        self.buffer.drain(..1);
        let window = self.buffer.len().min(RESYNC_WINDOW);
        let skip = memchr::memchr(HEADER_MAGIC, &self.buffer[..window]).unwrap_or(window);
        if skip > 0 {
            self.buffer.drain(..skip);
        }
        debug!(skipped = skip + 1, "re-synchronized frame stream");
    }
}
