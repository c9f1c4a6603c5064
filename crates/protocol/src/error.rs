//! crates/protocol/src/error.rs
//!
//! Error types for packet validation and decoding.

use thiserror::Error;

/// Reasons a byte sequence fails to parse as a well-formed packet.
///
/// The framer treats every variant the same way (drop one byte and
/// re-synchronize), but the distinction is kept for logging: header
/// defects are routine garbage, CRC mismatches usually mean the link
/// corrupted a frame in flight.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer does not yet contain the full frame.
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated {
        /// Total bytes the frame requires.
        needed: usize,
        /// Bytes currently available.
        have: usize,
    },
    /// The first byte is not the 0x02 frame marker.
    #[error("bad leading magic byte {0:#04x}")]
    BadLeadingMagic(u8),
    /// The kind tag is not one of the five known words.
    #[error("unknown packet kind tag {0:?}")]
    UnknownKind(String),
    /// The fragment index exceeds the fragment count.
    #[error("fragment index {index} exceeds count {count}")]
    FragmentOrder {
        /// 1-based index carried by the header.
        index: u32,
        /// Total fragment count carried by the header.
        count: u32,
    },
    /// The correlation id contains a byte outside `[0-9a-fA-F]`.
    #[error("correlation id contains non-hex bytes")]
    InvalidCorrelationId,
    /// The last byte is not the 0x03 frame terminator.
    #[error("bad trailing magic byte {0:#04x}")]
    BadTrailingMagic(u8),
    /// The footer checksum does not match the header and body.
    #[error("crc mismatch: footer {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        /// Checksum carried by the footer.
        expected: u32,
        /// Checksum computed over HEADER||BODY.
        actual: u32,
    },
}
