//! crates/protocol/src/wire.rs
//!
//! Packet layout, validation, and the encode/decode pair.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! HEADER (91 bytes)
//!   magic            1   0x02
//!   kind             30  NUL-padded ASCII tag
//!   correlation_id   32  ASCII hex digits
//!   fragment_index   4   u32, 1-based
//!   fragment_count   4   u32
//!   reserved         16  zero on send, ignored on receive
//!   body_length      4   u32
//! BODY   (body_length bytes)
//! FOOTER (5 bytes)
//!   crc32            4   CRC-32 of HEADER||BODY
//!   magic            1   0x03
//! ```

use std::fmt;

use crate::error::ProtocolError;

/// First byte of every frame.
pub const HEADER_MAGIC: u8 = 0x02;
/// Last byte of every frame.
pub const FOOTER_MAGIC: u8 = 0x03;
/// Width of the NUL-padded kind tag.
pub const KIND_LEN: usize = 30;
/// Width of the reserved header region.
pub const RESERVED_LEN: usize = 16;
/// Total header size.
pub const HEADER_LEN: usize = 1 + KIND_LEN + CorrelationId::LEN + 4 + 4 + RESERVED_LEN + 4;
/// Total footer size.
pub const FOOTER_LEN: usize = 4 + 1;
/// Smallest possible frame (empty body).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + FOOTER_LEN;
/// Largest body carried by a single outbound packet; longer reply
/// bodies are split into equal fragments under the same correlation
/// id, mirroring inbound reassembly.
pub const MAX_FRAGMENT_BODY: usize = 64 * 1024;

const KIND_OFFSET: usize = 1;
const ID_OFFSET: usize = KIND_OFFSET + KIND_LEN;
const INDEX_OFFSET: usize = ID_OFFSET + CorrelationId::LEN;
const COUNT_OFFSET: usize = INDEX_OFFSET + 4;
const BODY_LEN_OFFSET: usize = COUNT_OFFSET + 4 + RESERVED_LEN;

/// The five packet kinds of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Host-initiated command request.
    Command,
    /// Liveness probe; answered with an ACK carrying the same id.
    Ack,
    /// Per-fragment acknowledgement (also used for stuck-frame timeouts).
    Received,
    /// Handshake step announcing (agent side) or requesting (host side)
    /// a finished response.
    AuthResponse,
    /// Final reply carrying the command outcome.
    Response,
}

impl PacketKind {
    const ALL: [Self; 5] = [
        Self::Command,
        Self::Ack,
        Self::Received,
        Self::AuthResponse,
        Self::Response,
    ];

    /// Wire tag for this kind.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::Ack => "ACK",
            Self::Received => "RECEIVED",
            Self::AuthResponse => "AUTHRESPONSE",
            Self::Response => "RESPONSE",
        }
    }

    /// Parses a tag (the header bytes up to the first NUL).
    #[must_use]
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag().as_bytes() == tag)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// 32-hex-character opaque tag tying a request to every packet about it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; Self::LEN]);

impl CorrelationId {
    /// Width of a correlation id on the wire.
    pub const LEN: usize = 32;

    /// The all-zeros id used by the idle keepalive probe.
    pub const ZERO: Self = Self([b'0'; Self::LEN]);

    /// Validates and copies a 32-byte hex identifier.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: [u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidCorrelationId)?;
        if !raw.iter().all(u8::is_ascii_hexdigit) {
            return Err(ProtocolError::InvalidCorrelationId);
        }
        Ok(Self(raw))
    }

    /// Parses an id from its string form.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Self::from_bytes(s.as_bytes())
    }

    /// Builds a zero-padded decimal id, e.g. `7` becomes
    /// `"0...07"`. Handy for tests and the debug simulator.
    #[must_use]
    pub fn from_index(index: u64) -> Self {
        let mut raw = [b'0'; Self::LEN];
        let text = index.to_string();
        raw[Self::LEN - text.len()..].copy_from_slice(text.as_bytes());
        Self(raw)
    }

    /// The raw wire bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Hex digits are always valid UTF-8.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.as_str())
    }
}

/// Header fields extracted by [`peek_header`] before the body arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    /// Packet kind named by the tag.
    pub kind: PacketKind,
    /// Correlation id of the frame.
    pub correlation_id: CorrelationId,
    /// 1-based fragment index.
    pub fragment_index: u32,
    /// Total fragment count.
    pub fragment_count: u32,
    /// Announced body length.
    pub body_len: u32,
}

impl HeaderFields {
    /// Total frame size implied by this header.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize + FOOTER_LEN
    }
}

/// Validates the fixed-size header at the front of `buf` (rules 1-4:
/// leading magic, known kind tag, fragment ordering, hex id) and
/// returns its fields. `buf` must hold at least [`HEADER_LEN`] bytes.
pub fn peek_header(buf: &[u8]) -> Result<HeaderFields, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LEN,
            have: buf.len(),
        });
    }
    if buf[0] != HEADER_MAGIC {
        return Err(ProtocolError::BadLeadingMagic(buf[0]));
    }
    let tag_field = &buf[KIND_OFFSET..KIND_OFFSET + KIND_LEN];
    let tag_end = memchr::memchr(0, tag_field).unwrap_or(KIND_LEN);
    let kind = PacketKind::from_tag(&tag_field[..tag_end]).ok_or_else(|| {
        ProtocolError::UnknownKind(String::from_utf8_lossy(&tag_field[..tag_end]).into_owned())
    })?;
    let fragment_index = read_u32(buf, INDEX_OFFSET);
    let fragment_count = read_u32(buf, COUNT_OFFSET);
    if fragment_index > fragment_count {
        return Err(ProtocolError::FragmentOrder {
            index: fragment_index,
            count: fragment_count,
        });
    }
    let correlation_id = CorrelationId::from_bytes(&buf[ID_OFFSET..ID_OFFSET + CorrelationId::LEN])?;
    Ok(HeaderFields {
        kind,
        correlation_id,
        fragment_index,
        fragment_count,
        body_len: read_u32(buf, BODY_LEN_OFFSET),
    })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap_or([0; 4]))
}

/// The atomic unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Correlation id shared by every packet about one request.
    pub correlation_id: CorrelationId,
    /// 1-based fragment index.
    pub fragment_index: u32,
    /// Total fragment count.
    pub fragment_count: u32,
    /// Opaque payload, usually XML text.
    pub body: Vec<u8>,
}

impl Packet {
    /// Builds an unfragmented packet (`index == count == 1`).
    #[must_use]
    pub fn single(kind: PacketKind, correlation_id: CorrelationId, body: Vec<u8>) -> Self {
        Self {
            kind,
            correlation_id,
            fragment_index: 1,
            fragment_count: 1,
            body,
        }
    }

    /// An ACK for `correlation_id` with an empty body.
    #[must_use]
    pub fn ack(correlation_id: CorrelationId) -> Self {
        Self::single(PacketKind::Ack, correlation_id, Vec::new())
    }

    /// An AUTHRESPONSE announcing that a response for
    /// `correlation_id` is ready to be claimed.
    #[must_use]
    pub fn auth_response(correlation_id: CorrelationId) -> Self {
        Self::single(PacketKind::AuthResponse, correlation_id, Vec::new())
    }

    /// A per-fragment RECEIVED acknowledgement. With `timeout` set the
    /// body reports `TimeOut` instead of `Success`; the framer uses
    /// this for frames whose body never arrived.
    #[must_use]
    pub fn received(
        correlation_id: CorrelationId,
        fragment_index: u32,
        fragment_count: u32,
        timeout: bool,
    ) -> Self {
        let body = if timeout {
            "<responseType>TimeOut</responseType>"
        } else {
            "<responseType>Success</responseType>"
        };
        Self {
            kind: PacketKind::Received,
            correlation_id,
            fragment_index,
            fragment_count,
            body: body.as_bytes().to_vec(),
        }
    }

    /// True iff this packet is a whole message on its own.
    #[must_use]
    pub const fn is_single(&self) -> bool {
        self.fragment_count == 1 && self.fragment_index == 1
    }

    /// Encoded size of this packet.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        HEADER_LEN + self.body.len() + FOOTER_LEN
    }

    /// Serializes the packet, computing the footer CRC.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len());
        out.push(HEADER_MAGIC);
        let mut tag = [0u8; KIND_LEN];
        let text = self.kind.tag().as_bytes();
        tag[..text.len()].copy_from_slice(text);
        out.extend_from_slice(&tag);
        out.extend_from_slice(self.correlation_id.as_bytes());
        out.extend_from_slice(&self.fragment_index.to_le_bytes());
        out.extend_from_slice(&self.fragment_count.to_le_bytes());
        out.extend_from_slice(&[0u8; RESERVED_LEN]);
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.body);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out.push(FOOTER_MAGIC);
        out
    }

    /// Parses one complete frame, enforcing all six well-formedness
    /// rules. `frame` must be exactly the frame announced by its own
    /// header; the framer guarantees this by sizing the slice from
    /// [`peek_header`].
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let header = peek_header(frame)?;
        let frame_len = header.frame_len();
        if frame.len() < frame_len {
            return Err(ProtocolError::Truncated {
                needed: frame_len,
                have: frame.len(),
            });
        }
        let trailer = frame[frame_len - 1];
        if trailer != FOOTER_MAGIC {
            return Err(ProtocolError::BadTrailingMagic(trailer));
        }
        let crc_offset = HEADER_LEN + header.body_len as usize;
        let expected = read_u32(frame, crc_offset);
        let actual = crc32fast::hash(&frame[..crc_offset]);
        if expected != actual {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }
        Ok(Self {
            kind: header.kind,
            correlation_id: header.correlation_id,
            fragment_index: header.fragment_index,
            fragment_count: header.fragment_count,
            body: frame[HEADER_LEN..crc_offset].to_vec(),
        })
    }

    /// Splits the packet into wire fragments no larger than
    /// `max_body`, slicing the body into equal parts (1-based indices,
    /// same correlation id). A packet that already fits is returned
    /// unchanged.
    #[must_use]
    pub fn into_fragments(self, max_body: usize) -> Vec<Self> {
        if self.body.len() <= max_body || max_body == 0 {
            return vec![self];
        }
        let count = self.body.len().div_ceil(max_body);
        let slice_len = self.body.len().div_ceil(count);
        self.body
            .chunks(slice_len)
            .enumerate()
            .map(|(i, chunk)| Self {
                kind: self.kind,
                correlation_id: self.correlation_id,
                fragment_index: (i + 1) as u32,
                fragment_count: count as u32,
                body: chunk.to_vec(),
            })
            .collect()
    }
}
