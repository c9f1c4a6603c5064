#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Framed wire protocol spoken between the guest agent and the
//! hypervisor host over a virtual serial link.
//!
//! The link is byte-oriented and lossy-looking: the host may open and
//! close the device at any time, leaving garbage, partial frames, or
//! nothing at all in the stream. Everything in this crate is built
//! around that assumption:
//!
//! - [`wire`] defines the packet layout (magic bytes, NUL-padded kind
//!   tag, 32-hex correlation id, little-endian lengths, CRC-32 footer)
//!   and the well-formedness rules,
//! - [`framer`] turns the raw byte stream into whole packets,
//!   re-synchronizing after garbage and giving up on frames whose body
//!   never arrives,
//! - [`reassembly`] collects multi-packet messages by correlation id
//!   and acknowledges each fragment,
//! - [`body`] parses `<command>` request bodies and builds the
//!   `<response>` reply bodies with exactly one level of XML escaping.
//!
//! The serial device itself sits behind the [`Link`] trait so the
//! whole stack can be driven from memory in tests.

pub mod body;
mod error;
pub mod framer;
mod link;
pub mod reassembly;
pub mod wire;

pub use error::ProtocolError;
pub use link::Link;
#[cfg(any(test, feature = "test-support"))]
pub use link::testing::{ChannelLink, link_pair};
pub use wire::{CorrelationId, Packet, PacketKind};
