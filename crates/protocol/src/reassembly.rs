//! crates/protocol/src/reassembly.rs
//!
//! Multi-packet message reassembly keyed by correlation id.
//!
//! The host paces large requests by waiting for a RECEIVED
//! acknowledgement per fragment, so every accepted fragment produces
//! an ack — including the final one. Bodies are concatenated in
//! ascending fragment order once all fragments are present.

use std::collections::HashMap;

use tracing::{debug, error};

use crate::wire::{CorrelationId, Packet, PacketKind};

/// What [`Reassembler::accept`] decided about one inbound packet.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reassembled {
    /// Acknowledgement to write back to the host, when the packet was
    /// a fragment of a larger message.
    pub ack: Option<Packet>,
    /// A complete logical message: either the packet itself (single)
    /// or the synthetic single message assembled from all fragments.
    pub message: Option<Packet>,
}

#[derive(Debug)]
struct PendingMessage {
    kind: PacketKind,
    count: u32,
    fragments: HashMap<u32, Vec<u8>>,
}

/// Fragment table for in-progress multi-packet messages.
#[derive(Debug, Default)]
pub struct Reassembler {
    table: HashMap<CorrelationId, PendingMessage>,
}

impl Reassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently awaiting fragments.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    /// Folds one framed packet into the table.
    ///
    /// Single packets pass straight through. Fragments are stored and
    /// acknowledged; once the last fragment lands the entry is purged
    /// and the concatenated message is emitted. A completion with a
    /// missing index purges the entry without emitting anything.
    pub fn accept(&mut self, packet: Packet) -> Reassembled {
        if packet.is_single() {
            return Reassembled {
                ack: None,
                message: Some(packet),
            };
        }

        let id = packet.correlation_id;
        let ack = Packet::received(id, packet.fragment_index, packet.fragment_count, false);
        let entry = self.table.entry(id).or_insert_with(|| PendingMessage {
            kind: packet.kind,
            count: packet.fragment_count,
            fragments: HashMap::new(),
        });
        entry.fragments.insert(packet.fragment_index, packet.body);
        debug!(
            %id,
            stored = entry.fragments.len(),
            expected = entry.count,
            "buffered message fragment"
        );

        if (entry.fragments.len() as u32) < entry.count {
            return Reassembled {
                ack: Some(ack),
                message: None,
            };
        }

        let Some(mut done) = self.table.remove(&id) else {
            return Reassembled {
                ack: Some(ack),
                message: None,
            };
        };
        let mut body = Vec::new();
        for index in 1..=done.count {
            match done.fragments.remove(&index) {
                Some(fragment) => body.extend_from_slice(&fragment),
                None => {
                    error!(%id, index, "fragment sequence incomplete, dropping message");
                    return Reassembled {
                        ack: Some(ack),
                        message: None,
                    };
                }
            }
        }
        Reassembled {
            ack: Some(ack),
            message: Some(Packet::single(done.kind, id, body)),
        }
    }
}
