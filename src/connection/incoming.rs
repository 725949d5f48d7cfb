//! Ordering wrapper that turns `BinaryHeap` into the reorder buffer.

use crate::packet::PacketHeader;
use crate::seq::seq_lt;
use std::{
    cmp::Ordering,
    ops::{Deref, DerefMut},
};

/// A decoded inbound packet parked until the sequence gap before it closes.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Incoming(InboundPacket);

impl Incoming {
    pub fn new(packet: InboundPacket) -> Self {
        Self(packet)
    }

    pub fn into_inner(self) -> InboundPacket {
        self.0
    }
}

impl PartialEq for Incoming {
    fn eq(&self, other: &Self) -> bool {
        self.0.header.seq_nr == other.0.header.seq_nr
    }
}

impl Eq for Incoming {}

impl PartialOrd for Incoming {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Incoming {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.header.seq_nr == other.0.header.seq_nr {
            Ordering::Equal
        } else if seq_lt(self.0.header.seq_nr, other.0.header.seq_nr) {
            // Reversed so the max-heap hands back the lowest sequence
            // number first
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl Deref for Incoming {
    type Target = InboundPacket;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Incoming {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
