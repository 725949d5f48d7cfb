//! Bookkeeping for transmitted packets awaiting acknowledgement.

use crate::packet::Control;
use crate::seq::seq_leq;
use std::collections::VecDeque;

/// A transmitted packet retained until the peer cumulatively acknowledges
/// its sequence number.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    /// The sequence number stamped on the packet.
    pub seq_nr: u16,
    /// The flags stamped on the packet.
    pub ctl: Control,
    /// The encoded bytes, exactly as handed to the send callback.
    pub packet: Vec<u8>,
    /// Length of the user payload inside `packet`.
    pub payload_len: usize,
    /// Tick time of the most recent transmission.
    pub timestamp: u64,
    /// Total transmissions so far, the first included.
    pub transmissions: u32,
}

/// The retransmission queue. Packets are pushed in stamping order, so the
/// queue is sorted by sequence number and the front is always the oldest
/// unacknowledged packet.
#[derive(Debug, Default)]
pub struct Outbuf {
    queue: VecDeque<OutgoingPacket>,
}

impl Outbuf {
    pub fn push(&mut self, pkt: OutgoingPacket) {
        self.queue.push_back(pkt);
    }

    pub fn front(&self) -> Option<&OutgoingPacket> {
        self.queue.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut OutgoingPacket> {
        self.queue.front_mut()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Releases every packet covered by the cumulative acknowledgement
    /// `ack` and returns how many were released.
    pub fn pop_acked(&mut self, ack: u16) -> usize {
        let mut popped = 0;
        while let Some(front) = self.queue.front() {
            if seq_leq(front.seq_nr, ack) {
                self.queue.pop_front();
                popped += 1;
            } else {
                break;
            }
        }
        popped
    }
}
