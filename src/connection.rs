//! Per-connection state, the state machine and the packet pipeline.
//!
//! A [`Connection`] is driven from exactly three directions, all on the
//! caller's thread: user API calls (`connect`, `listen`, `accept`, `write`,
//! `close`), inbound datagrams (`process`) and timer ticks (`tick`). It
//! never blocks and owns no I/O; every side effect leaves through the
//! callback table.

mod callback;
mod incoming;
mod outgoing;
mod state;


pub use callback::{
    Callback, CallbackArgs, CallbackDetail, CallbackTable, CallbackType, ProcResult,
    CALLBACK_SLOTS,
};
pub use outgoing::OutgoingPacket;
pub use state::ConnState;

use crate::packet::{self, Control, PacketHeader, MSS_CEILING};
use crate::seq::{seq_geq, seq_gt, seq_leq};
use crate::RtpError;
use incoming::{InboundPacket, Incoming};
use outgoing::Outbuf;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Lower bound on the retransmission timeout.
pub const RTO_MIN_MS: u64 = 1000;
/// Upper bound on the retransmission timeout.
pub const RTO_MAX_MS: u64 = 12000;
/// Ticks spaced closer to `RTO_MIN_MS` than this cause spurious resends.
pub const TIMEEVENT_INTERVAL_MAX_MS: u64 = 500;
/// Maximum segment lifetime; TIME_WAIT lingers for twice this.
pub const MSL_MS: u64 = 5000;
/// Resends of a single packet tolerated before the connection resets.
pub const MAX_RETRANSMISSIONS: u32 = 5;
/// Hard cap on packets parked in the reorder buffer.
pub const MAX_REORDER_PACKETS: usize = 256;

/// What to do with an inbound packet's position in sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckAction {
    /// Already acknowledged; a duplicate or a stale retransmission.
    Drop,
    /// Exactly the next expected sequence number.
    Deliver,
    /// Ahead of the next expected sequence number; park it.
    Cache,
}

/// One endpoint of a reliable conversation over datagrams.
#[derive(Debug)]
pub struct Connection {
    sock_id: u16,
    peer_sock_id: u16,
    state: ConnState,
    local_addr: Option<SocketAddr>,
    local_port: Option<u16>,
    peer_addr: Option<SocketAddr>,
    /// Whether this connection serves a listening port and should return
    /// to `PassiveListen` after a teardown.
    listener: bool,

    /// Next sequence number to stamp on a sequence-space packet. Pure ACKs
    /// borrow this value without consuming it.
    seq_nr: u16,
    /// Initial send sequence number, stamped on our SYN or SYN+ACK.
    iss: u16,
    /// Highest contiguous peer sequence number delivered to the user.
    ack_nr: u16,
    /// Highest own sequence number cumulatively acknowledged by the peer.
    my_seq_acked_by_peer: u16,
    /// Sequence number our FIN was stamped with, once sent.
    fin_seq: Option<u16>,
    initial_seq_override: Option<u16>,

    /// Current retransmission timeout.
    rto: u64,
    /// Peer's advertised receive window, in packets.
    peer_window: u16,
    outbuf: Outbuf,
    inbuf: BinaryHeap<Incoming>,
    /// The most recent time observed through `tick`.
    now_ms: u64,
    /// TIME_WAIT expiry, when armed.
    destroy_at: Option<u64>,
    malformed_packets: u64,
    callbacks: CallbackTable,
}

impl Connection {
    pub(crate) fn new(sock_id: u16, callbacks: CallbackTable) -> Self {
        Self {
            sock_id,
            peer_sock_id: 0,
            state: ConnState::Uninitialized,
            local_addr: None,
            local_port: None,
            peer_addr: None,
            listener: false,
            seq_nr: 0,
            iss: 0,
            ack_nr: 0,
            my_seq_acked_by_peer: 0,
            fin_seq: None,
            initial_seq_override: None,
            rto: RTO_MIN_MS,
            peer_window: 0,
            outbuf: Outbuf::default(),
            inbuf: BinaryHeap::new(),
            now_ms: 0,
            destroy_at: None,
            malformed_packets: 0,
            callbacks,
        }
    }

    /// A child connection spawned off a listener. It shares the listener's
    /// datagram socket, so it starts out `Idle` without consulting the
    /// `Socket` slot.
    pub(crate) fn forked(sock_id: u16, callbacks: CallbackTable) -> Self {
        let mut conn = Self::new(sock_id, callbacks);
        conn.state = ConnState::Idle;
        conn
    }

    // # User API

    /// Acquires the datagram socket through the `Socket` slot and readies
    /// the connection for `connect` or `listen`.
    pub fn init(&mut self) -> Result<(), RtpError> {
        if self.state != ConnState::Uninitialized {
            return Err(self.fail(RtpError::InvalidState));
        }
        if self.invoke(CallbackType::Socket, &[], CallbackDetail::None) == ProcResult::Error {
            return Err(self.fail(RtpError::CallbackRejected));
        }
        self.set_state(ConnState::Idle);
        Ok(())
    }

    /// Binds the underlying socket through the `Bind` slot.
    pub fn bind(&mut self, addr: SocketAddr) -> Result<(), RtpError> {
        if self.state != ConnState::Idle {
            return Err(self.fail(RtpError::InvalidState));
        }
        if self.invoke(CallbackType::Bind, &[], CallbackDetail::Addr(addr)) == ProcResult::Error {
            return Err(self.fail(RtpError::CallbackRejected));
        }
        self.local_addr = Some(addr);
        Ok(())
    }

    /// Marks the connection as the listener for `port`. Port bookkeeping
    /// lives in the [`Context`](crate::Context), which refuses a second
    /// listener before calling this.
    pub fn listen(&mut self, port: u16) -> Result<(), RtpError> {
        if self.state != ConnState::Idle {
            return Err(self.fail(RtpError::InvalidState));
        }
        self.local_port = Some(port);
        self.listener = true;
        self.set_state(ConnState::Listen);
        debug!(sock_id = self.sock_id, port, "listening");
        Ok(())
    }

    /// Starts the handshake: sends a SYN carrying our `sock_id` in its
    /// first two payload bytes and moves to `SynSent`.
    pub fn connect(&mut self, to: SocketAddr) -> Result<(), RtpError> {
        if self.state != ConnState::Idle {
            return Err(self.fail(RtpError::InvalidState));
        }
        self.peer_addr = Some(to);
        self.seq_nr = self.initial_seq();
        self.iss = self.seq_nr;
        self.my_seq_acked_by_peer = self.iss.wrapping_sub(1);
        self.ack_nr = 0;
        // The host gets a veto before the first datagram leaves, e.g. to
        // connect its UDP socket to the peer.
        let own_id = self.sock_id.to_be_bytes();
        if self.invoke(CallbackType::Connect, &own_id, CallbackDetail::Addr(to))
            == ProcResult::Error
        {
            self.peer_addr = None;
            return Err(self.fail(RtpError::CallbackRejected));
        }
        self.set_state(ConnState::SynSent);
        let header = self.header(Control::new(false, false, false, true, false));
        debug!(sock_id = self.sock_id, peer = %to, seq_nr = header.seq_nr, "connect: sending SYN");
        self.transmit(header, &own_id)
    }

    /// Answers an inbound SYN: captures the peer's identity, synchronizes
    /// `ack_nr` to the SYN's sequence number and replies SYN+ACK carrying
    /// our `sock_id`.
    pub fn accept(
        &mut self,
        from: SocketAddr,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<(), RtpError> {
        if !matches!(
            self.state,
            ConnState::Idle | ConnState::Listen | ConnState::PassiveListen
        ) {
            return Err(self.fail(RtpError::InvalidState));
        }
        if !header.ctl.syn() || header.ctl.ack() || payload.len() < 2 {
            return Err(self.fail(RtpError::Malformed));
        }
        match self.invoke(CallbackType::BeforeAccept, payload, CallbackDetail::Addr(from)) {
            ProcResult::Error | ProcResult::Reject | ProcResult::Drop => {
                return Err(self.fail(RtpError::CallbackRejected));
            }
            _ => {}
        }
        self.peer_sock_id = u16::from_be_bytes([payload[0], payload[1]]);
        self.peer_addr = Some(from);
        self.peer_window = header.window_size;
        self.seq_nr = self.initial_seq();
        self.iss = self.seq_nr;
        self.my_seq_acked_by_peer = self.iss.wrapping_sub(1);
        self.ack_nr = header.seq_nr;
        self.set_state(ConnState::SynRecv);
        debug!(
            sock_id = self.sock_id,
            peer = %from,
            peer_sock_id = self.peer_sock_id,
            "accept: sending SYN+ACK"
        );
        let synack = self.header(Control::new(false, true, false, true, false));
        let own_id = self.sock_id.to_be_bytes();
        self.transmit(synack, &own_id)?;
        let _ = self.invoke(CallbackType::OnAccept, &[], CallbackDetail::Addr(from));
        Ok(())
    }

    /// Sends one packet of user payload. Payloads above [`MSS_CEILING`]
    /// must be split by the caller.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), RtpError> {
        if !matches!(
            self.state,
            ConnState::Connected | ConnState::ConnectedFull | ConnState::CloseWait
        ) {
            return Err(self.fail(RtpError::InvalidState));
        }
        if buf.len() > MSS_CEILING {
            return Err(self.fail(RtpError::PayloadTooLarge));
        }
        let header = self.header(Control::new(false, true, false, false, false));
        trace!(sock_id = self.sock_id, seq_nr = header.seq_nr, len = buf.len(), "write");
        self.transmit(header, buf)
    }

    /// Begins a graceful teardown, or cancels the connection when the
    /// handshake has not completed yet.
    pub fn close(&mut self) -> Result<(), RtpError> {
        match self.state {
            ConnState::SynSent | ConnState::SynRecv => {
                // Cancelling a handshake is unrecoverable.
                self.enter_reset(RtpError::InvalidState);
                Err(RtpError::InvalidState)
            }
            ConnState::Connected | ConnState::ConnectedFull => {
                debug!(sock_id = self.sock_id, "close: sending FIN");
                self.set_state(ConnState::FinWait1);
                self.send_fin()
            }
            ConnState::CloseWait => {
                debug!(sock_id = self.sock_id, "close after peer's FIN: sending FIN");
                self.set_state(ConnState::LastAck);
                self.send_fin()
            }
            // Teardown is already under way; a repeated close changes
            // nothing on the wire.
            ConnState::TimeWait => Ok(()),
            _ => Err(self.fail(RtpError::InvalidState)),
        }
    }

    /// Processes one inbound datagram addressed to this connection.
    pub fn process(&mut self, from: SocketAddr, datagram: &[u8]) -> ProcResult {
        let (header, payload) = match packet::decode(datagram) {
            Ok(parts) => parts,
            Err(e) => {
                self.malformed_packets += 1;
                warn!(sock_id = self.sock_id, %e, "dropping malformed datagram");
                let _ = self.invoke(CallbackType::Log, datagram, CallbackDetail::Addr(from));
                return ProcResult::Drop;
            }
        };
        if matches!(self.state, ConnState::Destroy | ConnState::Reset) {
            return ProcResult::Drop;
        }
        if let Some(peer) = self.peer_addr {
            if peer != from {
                trace!(sock_id = self.sock_id, %from, "datagram from a foreign address");
                return ProcResult::Drop;
            }
        }
        trace!(
            sock_id = self.sock_id,
            seq_nr = header.seq_nr,
            ack_nr = header.ack_nr,
            my_ack = self.ack_nr,
            payload = payload.len(),
            "packet in"
        );

        if header.ctl.rst() {
            self.enter_reset(RtpError::PeerReset);
            return ProcResult::Finish;
        }
        if header.ctl.syn() && header.ctl.ack() {
            return self.process_syn_ack(&header, payload);
        }
        if header.ctl.syn() {
            return self.process_syn(from, &header, payload);
        }

        // Anything else presumes an exchange of SYNs.
        match self.state {
            ConnState::Uninitialized
            | ConnState::Idle
            | ConnState::Listen
            | ConnState::SynSent => {
                let _ = self.fail(RtpError::InvalidState);
                return ProcResult::Error;
            }
            ConnState::PassiveListen => return ProcResult::Drop,
            _ => {}
        }

        if header.ctl.ack() {
            self.handle_peer_ack(&header);
            match self.state {
                ConnState::Destroy => return ProcResult::Finish,
                // A listener just finished its conversation; the counters
                // are reset and nothing further in this packet applies.
                ConnState::PassiveListen => return ProcResult::Ok,
                _ => {}
            }
        }

        let occupies = header.ctl.fin() || !payload.is_empty();
        if !occupies {
            // A pure ACK claims no place in sequence space; its ack and
            // window fields were everything it had to say.
            return ProcResult::Ok;
        }
        if self.state == ConnState::SynRecv {
            // Data cannot precede the acknowledgement that completes the
            // handshake.
            let _ = self.fail(RtpError::InvalidState);
            return ProcResult::Error;
        }

        let old_ack = self.ack_nr;
        let mut fin_ready = false;
        let mut result = ProcResult::Ok;
        match self.sequence_packet(&header) {
            AckAction::Drop => {
                // A retransmission of something already acknowledged: the
                // peer must be missing our ACK, so repeat it.
                trace!(
                    sock_id = self.sock_id,
                    seq_nr = header.seq_nr,
                    my_ack = self.ack_nr,
                    "duplicate packet, repeating ACK"
                );
                self.send_bare_ack();
                if self.state == ConnState::TimeWait {
                    self.destroy_at = Some(self.now_ms + 2 * MSL_MS);
                }
                result = ProcResult::Drop;
            }
            AckAction::Deliver => {
                self.deliver(&header, payload);
                fin_ready = header.ctl.fin();
            }
            AckAction::Cache => {
                result = self.cache(header, payload);
            }
        }
        if result == ProcResult::Ok {
            fin_ready |= self.drain();
            if self.ack_nr != old_ack {
                self.send_bare_ack();
            }
            if fin_ready {
                self.process_fin();
            }
        }
        if self.state == ConnState::Destroy {
            ProcResult::Finish
        } else {
            result
        }
    }

    /// Advances the connection's clock: retransmits the oldest overdue
    /// packet and expires TIME_WAIT.
    pub fn tick(&mut self, now_ms: u64) -> ProcResult {
        self.now_ms = now_ms;
        match self.state {
            ConnState::Destroy | ConnState::Reset => return ProcResult::Finish,
            ConnState::Uninitialized
            | ConnState::Idle
            | ConnState::Listen
            | ConnState::PassiveListen => return ProcResult::Ok,
            ConnState::TimeWait => {
                if let Some(at) = self.destroy_at {
                    if now_ms >= at {
                        debug!(sock_id = self.sock_id, "2*MSL elapsed");
                        self.enter_destroy();
                        return ProcResult::Finish;
                    }
                }
                return ProcResult::Ok;
            }
            _ => {}
        }

        let due = match self.outbuf.front() {
            Some(front) => now_ms >= front.timestamp.saturating_add(self.rto),
            None => false,
        };
        if !due {
            return ProcResult::Ok;
        }
        let (seq_nr, transmissions, bytes) = {
            let front = self.outbuf.front().expect("outbuf checked non-empty");
            (front.seq_nr, front.transmissions, front.packet.clone())
        };
        if transmissions > MAX_RETRANSMISSIONS {
            // No progress despite repeated resends; give up on the peer.
            warn!(sock_id = self.sock_id, seq_nr, "retransmission limit reached");
            let err = if self.state < ConnState::Connected {
                RtpError::HandshakeTimeout
            } else {
                RtpError::PeerReset
            };
            self.enter_reset(err);
            return ProcResult::Finish;
        }
        debug!(
            sock_id = self.sock_id,
            seq_nr,
            transmissions,
            rto = self.rto,
            "retransmitting"
        );
        let detail = self.peer_detail();
        let _ = self.invoke(CallbackType::SendTo, &bytes, detail);
        if let Some(front) = self.outbuf.front_mut() {
            front.transmissions += 1;
            front.timestamp = now_ms;
        }
        // Back off until the peer shows signs of life.
        self.rto = (self.rto * 2).min(RTO_MAX_MS);
        ProcResult::Ok
    }

    // # Callback management

    pub fn set_callback(
        &mut self,
        kind: CallbackType,
        callback: impl Fn(&CallbackArgs) -> ProcResult + 'static,
    ) {
        self.callbacks.set(kind, callback);
    }

    pub fn clear_callback(&mut self, kind: CallbackType) {
        self.callbacks.clear(kind);
    }

    pub(crate) fn callback_table(&self) -> &CallbackTable {
        &self.callbacks
    }

    // # Accessors

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn sock_id(&self) -> u16 {
        self.sock_id
    }

    pub fn peer_sock_id(&self) -> u16 {
        self.peer_sock_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_listener(&self) -> bool {
        self.listener
    }

    /// Highest contiguous peer sequence number delivered to the user.
    pub fn ack_nr(&self) -> u16 {
        self.ack_nr
    }

    /// Sequence number the next outgoing sequence-space packet will carry.
    pub fn next_seq_nr(&self) -> u16 {
        self.seq_nr
    }

    /// Packets sent but not yet acknowledged by the peer.
    pub fn in_flight(&self) -> usize {
        self.outbuf.len()
    }

    /// Packets parked in the reorder buffer.
    pub fn reorder_buffered(&self) -> usize {
        self.inbuf.len()
    }

    /// Malformed datagrams dropped so far.
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets
    }

    pub fn rto(&self) -> u64 {
        self.rto
    }

    /// Pins the next initial sequence number instead of drawing it from
    /// the thread RNG. Meant for reproducible setups and tests.
    pub fn set_initial_seq(&mut self, seq: u16) {
        self.initial_seq_override = Some(seq);
    }

    // # Inbound processing

    fn process_syn_ack(&mut self, header: &PacketHeader, payload: &[u8]) -> ProcResult {
        match self.state {
            ConnState::SynSent => {
                if payload.len() < 2 {
                    self.malformed_packets += 1;
                    warn!(sock_id = self.sock_id, "SYN+ACK without the peer's sock id");
                    return ProcResult::Drop;
                }
                self.peer_sock_id = u16::from_be_bytes([payload[0], payload[1]]);
                self.ack_nr = header.seq_nr;
                self.handle_peer_ack(header);
                debug!(
                    sock_id = self.sock_id,
                    peer_sock_id = self.peer_sock_id,
                    "handshake completed"
                );
                self.set_state(ConnState::Connected);
                let _ = self.invoke(CallbackType::OnEstablished, &[], CallbackDetail::None);
                // Acknowledge immediately so the peer's SYN+ACK timer
                // stops before it fires.
                self.send_bare_ack();
                ProcResult::Ok
            }
            ConnState::Connected | ConnState::ConnectedFull => {
                // Retransmitted SYN+ACK: our handshake ACK was lost.
                self.send_bare_ack();
                ProcResult::Drop
            }
            _ => {
                let _ = self.fail(RtpError::InvalidState);
                ProcResult::Error
            }
        }
    }

    fn process_syn(
        &mut self,
        from: SocketAddr,
        header: &PacketHeader,
        payload: &[u8],
    ) -> ProcResult {
        match self.state {
            ConnState::Idle | ConnState::Listen | ConnState::PassiveListen => {
                match self.accept(from, header, payload) {
                    Ok(()) => ProcResult::Ok,
                    Err(_) => ProcResult::Reject,
                }
            }
            // Duplicate SYN; the queued SYN+ACK retransmits on its own.
            ConnState::SynRecv => ProcResult::Drop,
            _ => {
                // A stray SYN on a live connection: repeat the current ACK
                // so a peer missing our handshake ACK can resynchronize.
                self.send_bare_ack();
                ProcResult::Drop
            }
        }
    }

    /// Applies the acknowledgement and window fields of an inbound packet:
    /// releases acknowledged packets and runs the transitions that hang on
    /// an ACK.
    fn handle_peer_ack(&mut self, header: &PacketHeader) {
        self.peer_window = header.window_size;
        let ack = header.ack_nr;
        if seq_gt(ack, self.seq_nr.wrapping_sub(1)) {
            warn!(sock_id = self.sock_id, ack, "ignoring ACK beyond what was sent");
            return;
        }
        if seq_gt(ack, self.my_seq_acked_by_peer) {
            self.my_seq_acked_by_peer = ack;
            let released = self.outbuf.pop_acked(ack);
            if released > 0 {
                // Forward progress relaxes the retransmission timeout.
                self.rto = (self.rto / 2).max(RTO_MIN_MS);
                trace!(
                    sock_id = self.sock_id,
                    ack,
                    released,
                    rto = self.rto,
                    "peer acknowledged packets"
                );
            }
        }
        match self.state {
            ConnState::SynRecv if seq_geq(self.my_seq_acked_by_peer, self.iss) => {
                debug!(sock_id = self.sock_id, "handshake completed");
                self.set_state(ConnState::Connected);
                let _ = self.invoke(CallbackType::OnEstablished, &[], CallbackDetail::None);
            }
            ConnState::FinWait1 if self.fin_acked() => {
                self.set_state(ConnState::FinWait2);
            }
            ConnState::LastAck if self.fin_acked() => {
                debug!(sock_id = self.sock_id, "FIN acknowledged, closing");
                self.enter_destroy();
            }
            _ => {}
        }
        self.update_fullness();
    }

    /// Places an inbound packet in sequence space relative to `ack_nr`,
    /// advancing it when the packet is the next expected one.
    fn sequence_packet(&mut self, header: &PacketHeader) -> AckAction {
        let seq = header.seq_nr;
        if seq_leq(seq, self.ack_nr) {
            AckAction::Drop
        } else if seq == self.ack_nr.wrapping_add(1) {
            self.ack_nr = seq;
            AckAction::Deliver
        } else {
            AckAction::Cache
        }
    }

    /// Hands in-order payload to the user.
    fn deliver(&mut self, header: &PacketHeader, payload: &[u8]) {
        if header.ctl.syn() || payload.is_empty() {
            // Handshake payload carries the peer's sock id, not user data.
            return;
        }
        let kind = if header.ctl.urg() {
            CallbackType::OnRecvUrg
        } else {
            CallbackType::OnRecv
        };
        let _ = self.invoke(kind, payload, CallbackDetail::None);
    }

    /// Parks an out-of-order packet in the reorder buffer.
    fn cache(&mut self, header: PacketHeader, payload: &[u8]) -> ProcResult {
        if self.inbuf.len() >= MAX_REORDER_PACKETS {
            warn!(sock_id = self.sock_id, "reorder buffer full, dropping packet");
            let _ = self.fail(RtpError::Exhausted);
            return ProcResult::Error;
        }
        let buffered = self.inbuf.len();
        let admit = self.invoke(
            CallbackType::GetReadBufferSize,
            &[],
            CallbackDetail::Buffered(buffered),
        );
        if matches!(admit, ProcResult::Reject | ProcResult::Drop) {
            trace!(
                sock_id = self.sock_id,
                seq_nr = header.seq_nr,
                "host refused to buffer, packet treated as lost"
            );
            return ProcResult::Drop;
        }
        trace!(
            sock_id = self.sock_id,
            seq_nr = header.seq_nr,
            my_ack = self.ack_nr,
            buffered,
            "caching out-of-order packet"
        );
        self.inbuf.push(Incoming::new(InboundPacket {
            header,
            payload: payload.to_vec(),
        }));
        ProcResult::Cache
    }

    /// Releases the contiguous run of cached packets unlocked by an
    /// advanced `ack_nr`. Returns whether a consumed packet carried FIN.
    fn drain(&mut self) -> bool {
        let mut fin_seen = false;
        while let Some(top) = self.inbuf.peek() {
            let seq = top.header.seq_nr;
            if seq_leq(seq, self.ack_nr) {
                // A duplicate parked before its twin was delivered.
                let _ = self.inbuf.pop();
                continue;
            }
            if seq != self.ack_nr.wrapping_add(1) {
                break;
            }
            let pkt = match self.inbuf.pop() {
                Some(incoming) => incoming.into_inner(),
                None => break,
            };
            self.ack_nr = seq;
            self.deliver(&pkt.header, &pkt.payload);
            fin_seen |= pkt.header.ctl.fin();
        }
        fin_seen
    }

    /// Runs the teardown transition for a FIN whose sequence number was
    /// just consumed. Deferred until the data ahead of it was delivered
    /// and the cumulative ACK went out, so a FIN cached behind a gap waits
    /// for the gap to fill.
    fn process_fin(&mut self) {
        match self.state {
            ConnState::Connected | ConnState::ConnectedFull => {
                debug!(sock_id = self.sock_id, "peer closed, conversation half open");
                self.set_state(ConnState::CloseWait);
                let _ = self.invoke(CallbackType::OnPeerClose, &[], CallbackDetail::None);
            }
            ConnState::FinWait2 => {
                debug!(sock_id = self.sock_id, "peer closed too, lingering 2*MSL");
                self.set_state(ConnState::TimeWait);
                self.destroy_at = Some(self.now_ms + 2 * MSL_MS);
            }
            _ => {
                // Simultaneous close is not supported; surface and stay.
                let _ = self.fail(RtpError::InvalidState);
            }
        }
    }

    // # Outbound path

    /// Builds a header stamped with the connection's current counters.
    fn header(&self, ctl: Control) -> PacketHeader {
        PacketHeader {
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
            peer_sock_id: self.peer_sock_id,
            opts_count: 0,
            ctl,
            window_size: self.advertised_window(),
        }
    }

    fn advertised_window(&self) -> u16 {
        MAX_REORDER_PACKETS.saturating_sub(self.inbuf.len()) as u16
    }

    /// Encodes and sends a packet, consuming a sequence number and queueing
    /// for retransmission when the packet occupies sequence space.
    fn transmit(&mut self, header: PacketHeader, payload: &[u8]) -> Result<(), RtpError> {
        let bytes = match packet::encode(&header, payload) {
            Ok(bytes) => bytes,
            Err(_) => return Err(self.fail(RtpError::PayloadTooLarge)),
        };
        let occupies = header.ctl.syn() || header.ctl.fin() || !payload.is_empty();
        if occupies {
            self.seq_nr = self.seq_nr.wrapping_add(1);
        }
        trace!(
            sock_id = self.sock_id,
            seq_nr = header.seq_nr,
            len = bytes.len(),
            payload = payload.len(),
            "packet out"
        );
        let detail = self.peer_detail();
        let result = self.invoke(CallbackType::SendTo, &bytes, detail);
        if occupies && self.state != ConnState::Destroy {
            self.outbuf.push(OutgoingPacket {
                seq_nr: header.seq_nr,
                ctl: header.ctl,
                packet: bytes,
                payload_len: payload.len(),
                timestamp: self.now_ms,
                transmissions: 1,
            });
            self.update_fullness();
        }
        match result {
            ProcResult::Error => Err(self.fail(RtpError::SendFailed)),
            ProcResult::Drop => {
                // The host could not send without blocking; the packet
                // stays queued and the retransmission timer covers it.
                trace!(sock_id = self.sock_id, seq_nr = header.seq_nr, "send deferred by host");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Emits an acknowledgement that claims no place in sequence space.
    /// Never queued: the peer's retransmissions regenerate it as needed.
    fn send_bare_ack(&mut self) {
        let header = self.header(Control::new(false, true, false, false, false));
        let bytes = packet::encode(&header, &[])
            .expect("header-only packet is always within bounds");
        trace!(sock_id = self.sock_id, ack_nr = header.ack_nr, "bare ACK out");
        let detail = self.peer_detail();
        let _ = self.invoke(CallbackType::SendTo, &bytes, detail);
    }

    fn send_fin(&mut self) -> Result<(), RtpError> {
        let header = self.header(Control::new(false, true, false, false, true));
        self.fin_seq = Some(header.seq_nr);
        self.transmit(header, &[])
    }

    // # State plumbing

    fn set_state(&mut self, next: ConnState) {
        if self.state == next || self.state == ConnState::Destroy {
            return;
        }
        trace!(sock_id = self.sock_id, from = ?self.state, to = ?next, "state change");
        self.state = next;
        let _ = self.invoke(CallbackType::OnStateChange, &[], CallbackDetail::None);
    }

    fn update_fullness(&mut self) {
        let full = self.peer_window > 0 && self.outbuf.len() >= self.peer_window as usize;
        match (self.state, full) {
            (ConnState::Connected, true) => self.set_state(ConnState::ConnectedFull),
            (ConnState::ConnectedFull, false) => self.set_state(ConnState::Connected),
            _ => {}
        }
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq
            .map_or(false, |fin| seq_geq(self.my_seq_acked_by_peer, fin))
    }

    /// Tears the connection down after a peer reset or a fatal error:
    /// `OnError`, then `Reset`, then `OnDestroy`.
    fn enter_reset(&mut self, err: RtpError) {
        warn!(sock_id = self.sock_id, %err, "connection reset");
        let _ = self.invoke(CallbackType::OnError, &[], CallbackDetail::Error(err));
        self.set_state(ConnState::Reset);
        self.outbuf.clear();
        self.inbuf.clear();
        let _ = self.invoke(CallbackType::OnDestroy, &[], CallbackDetail::None);
    }

    /// Finishes a graceful teardown. A listener returns to
    /// `PassiveListen` with a clean slate instead of dying.
    fn enter_destroy(&mut self) {
        if matches!(
            self.state,
            ConnState::Destroy | ConnState::PassiveListen | ConnState::Reset
        ) {
            return;
        }
        if self.listener {
            debug!(sock_id = self.sock_id, "conversation finished, back to listening");
            self.set_state(ConnState::PassiveListen);
            self.reset_conversation();
        } else {
            self.set_state(ConnState::Destroy);
            self.outbuf.clear();
            self.inbuf.clear();
            self.destroy_at = None;
            let _ = self.invoke(CallbackType::OnDestroy, &[], CallbackDetail::None);
        }
    }

    fn reset_conversation(&mut self) {
        self.peer_sock_id = 0;
        self.peer_addr = None;
        self.ack_nr = 0;
        self.my_seq_acked_by_peer = 0;
        self.fin_seq = None;
        self.destroy_at = None;
        self.rto = RTO_MIN_MS;
        self.peer_window = 0;
        self.outbuf.clear();
        self.inbuf.clear();
    }

    // # Callback plumbing

    /// Runs a callback slot with this connection's identity attached.
    /// `Finish` from any slot forces the connection to `Destroy`.
    fn invoke(&mut self, kind: CallbackType, data: &[u8], detail: CallbackDetail) -> ProcResult {
        if self.state == ConnState::Destroy && kind != CallbackType::OnDestroy {
            return ProcResult::Ok;
        }
        let args = CallbackArgs {
            sock_id: self.sock_id,
            kind,
            state: self.state,
            data,
            detail,
        };
        let result = self.callbacks.invoke(&args);
        if result == ProcResult::Finish {
            self.enter_destroy();
        }
        result
    }

    /// Surfaces an error through `OnError` and hands the code back for the
    /// API return value.
    fn fail(&mut self, err: RtpError) -> RtpError {
        let _ = self.invoke(CallbackType::OnError, &[], CallbackDetail::Error(err));
        err
    }

    fn peer_detail(&self) -> CallbackDetail {
        match self.peer_addr {
            Some(addr) => CallbackDetail::Addr(addr),
            None => CallbackDetail::None,
        }
    }

    fn initial_seq(&self) -> u16 {
        match self.initial_seq_override {
            Some(seq) => seq,
            None => rand::random(),
        }
    }
}
