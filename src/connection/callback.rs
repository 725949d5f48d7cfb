//! The callback surface between a connection and its host.
//!
//! The core never touches a socket, a clock or a log sink directly; every
//! side effect is routed through one of the slots below. A host installs
//! closures for the slots it cares about and leaves the rest empty; an
//! absent slot behaves as a no-op returning [`ProcResult::Ok`].

use super::state::ConnState;
use crate::RtpError;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

/// Result code returned by callbacks and by the packet-processing entry
/// points. The core interprets these uniformly: `Finish` forces the
/// connection to `Destroy`, `Error` from a transition guard aborts the
/// transition, `Drop`/`Reject`/`Cache`/`Wait` carry the per-slot meanings
/// documented on each call site.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ProcResult {
    #[default]
    Ok,
    Error,
    Finish,
    Cache,
    Drop,
    Reject,
    Wait,
}

/// The callback slots, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackType {
    /// An error code is about to be returned to the caller.
    OnError = 0,
    /// The connection moved to a new state.
    OnStateChange,
    /// Admission check before an out-of-order packet is parked in the
    /// reorder buffer; `Reject` or `Drop` refuses the buffering.
    GetReadBufferSize,
    /// Reserved. Initial sequence numbers come from the `rand` crate; see
    /// [`Connection::set_initial_seq`](super::Connection::set_initial_seq)
    /// for a deterministic override.
    GetRandom,
    /// A dropped malformed datagram, handed over for diagnostics.
    Log,
    /// The connection needs a datagram socket.
    Socket,
    /// The connection was bound to a local address.
    Bind,
    /// Guard before the first SYN goes out; `Error` vetoes the connect.
    Connect,
    /// Guard before an inbound SYN is accepted; `Reject` or `Drop` vetoes.
    BeforeAccept,
    /// An inbound SYN was answered and the connection entered `SynRecv`.
    OnAccept,
    /// The handshake completed; fires before any `OnRecv`.
    OnEstablished,
    /// A datagram is ready for the wire. `Drop` marks the attempt lost
    /// (the packet stays queued for retransmission), `Error` reports a
    /// send failure.
    SendTo,
    /// In-order payload, delivered exactly once per sequence number.
    OnRecv,
    /// In-order payload that was flagged urgent.
    OnRecvUrg,
    /// The peer sent FIN; it will send no more data.
    OnPeerClose,
    /// The connection is gone. Always the last callback to fire.
    OnDestroy,
    /// Reserved.
    OnUrgTimeout,
    /// Reserved.
    BeforeRepAccept,
    /// Reserved.
    OnFork,
}

pub const CALLBACK_SLOTS: usize = 19;

/// The argument-specific half of [`CallbackArgs`]: at most one of a peer
/// address, an error code or a buffer occupancy accompanies any call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDetail {
    None,
    /// The peer address a datagram relates to.
    Addr(SocketAddr),
    /// The error code being surfaced.
    Error(RtpError),
    /// Packets currently parked in the reorder buffer.
    Buffered(usize),
}

/// Everything a callback gets to see, bundled in one borrow.
#[derive(Debug, Clone, Copy)]
pub struct CallbackArgs<'a> {
    pub sock_id: u16,
    pub kind: CallbackType,
    /// State snapshot at the moment of the call.
    pub state: ConnState,
    /// Payload or datagram bytes, depending on the slot. Empty when the
    /// slot carries no data.
    pub data: &'a [u8],
    pub detail: CallbackDetail,
}

pub type Callback = Rc<dyn Fn(&CallbackArgs) -> ProcResult>;

/// A flat table of optional callback handles indexed by [`CallbackType`].
///
/// Handles are shared (`Rc`), so cloning a table (as the demultiplexer
/// does when it forks a child connection off a listener) shares the
/// installed closures rather than copying host state.
#[derive(Clone)]
pub struct CallbackTable {
    slots: [Option<Callback>; CALLBACK_SLOTS],
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl CallbackTable {
    pub fn set(&mut self, kind: CallbackType, callback: impl Fn(&CallbackArgs) -> ProcResult + 'static) {
        self.slots[kind as usize] = Some(Rc::new(callback));
    }

    pub fn clear(&mut self, kind: CallbackType) {
        self.slots[kind as usize] = None;
    }

    pub fn installed(&self, kind: CallbackType) -> bool {
        self.slots[kind as usize].is_some()
    }

    /// Runs the slot selected by `args.kind`; an empty slot returns `Ok`.
    pub fn invoke(&self, args: &CallbackArgs) -> ProcResult {
        match &self.slots[args.kind as usize] {
            Some(callback) => callback(args),
            None => ProcResult::Ok,
        }
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installed = self.slots.iter().filter(|slot| slot.is_some()).count();
        f.debug_struct("CallbackTable")
            .field("installed", &installed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn args(kind: CallbackType) -> CallbackArgs<'static> {
        CallbackArgs {
            sock_id: 1,
            kind,
            state: ConnState::Idle,
            data: &[],
            detail: CallbackDetail::None,
        }
    }

    #[test]
    fn empty_slot_is_ok() {
        let table = CallbackTable::default();
        assert_eq!(table.invoke(&args(CallbackType::OnRecv)), ProcResult::Ok);
    }

    #[test]
    fn installed_slot_runs() {
        let mut table = CallbackTable::default();
        table.set(CallbackType::OnRecv, |_| ProcResult::Reject);
        assert_eq!(table.invoke(&args(CallbackType::OnRecv)), ProcResult::Reject);
        assert_eq!(table.invoke(&args(CallbackType::OnError)), ProcResult::Ok);
        table.clear(CallbackType::OnRecv);
        assert_eq!(table.invoke(&args(CallbackType::OnRecv)), ProcResult::Ok);
    }

    #[test]
    fn cloned_table_shares_handles() {
        let hits = Rc::new(Cell::new(0));
        let mut table = CallbackTable::default();
        let counter = hits.clone();
        table.set(CallbackType::SendTo, move |_| {
            counter.set(counter.get() + 1);
            ProcResult::Ok
        });
        let forked = table.clone();
        let _ = table.invoke(&args(CallbackType::SendTo));
        let _ = forked.invoke(&args(CallbackType::SendTo));
        assert_eq!(hits.get(), 2);
    }
}
