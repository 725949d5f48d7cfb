//! The connection state machine.

/// The state of a connection. The variant order is significant: ordered
/// comparisons such as `state >= ConnState::Connected` are used for
/// reachability checks, so new states must not be inserted casually.
///
/// The lifecycle is TCP-shaped. A is the side that closes first, B the side
/// that closes second:
///
/// ```text
///             Idle ----------------- listen -----------------> Listen
///              |                                                 |
///           connect                                          rcv SYN
///           snd SYN                                       snd SYN+ACK
///              v                                                 v
///           SynSent --- rcv SYN+ACK, snd ACK --> Connected <- SynRecv
///                                                 |     |  (rcv ACK)
///                              close, snd FIN (A) |     | rcv FIN, snd ACK (B)
///                                                 v     v
///                                          FinWait1     CloseWait
///                            rcv ACK of FIN    |            |  close
///                                              v            |  snd FIN
///                                          FinWait2         v
///                            rcv FIN, snd ACK  |        LastAck
///                                              v            |  rcv ACK of FIN
///                                          TimeWait         v
///                                   2*MSL      |         Destroy
///                                              v
///                                           Destroy
/// ```
///
/// An inbound RST short-circuits any state to `Reset`. A connection serving
/// a listening port finishes its teardown in `PassiveListen` instead of
/// `Destroy` so the port keeps accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnState {
    /// Created but not yet initialized with a datagram socket.
    Uninitialized,
    /// Initialized and ready for `connect` or `listen`.
    Idle,
    /// Waiting for a connection request on a bound port.
    Listen,
    /// Sent a connection request, waiting for the matching SYN+ACK.
    SynSent,
    /// Answered a connection request, waiting for the closing ACK.
    SynRecv,
    /// Torn down by a peer reset or a fatal local error.
    Reset,
    /// The data-transfer state.
    Connected,
    /// Connected, with the peer's receive window exhausted by in-flight
    /// packets.
    ConnectedFull,
    /// Sent our FIN, waiting for it to be acknowledged.
    FinWait1,
    /// Received the peer's FIN; the peer sends no more data but we may.
    CloseWait,
    /// Our FIN is acknowledged, waiting for the peer's FIN.
    FinWait2,
    /// Sent our FIN after the peer's, waiting for the final ACK.
    LastAck,
    /// Both sides closed; linger 2*MSL so a retransmitted FIN can be
    /// re-acknowledged.
    TimeWait,
    /// A listening connection whose last conversation finished; it may
    /// accept again.
    PassiveListen,
    /// Terminal. No callbacks fire and no packets are processed past this.
    Destroy,
}
