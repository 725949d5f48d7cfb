//! A reliable, connection-oriented transport protocol over datagrams.
//!
//! This crate implements TCP-like semantics (an ordered, reliable,
//! full-duplex packet stream with explicit setup and teardown) on top of
//! an unreliable datagram service such as UDP, so the whole protocol runs
//! in user space.
//!
//! # Organization
//!
//! - [`packet`] defines the wire layout and the stateless codec.
//! - [`Connection`] holds per-connection state: the connection state
//!   machine, sequence counters, the reorder buffer for inbound packets and
//!   the retransmission queue for outbound ones.
//! - [`Context`] owns every connection of one endpoint and routes inbound
//!   datagrams to the right one.
//!
//! # Driving the core
//!
//! The core is single-threaded and cooperative: it never blocks, never
//! spawns, and performs no I/O of its own. The host owns the datagram
//! socket and the clock, and drives the core from one thread by calling
//! [`Context::demux`] for every received datagram and [`Context::tick`] at
//! a regular interval. Everything the core wants from the outside world,
//! whether sending a datagram, delivering payload or reporting an error,
//! is requested through per-connection callback slots; see
//! [`CallbackType`].

pub mod connection;
pub mod context;
pub mod packet;
pub mod seq;

pub use connection::{
    CallbackArgs, CallbackDetail, CallbackTable, CallbackType, ConnState, Connection, ProcResult,
};
pub use context::Context;

use thiserror::Error;

/// Error codes surfaced through the `OnError` callback and returned by the
/// API call that triggered them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RtpError {
    #[error("operation is illegal in the connection's current state")]
    InvalidState,
    #[error("datagram failed to decode")]
    Malformed,
    #[error("connection reset by peer")]
    PeerReset,
    #[error("socket ids or buffer space exhausted")]
    Exhausted,
    #[error("port already has a listener")]
    PortInUse,
    #[error("payload exceeds the maximum segment size")]
    PayloadTooLarge,
    #[error("the send callback reported failure")]
    SendFailed,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("a callback vetoed the operation")]
    CallbackRejected,
}
