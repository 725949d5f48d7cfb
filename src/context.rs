//! The process-wide registry that routes inbound datagrams to connections.
//!
//! A [`Context`] owns every connection of one endpoint in an arena keyed by
//! `sock_id`; the routing maps store arena keys, never ownership. Datagram
//! routing prefers the exact `(sock_id, peer address)` match stamped into
//! every inbound header and falls back to the listening-port table for
//! connection requests.

use crate::connection::{
    CallbackArgs, CallbackDetail, CallbackTable, CallbackType, ConnState, Connection, ProcResult,
};
use crate::packet::{self, Control, PacketHeader, HEADER_SIZE};
use crate::RtpError;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub struct Context {
    /// The connection arena. Everything else indexes into this.
    connections: FxHashMap<u16, Connection>,
    /// `(our sock id as stamped in the inbound header, peer address)` →
    /// arena key.
    look_up: FxHashMap<(u16, SocketAddr), u16>,
    /// `(peer address, peer sock id from a SYN payload)` → arena key.
    /// Keeps a retransmitted SYN from forking a second child.
    syn_children: FxHashMap<(SocketAddr, u16), u16>,
    /// Local port → listening connection.
    listen_sockets: FxHashMap<u16, u16>,
    /// Cloned into every new connection; also answers orphan SYNs.
    defaults: CallbackTable,
    next_sock_id: u16,
    orphan_drops: u64,
}

/// Where the routing maps place an inbound header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// An exact route for this peer exists.
    Connection(u16),
    /// No exact route, but the packet opens a connection on a listening
    /// port.
    Listener(u16),
}

impl Context {
    pub fn new() -> Self {
        Self {
            next_sock_id: 1,
            ..Default::default()
        }
    }

    /// Installs a callback inherited by every connection created after
    /// this call. Per-connection overrides layer on top through
    /// [`Connection::set_callback`].
    pub fn set_default_callback(
        &mut self,
        kind: CallbackType,
        callback: impl Fn(&CallbackArgs) -> ProcResult + 'static,
    ) {
        self.defaults.set(kind, callback);
    }

    /// Hands out the next free sock id. Monotonic, skips ids still in
    /// use, and never returns 0 (which marks "peer unknown" on the wire).
    pub fn new_sock_id(&mut self) -> Result<u16, RtpError> {
        for _ in 0..=u16::MAX {
            let id = self.next_sock_id;
            self.next_sock_id = self.next_sock_id.wrapping_add(1);
            if self.next_sock_id == 0 {
                self.next_sock_id = 1;
            }
            if id != 0 && !self.connections.contains_key(&id) {
                return Ok(id);
            }
        }
        warn!("sock id space exhausted");
        Err(RtpError::Exhausted)
    }

    /// Creates a connection in the arena and returns its sock id. The new
    /// connection starts with a clone of the context-default callback
    /// table.
    pub fn socket(&mut self) -> Result<u16, RtpError> {
        let sock = self.new_sock_id()?;
        self.connections
            .insert(sock, Connection::new(sock, self.defaults.clone()));
        trace!(sock, "connection created");
        Ok(sock)
    }

    pub fn connection(&self, sock: u16) -> Option<&Connection> {
        self.connections.get(&sock)
    }

    pub fn connection_mut(&mut self, sock: u16) -> Option<&mut Connection> {
        self.connections.get_mut(&sock)
    }

    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    /// Datagrams that matched no connection and were dropped.
    pub fn orphan_drops(&self) -> u64 {
        self.orphan_drops
    }

    // # User API, addressed by sock id

    pub fn init(&mut self, sock: u16) -> Result<(), RtpError> {
        self.conn_mut(sock)?.init()
    }

    pub fn bind(&mut self, sock: u16, addr: SocketAddr) -> Result<(), RtpError> {
        self.conn_mut(sock)?.bind(addr)
    }

    /// Registers `sock` as the listener for `port`. Fails when the port
    /// already has one.
    pub fn listen(&mut self, sock: u16, port: u16) -> Result<(), RtpError> {
        if self.listen_sockets.contains_key(&port) {
            warn!(port, "listen refused, port taken");
            return Err(RtpError::PortInUse);
        }
        self.conn_mut(sock)?.listen(port)?;
        self.listen_sockets.insert(port, sock);
        Ok(())
    }

    pub fn connect(&mut self, sock: u16, to: SocketAddr) -> Result<(), RtpError> {
        self.conn_mut(sock)?.connect(to)?;
        self.register(sock, to);
        Ok(())
    }

    pub fn write(&mut self, sock: u16, buf: &[u8]) -> Result<(), RtpError> {
        self.conn_mut(sock)?.write(buf)
    }

    pub fn close(&mut self, sock: u16) -> Result<(), RtpError> {
        self.conn_mut(sock)?.close()
    }

    // # Registration

    /// Adds the peer route for a connection so inbound datagrams stamped
    /// with its sock id find it.
    pub fn register(&mut self, sock: u16, peer: SocketAddr) {
        self.look_up.insert((sock, peer), sock);
    }

    /// Removes every route pointing at a connection, leaving the
    /// connection itself in the arena.
    pub fn deregister(&mut self, sock: u16) {
        self.look_up.retain(|_, &mut v| v != sock);
        self.syn_children.retain(|_, &mut v| v != sock);
    }

    /// Deregisters and drops a connection; its sock id becomes reusable.
    pub fn remove(&mut self, sock: u16) {
        if self.connections.remove(&sock).is_some() {
            trace!(sock, "connection removed");
        }
        self.deregister(sock);
        self.listen_sockets.retain(|_, &mut v| v != sock);
    }

    /// Finds the connection an inbound header addresses: the exact
    /// `(sock_id, peer)` route when one exists, else the port's listener
    /// when the packet opens a connection.
    pub fn lookup(
        &self,
        local_port: u16,
        from: SocketAddr,
        header: &PacketHeader,
    ) -> Option<&Connection> {
        match self.route(local_port, from, header)? {
            Route::Connection(sock) | Route::Listener(sock) => self.connections.get(&sock),
        }
    }

    /// Resolves an inbound header against the routing maps.
    fn route(&self, local_port: u16, from: SocketAddr, header: &PacketHeader) -> Option<Route> {
        if let Some(&sock) = self.look_up.get(&(header.peer_sock_id, from)) {
            return Some(Route::Connection(sock));
        }
        if header.ctl.syn() && !header.ctl.ack() {
            if let Some(&listener) = self.listen_sockets.get(&local_port) {
                return Some(Route::Listener(listener));
            }
        }
        None
    }

    // # Datagram entry point

    /// Routes one received datagram: exact connection match first, then
    /// the listening-port fallback for SYNs. A SYN nobody listens for is
    /// answered with RST; all other orphans are dropped silently.
    pub fn demux(&mut self, local_port: u16, from: SocketAddr, datagram: &[u8]) -> ProcResult {
        let header = match PacketHeader::from_bytes(datagram) {
            Ok(header) => header,
            Err(e) => {
                self.orphan_drops += 1;
                trace!(%e, "dropping undecodable datagram");
                return ProcResult::Drop;
            }
        };
        // A SYN names its sender in the payload; a retransmission of one
        // we already answered goes to the child it spawned, not through
        // the listener again.
        if header.ctl.syn() && !header.ctl.ack() && datagram.len() >= HEADER_SIZE + 2 {
            let peer_id = u16::from_be_bytes([datagram[HEADER_SIZE], datagram[HEADER_SIZE + 1]]);
            if let Some(&child) = self.syn_children.get(&(from, peer_id)) {
                if let Some(conn) = self.connections.get_mut(&child) {
                    return conn.process(from, datagram);
                }
            }
        }
        match self.route(local_port, from, &header) {
            Some(Route::Connection(sock)) => match self.connections.get_mut(&sock) {
                Some(conn) => conn.process(from, datagram),
                None => ProcResult::Drop,
            },
            Some(Route::Listener(listener)) => self.fork_accept(listener, from, datagram),
            None if header.ctl.syn() && !header.ctl.ack() => {
                self.send_reset(from, &header, datagram);
                ProcResult::Reject
            }
            None => {
                self.orphan_drops += 1;
                trace!(%from, "dropping unroutable datagram");
                ProcResult::Drop
            }
        }
    }

    /// Drives every connection's timer and reaps finished ones.
    pub fn tick(&mut self, now_ms: u64) {
        let mut dead = Vec::new();
        let mut recycled = Vec::new();
        for (&sock, conn) in self.connections.iter_mut() {
            let _ = conn.tick(now_ms);
            match conn.state() {
                ConnState::Destroy | ConnState::Reset => dead.push(sock),
                ConnState::PassiveListen => recycled.push(sock),
                _ => {}
            }
        }
        for sock in dead {
            self.remove(sock);
        }
        for sock in recycled {
            // The conversation ended but the listener lives on; only the
            // routes for the finished peer go away.
            self.deregister(sock);
        }
    }

    // # Internals

    fn conn_mut(&mut self, sock: u16) -> Result<&mut Connection, RtpError> {
        self.connections.get_mut(&sock).ok_or(RtpError::InvalidState)
    }

    /// Spawns a child connection off a listener for an inbound SYN. The
    /// child inherits the listener's callback table and answers with
    /// SYN+ACK before it is entered into the routing maps.
    fn fork_accept(&mut self, listener: u16, from: SocketAddr, datagram: &[u8]) -> ProcResult {
        let (header, payload) = match packet::decode(datagram) {
            Ok(parts) => parts,
            Err(_) => return ProcResult::Drop,
        };
        if payload.len() < 2 {
            self.orphan_drops += 1;
            trace!(%from, "SYN without the sender's sock id");
            return ProcResult::Drop;
        }
        let peer_id = u16::from_be_bytes([payload[0], payload[1]]);
        let table = match self.connections.get(&listener) {
            Some(conn) => conn.callback_table().clone(),
            None => return ProcResult::Drop,
        };
        let child_id = match self.new_sock_id() {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "cannot fork a connection for an inbound SYN");
                return ProcResult::Error;
            }
        };
        let mut child = Connection::forked(child_id, table);
        debug!(listener, child = child_id, peer = %from, "forking connection for inbound SYN");
        match child.accept(from, &header, payload) {
            Ok(()) => {
                self.connections.insert(child_id, child);
                self.look_up.insert((child_id, from), child_id);
                self.syn_children.insert((from, peer_id), child_id);
                ProcResult::Ok
            }
            // Vetoed by `BeforeAccept`; the unregistered child just drops.
            Err(_) => ProcResult::Reject,
        }
    }

    /// Answers an unserviceable SYN with RST through the context-default
    /// `SendTo` slot. The SYN payload names the sender's sock id; without
    /// it the reset would be unroutable, so the datagram is dropped
    /// instead.
    fn send_reset(&mut self, to: SocketAddr, header: &PacketHeader, datagram: &[u8]) {
        let payload = &datagram[HEADER_SIZE..];
        if payload.len() < 2 {
            self.orphan_drops += 1;
            return;
        }
        let peer_sock_id = u16::from_be_bytes([payload[0], payload[1]]);
        debug!(%to, "no listener, answering SYN with RST");
        let reset = PacketHeader {
            seq_nr: 0,
            ack_nr: header.seq_nr,
            peer_sock_id,
            opts_count: 0,
            ctl: Control::new(false, true, true, false, false),
            window_size: 0,
        };
        let bytes =
            packet::encode(&reset, &[]).expect("header-only packet is always within bounds");
        let args = CallbackArgs {
            sock_id: 0,
            kind: CallbackType::SendTo,
            state: ConnState::Uninitialized,
            data: &bytes,
            detail: CallbackDetail::Addr(to),
        };
        let _ = self.defaults.invoke(&args);
    }
}
