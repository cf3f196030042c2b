//! Pairing between client sockets and their upstream sockets.
//!
//! The registry is owned by the relay loop and only ever mutated from it.
//! A pair is inserted in one call and removed in one call, so a socket is
//! either fully paired or absent.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// One monitored socket: the queue feeding its writer task, plus the tasks
/// reading from and writing to it.
///
/// The writer task drains the outbox until every sender is gone, then shuts
/// the socket down. Dropping the endpoint drops the registry's sender.
pub struct Endpoint {
    side: Side,
    peer_addr: Option<SocketAddr>,
    outbox: mpsc::Sender<Bytes>,
    reader: Option<AbortHandle>,
    writer: Option<AbortHandle>,
    bytes_read: u64,
    rewrites: u64,
}

impl Endpoint {
    pub fn new(side: Side, peer_addr: Option<SocketAddr>, outbox: mpsc::Sender<Bytes>) -> Self {
        Self {
            side,
            peer_addr,
            outbox,
            reader: None,
            writer: None,
            bytes_read: 0,
            rewrites: 0,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Chunks queued here are written to this socket.
    pub fn outbox(&self) -> &mpsc::Sender<Bytes> {
        &self.outbox
    }

    /// Bytes read from this socket and forwarded to its peer.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn rewrites(&self) -> u64 {
        self.rewrites
    }

    fn stop_reading(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn stop_writing(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Both halves of a torn-down pair, already removed from the registry.
pub struct ClosedPair {
    pub client: Endpoint,
    pub upstream: Endpoint,
}

#[derive(Default)]
pub struct ChannelRegistry {
    next_id: u64,
    endpoints: HashMap<SocketId, Endpoint>,
    peers: HashMap<SocketId, SocketId>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> SocketId {
        self.next_id += 1;
        SocketId(self.next_id)
    }

    /// Insert both directions of a new pair. Returns `(client, upstream)` ids.
    pub fn register_pair(&mut self, client: Endpoint, upstream: Endpoint) -> (SocketId, SocketId) {
        debug_assert_eq!(client.side, Side::Client);
        debug_assert_eq!(upstream.side, Side::Upstream);

        let client_id = self.allocate();
        let upstream_id = self.allocate();

        self.endpoints.insert(client_id, client);
        self.endpoints.insert(upstream_id, upstream);
        self.peers.insert(client_id, upstream_id);
        self.peers.insert(upstream_id, client_id);

        (client_id, upstream_id)
    }

    /// Record the tasks reading from and writing to `id`. Teardown stops the
    /// reader; the writer is left to flush what is queued and is only aborted
    /// when the registry itself goes away. Returns false (and aborts both
    /// tasks) if `id` is no longer registered.
    pub fn attach_tasks(&mut self, id: SocketId, reader: AbortHandle, writer: AbortHandle) -> bool {
        match self.endpoints.get_mut(&id) {
            Some(endpoint) => {
                endpoint.stop_reading();
                endpoint.stop_writing();
                endpoint.reader = Some(reader);
                endpoint.writer = Some(writer);
                true
            }
            None => {
                reader.abort();
                writer.abort();
                false
            }
        }
    }

    pub fn peer(&self, id: SocketId) -> Option<SocketId> {
        self.peers.get(&id).copied()
    }

    pub fn endpoint(&self, id: SocketId) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    #[cfg(test)]
    fn is_monitored(&self, id: SocketId) -> bool {
        self.endpoints.contains_key(&id)
    }

    /// Every paired socket currently watched. The listener is not included.
    #[cfg(test)]
    fn monitored(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.endpoints.keys().copied()
    }

    pub fn monitored_len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn pair_count(&self) -> usize {
        self.peers.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn record_read(&mut self, id: SocketId, bytes: usize) {
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.bytes_read += bytes as u64;
        }
    }

    pub fn record_rewrite(&mut self, id: SocketId) {
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            endpoint.rewrites += 1;
        }
    }

    /// Remove the pair `id` belongs to and stop both readers. Unknown ids
    /// (already torn down, never registered) yield `None`.
    pub fn teardown(&mut self, id: SocketId) -> Option<ClosedPair> {
        let peer = self.peers.remove(&id)?;
        self.peers.remove(&peer);

        let mut first = self.endpoints.remove(&id)?;
        let mut second = self.endpoints.remove(&peer)?;
        first.stop_reading();
        second.stop_reading();

        let (client, upstream) = match first.side {
            Side::Client => (first, second),
            Side::Upstream => (second, first),
        };
        Some(ClosedPair { client, upstream })
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        for endpoint in self.endpoints.values_mut() {
            endpoint.stop_reading();
            endpoint.stop_writing();
        }
    }
}
