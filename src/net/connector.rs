//! Connector + pool (C8): outbound connect with a per-peer concurrency cap,
//! reusing unlocked connections and waiting/notifying on availability
//! (spec.md §4.8).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::envelope::{Envelope, Header};
use crate::error::PoolError;
use crate::net::connection::Connection;
use crate::net::watcher::BandwidthWatcher;
use crate::peer::{Peer, PeerId};

struct PeerPool {
    connections: Vec<Arc<Connection>>,
    /// Connection ids currently checked out by some caller — the pool-level
    /// reservation `connect()` grants, independent of `Connection`'s own
    /// per-operation wire lock (spec.md §4.8's "return it locked").
    checked_out: HashSet<u64>,
    /// Notified whenever a connection to this peer is released or added —
    /// the condition variable spec.md §4.8 describes.
    available: Arc<Notify>,
}

impl PeerPool {
    fn new() -> Self {
        Self {
            connections: Vec::new(),
            checked_out: HashSet::new(),
            available: Arc::new(Notify::new()),
        }
    }
}

/// Outbound connector with a per-peer connection pool.
pub struct Connector {
    max_connections_between_peers: usize,
    server_timeout: Duration,
    watcher: Arc<BandwidthWatcher>,
    pools: RwLock<HashMap<PeerId, PeerPool>>,
}

/// A connection checked out of the pool for exclusive use by the caller
/// (spec.md §4.8: "`connect()` ... returns an acquired `Connection` as a
/// scoped resource"). Derefs to the underlying `Connection` so callers use
/// it exactly like an `Arc<Connection>`. Dropping it checks the connection
/// back in and wakes anyone waiting on this peer's condition ("release on
/// scope exit unlocks the connection and notifies the condition").
pub struct PooledConnection {
    conn: Arc<Connection>,
    connector: Arc<Connector>,
    peer_id: PeerId,
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.connector.release(&self.peer_id, self.conn.id);
    }
}

impl Connector {
    pub fn new(
        max_connections_between_peers: usize,
        server_timeout: Duration,
        watcher: Arc<BandwidthWatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_connections_between_peers,
            server_timeout,
            watcher,
            pools: RwLock::new(HashMap::new()),
        })
    }

    fn notify_handle(&self, peer_id: &PeerId) -> Arc<Notify> {
        self.pools
            .write()
            .unwrap()
            .entry(*peer_id)
            .or_insert_with(PeerPool::new)
            .available
            .clone()
    }

    /// Obtain a connection to `peer`, checked out exclusively for the
    /// caller's use, our own id and a service `header` presented as the
    /// outbound handshake on a freshly opened connection. If `raise_if_busy`
    /// is set and the per-peer cap is already reached with no checked-in
    /// connection available, fails with `PoolError::Busy` immediately;
    /// otherwise waits for a release.
    pub async fn connect(
        self: &Arc<Self>,
        peer: &Peer,
        our_id: PeerId,
        header: Header,
        raise_if_busy: bool,
    ) -> Result<PooledConnection, PoolError> {
        loop {
            if let Some(conn) = self.try_reuse(&peer.id) {
                return Ok(PooledConnection {
                    conn,
                    connector: self.clone(),
                    peer_id: peer.id,
                });
            }

            let open_count = self
                .pools
                .read()
                .unwrap()
                .get(&peer.id)
                .map(|p| p.connections.len())
                .unwrap_or(0);

            if open_count < self.max_connections_between_peers {
                let conn = self.open_new(peer, our_id, header).await?;
                return Ok(PooledConnection {
                    conn,
                    connector: self.clone(),
                    peer_id: peer.id,
                });
            }

            if raise_if_busy {
                return Err(PoolError::Busy);
            }

            let notify = self.notify_handle(&peer.id);
            notify.notified().await;
        }
    }

    /// Scan existing connections for one not already checked out, and check
    /// it out atomically with the scan so two concurrent callers can't both
    /// claim it.
    fn try_reuse(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        let mut pools = self.pools.write().unwrap();
        let pool = pools.get_mut(peer_id)?;
        let conn = pool
            .connections
            .iter()
            .find(|c| !pool.checked_out.contains(&c.id))
            .cloned()?;
        pool.checked_out.insert(conn.id);
        Some(conn)
    }

    async fn open_new(
        &self,
        peer: &Peer,
        our_id: PeerId,
        header: Header,
    ) -> Result<Arc<Connection>, PoolError> {
        let addr = SocketAddr::new(peer.addr, peer.connection_port);
        let stream = tokio::time::timeout(self.server_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PoolError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))??;

        let conn = Connection::new(peer.id, stream);
        let handshake = Envelope::new(header).with_peer_id(our_id);
        conn.write_envelope(&handshake).await.map_err(|e| match e {
            crate::error::CodecError::Io(io) => PoolError::Io(io),
            other => PoolError::Io(std::io::Error::other(other.to_string())),
        })?;

        self.watcher.track(conn.clone());
        let mut pools = self.pools.write().unwrap();
        let pool = pools.entry(peer.id).or_insert_with(PeerPool::new);
        pool.connections.push(conn.clone());
        pool.checked_out.insert(conn.id);

        Ok(conn)
    }

    /// Check a connection back in and wake anyone waiting for availability.
    /// Called automatically when a [`PooledConnection`] is dropped.
    fn release(&self, peer_id: &PeerId, conn_id: u64) {
        if let Some(pool) = self.pools.write().unwrap().get_mut(peer_id) {
            pool.checked_out.remove(&conn_id);
            pool.available.notify_waiters();
        }
    }

    pub fn open_count(&self, peer_id: &PeerId) -> usize {
        self.pools
            .read()
            .unwrap()
            .get(peer_id)
            .map(|p| p.connections.len())
            .unwrap_or(0)
    }

    /// Drop closed connections from the pool's bookkeeping (called
    /// periodically, or right after the watcher reports a connection dead).
    pub fn prune_closed(&self, peer_id: &PeerId, closed_ids: &[u64]) {
        if let Some(pool) = self.pools.write().unwrap().get_mut(peer_id) {
            pool.connections.retain(|c| !closed_ids.contains(&c.id));
            for id in closed_ids {
                pool.checked_out.remove(id);
            }
        }
    }
}
