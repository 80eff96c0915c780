//! Bandwidth watcher (C9): tracks every open `(peer, connection)` pair and
//! evicts idle ones once the process-wide socket cap is exceeded
//! (spec.md §4.9).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::net::connection::Connection;
use crate::peer::PeerId;

pub struct BandwidthWatcher {
    max_total_connections: usize,
    max_idle_time: Duration,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl BandwidthWatcher {
    pub fn new(max_total_connections: usize, max_idle_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_total_connections,
            max_idle_time,
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub fn track(&self, conn: Arc<Connection>) {
        self.connections.write().unwrap().insert(conn.id, conn);
    }

    pub fn untrack(&self, conn_id: u64) {
        self.connections.write().unwrap().remove(&conn_id);
    }

    pub fn open_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// The idle budget parked connections and the connection dispatcher are
    /// held to (spec.md §4.7's parking idle budget, §4.9's eviction one).
    pub fn max_idle_time(&self) -> Duration {
        self.max_idle_time
    }

    /// Forcibly close a connection regardless of idleness (spec.md §4.9).
    pub fn request_closing(&self, conn_id: u64) {
        self.connections.write().unwrap().remove(&conn_id);
    }

    /// Liveness probe for a peer's connections: splits them into still-active
    /// and confirmed-closed (spec.md §4.9 `refresh`).
    pub async fn refresh(&self, peer_id: &PeerId) -> (Vec<Arc<Connection>>, Vec<Arc<Connection>>) {
        let candidates: Vec<Arc<Connection>> = self
            .connections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.peer_id == *peer_id)
            .cloned()
            .collect();

        let mut active = Vec::new();
        let mut closed = Vec::new();
        for conn in candidates {
            if conn.is_connected().await {
                active.push(conn);
            } else {
                closed.push(conn);
            }
        }
        for conn in &closed {
            self.untrack(conn.id);
        }
        (active, closed)
    }

    /// One maintenance pass (spec.md §4.9): if over the total cap, evict any
    /// connection idle past `max_idle_time`. Intended to be called on a 1s
    /// interval by the caller (see `maintenance_loop`).
    pub fn sweep_once(&self) {
        if self.open_count() < self.max_total_connections {
            return;
        }
        let idle_ids: Vec<u64> = self
            .connections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.idle_for() > self.max_idle_time)
            .map(|c| c.id)
            .collect();
        for id in idle_ids {
            tracing::debug!(conn_id = id, "evicting idle connection");
            self.request_closing(id);
        }
    }

    /// Background maintenance loop, spawned once by the state manager (C14).
    pub async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.sweep_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paired_connection(peer: PeerId) -> Arc<Connection> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_stream = accept_task.await.unwrap();
        Connection::new(peer, server_stream)
    }

    #[tokio::test]
    async fn sweep_does_nothing_under_cap() {
        let watcher = BandwidthWatcher::new(10, Duration::from_millis(1));
        let conn = paired_connection(PeerId::from_seed(1)).await;
        watcher.track(conn.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        watcher.sweep_once();
        assert_eq!(watcher.open_count(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_when_over_cap() {
        let watcher = BandwidthWatcher::new(1, Duration::from_millis(1));
        let conn = paired_connection(PeerId::from_seed(2)).await;
        watcher.track(conn.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        watcher.sweep_once();
        assert_eq!(watcher.open_count(), 0);
    }

    #[tokio::test]
    async fn tracked_connections_are_open() {
        let watcher = BandwidthWatcher::new(10, Duration::from_secs(60));
        let conn = paired_connection(PeerId::from_seed(3)).await;
        watcher.track(conn.clone());
        let (active, closed) = watcher.refresh(&conn.peer_id).await;
        assert_eq!(active.len(), 1);
        assert!(closed.is_empty());
    }
}
