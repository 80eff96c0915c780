//! The `Connection` type shared by the acceptor, connector/pool, and
//! bandwidth watcher (spec.md §3): a TCP stream, its owning peer, an
//! exclusive acquisition lock, and last-send/recv timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::envelope::Envelope;
use crate::error::CodecError;
use crate::peer::PeerId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One TCP connection to a peer. `stream` is an `Arc<Mutex<..>>` (rather than
/// a plain `Mutex` field) so a held lock can be handed around as an
/// [`OwnedMutexGuard`] — the scoped resource the connector pool (C8) returns
/// from `connect()` — independent of the `Connection`'s own lifetime.
pub struct Connection {
    pub id: u64,
    pub peer_id: PeerId,
    stream: Arc<Mutex<TcpStream>>,
    last_send_epoch_ms: AtomicU64,
    last_recv_epoch_ms: AtomicU64,
    created_at: Instant,
}

impl Connection {
    pub fn new(peer_id: PeerId, stream: TcpStream) -> Arc<Self> {
        let now = now_epoch_ms();
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            stream: Arc::new(Mutex::new(stream)),
            last_send_epoch_ms: AtomicU64::new(now),
            last_recv_epoch_ms: AtomicU64::new(now),
            created_at: Instant::now(),
        })
    }

    /// Acquire the exclusive lock, waiting as long as necessary.
    pub async fn lock(&self) -> OwnedMutexGuard<TcpStream> {
        self.stream.clone().lock_owned().await
    }

    /// Non-blocking acquisition attempt — used by the parking mechanism and
    /// the pool to find an already-unlocked connection without waiting.
    pub fn try_lock(&self) -> Option<OwnedMutexGuard<TcpStream>> {
        self.stream.clone().try_lock_owned().ok()
    }

    /// Try to acquire the lock within `timeout` — used by the connection
    /// dispatcher (spec.md §4.7) to decide park-vs-close after a handler
    /// returns without releasing its hold in time.
    pub async fn try_lock_timeout(&self, timeout: Duration) -> Option<OwnedMutexGuard<TcpStream>> {
        tokio::time::timeout(timeout, self.stream.clone().lock_owned())
            .await
            .ok()
    }

    pub fn touch_send(&self) {
        self.last_send_epoch_ms.store(now_epoch_ms(), Ordering::Relaxed);
    }

    pub fn touch_recv(&self) {
        self.last_recv_epoch_ms.store(now_epoch_ms(), Ordering::Relaxed);
    }

    /// Idle time since the most recent send or recv, whichever is newer
    /// (spec.md §4.9: `max(last_send, last_recv)`).
    pub fn idle_for(&self) -> Duration {
        let last = self
            .last_send_epoch_ms
            .load(Ordering::Relaxed)
            .max(self.last_recv_epoch_ms.load(Ordering::Relaxed));
        let elapsed_ms = now_epoch_ms().saturating_sub(last);
        Duration::from_millis(elapsed_ms)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Cheap liveness check: does the peer still have the socket open, per
    /// spec.md §4.9's `is_socket_connected` probe. A zero-byte peek that
    /// returns `Ok(0)` means the peer closed; `WouldBlock` means still open.
    pub async fn is_connected(&self) -> bool {
        let stream = self.lock().await;
        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    pub async fn write_envelope(&self, envelope: &Envelope) -> Result<(), CodecError> {
        let mut stream = self.lock().await;
        crate::envelope::write_tcp_frame(&mut *stream, envelope).await?;
        drop(stream);
        self.touch_send();
        Ok(())
    }

    pub async fn read_envelope(&self, max_frame_size: u32) -> Result<Envelope, CodecError> {
        let mut stream = self.lock().await;
        let envelope = crate::envelope::read_tcp_frame(&mut *stream, max_frame_size).await?;
        drop(stream);
        self.touch_recv();
        Ok(envelope)
    }
}

fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paired_connection(peer: PeerId) -> Arc<Connection> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        let server_stream = accept_task.await.unwrap();
        std::mem::forget(client);
        Connection::new(peer, server_stream)
    }

    #[tokio::test]
    async fn lock_is_exclusive_while_held() {
        let conn = paired_connection(PeerId::from_seed(1)).await;
        let _guard = conn.lock().await;
        let second = conn.try_lock_timeout(Duration::from_millis(20)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn try_lock_succeeds_when_unlocked() {
        let conn = paired_connection(PeerId::from_seed(2)).await;
        assert!(conn.try_lock().is_some());
    }

    #[tokio::test]
    async fn idle_time_resets_on_touch() {
        let conn = paired_connection(PeerId::from_seed(3)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.touch_send();
        assert!(conn.idle_for() < Duration::from_millis(10));
    }
}
