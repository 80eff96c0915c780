//! Messaging (C10): one persistent outbound connection per peer, queued and
//! drained in order by a writer task (spec.md §4.10), plus the inbound read
//! loop an accepted `CMD_MSG_CONN` connection runs for the lifetime it's
//! held.
//!
//! Ordering across a conversation with one peer is guaranteed only by this
//! single persistent connection (spec.md §5) — any other connection to the
//! same peer (file transfer, DHT RPCs) carries no ordering relationship to
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};

use crate::envelope::{BodyValue, Envelope, Header};
use crate::error::MessagingError;
use crate::net::acceptor::{AcceptedConnection, Acceptor};
use crate::net::connection::Connection;
use crate::net::connector::{Connector, PooledConnection};
use crate::peer::{Peer, PeerId, PeerRegistry, PeerStatus};
use crate::ui_bridge::{UiBridge, UiEvent};

/// Initial backoff before a reconnect retry; doubles up to `MAX_BACKOFF`.
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

struct QueueItem {
    envelope: Envelope,
    done: oneshot::Sender<Result<(), MessagingError>>,
}

/// A handle to one peer's persistent outbound message connection. Queued
/// sends are drained strictly in order by a single writer task; reconnects
/// on socket error happen transparently while the peer still looks online.
pub struct MsgSender {
    peer_id: PeerId,
    queue: mpsc::Sender<QueueItem>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl MsgSender {
    /// Spawn the writer task for `peer` and return a handle to it.
    pub fn spawn(
        peer: Arc<Peer>,
        our_id: PeerId,
        registry: Arc<PeerRegistry>,
        connector: Arc<Connector>,
        ui: Arc<UiBridge>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let this = Arc::new(Self {
            peer_id: peer.id,
            queue: tx,
            stop: stop.clone(),
            stopped: stopped.clone(),
        });

        tokio::spawn(writer_task(peer, our_id, registry, connector, ui, rx, stop, stopped));
        this
    }

    /// Queue a text message, returning once it has actually been written to
    /// the wire (or definitively failed).
    pub async fn send_text(&self, text: String) -> Result<(), MessagingError> {
        let envelope = Envelope::new(Header::CmdText).with_body("text", BodyValue::Str(text));
        self.send(envelope).await
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), MessagingError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(QueueItem {
                envelope,
                done: done_tx,
            })
            .await
            .map_err(|_| MessagingError::Closed)?;
        done_rx.await.map_err(|_| MessagingError::Closed)?
    }

    /// Stop the writer task, discarding anything still queued. Safe to call
    /// before the writer task has started waiting: the `stopped` flag is
    /// checked independently of the `Notify`, so no stop request is lost to
    /// the "notify before anyone's listening" race.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

async fn writer_task(
    peer: Arc<Peer>,
    our_id: PeerId,
    registry: Arc<PeerRegistry>,
    connector: Arc<Connector>,
    ui: Arc<UiBridge>,
    mut queue: mpsc::Receiver<QueueItem>,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
) {
    let mut current: Option<PooledConnection> = None;

    loop {
        if stopped.load(Ordering::SeqCst) {
            drain_with_warning(&mut queue, &peer.id);
            return;
        }

        let item = tokio::select! {
            item = queue.recv() => item,
            _ = stop.notified() => {
                drain_with_warning(&mut queue, &peer.id);
                return;
            }
        };
        let Some(item) = item else { return };

        if stopped.load(Ordering::SeqCst) {
            let _ = item.done.send(Err(MessagingError::Closed));
            drain_with_warning(&mut queue, &peer.id);
            return;
        }

        let peer_now = registry.get(&peer.id);
        if peer_now.as_ref().map(|p| !p.is_online()).unwrap_or(true) {
            tracing::warn!(peer = %peer.id, "peer offline, dropping queued message");
            let _ = item.done.send(Err(MessagingError::PeerOffline));
            continue;
        }

        let result = send_with_reconnect(&peer, our_id, &registry, &connector, &ui, &mut current, &item.envelope).await;
        let _ = item.done.send(result);
    }
}

fn drain_with_warning(queue: &mut mpsc::Receiver<QueueItem>, peer_id: &PeerId) {
    let mut dropped = 0;
    while let Ok(item) = queue.try_recv() {
        let _ = item.done.send(Err(MessagingError::Closed));
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(peer = %peer_id, dropped, "discarded queued messages on stop");
    }
}

/// Write `envelope` over `current`, (re)connecting with exponential backoff
/// on failure while the peer remains online. Every failed attempt raises a
/// `failed_to_reach` UI event (spec.md §4.10).
async fn send_with_reconnect(
    peer: &Peer,
    our_id: PeerId,
    registry: &PeerRegistry,
    connector: &Arc<Connector>,
    ui: &UiBridge,
    current: &mut Option<PooledConnection>,
    envelope: &Envelope,
) -> Result<(), MessagingError> {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if current.is_none() {
            match connector.connect(peer, our_id, Header::CmdMsgConn, false).await {
                Ok(conn) => *current = Some(conn),
                Err(err) => {
                    tracing::warn!(peer = %peer.id, %err, "failed to open message connection");
                    ui.emit(UiEvent::FailedToReach {
                        peer: peer.id,
                        reason: err.to_string(),
                    })
                    .await;
                    if !still_online(registry, &peer.id) {
                        return Err(MessagingError::PeerOffline);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        }

        let conn = current.as_ref().expect("set above");
        match conn.write_envelope(envelope).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(peer = %peer.id, %err, "message send failed, will reconnect");
                *current = None;
                ui.emit(UiEvent::FailedToReach {
                    peer: peer.id,
                    reason: err.to_string(),
                })
                .await;
                if !still_online(registry, &peer.id) {
                    return Err(MessagingError::PeerOffline);
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn still_online(registry: &PeerRegistry, peer_id: &PeerId) -> bool {
    registry
        .get(peer_id)
        .map(|p| p.status == PeerStatus::Online)
        .unwrap_or(false)
}

/// Registers the inbound side of `CMD_MSG_CONN` on the acceptor: read one
/// envelope at a time with `msg_recv_timeout`, dispatching `PING` to an
/// immediate `UNPING` reply and `CMD_TEXT` to the UI bridge. After
/// `MSG_PATIENCE_THRESHOLD` consecutive timeouts the loop returns with the
/// connection unlocked; the acceptor's own post-handler dispatch (spec.md
/// §4.7) is what actually parks it for possible reclaim rather than closing
/// it outright (spec.md §4.10) — this function only has to give the lock
/// back promptly, not park it itself.
pub fn register_message_handler(acceptor: &Acceptor, ui: Arc<UiBridge>, msg_recv_timeout: Duration) {
    acceptor.register_handler(
        "CmdMsgConn",
        Box::new(move |accepted: AcceptedConnection| {
            let ui = ui.clone();
            Box::pin(async move { run_message_loop(accepted, ui, msg_recv_timeout).await })
        }),
    );
}

async fn run_message_loop(accepted: AcceptedConnection, ui: Arc<UiBridge>, msg_recv_timeout: Duration) {
    let AcceptedConnection { connection, peer_id, .. } = accepted;
    let mut consecutive_timeouts = 0u32;

    loop {
        match tokio::time::timeout(
            msg_recv_timeout,
            connection.read_envelope(crate::envelope::DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        {
            Ok(Ok(envelope)) => {
                consecutive_timeouts = 0;
                handle_message_envelope(&connection, peer_id, envelope, &ui).await;
            }
            Ok(Err(err)) => {
                tracing::info!(peer = %peer_id, %err, "message connection closed or errored");
                return;
            }
            Err(_) => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= crate::config::MSG_PATIENCE_THRESHOLD {
                    tracing::debug!(peer = %peer_id, "message read timed out repeatedly, releasing connection");
                    return;
                }
            }
        }
    }
}

async fn handle_message_envelope(connection: &Arc<Connection>, peer_id: PeerId, envelope: Envelope, ui: &UiBridge) {
    match envelope.header {
        Header::Ping => {
            if let Some(msg_id) = envelope.msg_id {
                let reply = Envelope::new(Header::Unping).with_msg_id(msg_id);
                let _ = connection.write_envelope(&reply).await;
            }
        }
        Header::CmdText => {
            if let Some(text) = envelope.body_str("text") {
                ui.emit(UiEvent::MsgArrived {
                    from: peer_id,
                    text: text.to_string(),
                })
                .await;
            }
        }
        other => {
            tracing::info!(peer = %peer_id, header = ?other, "unexpected header on message connection, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::net::watcher::BandwidthWatcher;
    use std::net::Ipv4Addr;

    fn test_peer(addr: std::net::SocketAddr, id: PeerId) -> Peer {
        Peer {
            id,
            name: "x".into(),
            addr: addr.ip(),
            request_port: 0,
            connection_port: addr.port(),
            status: PeerStatus::Online,
        }
    }

    #[tokio::test]
    async fn send_succeeds_once_server_accepts_the_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _handshake = crate::envelope::read_tcp_frame(&mut stream, crate::envelope::DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            let _ = crate::envelope::read_tcp_frame(&mut stream, crate::envelope::DEFAULT_MAX_FRAME_SIZE).await;
        });

        let peer_id = PeerId::from_seed(1);
        let peer = Arc::new(test_peer(addr, peer_id));
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert((*peer).clone());
        let watcher = BandwidthWatcher::new(100, Duration::from_secs(60));
        let connector = Connector::new(4, Duration::from_secs(2), watcher);
        let (ui, _rx) = UiBridge::new(16);

        let sender = MsgSender::spawn(peer.clone(), PeerId::from_seed(99), registry, connector, ui);
        let result = sender.send_text("hello".into()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_fails_fast_once_peer_is_offline_and_unreachable() {
        let peer_id = PeerId::from_seed(2);
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap(); // nothing listens
        let mut peer = test_peer(addr, peer_id);
        peer.status = PeerStatus::Offline;
        let peer = Arc::new(peer);
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert((*peer).clone());
        let watcher = BandwidthWatcher::new(100, Duration::from_secs(60));
        let connector = Connector::new(4, Duration::from_secs(2), watcher);
        let (ui, _rx) = UiBridge::new(16);

        let sender = MsgSender::spawn(peer.clone(), PeerId::from_seed(99), registry, connector, ui);
        let result = sender.send_text("hi".into()).await;
        assert!(matches!(result, Err(MessagingError::PeerOffline)));
    }

    #[tokio::test]
    async fn stop_discards_queued_messages() {
        let peer_id = PeerId::from_seed(3);
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let peer = Arc::new(test_peer(addr, peer_id));
        let registry = Arc::new(PeerRegistry::new());
        registry.upsert((*peer).clone());
        let watcher = BandwidthWatcher::new(100, Duration::from_secs(60));
        let connector = Connector::new(4, Duration::from_secs(2), watcher);
        let (ui, _rx) = UiBridge::new(16);

        let sender = MsgSender::spawn(peer, PeerId::from_seed(99), registry, connector, ui);
        sender.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = sender.send_text("late".into()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ping_on_a_message_connection_gets_an_immediate_unping() {
        let mut cfg = Config::default();
        cfg.bind_addr = std::net::IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.connection_port = 0;
        let watcher = BandwidthWatcher::new(100, Duration::from_secs(60));
        let acceptor = Arc::new(Acceptor::bind(&cfg, watcher).await.unwrap());
        let (ui, _rx) = UiBridge::new(16);
        register_message_handler(&acceptor, ui, Duration::from_secs(2));

        let addr = acceptor.local_addr().unwrap();
        let acceptor_clone = acceptor.clone();
        let run_task = tokio::spawn(async move {
            acceptor_clone.run(PeerId::from_seed(1)).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let handshake = Envelope::new(Header::CmdMsgConn).with_peer_id(PeerId::from_seed(2));
        crate::envelope::write_tcp_frame(&mut client, &handshake).await.unwrap();
        let ping = Envelope::new(Header::Ping).with_msg_id(42);
        crate::envelope::write_tcp_frame(&mut client, &ping).await.unwrap();

        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            crate::envelope::read_tcp_frame(&mut client, crate::envelope::DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply.header, Header::Unping);
        assert_eq!(reply.msg_id, Some(42));
        run_task.abort();
    }
}
