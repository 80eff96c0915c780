//! Acceptor + connection dispatcher (C7): the TCP listener side of the
//! connection plane, with a "parking" mechanism so a handler that doesn't
//! immediately consume its connection can hand it back for reuse instead of
//! closing it (spec.md §4.7).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::envelope::Header;
use crate::net::connection::Connection;
use crate::net::watcher::BandwidthWatcher;

/// A freshly accepted connection plus the handshake header it announced,
/// handed to whichever handler is registered for that header.
pub struct AcceptedConnection {
    pub connection: Arc<Connection>,
    pub header: Header,
    pub peer_id: crate::peer::PeerId,
    pub from_addr: SocketAddr,
    /// The handshake envelope's `msg_id`, if it carried one — needed by
    /// single-shot handlers like `PING` that must echo it back.
    pub msg_id: Option<u64>,
}

pub type AcceptHandlerFn =
    Box<dyn Fn(AcceptedConnection) -> crate::net::BoxFuture<'static, ()> + Send + Sync>;

/// Accepts inbound TCP connections, reads the handshake envelope, and routes
/// by header to a registered handler. Connections a handler "parks" (returns
/// without consuming) stay tracked by the watcher and can be re-claimed by
/// [`Acceptor::take_parked`] — the mechanism spec.md §4.7 describes for
/// handlers like the message connection (C10) that hold a socket open across
/// many request/reply cycles.
pub struct Acceptor {
    listener: TcpListener,
    watcher: Arc<BandwidthWatcher>,
    handlers: RwLock<HashMap<String, AcceptHandlerFn>>,
    parked: RwLock<HashMap<u64, Arc<Connection>>>,
    handshake_timeout: Duration,
}

impl Acceptor {
    pub async fn bind(config: &Config, watcher: Arc<BandwidthWatcher>) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.connection_port);
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            watcher,
            handlers: RwLock::new(HashMap::new()),
            parked: RwLock::new(HashMap::new()),
            handshake_timeout: config.server_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn register_handler(&self, header_key: &str, handler: AcceptHandlerFn) {
        self.handlers
            .write()
            .unwrap()
            .insert(header_key.to_string(), handler);
    }

    /// Park a connection for later retrieval instead of closing it — used by
    /// a handler that wants to hand the socket to a different subsystem (the
    /// message sender, C10, reclaiming a connection the acceptor first took
    /// the handshake on).
    pub fn park(&self, conn: Arc<Connection>) {
        self.watcher.track(conn.clone());
        self.parked.write().unwrap().insert(conn.id, conn);
    }

    pub fn take_parked(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.parked.write().unwrap().remove(&conn_id)
    }

    /// Drive the accept loop. Each connection's handshake is read with its
    /// own bounded task so a slow or silent peer can't stall new accepts
    /// (spec.md §4.7).
    pub async fn run(self: Arc<Self>, our_peer_id: crate::peer::PeerId) {
        loop {
            let (stream, from_addr) = match self.listener.accept().await {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(%err, "acceptor socket error, stopping");
                    return;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_one(stream, from_addr, our_peer_id).await;
            });
        }
    }

    async fn handle_one(
        self: Arc<Self>,
        mut stream: tokio::net::TcpStream,
        from_addr: SocketAddr,
        _our_peer_id: crate::peer::PeerId,
    ) {
        // Read the handshake on the raw stream, before wrapping it in a
        // `Connection`, so the peer id it carries can be baked into the
        // `Connection` itself rather than patched in afterwards.
        let envelope = match tokio::time::timeout(
            self.handshake_timeout,
            crate::envelope::read_tcp_frame(&mut stream, crate::envelope::DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(err)) => {
                tracing::info!(%err, %from_addr, "handshake decode failed, dropping");
                return;
            }
            Err(_) => {
                tracing::info!(%from_addr, "handshake timed out, dropping");
                return;
            }
        };

        let peer_id = envelope.peer_id.unwrap_or_else(|| crate::peer::PeerId::from_seed(0));
        let conn = Connection::new(peer_id, stream);
        self.watcher.track(conn.clone());
        self.dispatch(envelope.header, conn, peer_id, from_addr, envelope.msg_id).await;
    }

    /// Runs the handler registered for `header`, then applies spec.md §4.7's
    /// connection-dispatcher lifecycle: wait up to 1s for the handler to
    /// have released the lock, park on success, close on failure.
    async fn dispatch(
        self: Arc<Self>,
        header: Header,
        conn: Arc<Connection>,
        peer_id: crate::peer::PeerId,
        from_addr: SocketAddr,
        msg_id: Option<u64>,
    ) {
        let header_key = format!("{:?}", header);
        let fut = {
            let handlers = self.handlers.read().unwrap();
            let Some(handler) = handlers.get(&header_key) else {
                tracing::info!(header = %header_key, %from_addr, "no acceptor handler registered");
                self.watcher.request_closing(conn.id);
                return;
            };
            handler(AcceptedConnection {
                connection: conn.clone(),
                header,
                peer_id,
                from_addr,
                msg_id,
            })
        };
        fut.await;

        match conn.try_lock_timeout(Duration::from_secs(1)).await {
            Some(guard) => {
                drop(guard);
                self.park(conn.clone());
                let idle_budget = self.watcher.max_idle_time();
                tokio::spawn(self.watch_parked(conn, from_addr, idle_budget));
            }
            None => {
                tracing::warn!(conn_id = conn.id, "handler did not release connection in time, closing");
                self.watcher.request_closing(conn.id);
            }
        }
    }

    /// Watches a parked connection for the next inbound envelope, per
    /// spec.md §4.7's parking rules: re-dispatch on arrival, close on idle
    /// timeout or read error.
    async fn watch_parked(self: Arc<Self>, conn: Arc<Connection>, from_addr: SocketAddr, idle_budget: Duration) {
        let outcome = tokio::time::timeout(
            idle_budget,
            conn.read_envelope(crate::envelope::DEFAULT_MAX_FRAME_SIZE),
        )
        .await;

        // Another task (e.g. messaging's own reclaim) may have already taken
        // this connection out of parking; don't double-dispatch it.
        if self.take_parked(conn.id).is_none() {
            return;
        }

        match outcome {
            Ok(Ok(envelope)) => {
                let peer_id = envelope.peer_id.unwrap_or(conn.peer_id);
                self.dispatch(envelope.header, conn, peer_id, from_addr, envelope.msg_id).await;
            }
            Ok(Err(err)) => {
                tracing::info!(%err, conn_id = conn.id, "parked connection read failed, closing");
                self.watcher.request_closing(conn.id);
            }
            Err(_) => {
                tracing::debug!(conn_id = conn.id, "parked connection idle timeout, closing");
                self.watcher.request_closing(conn.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    async fn bound_acceptor() -> Arc<Acceptor> {
        let mut cfg = Config::default();
        cfg.bind_addr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        cfg.connection_port = 0;
        let watcher = BandwidthWatcher::new(100, Duration::from_secs(60));
        Arc::new(Acceptor::bind(&cfg, watcher).await.unwrap())
    }

    #[tokio::test]
    async fn handshake_routes_to_the_registered_handler() {
        let acceptor = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();
        let hits = StdArc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        acceptor.register_handler(
            "CmdMsgConn",
            Box::new(move |_accepted: AcceptedConnection| {
                let hits = hits2.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let acceptor_clone = acceptor.clone();
        let run_task = tokio::spawn(async move {
            acceptor_clone.run(crate::peer::PeerId::from_seed(1)).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let envelope = Envelope::new(Header::CmdMsgConn).with_peer_id(crate::peer::PeerId::from_seed(2));
        crate::envelope::write_tcp_frame(&mut client, &envelope)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        run_task.abort();
    }

    #[tokio::test]
    async fn unregistered_header_is_dropped_without_panicking() {
        let acceptor = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();
        let acceptor_clone = acceptor.clone();
        let run_task = tokio::spawn(async move {
            acceptor_clone.run(crate::peer::PeerId::from_seed(1)).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let envelope = Envelope::new(Header::Ping);
        crate::envelope::write_tcp_frame(&mut client, &envelope)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        run_task.abort();
    }

    #[tokio::test]
    async fn a_handler_that_releases_its_lock_gets_auto_parked_and_redispatched() {
        let acceptor = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();

        // First header's handler does nothing and returns immediately,
        // leaving the connection unlocked — the dispatcher should park it.
        acceptor.register_handler(
            "CmdMsgConn",
            Box::new(|_accepted: AcceptedConnection| Box::pin(async move {})),
        );

        let second_hits = StdArc::new(AtomicUsize::new(0));
        let second_hits2 = second_hits.clone();
        acceptor.register_handler(
            "CmdText",
            Box::new(move |_accepted: AcceptedConnection| {
                let hits = second_hits2.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let acceptor_clone = acceptor.clone();
        let run_task = tokio::spawn(async move {
            acceptor_clone.run(crate::peer::PeerId::from_seed(1)).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let handshake =
            Envelope::new(Header::CmdMsgConn).with_peer_id(crate::peer::PeerId::from_seed(2));
        crate::envelope::write_tcp_frame(&mut client, &handshake)
            .await
            .unwrap();

        // Give the dispatcher time to run the first handler and park.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = Envelope::new(Header::CmdText).with_body(
            "text",
            crate::envelope::BodyValue::Str("hi".to_string()),
        );
        crate::envelope::write_tcp_frame(&mut client, &second)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        run_task.abort();
    }

    #[tokio::test]
    async fn a_handler_that_keeps_the_lock_past_the_grace_period_gets_closed_not_parked() {
        let acceptor = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();

        acceptor.register_handler(
            "CmdMsgConn",
            Box::new(|accepted: AcceptedConnection| {
                Box::pin(async move {
                    // Hold the lock well past the 1s park grace period.
                    let _guard = accepted.connection.lock().await;
                    tokio::time::sleep(Duration::from_millis(1200)).await;
                })
            }),
        );

        let acceptor_clone = acceptor.clone();
        let run_task = tokio::spawn(async move {
            acceptor_clone.run(crate::peer::PeerId::from_seed(1)).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let handshake =
            Envelope::new(Header::CmdMsgConn).with_peer_id(crate::peer::PeerId::from_seed(2));
        crate::envelope::write_tcp_frame(&mut client, &handshake)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(acceptor.watcher.open_count(), 0);
        run_task.abort();
    }

    #[tokio::test]
    async fn parked_connection_can_be_reclaimed() {
        let acceptor = bound_acceptor().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_stream = accept_task.await.unwrap();
        std::mem::forget(client);

        let conn = Connection::new(crate::peer::PeerId::from_seed(9), server_stream);
        let id = conn.id;
        acceptor.park(conn);
        let reclaimed = acceptor.take_parked(id);
        assert!(reclaimed.is_some());
        assert!(acceptor.take_parked(id).is_none());
    }
}
