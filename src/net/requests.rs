//! Requests endpoint (C3): one UDP socket multiplexing DHT RPCs, gossip,
//! discovery, and short control requests, with a reply-correlation registry
//! (spec.md §4.3).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::envelope::{Envelope, Header, RootCode};
use crate::error::DispatchError;
use crate::net::{BoxFuture, HandlerFn, ReplyRegistry};

/// Maximum UDP datagram this endpoint will attempt to read; oversized or
/// malformed datagrams are dropped and logged (spec.md §4.1).
const MAX_DATAGRAM: usize = 64 * 1024;

/// One inbound UDP message, handed to a handler's own task (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub root_code: RootCode,
    pub envelope: Envelope,
    pub from_addr: SocketAddr,
}

/// The requests endpoint: one bound UDP socket plus the dispatch tables
/// spec.md §4.3 describes. Root-code handlers are full `HandlerFn`s; the
/// nested `REQUEST` registry additionally keys by header string for small
/// RPCs like ping/echo.
pub struct RequestsEndpoint {
    socket: Arc<UdpSocket>,
    reply_registry: Arc<ReplyRegistry<Envelope>>,
    root_handlers: RwLock<HashMap<u8, HandlerFn<RequestEvent>>>,
    request_handlers: RwLock<HashMap<String, HandlerFn<RequestEvent>>>,
}

impl RequestsEndpoint {
    /// Bind the UDP socket, enabling address reuse and subscribing to the
    /// discovery multicast groups (spec.md §4.3, §6).
    pub async fn bind(config: &Config) -> anyhow::Result<Arc<Self>> {
        let addr = SocketAddr::new(config.bind_addr, config.request_port);
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket2 = Socket::new(domain, Type::DGRAM, None)?;
        socket2.set_reuse_address(true)?;
        socket2.set_nonblocking(true)?;
        socket2.bind(&addr.into())?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)?;

        if let std::net::IpAddr::V4(bind_v4) = config.bind_addr {
            if socket
                .join_multicast_v4(config.multicast_v4, bind_v4)
                .is_err()
            {
                tracing::warn!("failed to join ipv4 multicast group, discovery degraded");
            }
        }
        let _ = socket.join_multicast_v6(&config.multicast_v6, 0);
        socket.set_broadcast(true).ok();

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            reply_registry: Arc::new(ReplyRegistry::new()),
            root_handlers: RwLock::new(HashMap::new()),
            request_handlers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register a handler for an entire root-code family (GOSSIP, DISCOVERY,
    /// DHT). The REQUEST family is handled separately via
    /// [`Self::register_request_handler`] so small RPCs can be routed by
    /// header without every caller re-implementing that nested dispatch.
    pub fn register_root_handler(&self, root: RootCode, handler: HandlerFn<RequestEvent>) {
        self.root_handlers
            .write()
            .unwrap()
            .insert(root.to_byte(), handler);
    }

    /// Register a handler keyed by header string, under the REQUEST root
    /// code (spec.md §4.3: "a nested registry header → handler").
    pub fn register_request_handler(&self, header: &str, handler: HandlerFn<RequestEvent>) {
        self.request_handlers
            .write()
            .unwrap()
            .insert(header.to_string(), handler);
    }

    /// Register interest in a reply keyed by `msg_id`.
    pub fn register_reply(&self, msg_id: u64) -> oneshot::Receiver<Envelope> {
        self.reply_registry.register(msg_id)
    }

    /// Send an envelope to `addr` tagged with `root`. If `expect_reply` is
    /// set, `envelope.msg_id` must already be set (spec.md §4.3) — the caller
    /// is expected to have called [`Self::register_reply`] first.
    pub async fn send_to(
        &self,
        envelope: &Envelope,
        root: RootCode,
        addr: SocketAddr,
        expect_reply: bool,
    ) -> Result<(), DispatchError> {
        if expect_reply && envelope.msg_id.is_none() {
            return Err(DispatchError::MissingMsgId);
        }
        let datagram = envelope.encode_udp(root)?;
        self.socket.send_to(&datagram, addr).await?;
        Ok(())
    }

    /// Drive the receive loop. Runs until the socket errors or the task is
    /// cancelled; intended to be spawned once by the state manager (C14).
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(%err, "requests endpoint socket error, stopping");
                    return;
                }
            };
            let datagram = &buf[..len];
            let (root_code, envelope) = match Envelope::decode_udp(datagram) {
                Ok(v) => v,
                Err(err) => {
                    tracing::info!(%err, %from_addr, "dropping malformed datagram");
                    continue;
                }
            };
            self.dispatch(RequestEvent {
                root_code,
                envelope,
                from_addr,
            });
        }
    }

    /// Dispatch order (spec.md §4.3): (a) fulfill a waiting reply and stop;
    /// (b) else look up by root code (or header, for REQUEST); (c) invoke on
    /// its own task so handler panics/errors never kill this loop.
    fn dispatch(self: &Arc<Self>, event: RequestEvent) {
        if let Some(msg_id) = event.envelope.msg_id {
            if self.reply_registry.resolve(msg_id, event.envelope.clone()) {
                return;
            }
        }

        if event.root_code == RootCode::Request {
            let header_key = header_key(&event.envelope.header);
            let handlers = self.request_handlers.read().unwrap();
            if let Some(handler) = handlers.get(&header_key) {
                let fut = handler(event);
                drop(handlers);
                tokio::spawn(async move {
                    fut.await;
                });
            } else {
                tracing::info!(header = %header_key, "no request handler registered, dropping");
            }
            return;
        }

        let handlers = self.root_handlers.read().unwrap();
        if let Some(handler) = handlers.get(&event.root_code.to_byte()) {
            let fut = handler(event);
            drop(handlers);
            tokio::spawn(async move {
                fut.await;
            });
        } else {
            tracing::info!(root = ?event.root_code, "no root handler registered, dropping");
        }
    }
}

fn header_key(header: &Header) -> String {
    format!("{header:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn bound_endpoint() -> Arc<RequestsEndpoint> {
        let mut cfg = Config::default();
        cfg.bind_addr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        cfg.request_port = 0; // OS-assigned port for test isolation
        RequestsEndpoint::bind(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn root_handler_receives_dispatched_events() {
        let endpoint = bound_endpoint().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        endpoint.register_root_handler(
            RootCode::Gossip,
            Box::new(move |_event: RequestEvent| {
                let count = count2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let envelope = Envelope::new(Header::GossipMessage).with_msg_id(1);
        let from_addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        endpoint.dispatch(RequestEvent {
            root_code: RootCode::Gossip,
            envelope,
            from_addr,
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reply_is_fulfilled_instead_of_handler_dispatch() {
        let endpoint = bound_endpoint().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        endpoint.register_root_handler(
            RootCode::Gossip,
            Box::new(move |_event| {
                fired2.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {})
            }),
        );
        let rx = endpoint.register_reply(99);
        let reply_envelope = Envelope::new(Header::GossipMessage).with_msg_id(99);
        endpoint.dispatch(RequestEvent {
            root_code: RootCode::Gossip,
            envelope: reply_envelope.clone(),
            from_addr: "127.0.0.1:1".parse().unwrap(),
        });
        let got = rx.await.unwrap();
        assert_eq!(got, reply_envelope);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_to_requires_msg_id_when_expecting_reply() {
        let endpoint = bound_endpoint().await;
        let envelope = Envelope::new(Header::Ping);
        let result = endpoint
            .send_to(&envelope, RootCode::Request, "127.0.0.1:1".parse().unwrap(), true)
            .await;
        assert!(matches!(result, Err(DispatchError::MissingMsgId)));
    }
}
