//! Discovery (C6): multicast ping/reply bootstrap over the requests
//! endpoint's `Discovery` root code, with passive retry and a display-name
//! fallback when no one answers (spec.md §4.6 table entry, §6).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::envelope::{BodyValue, Envelope, Header, RootCode};
use crate::net::requests::{RequestEvent, RequestsEndpoint};
use crate::peer::{Peer, PeerId, PeerRegistry, PeerStatus};

/// Broadcasts a `NETWORK_FIND` on the discovery multicast group and waits
/// for `NETWORK_FIND_REPLY`s, retrying with the configured backoff until a
/// peer answers or the retry budget is exhausted (spec.md §5:
/// `DISCOVER_TIMEOUT` / `DISCOVER_RETRIES`).
pub struct Discovery {
    requests: Arc<RequestsEndpoint>,
    registry: Arc<PeerRegistry>,
    our_id: PeerId,
    our_name: String,
    discover_timeout: Duration,
    discover_retries: u32,
}

impl Discovery {
    pub fn new(requests: Arc<RequestsEndpoint>, registry: Arc<PeerRegistry>, our_id: PeerId, config: &Config) -> Self {
        Self {
            requests,
            registry,
            our_id,
            our_name: config.display_name.clone(),
            discover_timeout: config.discover_timeout,
            discover_retries: config.discover_retries,
        }
    }

    /// Run the bootstrap sequence. Returns `true` if at least one peer
    /// answered within the retry budget (spec.md edge case 5: "packet loss
    /// for 2s; on the third retry, B replies").
    pub async fn bootstrap(&self, multicast_addr: SocketAddr) -> bool {
        for attempt in 0..=self.discover_retries {
            if attempt > 0 {
                tracing::info!(attempt, "no discovery reply yet, retrying");
            }
            let rx = self.requests.register_reply(DISCOVERY_MSG_ID);
            let envelope = Envelope::new(Header::NetworkFind)
                .with_msg_id(DISCOVERY_MSG_ID)
                .with_peer_id(self.our_id)
                .with_body("name", BodyValue::Str(self.our_name.clone()));
            if self
                .requests
                .send_to(&envelope, RootCode::Discovery, multicast_addr, true)
                .await
                .is_err()
            {
                continue;
            }

            if let Ok(Ok(reply)) = tokio::time::timeout(self.discover_timeout, rx).await {
                self.absorb_reply(&reply);
                return true;
            }
        }
        tracing::warn!("discovery exhausted retry budget, starting isolated");
        false
    }

    fn absorb_reply(&self, envelope: &Envelope) {
        let Some(peer_id) = envelope.peer_id else {
            return;
        };
        let name = envelope.body_str("name").unwrap_or("anonymous").to_string();
        let Some(BodyValue::U64(request_port)) = envelope.body.get("request_port") else {
            return;
        };
        let Some(BodyValue::U64(connection_port)) = envelope.body.get("connection_port") else {
            return;
        };
        let Some(BodyValue::Str(addr_str)) = envelope.body.get("addr") else {
            return;
        };
        let Ok(addr) = addr_str.parse() else {
            return;
        };
        self.registry.upsert(Peer {
            id: peer_id,
            name,
            addr,
            request_port: *request_port as u16,
            connection_port: *connection_port as u16,
            status: PeerStatus::Online,
        });
    }

    /// Handler installed on the requests endpoint's `Discovery` root code:
    /// answer every `NETWORK_FIND` that isn't our own, and absorb any
    /// `NETWORK_FIND_REPLY` addressed via a non-reply path (e.g. a late
    /// duplicate arriving after this node stopped waiting).
    pub fn handle_event(self: &Arc<Self>, local_addr: SocketAddr, connection_port: u16) -> impl Fn(RequestEvent) -> crate::net::BoxFuture<'static, ()> + Send + Sync {
        let this = self.clone();
        move |event: RequestEvent| {
            let this = this.clone();
            Box::pin(async move {
                if event.envelope.header != Header::NetworkFind {
                    return;
                }
                if event.envelope.peer_id == Some(this.our_id) {
                    return; // our own broadcast looped back
                }
                let reply = Envelope::new(Header::NetworkFindReply)
                    .with_msg_id(event.envelope.msg_id.unwrap_or_default())
                    .with_peer_id(this.our_id)
                    .with_body("name", BodyValue::Str(this.our_name.clone()))
                    .with_body("addr", BodyValue::Str(local_addr.ip().to_string()))
                    .with_body("request_port", BodyValue::U64(local_addr.port() as u64))
                    .with_body("connection_port", BodyValue::U64(connection_port as u64));
                let _ = this
                    .requests
                    .send_to(&reply, RootCode::Discovery, event.from_addr, false)
                    .await;
            })
        }
    }
}

/// A fixed correlation id for the broadcast discovery request: every replier
/// echoes it back so a single `register_reply` wait catches the first
/// answer, matching spec.md §4.3's reply-correlation contract for a
/// fan-out-of-one-expects-any-of-many request.
const DISCOVERY_MSG_ID: u64 = 0;
