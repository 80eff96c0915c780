//! Gossip engine (C5): rumor-mongering message propagation over the requests
//! endpoint's `Gossip` root code (spec.md §4.5), plus the hop-based `ttl`
//! decrement the original distillation dropped (spec.md §6 "Supplemented
//! features") layered on top.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::envelope::{BodyValue, Envelope, Header, RootCode};
use crate::net::requests::{RequestEvent, RequestsEndpoint};
use crate::peer::{PeerId, PeerRegistry};

/// A gossip message as it's carried over the wire (spec.md §3: `id, header,
/// message, created, ttl`). `created` is an epoch-millisecond timestamp set
/// once by the originator; every hop uses it, unmodified, to compute decay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: u64,
    pub header: String,
    pub message: Vec<u8>,
    pub created_epoch_ms: u64,
    pub ttl: u8,
}

struct SeenEntry {
    created_epoch_ms: u64,
    /// Peers this node has already forwarded the message to, so a repeat
    /// delivery samples only from the complement (spec.md §4.5
    /// `sample_peers`).
    already_sent: HashSet<PeerId>,
}

/// Tracks every in-flight message's forwarding history until it ages out of
/// `NODE_POV_GOSSIP_TTL` (spec.md §4.5: "entries older than
/// NODE_POV_GOSSIP_TTL are moved to a dropped set" — modeled here as removal,
/// since a dropped id and a never-seen id are handled identically).
struct SeenSet {
    entries: HashMap<u64, SeenEntry>,
    global_ttl: Duration,
}

impl SeenSet {
    fn new(global_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            global_ttl,
        }
    }

    fn sweep(&mut self) {
        let now = now_epoch_ms();
        let ttl_ms = self.global_ttl.as_millis() as u64;
        self.entries
            .retain(|_, e| now.saturating_sub(e.created_epoch_ms) <= ttl_ms);
    }
}

pub type GossipHandlerFn = Box<dyn Fn(GossipMessage) -> crate::net::BoxFuture<'static, ()> + Send + Sync>;

/// The gossip engine: holds the seen set and the subscriber table, and drives
/// fan-out over the requests endpoint.
pub struct Gossip {
    requests: Arc<RequestsEndpoint>,
    registry: Arc<PeerRegistry>,
    seen: Mutex<SeenSet>,
    subscribers: std::sync::RwLock<Vec<GossipHandlerFn>>,
    fanout: usize,
    max_hops: u8,
    global_ttl: Duration,
}

impl Gossip {
    pub fn new(requests: Arc<RequestsEndpoint>, registry: Arc<PeerRegistry>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            requests,
            registry,
            seen: Mutex::new(SeenSet::new(config.node_pov_gossip_ttl)),
            subscribers: std::sync::RwLock::new(Vec::new()),
            fanout: crate::config::GOSSIP_ALPHA,
            max_hops: 16,
            global_ttl: config.node_pov_gossip_ttl,
        })
    }

    /// Register a local handler invoked once per distinct message, regardless
    /// of how many peers it arrived from.
    pub fn subscribe(&self, handler: GossipHandlerFn) {
        self.subscribers.write().unwrap().push(handler);
    }

    /// Originate a new message: assign a fresh id, mark it seen locally, hand
    /// it to subscribers, and fan it out.
    pub async fn publish(self: &Arc<Self>, header: &str, message: Vec<u8>) {
        let gmsg = GossipMessage {
            id: rand::random(),
            header: header.to_string(),
            message,
            created_epoch_ms: now_epoch_ms(),
            ttl: self.max_hops,
        };
        self.publish_raw(gmsg).await;
    }

    /// Same as [`Self::publish`] but takes an already-built message — used by
    /// the search engine (C6-adjacent) to originate `SEARCH_REQ`/`SEARCH_REPLY`
    /// with its own ttl and header convention.
    pub async fn publish_raw(self: &Arc<Self>, gmsg: GossipMessage) {
        {
            let mut seen = self.seen.lock().unwrap();
            seen.sweep();
            seen.entries.entry(gmsg.id).or_insert_with(|| SeenEntry {
                created_epoch_ms: gmsg.created_epoch_ms,
                already_sent: HashSet::new(),
            });
        }
        self.notify_subscribers(&gmsg).await;
        self.fan_out(&gmsg).await;
    }

    /// Handler installed on the requests endpoint's `Gossip` root code
    /// (spec.md §4.3, §4.5): decide whether to deliver/forward per
    /// `should_gossip`, then sample fresh fan-out targets.
    pub fn handle_event(self: &Arc<Self>, event: RequestEvent) -> crate::net::BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let Some(BodyValue::Bytes(payload)) = event.envelope.body.get("gossip") else {
                tracing::info!("gossip event missing payload, dropping");
                return;
            };
            let gmsg: GossipMessage = match postcard::from_bytes(payload) {
                Ok(v) => v,
                Err(err) => {
                    tracing::info!(%err, "malformed gossip payload, dropping");
                    return;
                }
            };
            if gmsg.ttl == 0 {
                return; // hop-based suppression (spec.md §6)
            }
            if !this.should_gossip(&gmsg) {
                return;
            }

            let is_new = {
                let mut seen = this.seen.lock().unwrap();
                seen.sweep();
                let was_absent = !seen.entries.contains_key(&gmsg.id);
                seen.entries.entry(gmsg.id).or_insert_with(|| SeenEntry {
                    created_epoch_ms: gmsg.created_epoch_ms,
                    already_sent: HashSet::new(),
                });
                was_absent
            };
            if is_new {
                this.notify_subscribers(&gmsg).await;
            }

            let mut forwarded = gmsg.clone();
            forwarded.ttl -= 1;
            this.fan_out(&forwarded).await;
        })
    }

    /// `should_gossip` (spec.md §4.5): a message past `GLOBAL_TTL` never
    /// forwards again; otherwise forward with probability decaying linearly
    /// from 1.0 towards a floor of 0.6 as it ages.
    fn should_gossip(&self, gmsg: &GossipMessage) -> bool {
        let elapsed = Duration::from_millis(now_epoch_ms().saturating_sub(gmsg.created_epoch_ms));
        if elapsed > self.global_ttl {
            return false;
        }
        let remaining = self.global_ttl.as_secs_f64() - elapsed.as_secs_f64();
        let chance = (remaining / self.global_ttl.as_secs_f64()).max(0.6);
        rand::thread_rng().gen_bool(chance.clamp(0.0, 1.0))
    }

    async fn notify_subscribers(&self, gmsg: &GossipMessage) {
        let handlers: Vec<_> = {
            let guard = self.subscribers.read().unwrap();
            // Handlers aren't `Clone`; invoke under the read lock's borrow by
            // collecting the futures first, then await after dropping it.
            guard.iter().map(|h| h(gmsg.clone())).collect()
        };
        for fut in handlers {
            fut.await;
        }
    }

    /// Reservoir-sample `fanout` peers this message hasn't already been sent
    /// to, and update the already-sent set (spec.md §4.5 `sample_peers`).
    async fn fan_out(&self, gmsg: &GossipMessage) {
        let candidates: Vec<_> = {
            let seen = self.seen.lock().unwrap();
            let already_sent = seen.entries.get(&gmsg.id).map(|e| e.already_sent.clone()).unwrap_or_default();
            self.registry
                .online_peers()
                .into_iter()
                .filter(|p| !already_sent.contains(&p.id))
                .collect()
        };
        let targets = reservoir_sample(candidates, self.fanout);
        if targets.is_empty() {
            return;
        }

        let payload = match postcard::to_stdvec(gmsg) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "failed to encode gossip message");
                return;
            }
        };
        let envelope = Envelope::new(Header::GossipMessage).with_body("gossip", BodyValue::Bytes(payload));

        let mut sent_to = HashSet::new();
        for peer in &targets {
            let addr = std::net::SocketAddr::new(peer.addr, peer.request_port);
            match self.requests.send_to(&envelope, RootCode::Gossip, addr, false).await {
                Ok(()) => {
                    sent_to.insert(peer.id);
                }
                Err(err) => tracing::debug!(%err, peer = %peer.id, "gossip send failed"),
            }
        }

        if let Some(entry) = self.seen.lock().unwrap().entries.get_mut(&gmsg.id) {
            entry.already_sent.extend(sent_to);
        }
    }
}

pub(crate) fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reservoir sampling (Algorithm R): picks up to `k` items from `items`
/// uniformly at random without needing to know the length in advance.
fn reservoir_sample<T>(items: Vec<T>, k: usize) -> Vec<T> {
    let mut rng = rand::thread_rng();
    let mut reservoir: Vec<T> = Vec::with_capacity(k);
    let mut iter = items.into_iter();
    for item in iter.by_ref().take(k) {
        reservoir.push(item);
    }
    for (i, item) in iter.enumerate() {
        let j = rng.gen_range(0..=(i + k));
        if j < k {
            reservoir[j] = item;
        }
    }
    reservoir.shuffle(&mut rng);
    reservoir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_sample_never_exceeds_k() {
        let items: Vec<u32> = (0..50).collect();
        let sample = reservoir_sample(items, 3);
        assert_eq!(sample.len(), 3);
    }

    #[test]
    fn reservoir_sample_returns_everything_when_fewer_than_k() {
        let items = vec![1, 2];
        let sample = reservoir_sample(items, 5);
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn seen_set_forgets_after_ttl_elapses() {
        let mut seen = SeenSet::new(Duration::from_millis(5));
        seen.entries.insert(
            1,
            SeenEntry {
                created_epoch_ms: now_epoch_ms(),
                already_sent: HashSet::new(),
            },
        );
        std::thread::sleep(Duration::from_millis(15));
        seen.sweep();
        assert!(seen.entries.is_empty());
    }

    #[tokio::test]
    async fn fresh_message_always_passes_should_gossip() {
        let mut cfg = Config::default();
        cfg.bind_addr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        cfg.request_port = 0;
        cfg.node_pov_gossip_ttl = Duration::from_secs(30);
        let requests = RequestsEndpoint::bind(&cfg).await.unwrap();
        let registry = Arc::new(PeerRegistry::new());
        let gossip = Gossip::new(requests, registry, &cfg);

        let gmsg = GossipMessage {
            id: 1,
            header: "test".into(),
            message: vec![],
            created_epoch_ms: now_epoch_ms(),
            ttl: 16,
        };
        assert!(gossip.should_gossip(&gmsg));
    }

    #[tokio::test]
    async fn message_past_global_ttl_never_forwards() {
        let mut cfg = Config::default();
        cfg.bind_addr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        cfg.request_port = 0;
        cfg.node_pov_gossip_ttl = Duration::from_millis(10);
        let requests = RequestsEndpoint::bind(&cfg).await.unwrap();
        let registry = Arc::new(PeerRegistry::new());
        let gossip = Gossip::new(requests, registry, &cfg);

        let gmsg = GossipMessage {
            id: 1,
            header: "test".into(),
            message: vec![],
            created_epoch_ms: now_epoch_ms().saturating_sub(1000),
            ttl: 16,
        };
        assert!(!gossip.should_gossip(&gmsg));
    }
}
