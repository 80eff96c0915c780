//! Distributed search (C5/C6-adjacent): DHT anchor enumeration plus gossip
//! search, merged behind one async stream per query (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dht::{DhtHandle, DhtRequest, DhtResponse, PeerRecord};
use crate::gossip::{Gossip, GossipMessage};
use crate::net::requests::RequestsEndpoint;
use crate::peer::{Peer, PeerId, PeerRegistry, PeerStatus};

/// Deadline a gossip search result stream stays open for (spec.md §4.6: "≈3s").
const GOSSIP_SEARCH_DEADLINE: Duration = Duration::from_secs(3);
const GOSSIP_SEARCH_TTL: u8 = 4;

/// Routes `SEARCH_REQ`/`SEARCH_REPLY` gossip messages to per-query result
/// channels keyed by `msg_id`, and answers `SEARCH_REQ`s against the local
/// registry (spec.md §4.6 step 2).
pub struct SearchEngine {
    our_peer: Arc<Peer>,
    registry: Arc<PeerRegistry>,
    requests: Arc<RequestsEndpoint>,
    gossip: Arc<Gossip>,
    dht: Option<DhtHandle>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Arc<Peer>>>>,
}

impl SearchEngine {
    pub fn new(
        our_peer: Arc<Peer>,
        registry: Arc<PeerRegistry>,
        requests: Arc<RequestsEndpoint>,
        gossip: Arc<Gossip>,
        dht: Option<DhtHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            our_peer,
            registry,
            requests,
            gossip,
            dht,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Search for peers whose display name contains `substring`, streaming
    /// results as they arrive: local matches first, then DHT-enumerated
    /// matches, then whatever the gossip search turns up before the
    /// deadline. De-duplicated by peer id (spec.md §4.6).
    pub fn search_for_nodes(self: &Arc<Self>, substring: String) -> mpsc::Receiver<Arc<Peer>> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            let mut seen: HashSet<PeerId> = HashSet::new();

            for peer in this.registry.search_by_name(&substring) {
                if seen.insert(peer.id) {
                    let _ = tx.send(peer).await;
                }
            }

            if let Some(dht) = &this.dht {
                for record in this.dht_enumerate(dht, &substring).await {
                    let peer = record_to_peer(record);
                    if seen.insert(peer.id) {
                        let _ = tx.send(Arc::new(peer)).await;
                    }
                }
            }

            this.run_gossip_search(substring, tx, seen).await;
        });
        rx
    }

    async fn dht_enumerate(&self, dht: &DhtHandle, substring: &str) -> Vec<PeerRecord> {
        let mut matches = Vec::new();
        for anchor in crate::dht::anchor_ids() {
            // The local peer acts as its own bootstrap target for anchor
            // lookups here; a real deployment resolves the closest known
            // peer to `anchor` first. Kept simple: anchor lookups degrade to
            // no-ops until at least one peer is known.
            let Some(bootstrap) = self.registry.all_peers().into_iter().next() else {
                break;
            };
            let target = libp2p::PeerId::from_bytes(&bootstrap.id.0).unwrap_or(libp2p::PeerId::random());
            if let Ok(DhtResponse::SearchResults(results)) = dht
                .request(target, DhtRequest::SearchPeers { name_query: substring.to_string() })
                .await
            {
                matches.extend(results);
            }
            let _ = anchor;
        }
        matches
    }

    async fn run_gossip_search(self: &Arc<Self>, substring: String, tx: mpsc::Sender<Arc<Peer>>, mut seen: HashSet<PeerId>) {
        let msg_id = rand::random();
        let (result_tx, mut result_rx) = mpsc::channel(64);
        self.pending.lock().unwrap().insert(msg_id, result_tx);

        let gmsg = GossipMessage {
            id: rand::random(),
            header: "SEARCH_REQ".to_string(),
            message: search_req_payload(msg_id, &substring),
            created_epoch_ms: crate::gossip::now_epoch_ms(),
            ttl: GOSSIP_SEARCH_TTL,
        };
        self.gossip.publish_raw(gmsg).await;

        let deadline = tokio::time::sleep(GOSSIP_SEARCH_DEADLINE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                maybe_peer = result_rx.recv() => {
                    match maybe_peer {
                        Some(peer) => {
                            if seen.insert(peer.id) {
                                let _ = tx.send(peer).await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.pending.lock().unwrap().remove(&msg_id);
    }

    /// Answers the requests-endpoint `SEARCH_PEERS(substring) -> [peer]` RPC
    /// (spec.md §4.4) by scanning the local registry and replying directly
    /// to the requester's address.
    pub fn register_search_peers_handler(self: &Arc<Self>) {
        let this = self.clone();
        self.requests.register_request_handler(
            "SearchPeersReq",
            // key must match `format!("{:?}", Header::SearchPeersReq)`
            Box::new(move |event| {
                let this = this.clone();
                Box::pin(async move {
                    let Some(substring) = event.envelope.body_str("substring").map(str::to_owned) else {
                        return;
                    };
                    let matches = this.registry.search_by_name(&substring);
                    let peer_ids = matches.iter().map(|p| p.id).collect();
                    let mut reply = crate::envelope::Envelope::new(crate::envelope::Header::SearchPeersReply)
                        .with_body("peers", crate::envelope::BodyValue::PeerList(peer_ids));
                    if let Some(msg_id) = event.envelope.msg_id {
                        reply = reply.with_msg_id(msg_id);
                    }
                    let _ = this
                        .requests
                        .send_to(&reply, crate::envelope::RootCode::Request, event.from_addr, false)
                        .await;
                })
            }),
        );
    }

    /// Handler for `SEARCH_REQ`/`SEARCH_REPLY` gossip deliveries, installed
    /// on the gossip engine (spec.md §4.6 step 2).
    pub fn gossip_handler(self: &Arc<Self>) -> crate::gossip::GossipHandlerFn {
        let this = self.clone();
        Box::new(move |gmsg: GossipMessage| {
            let this = this.clone();
            Box::pin(async move {
                match gmsg.header.as_str() {
                    "SEARCH_REQ" => this.on_search_req(gmsg).await,
                    "SEARCH_REPLY" => this.on_search_reply(gmsg).await,
                    _ => {}
                }
            })
        })
    }

    async fn on_search_req(self: &Arc<Self>, gmsg: GossipMessage) {
        let Some((msg_id, substring)) = parse_search_req(&gmsg.message) else {
            return;
        };
        // Only the node whose own display name matches answers (spec.md
        // §4.6 step 2); matching against the whole registry would have every
        // node that merely knows of a match reply with someone else's name.
        if !self.our_peer.name.to_lowercase().contains(&substring.to_lowercase()) {
            return;
        }
        let reply = GossipMessage {
            id: rand::random(),
            header: "SEARCH_REPLY".to_string(),
            message: search_reply_payload(msg_id, &self.our_peer),
            created_epoch_ms: crate::gossip::now_epoch_ms(),
            ttl: 1,
        };
        self.gossip.publish_raw(reply).await;
    }

    async fn on_search_reply(&self, gmsg: GossipMessage) {
        let Some((msg_id, peer)) = parse_search_reply(&gmsg.message) else {
            return;
        };
        if let Some(sender) = self.pending.lock().unwrap().get(&msg_id) {
            let _ = sender.try_send(Arc::new(peer));
        }
    }
}

fn record_to_peer(record: PeerRecord) -> Peer {
    Peer {
        id: record.id,
        name: record.name,
        addr: record.addr,
        request_port: record.request_port,
        connection_port: record.connection_port,
        status: PeerStatus::Online,
    }
}

fn search_req_payload(msg_id: u64, substring: &str) -> Vec<u8> {
    let mut out = msg_id.to_be_bytes().to_vec();
    out.extend_from_slice(substring.as_bytes());
    out
}

fn parse_search_req(bytes: &[u8]) -> Option<(u64, String)> {
    if bytes.len() < 8 {
        return None;
    }
    let msg_id = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let substring = String::from_utf8(bytes[8..].to_vec()).ok()?;
    Some((msg_id, substring))
}

/// `msg_id(8) | peer_id(20) | addr_is_v6(1) | addr(4 or 16) | request_port(2)
/// | connection_port(2) | name(rest, utf8)` — carries the replying peer's
/// full record so the searcher can actually connect to what it found
/// (spec.md §4.6 step 2, §8 scenario 4).
fn search_reply_payload(msg_id: u64, peer: &Peer) -> Vec<u8> {
    let mut out = msg_id.to_be_bytes().to_vec();
    out.extend_from_slice(&peer.id.0);
    match peer.addr {
        std::net::IpAddr::V4(v4) => {
            out.push(0);
            out.extend_from_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            out.push(1);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&peer.request_port.to_be_bytes());
    out.extend_from_slice(&peer.connection_port.to_be_bytes());
    out.extend_from_slice(peer.name.as_bytes());
    out
}

fn parse_search_reply(bytes: &[u8]) -> Option<(u64, Peer)> {
    let msg_id = u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?);
    let mut pos = 8;
    let id_bytes: [u8; 20] = bytes.get(pos..pos + 20)?.try_into().ok()?;
    pos += 20;
    let is_v6 = *bytes.get(pos)?;
    pos += 1;
    let addr = if is_v6 == 1 {
        let octets: [u8; 16] = bytes.get(pos..pos + 16)?.try_into().ok()?;
        pos += 16;
        std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets))
    } else {
        let octets: [u8; 4] = bytes.get(pos..pos + 4)?.try_into().ok()?;
        pos += 4;
        std::net::IpAddr::V4(std::net::Ipv4Addr::from(octets))
    };
    let request_port = u16::from_be_bytes(bytes.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let connection_port = u16::from_be_bytes(bytes.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let name = String::from_utf8(bytes.get(pos..)?.to_vec()).ok()?;
    Some((
        msg_id,
        Peer {
            id: PeerId(id_bytes),
            name,
            addr,
            request_port,
            connection_port,
            status: PeerStatus::Online,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_req_payload_roundtrips() {
        let bytes = search_req_payload(42, "alice");
        let (msg_id, substring) = parse_search_req(&bytes).unwrap();
        assert_eq!(msg_id, 42);
        assert_eq!(substring, "alice");
    }

    #[test]
    fn search_reply_payload_roundtrips() {
        let peer = Peer {
            id: PeerId::from_seed(42),
            name: "alice-42".to_string(),
            addr: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7)),
            request_port: 9000,
            connection_port: 9001,
            status: PeerStatus::Online,
        };
        let bytes = search_reply_payload(7, &peer);
        let (msg_id, decoded) = parse_search_reply(&bytes).unwrap();
        assert_eq!(msg_id, 7);
        assert_eq!(decoded.id, peer.id);
        assert_eq!(decoded.name, peer.name);
        assert_eq!(decoded.addr, peer.addr);
        assert_eq!(decoded.request_port, peer.request_port);
        assert_eq!(decoded.connection_port, peer.connection_port);
    }

    #[test]
    fn truncated_search_req_is_rejected() {
        assert!(parse_search_req(&[1, 2, 3]).is_none());
    }
}
