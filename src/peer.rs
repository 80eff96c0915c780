//! Peer identity and process-wide registry (C2).
//!
//! A [`PeerId`] is derived once from a numeric seed by hashing it to 160
//! bits (spec.md §3, §6 "Supplemented features"). The [`PeerRegistry`] is the
//! single process-wide map of known peers — readers see consistent snapshots
//! via `Arc<Peer>` clones rather than holding the registry lock across `.await`.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// A 160-bit peer identifier, derived from a numeric seed via BLAKE3.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Derive a stable 160-bit id from a numeric seed. `blake3` produces a
    /// 256-bit digest; we keep the first 20 bytes, matching the original's
    /// "hash a numeric seed to get an id" behavior (spec.md §3) without
    /// committing to a specific legacy hash algorithm.
    pub fn from_seed(seed: u64) -> Self {
        let digest = blake3::hash(&seed.to_be_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.as_bytes()[..20]);
        Self(bytes)
    }

    /// XOR distance between two ids, used by anchor enumeration and the DHT
    /// closest-node calculations (C4).
    pub fn distance(&self, other: &PeerId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn short(&self) -> String {
        hex_string(&self.0[..4])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex_string(&self.0))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_string(&self.0))
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Online/offline liveness, per spec.md §3's `peer.is_online ⇔ status=ONLINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Online,
    Offline,
}

/// A peer record. Mutated in place (status, name) rather than replaced, so
/// `Arc<Peer>` holders observe updates only by re-fetching from the registry —
/// individual fields needing independent mutation live behind their own lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub addr: IpAddr,
    pub request_port: u16,
    pub connection_port: u16,
    pub status: PeerStatus,
}

impl Peer {
    pub fn is_online(&self) -> bool {
        matches!(self.status, PeerStatus::Online)
    }
}

/// Process-wide map of known peers, keyed by id.
///
/// `RwLock` gives many concurrent readers (handlers checking peer status) and
/// exclusive writers (the one mutation path: insert / status update / remove
/// on confirmed unreachability from C13). Mirrors the `Arc<RwLock<HashMap>>`
/// pattern the teacher uses for `ConnTracker`.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly-sighted peer, or update an existing record in place
    /// (last-writer-wins on status/name, per spec.md §5).
    pub fn upsert(&self, peer: Peer) {
        self.inner.write().unwrap().insert(peer.id, Arc::new(peer));
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Remove a peer record. Only called by the connectivity checker (C13)
    /// after a confirmed unreachability — see `net::connectivity`.
    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.write().unwrap().remove(id)
    }

    pub fn set_status(&self, id: &PeerId, status: PeerStatus) {
        if let Some(mut peer) = self.get(id).map(|p| (*p).clone()) {
            peer.status = status;
            self.upsert(peer);
        }
    }

    pub fn online_peers(&self) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_online())
            .cloned()
            .collect()
    }

    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Case-insensitive substring search by display name (spec.md §4.2, §4.6).
    pub fn search_by_name(&self, substring: &str) -> Vec<Arc<Peer>> {
        let needle = substring.to_lowercase();
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer(seed: u64, name: &str) -> Peer {
        Peer {
            id: PeerId::from_seed(seed),
            name: name.to_string(),
            addr: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            request_port: 35896,
            connection_port: 45210,
            status: PeerStatus::Online,
        }
    }

    #[test]
    fn peer_id_is_stable_for_a_seed() {
        assert_eq!(PeerId::from_seed(42), PeerId::from_seed(42));
        assert_ne!(PeerId::from_seed(42), PeerId::from_seed(43));
    }

    #[test]
    fn add_then_get_returns_the_added_record() {
        let registry = PeerRegistry::new();
        let peer = sample_peer(1, "alice");
        let id = peer.id;
        registry.upsert(peer);
        let fetched = registry.get(&id).expect("peer should be present");
        assert_eq!(fetched.name, "alice");
    }

    #[test]
    fn remove_then_get_returns_none() {
        let registry = PeerRegistry::new();
        let peer = sample_peer(2, "bob");
        let id = peer.id;
        registry.upsert(peer);
        registry.remove(&id);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn search_by_name_is_case_insensitive_substring() {
        let registry = PeerRegistry::new();
        registry.upsert(sample_peer(3, "alice-42"));
        registry.upsert(sample_peer(4, "Bob"));
        let hits = registry.search_by_name("ALICE");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "alice-42");
    }

    #[test]
    fn status_transition_is_reflected_on_next_get() {
        let registry = PeerRegistry::new();
        let peer = sample_peer(5, "carol");
        let id = peer.id;
        registry.upsert(peer);
        registry.set_status(&id, PeerStatus::Offline);
        assert!(!registry.get(&id).unwrap().is_online());
    }

    #[test]
    fn distance_with_self_is_zero() {
        let id = PeerId::from_seed(7);
        assert_eq!(id.distance(&id), [0u8; 20]);
    }
}
