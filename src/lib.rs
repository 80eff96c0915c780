//! PeerConnect: a serverless LAN-first peer-to-peer core (spec.md §1).
//!
//! Fourteen components (spec.md §2): wire codec, peer registry, requests
//! endpoint, DHT integration, gossip, discovery, acceptor, connector/pool,
//! bandwidth watcher, messaging, file/directory/big-file transfer,
//! connectivity checker, and the state manager wiring them all together.
//! `main.rs` is the only caller of the state manager; everything else is a
//! library so a frontend crate can depend on it directly via [`ui_bridge`].

pub mod config;
pub mod dht;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod messaging;
pub mod net;
pub mod peer;
pub mod search;
pub mod state;
pub mod transfer;
pub mod ui_bridge;
