//! Runtime configuration: ports, timeouts, and the handful of named constants
//! spec.md §5 calls out by name. Loaded from a TOML file under the platform
//! config directory (via `dirs`, already a teacher dependency); falls back to
//! [`Config::default`] when no file is present.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default UDP port for the multiplexed requests endpoint (spec.md §6).
pub const DEFAULT_REQ_PORT: u16 = 35896;
/// Default TCP port for the acceptor / bulk connections.
pub const DEFAULT_CONN_PORT: u16 = 45210;
/// Number of evenly spaced DHT anchor ids used for peer-list enumeration.
pub const ANCHOR_COUNT: usize = 20;
/// Gossip fan-out (`alpha`).
pub const GOSSIP_ALPHA: usize = 3;
/// Big-file chunk size (30 MiB, spec.md §4.12).
pub const BIG_CHUNK_SIZE: u64 = 30 * 1024 * 1024;
/// Suffix applied to in-progress download part files.
pub const FILE_ERROR_EXT: &str = "part";
/// Consecutive message-read timeouts tolerated before a parked message
/// connection gives up and releases the socket (spec.md §4.10).
pub const MSG_PATIENCE_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display_name: String,
    pub numeric_seed: u64,
    pub bind_addr: std::net::IpAddr,
    pub request_port: u16,
    pub connection_port: u16,
    pub multicast_v4: std::net::Ipv4Addr,
    pub multicast_v6: std::net::Ipv6Addr,
    pub download_dir: PathBuf,

    #[serde(with = "duration_secs")]
    pub server_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub max_idle_time_for_conn: Duration,
    #[serde(with = "duration_secs")]
    pub ping_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub ping_time_check_window: Duration,
    #[serde(with = "duration_secs")]
    pub discover_timeout: Duration,
    pub discover_retries: u32,
    #[serde(with = "duration_secs")]
    pub node_pov_gossip_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub transfer_status_update_freq: Duration,
    #[serde(with = "duration_secs")]
    pub msg_recv_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub default_transfer_timeout: Duration,

    pub max_connections_between_peers: usize,
    pub max_total_connections: usize,
    pub big_file_streams: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: String::from("anonymous"),
            numeric_seed: rand::random(),
            bind_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            request_port: DEFAULT_REQ_PORT,
            connection_port: DEFAULT_CONN_PORT,
            multicast_v4: std::net::Ipv4Addr::new(239, 255, 42, 99),
            multicast_v6: "ff02::42:99".parse().unwrap(),
            download_dir: default_download_dir(),
            server_timeout: Duration::from_secs(5),
            max_idle_time_for_conn: Duration::from_secs(120),
            ping_timeout: Duration::from_millis(500),
            ping_time_check_window: Duration::from_secs(10),
            discover_timeout: Duration::from_secs(2),
            discover_retries: 5,
            node_pov_gossip_ttl: Duration::from_secs(30),
            transfer_status_update_freq: Duration::from_millis(250),
            msg_recv_timeout: Duration::from_secs(15),
            default_transfer_timeout: Duration::from_secs(10),
            max_connections_between_peers: 4,
            max_total_connections: 256,
            big_file_streams: 3,
        }
    }
}

impl Config {
    /// Load from `<config_dir>/peerconnect/config.toml`, falling back to
    /// defaults (with a fresh random seed) when the file is absent or
    /// unreadable. Unreadable-but-present is logged at WARN, not treated as
    /// fatal — a missing config is normal on first run.
    pub fn load_or_default() -> Self {
        let path = config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!(?path, %err, "config file unreadable, using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("peerconnect")
        .join("config.toml")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("peerconnect")
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ports() {
        let cfg = Config::default();
        assert_eq!(cfg.request_port, DEFAULT_REQ_PORT);
        assert_eq!(cfg.connection_port, DEFAULT_CONN_PORT);
        assert!(cfg.max_connections_between_peers > 0);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg.request_port, back.request_port);
        assert_eq!(cfg.server_timeout, back.server_timeout);
    }
}
