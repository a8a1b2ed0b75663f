//! Peer configuration.
//!
//! Everything tunable lives here and rides in the [`crate::PeerContext`]
//! dependency bundle; there are no process-wide singletons. The signaling
//! URL deliberately has no production fallback and must be set per
//! deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a peer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Root directory for keys, the database, and backup trees.
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Signaling broker URL. Local development endpoint by default;
    /// deployments must configure this explicitly.
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    /// Protocol version advertised in signed identities.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Host address handed to matched peers for the direct channel.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Transfer chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Retry budget per chunk.
    #[serde(default = "default_chunk_attempts")]
    pub max_chunk_attempts: u32,

    /// Keepalive ping interval.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Connection establishment timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Outbound send backpressure timeout.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Maximum reconnect attempts after a disconnect.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base delay for exponential reconnect backoff, in milliseconds.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Maximum bytes this peer will offer across all counterparties.
    #[serde(default = "default_max_offered_bytes")]
    pub max_offered_bytes: u64,

    /// Verification scheduler cadence.
    #[serde(default = "default_verification_interval_secs")]
    pub verification_interval_secs: u64,

    /// Seed for the store's field-encryption key derivation.
    #[serde(default = "default_store_seed")]
    pub store_seed: String,

    /// Rate limiter tuning.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Admission-control tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Coarse window length.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests allowed per coarse window.
    #[serde(default = "default_window_max")]
    pub window_max: u32,
    /// Burst window length in milliseconds.
    #[serde(default = "default_burst_ms")]
    pub burst_ms: u64,
    /// Requests allowed per burst window.
    #[serde(default = "default_burst_max")]
    pub burst_max: u32,
    /// Coarse utilization above which strikes accrue (0..1).
    #[serde(default = "default_window_threshold")]
    pub window_ban_threshold: f64,
    /// Burst utilization above which strikes accrue (0..1).
    #[serde(default = "default_burst_threshold")]
    pub burst_ban_threshold: f64,
    /// Consecutive over-threshold denials before a ban.
    #[serde(default = "default_ban_strikes")]
    pub ban_strikes: u32,
    /// Ban duration.
    #[serde(default = "default_ban_secs")]
    pub ban_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            window_max: default_window_max(),
            burst_ms: default_burst_ms(),
            burst_max: default_burst_max(),
            window_ban_threshold: default_window_threshold(),
            burst_ban_threshold: default_burst_threshold(),
            ban_strikes: default_ban_strikes(),
            ban_secs: default_ban_secs(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            signaling_url: default_signaling_url(),
            protocol_version: default_protocol_version(),
            advertise_host: default_advertise_host(),
            chunk_size: default_chunk_size(),
            max_chunk_attempts: default_chunk_attempts(),
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            max_reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_offered_bytes: default_max_offered_bytes(),
            verification_interval_secs: default_verification_interval_secs(),
            store_seed: default_store_seed(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl PeerConfig {
    /// Directory holding the signing and encryption keypairs.
    pub fn keys_dir(&self) -> PathBuf {
        self.home_dir.join("keys")
    }

    /// Path of the relational store.
    pub fn db_path(&self) -> PathBuf {
        self.home_dir.join("backuppeer.db")
    }

    /// Root of locally sourced backup trees.
    pub fn backups_dir(&self) -> PathBuf {
        self.home_dir.join("backups")
    }

    /// Root of the received tree.
    pub fn received_dir(&self) -> PathBuf {
        self.home_dir.join("received")
    }

    /// Staging area for in-flight inbound chunks.
    pub fn chunks_dir(&self) -> PathBuf {
        self.received_dir().join("chunks")
    }

    /// Legacy reputation export path.
    pub fn reputation_path(&self) -> PathBuf {
        self.home_dir.join("reputation.json")
    }

    /// Allocation ledger snapshot path.
    pub fn allocation_path(&self) -> PathBuf {
        self.home_dir.join("allocation.json")
    }

    /// Keepalive interval as a [`Duration`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Connection timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Send backpressure timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn default_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".backup-peer")
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:3030/ws".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_protocol_version() -> u32 {
    1
}

const fn default_chunk_size() -> u32 {
    64 * 1024
}

const fn default_chunk_attempts() -> u32 {
    3
}

const fn default_keepalive_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    30
}

const fn default_send_timeout_secs() -> u64 {
    30
}

const fn default_reconnect_attempts() -> u32 {
    5
}

const fn default_reconnect_base_ms() -> u64 {
    1000
}

const fn default_max_offered_bytes() -> u64 {
    100 * 1024 * 1024 * 1024
}

const fn default_verification_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_store_seed() -> String {
    "backup-peer-local".to_string()
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_window_max() -> u32 {
    100
}

const fn default_burst_ms() -> u64 {
    1000
}

const fn default_burst_max() -> u32 {
    20
}

const fn default_window_threshold() -> f64 {
    0.90
}

const fn default_burst_threshold() -> f64 {
    0.95
}

const fn default_ban_strikes() -> u32 {
    3
}

const fn default_ban_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = PeerConfig::default();
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.max_chunk_attempts, 3);
        assert_eq!(config.keepalive_secs, 30);
        assert_eq!(config.rate_limit.window_max, 100);
        assert_eq!(config.rate_limit.burst_max, 20);
        assert_eq!(config.rate_limit.ban_secs, 300);
    }

    #[test]
    fn test_paths_derive_from_home() {
        let mut config = PeerConfig::default();
        config.home_dir = PathBuf::from("/tmp/bp-test");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/bp-test/backuppeer.db"));
        assert_eq!(
            config.chunks_dir(),
            PathBuf::from("/tmp/bp-test/received/chunks")
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: PeerConfig =
            serde_json::from_str(r#"{"signaling_url": "wss://example.net/ws"}"#).unwrap();
        assert_eq!(config.signaling_url, "wss://example.net/ws");
        assert_eq!(config.chunk_size, 65536);
    }
}
