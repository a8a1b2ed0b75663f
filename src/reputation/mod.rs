//! Peer reputation engine.
//!
//! Maintains running behavior counters per peer and derives a weighted
//! overall score and a discrete trust level from them. Mutations flow only
//! through explicit record calls; derived fields are recomputed on every
//! event so the stored record always equals the formula applied to the
//! final counters.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

/// Discrete trust classification derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Acceptable,
    Suspicious,
    Untrusted,
    Blacklisted,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Acceptable => "acceptable",
            TrustLevel::Suspicious => "suspicious",
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Blacklisted => "blacklisted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trusted" => Some(TrustLevel::Trusted),
            "acceptable" => Some(TrustLevel::Acceptable),
            "suspicious" => Some(TrustLevel::Suspicious),
            "untrusted" => Some(TrustLevel::Untrusted),
            "blacklisted" => Some(TrustLevel::Blacklisted),
            _ => None,
        }
    }

    /// Classify a score. Blacklisting is handled separately.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            TrustLevel::Trusted
        } else if score >= 0.6 {
            TrustLevel::Acceptable
        } else if score >= 0.4 {
            TrustLevel::Suspicious
        } else {
            TrustLevel::Untrusted
        }
    }
}

/// Tuning for the engine.
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// Capacity of the uptime observation ring.
    pub uptime_window: usize,
    /// How many recent observations feed the uptime score.
    pub uptime_score_samples: usize,
    /// Response times at or beyond this score zero.
    pub response_floor_ms: f64,
    /// Scores below this auto-blacklist.
    pub blacklist_threshold: f64,
    /// Connection events between automatic flushes.
    pub flush_every: u32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            uptime_window: 100,
            uptime_score_samples: 50,
            response_floor_ms: 30_000.0,
            blacklist_threshold: 0.2,
            flush_every: 10,
        }
    }
}

/// Running counters and derived fields for one peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerReputation {
    pub peer_id_hash: String,
    pub total_connections: u64,
    pub successful_connections: u64,
    pub total_challenges: u64,
    pub successful_challenges: u64,
    pub total_files: u64,
    pub corrupted_files: u64,
    /// Most recent uptime observations, oldest first.
    pub uptime_window: VecDeque<bool>,
    /// Running mean over all timed events.
    pub average_response_ms: f64,
    timed_events: u64,
    pub data_integrity_score: f64,
    pub overall_score: f64,
    pub trust_level: TrustLevel,
    pub blacklisted: bool,
    pub blacklist_reason: Option<String>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl PeerReputation {
    fn new(peer_id_hash: &str, now: u64) -> Self {
        let mut rep = Self {
            peer_id_hash: peer_id_hash.to_string(),
            total_connections: 0,
            successful_connections: 0,
            total_challenges: 0,
            successful_challenges: 0,
            total_files: 0,
            corrupted_files: 0,
            uptime_window: VecDeque::new(),
            average_response_ms: 0.0,
            timed_events: 0,
            data_integrity_score: 1.0,
            overall_score: 0.0,
            trust_level: TrustLevel::Untrusted,
            blacklisted: false,
            blacklist_reason: None,
            first_seen_ms: now,
            last_seen_ms: now,
        };
        rep.recompute(&ReputationConfig::default());
        rep
    }

    /// Ratio of successful to total connections, neutral when unobserved.
    pub fn connection_score(&self) -> f64 {
        ratio_or_neutral(self.successful_connections, self.total_connections)
    }

    /// Ratio of passed to issued challenges, neutral when unobserved.
    pub fn verification_score(&self) -> f64 {
        ratio_or_neutral(self.successful_challenges, self.total_challenges)
    }

    fn response_time_score(&self, config: &ReputationConfig) -> f64 {
        (1.0 - self.average_response_ms / config.response_floor_ms).max(0.0)
    }

    fn integrity_score(&self) -> f64 {
        if self.total_files == 0 {
            1.0
        } else {
            1.0 - self.corrupted_files as f64 / self.total_files as f64
        }
    }

    fn uptime_score(&self, config: &ReputationConfig) -> f64 {
        let samples: Vec<bool> = self
            .uptime_window
            .iter()
            .rev()
            .take(config.uptime_score_samples)
            .copied()
            .collect();
        if samples.is_empty() {
            return 0.5;
        }
        samples.iter().filter(|up| **up).count() as f64 / samples.len() as f64
    }

    /// Recompute every derived field from the counters.
    fn recompute(&mut self, config: &ReputationConfig) {
        self.data_integrity_score = self.integrity_score();

        if self.blacklisted {
            self.overall_score = 0.0;
            self.trust_level = TrustLevel::Blacklisted;
            return;
        }

        let score = 0.3 * self.uptime_score(config)
            + 0.2 * self.response_time_score(config)
            + 0.3 * self.verification_score()
            + 0.2 * self.data_integrity_score;
        self.overall_score = score.clamp(0.0, 1.0);

        if self.overall_score < config.blacklist_threshold {
            self.blacklisted = true;
            self.blacklist_reason = Some("automatic".to_string());
            self.overall_score = 0.0;
            self.trust_level = TrustLevel::Blacklisted;
        } else {
            self.trust_level = TrustLevel::from_score(self.overall_score);
        }
    }

    fn observe_response_time(&mut self, response_ms: u64) {
        self.timed_events += 1;
        let n = self.timed_events as f64;
        self.average_response_ms += (response_ms as f64 - self.average_response_ms) / n;
    }
}

fn ratio_or_neutral(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.5
    } else {
        numerator as f64 / denominator as f64
    }
}

/// The engine owns its peer map; sessions hand it observations and read
/// back trust decisions.
pub struct ReputationEngine {
    config: ReputationConfig,
    snapshot_path: Option<PathBuf>,
    inner: Mutex<EngineInner>,
}

struct EngineInner {
    peers: HashMap<String, PeerReputation>,
    connection_events_since_flush: u32,
}

impl ReputationEngine {
    /// Create an engine with no persistence.
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            snapshot_path: None,
            inner: Mutex::new(EngineInner {
                peers: HashMap::new(),
                connection_events_since_flush: 0,
            }),
        }
    }

    /// Create an engine that flushes to `path`, importing any existing
    /// snapshot found there.
    pub fn with_snapshot(config: ReputationConfig, path: &Path) -> Result<Self, StoreError> {
        let mut engine = Self::new(config);
        engine.snapshot_path = Some(path.to_path_buf());

        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let peers: Vec<PeerReputation> = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("reputation snapshot: {e}")))?;
            let mut inner = engine.inner.lock().unwrap_or_else(|e| e.into_inner());
            for peer in peers {
                inner.peers.insert(peer.peer_id_hash.clone(), peer);
            }
            drop(inner);
        }
        Ok(engine)
    }

    /// Record a connection attempt.
    pub fn record_connection(
        &self,
        peer_id_hash: &str,
        success: bool,
        response_ms: Option<u64>,
    ) -> TrustLevel {
        let trust = self.with_peer(peer_id_hash, |rep| {
            rep.total_connections += 1;
            if success {
                rep.successful_connections += 1;
            }
            if let Some(ms) = response_ms {
                rep.observe_response_time(ms);
            }
        });

        let should_flush = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.connection_events_since_flush += 1;
            if inner.connection_events_since_flush >= self.config.flush_every {
                inner.connection_events_since_flush = 0;
                true
            } else {
                false
            }
        };
        if should_flush {
            if let Err(err) = self.save() {
                tracing::warn!("reputation flush failed: {err}");
            }
        }
        trust
    }

    /// Record a verification challenge outcome.
    pub fn record_challenge(
        &self,
        peer_id_hash: &str,
        success: bool,
        response_ms: Option<u64>,
    ) -> TrustLevel {
        self.with_peer(peer_id_hash, |rep| {
            rep.total_challenges += 1;
            if success {
                rep.successful_challenges += 1;
            }
            if let Some(ms) = response_ms {
                rep.observe_response_time(ms);
            }
        })
    }

    /// Record transferred files and how many arrived corrupted.
    pub fn record_transfer(&self, peer_id_hash: &str, files: u64, corrupted: u64) -> TrustLevel {
        self.with_peer(peer_id_hash, |rep| {
            rep.total_files += files;
            rep.corrupted_files += corrupted.min(files);
        })
    }

    /// Record an uptime observation.
    pub fn record_uptime(&self, peer_id_hash: &str, up: bool) -> TrustLevel {
        let window = self.config.uptime_window;
        self.with_peer(peer_id_hash, |rep| {
            rep.uptime_window.push_back(up);
            while rep.uptime_window.len() > window {
                rep.uptime_window.pop_front();
            }
        })
    }

    /// Force a peer onto the blacklist.
    pub fn blacklist(&self, peer_id_hash: &str, reason: &str) -> TrustLevel {
        self.with_peer(peer_id_hash, |rep| {
            rep.blacklisted = true;
            rep.blacklist_reason = Some(reason.to_string());
        })
    }

    /// Acceptance predicate: blacklisted peers and peers below `min` fail.
    pub fn acceptable(&self, peer_id_hash: &str, min: f64) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.peers.get(peer_id_hash) {
            Some(rep) => !rep.blacklisted && rep.overall_score >= min,
            // An unknown peer has no strikes against it yet.
            None => min <= 0.5,
        }
    }

    /// Current trust level for a peer.
    pub fn trust_level(&self, peer_id_hash: &str) -> TrustLevel {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .peers
            .get(peer_id_hash)
            .map(|rep| rep.trust_level)
            .unwrap_or(TrustLevel::Untrusted)
    }

    /// Cloned view of one peer's record.
    pub fn snapshot(&self, peer_id_hash: &str) -> Option<PeerReputation> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.get(peer_id_hash).cloned()
    }

    /// Number of tracked peers.
    pub fn peer_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.peers.len()
    }

    /// Merge another snapshot: counters sum, last-seen takes the max, and
    /// the more restrictive blacklist flag wins.
    pub fn merge_import(&self, imported: Vec<PeerReputation>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for incoming in imported {
            match inner.peers.get_mut(&incoming.peer_id_hash) {
                Some(existing) => {
                    existing.total_connections += incoming.total_connections;
                    existing.successful_connections += incoming.successful_connections;
                    existing.total_challenges += incoming.total_challenges;
                    existing.successful_challenges += incoming.successful_challenges;
                    existing.total_files += incoming.total_files;
                    existing.corrupted_files += incoming.corrupted_files;
                    existing.timed_events += incoming.timed_events;
                    existing.first_seen_ms = existing.first_seen_ms.min(incoming.first_seen_ms);
                    existing.last_seen_ms = existing.last_seen_ms.max(incoming.last_seen_ms);
                    existing.blacklisted = existing.blacklisted || incoming.blacklisted;
                    if existing.blacklist_reason.is_none() {
                        existing.blacklist_reason = incoming.blacklist_reason;
                    }
                    for sample in incoming.uptime_window {
                        existing.uptime_window.push_back(sample);
                        while existing.uptime_window.len() > self.config.uptime_window {
                            existing.uptime_window.pop_front();
                        }
                    }
                    existing.recompute(&self.config);
                }
                None => {
                    let mut rep = incoming;
                    rep.recompute(&self.config);
                    inner.peers.insert(rep.peer_id_hash.clone(), rep);
                }
            }
        }
    }

    /// Write the snapshot atomically (tmp + rename).
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let peers: Vec<PeerReputation> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.peers.values().cloned().collect()
        };
        let json = serde_json::to_string_pretty(&peers)
            .map_err(|e| StoreError::Corrupt(format!("reputation serialize: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn with_peer(&self, peer_id_hash: &str, f: impl FnOnce(&mut PeerReputation)) -> TrustLevel {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = crate::crypto::identity::now_ms();
        let rep = inner
            .peers
            .entry(peer_id_hash.to_string())
            .or_insert_with(|| PeerReputation::new(peer_id_hash, now));
        f(rep);
        rep.last_seen_ms = now.max(rep.last_seen_ms);
        rep.recompute(&self.config);
        rep.trust_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ReputationEngine {
        ReputationEngine::new(ReputationConfig::default())
    }

    fn warm_up(engine: &ReputationEngine, peer: &str) {
        // A healthy history: responsive, honest, online.
        for _ in 0..20 {
            engine.record_uptime(peer, true);
        }
        for _ in 0..10 {
            engine.record_challenge(peer, true, Some(500));
        }
        engine.record_transfer(peer, 10, 0);
    }

    #[test]
    fn test_good_peer_becomes_trusted() {
        let engine = engine();
        warm_up(&engine, "peer-a");

        let rep = engine.snapshot("peer-a").unwrap();
        assert!(rep.overall_score >= 0.8, "score was {}", rep.overall_score);
        assert_eq!(rep.trust_level, TrustLevel::Trusted);
        assert!(engine.acceptable("peer-a", 0.6));
    }

    #[test]
    fn test_derived_fields_match_formula() {
        let engine = engine();
        let peer = "peer-f";
        engine.record_uptime(peer, true);
        engine.record_uptime(peer, false);
        engine.record_challenge(peer, true, Some(3000));
        engine.record_challenge(peer, false, Some(3000));
        engine.record_transfer(peer, 4, 1);

        let rep = engine.snapshot(peer).unwrap();
        let expected = 0.3 * 0.5 + 0.2 * (1.0 - 3000.0 / 30000.0) + 0.3 * 0.5 + 0.2 * 0.75;
        assert!((rep.overall_score - expected).abs() < 1e-9);
        // 0.63 sits in the acceptable band.
        assert_eq!(rep.trust_level, TrustLevel::Acceptable);
    }

    #[test]
    fn test_counters_never_exceed_totals() {
        let engine = engine();
        for i in 0..50 {
            engine.record_connection("p", i % 3 != 0, Some(100));
            engine.record_challenge("p", i % 2 == 0, None);
        }
        let rep = engine.snapshot("p").unwrap();
        assert!(rep.successful_connections <= rep.total_connections);
        assert!(rep.successful_challenges <= rep.total_challenges);
    }

    #[test]
    fn test_low_score_auto_blacklists() {
        let engine = engine();
        let peer = "peer-b";
        for _ in 0..60 {
            engine.record_uptime(peer, false);
            engine.record_challenge(peer, false, Some(29_000));
        }
        engine.record_transfer(peer, 10, 10);

        let rep = engine.snapshot(peer).unwrap();
        assert!(rep.blacklisted);
        assert_eq!(rep.blacklist_reason.as_deref(), Some("automatic"));
        assert_eq!(rep.trust_level, TrustLevel::Blacklisted);
        assert_eq!(rep.overall_score, 0.0);
        assert!(!engine.acceptable(peer, 0.0));
    }

    #[test]
    fn test_blacklist_overrides_good_components() {
        let engine = engine();
        warm_up(&engine, "peer-c");
        engine.blacklist("peer-c", "manual");

        let rep = engine.snapshot("peer-c").unwrap();
        assert_eq!(rep.overall_score, 0.0);
        assert_eq!(rep.trust_level, TrustLevel::Blacklisted);
        assert!(!engine.acceptable("peer-c", 0.0));
    }

    #[test]
    fn test_uptime_window_bounded() {
        let engine = engine();
        for _ in 0..150 {
            engine.record_uptime("peer-d", true);
        }
        let rep = engine.snapshot("peer-d").unwrap();
        assert_eq!(rep.uptime_window.len(), 100);
    }

    #[test]
    fn test_merge_sums_counters_and_keeps_blacklist() {
        let engine = engine();
        warm_up(&engine, "peer-e");
        let mut imported = engine.snapshot("peer-e").unwrap();
        imported.total_challenges = 5;
        imported.successful_challenges = 5;
        imported.blacklisted = true;
        imported.blacklist_reason = Some("imported".into());
        imported.last_seen_ms = u64::MAX;

        engine.merge_import(vec![imported]);
        let rep = engine.snapshot("peer-e").unwrap();
        assert_eq!(rep.total_challenges, 15);
        assert!(rep.blacklisted);
        assert_eq!(rep.last_seen_ms, u64::MAX);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reputation.json");

        let engine =
            ReputationEngine::with_snapshot(ReputationConfig::default(), &path).unwrap();
        warm_up(&engine, "peer-g");
        engine.save().unwrap();

        let reloaded =
            ReputationEngine::with_snapshot(ReputationConfig::default(), &path).unwrap();
        assert_eq!(
            reloaded.snapshot("peer-g").unwrap().total_challenges,
            engine.snapshot("peer-g").unwrap().total_challenges
        );
    }

    #[test]
    fn test_auto_flush_after_ten_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reputation.json");
        let engine =
            ReputationEngine::with_snapshot(ReputationConfig::default(), &path).unwrap();

        for _ in 0..9 {
            engine.record_connection("peer-h", true, Some(100));
        }
        assert!(!path.exists());

        engine.record_connection("peer-h", true, Some(100));
        assert!(path.exists());
    }
}
