//! Symmetric give/take storage accounting.
//!
//! Per counterparty we track how much we hold for them (offered) and how
//! much of our data they hold (consumed), with ledger-wide aggregates kept
//! in lockstep. The give-to-get rule that consumed never exceeds offered
//! globally gates both inbound acceptance and outbound placement.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::identity::now_ms;
use crate::error::{AllocationError, StoreError};

/// Per-peer ledger line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocationEntry {
    /// Bytes of their data we hold (or have agreed to hold).
    pub offered_to_them: u64,
    /// Bytes of our data placed with them.
    pub consumed_from_them: u64,
    /// Backups participating in this entry.
    pub backups: Vec<String>,
    pub last_update_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    total_offered: u64,
    total_consumed: u64,
    entries: HashMap<String, AllocationEntry>,
}

/// The ledger. One per peer process; mutations are O(1) under one mutex.
pub struct AllocationLedger {
    max_offered: u64,
    snapshot_path: Option<PathBuf>,
    inner: Mutex<LedgerState>,
}

impl AllocationLedger {
    /// A ledger with no persistence.
    pub fn new(max_offered: u64) -> Self {
        Self {
            max_offered,
            snapshot_path: None,
            inner: Mutex::new(LedgerState::default()),
        }
    }

    /// A ledger backed by a JSON snapshot, importing it when present.
    pub fn with_snapshot(max_offered: u64, path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("allocation snapshot: {e}")))?
        } else {
            LedgerState::default()
        };
        Ok(Self {
            max_offered,
            snapshot_path: Some(path.to_path_buf()),
            inner: Mutex::new(state),
        })
    }

    /// Decide whether to accept an inbound request to store `bytes` for
    /// `peer`. Admission requires headroom under the give-to-get rule and
    /// an unexhausted offer ceiling.
    pub fn may_accept(&self, peer_id_hash: &str, bytes: u64) -> Result<(), AllocationError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.total_offered >= self.max_offered {
            return Err(AllocationError::CapacityExhausted);
        }
        let offered_to_peer = state
            .entries
            .get(peer_id_hash)
            .map(|e| e.offered_to_them)
            .unwrap_or(0);
        if state.total_consumed + bytes > state.total_offered + offered_to_peer {
            return Err(AllocationError::RatioViolation);
        }
        Ok(())
    }

    /// Decide whether we may place `bytes` of our data with `peer`.
    pub fn may_place(&self, _peer_id_hash: &str, bytes: u64) -> Result<(), AllocationError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.total_consumed + bytes > state.total_offered {
            return Err(AllocationError::RatioViolation);
        }
        Ok(())
    }

    /// Record bytes we now hold for a peer.
    pub fn record_offered(&self, peer_id_hash: &str, bytes: u64, backup_id: Option<&str>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entries.entry(peer_id_hash.to_string()).or_default();
        entry.offered_to_them += bytes;
        entry.last_update_ms = now_ms();
        if let Some(id) = backup_id {
            if !entry.backups.iter().any(|b| b == id) {
                entry.backups.push(id.to_string());
            }
        }
        state.total_offered += bytes;
    }

    /// Record bytes of ours now held by a peer.
    pub fn record_consumed(&self, peer_id_hash: &str, bytes: u64, backup_id: Option<&str>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entries.entry(peer_id_hash.to_string()).or_default();
        entry.consumed_from_them += bytes;
        entry.last_update_ms = now_ms();
        if let Some(id) = backup_id {
            if !entry.backups.iter().any(|b| b == id) {
                entry.backups.push(id.to_string());
            }
        }
        state.total_consumed += bytes;
    }

    /// Release bytes on backup deletion. `offered_side` selects which half
    /// of the entry shrinks.
    pub fn release(&self, peer_id_hash: &str, bytes: u64, offered_side: bool, backup_id: &str) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = state.entries.get_mut(peer_id_hash) else {
            return;
        };
        if offered_side {
            let freed = entry.offered_to_them.min(bytes);
            entry.offered_to_them -= freed;
            state.total_offered = state.total_offered.saturating_sub(freed);
        } else {
            let freed = entry.consumed_from_them.min(bytes);
            entry.consumed_from_them -= freed;
            state.total_consumed = state.total_consumed.saturating_sub(freed);
        }
        if let Some(entry) = state.entries.get_mut(peer_id_hash) {
            entry.backups.retain(|b| b != backup_id);
            entry.last_update_ms = now_ms();
        }
    }

    /// Check internal consistency. Returns human-readable violations;
    /// an empty list means the ledger reconciles.
    pub fn validate(&self) -> Vec<String> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut violations = Vec::new();

        let offered_sum: u64 = state.entries.values().map(|e| e.offered_to_them).sum();
        let consumed_sum: u64 = state.entries.values().map(|e| e.consumed_from_them).sum();

        if offered_sum != state.total_offered {
            violations.push(format!(
                "offered aggregate {} != per-peer sum {}",
                state.total_offered, offered_sum
            ));
        }
        if consumed_sum != state.total_consumed {
            violations.push(format!(
                "consumed aggregate {} != per-peer sum {}",
                state.total_consumed, consumed_sum
            ));
        }
        if state.total_consumed > state.total_offered {
            violations.push(format!(
                "give-to-get violated: consumed {} > offered {}",
                state.total_consumed, state.total_offered
            ));
        }
        violations
    }

    /// (total offered, total consumed).
    pub fn totals(&self) -> (u64, u64) {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (state.total_offered, state.total_consumed)
    }

    /// Cloned view of one peer's entry.
    pub fn entry(&self, peer_id_hash: &str) -> Option<AllocationEntry> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.get(peer_id_hash).cloned()
    }

    /// Write the snapshot atomically (tmp + rename).
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = {
            let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*state)
                .map_err(|e| StoreError::Corrupt(format!("allocation serialize: {e}")))?
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_ratio_enforcement_scenario() {
        let ledger = AllocationLedger::new(100 * GIB);
        ledger.record_offered("peer-a", 10 * GIB, Some("theirs-1"));
        ledger.record_consumed("peer-a", 10 * GIB, Some("ours-1"));

        // Fully balanced: one more byte of placement breaks give-to-get.
        assert_eq!(
            ledger.may_place("peer-a", 1),
            Err(AllocationError::RatioViolation)
        );

        // Accepting another kibibyte from them reopens headroom.
        ledger.record_offered("peer-a", 1024, None);
        assert!(ledger.may_place("peer-a", 1).is_ok());
    }

    #[test]
    fn test_may_accept_ceiling() {
        let ledger = AllocationLedger::new(10 * GIB);

        // A fresh pairing has no reciprocity yet; the formula denies.
        assert_eq!(
            ledger.may_accept("p", 512),
            Err(AllocationError::RatioViolation)
        );

        ledger.record_offered("p", GIB, None);
        assert!(ledger.may_accept("p", 512).is_ok());

        // Filling the configured ceiling trips the capacity check first.
        ledger.record_offered("p", 9 * GIB, None);
        assert_eq!(
            ledger.may_accept("p", 1),
            Err(AllocationError::CapacityExhausted)
        );
    }

    #[test]
    fn test_accept_admits_against_peer_offer() {
        let ledger = AllocationLedger::new(100 * GIB);
        ledger.record_offered("p", 2 * GIB, None);
        ledger.record_consumed("p", 3 * GIB, None);

        // consumed (3G) + 1G <= offered (2G) + offered_to_p (2G).
        assert!(ledger.may_accept("p", GIB).is_ok());
        assert_eq!(
            ledger.may_accept("p", GIB + 1),
            Err(AllocationError::RatioViolation)
        );
    }

    #[test]
    fn test_release_frees_the_right_side() {
        let ledger = AllocationLedger::new(100 * GIB);
        ledger.record_offered("p", 5 * GIB, Some("b1"));
        ledger.record_consumed("p", 2 * GIB, Some("b2"));

        ledger.release("p", 5 * GIB, true, "b1");
        let entry = ledger.entry("p").unwrap();
        assert_eq!(entry.offered_to_them, 0);
        assert_eq!(entry.consumed_from_them, 2 * GIB);
        assert_eq!(entry.backups, vec!["b2".to_string()]);
        assert_eq!(ledger.totals(), (0, 2 * GIB));
    }

    #[test]
    fn test_validate_reconciles() {
        let ledger = AllocationLedger::new(100 * GIB);
        ledger.record_offered("a", GIB, None);
        ledger.record_offered("b", GIB, None);
        ledger.record_consumed("a", GIB, None);
        assert!(ledger.validate().is_empty());

        // Force the give-to-get rule to fail.
        ledger.release("a", GIB, true, "none");
        ledger.release("b", GIB, true, "none");
        let violations = ledger.validate();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("give-to-get"));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allocation.json");

        let ledger = AllocationLedger::with_snapshot(10 * GIB, &path).unwrap();
        ledger.record_offered("p", GIB, Some("b1"));
        ledger.save().unwrap();

        let reloaded = AllocationLedger::with_snapshot(10 * GIB, &path).unwrap();
        assert_eq!(reloaded.totals(), (GIB, 0));
        assert_eq!(reloaded.entry("p").unwrap().backups, vec!["b1".to_string()]);
    }
}
