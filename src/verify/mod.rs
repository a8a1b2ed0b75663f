//! Proof-of-storage: commitments, challenges, and their accounting.

pub mod challenge;
pub mod commitment;
pub mod scheduler;

pub use challenge::{
    compute_proof, generate_challenge, verify_proof, BlockProof, ChallengeParams, FileProof,
    ProofBody, StorageChallenge, StorageProof, CHALLENGE_TTL_MS,
};
pub use commitment::{
    build_commitment, verify_commitment, StorageCommitment, MAX_COMMITMENT_BYTES,
    MIN_COMMITMENT_BYTES,
};
pub use scheduler::spawn_scheduler;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::crypto::identity::now_ms;
use crate::error::VerificationError;
use crate::events::{EventSender, PeerEvent};
use crate::reputation::ReputationEngine;
use crate::store::{BackupRecord, ChallengeRecord, ChallengeStatus, Direction, Store};

/// Rolling history depth per peer.
pub const HISTORY_CAPACITY: usize = 100;

/// History entries older than this are evicted on insert.
pub const HISTORY_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// One settled challenge, as kept in the rolling history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeOutcome {
    pub challenge_id: String,
    pub backup_id: String,
    pub success: bool,
    pub response_time_ms: u64,
    pub at_ms: u64,
}

struct PendingChallenge {
    challenge: StorageChallenge,
    peer_id_hash: String,
    issued_at: Instant,
}

/// Issues challenges for our sent backups and answers challenges against
/// the backups we hold for others.
pub struct Verifier {
    store: Store,
    events: EventSender,
    reputation: Arc<ReputationEngine>,
    received_root: PathBuf,
    pending: Mutex<HashMap<String, PendingChallenge>>,
    history: Mutex<HashMap<String, VecDeque<ChallengeOutcome>>>,
}

impl Verifier {
    pub fn new(
        store: Store,
        events: EventSender,
        reputation: Arc<ReputationEngine>,
        received_root: PathBuf,
    ) -> Self {
        Self {
            store,
            events,
            reputation,
            received_root,
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a challenge against a backup the counterparty holds for us.
    /// The caller is responsible for actually sending it.
    pub fn issue(
        &self,
        peer_id_hash: &str,
        backup: &BackupRecord,
        kind: &str,
    ) -> Result<StorageChallenge, VerificationError> {
        let now = now_ms();
        let challenge = generate_challenge(kind, backup, now)?;

        let challenge_data = serde_json::to_string(&challenge.params)
            .map_err(|_| VerificationError::UnsupportedKind(kind.to_string()))?;
        if let Err(err) = self.store.insert_challenge(&ChallengeRecord {
            id: challenge.id.clone(),
            backup_id: backup.id.clone(),
            peer_id_hash: peer_id_hash.to_string(),
            kind: kind.to_string(),
            challenge_data,
            response_data: None,
            status: ChallengeStatus::Pending,
            issued_ms: challenge.issued_at_ms,
            expires_ms: challenge.expires_at_ms,
            response_time_ms: None,
        }) {
            tracing::warn!("challenge not persisted: {err}");
        }

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(
            challenge.id.clone(),
            PendingChallenge {
                challenge: challenge.clone(),
                peer_id_hash: peer_id_hash.to_string(),
                issued_at: Instant::now(),
            },
        );
        Ok(challenge)
    }

    /// Custodian side: answer a challenge against our stored copy.
    pub fn answer(&self, peer_id_hash: &str, challenge: &StorageChallenge) -> StorageProof {
        let error_proof = |reason: String| StorageProof {
            challenge_id: challenge.id.clone(),
            backup_id: challenge.backup_id.clone(),
            body: None,
            error: Some(reason),
        };

        if now_ms() > challenge.expires_at_ms {
            return error_proof("challenge expired".into());
        }

        let backup = match self.store.get_backup(&challenge.backup_id) {
            Ok(Some(backup)) if backup.direction == Direction::Received => backup,
            Ok(_) => return error_proof("unknown backup".into()),
            Err(err) => {
                tracing::warn!("backup lookup failed: {err}");
                return error_proof("store unavailable".into());
            }
        };
        if backup.peer_id_hash != peer_id_hash {
            return error_proof("backup belongs to a different peer".into());
        }

        let root = self.received_root.join(&backup.id);
        compute_proof(challenge, &backup, &root)
    }

    /// Challenger side: settle an incoming proof. Every outcome, including
    /// a mismatch or a late arrival, is accounted to reputation.
    pub fn settle(
        &self,
        peer_id_hash: &str,
        proof: &StorageProof,
    ) -> Result<(), VerificationError> {
        let pending = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&proof.challenge_id)
        };
        let Some(pending) = pending else {
            return Err(VerificationError::UnknownChallenge(
                proof.challenge_id.clone(),
            ));
        };
        if pending.peer_id_hash != peer_id_hash {
            return Err(VerificationError::UnknownChallenge(
                proof.challenge_id.clone(),
            ));
        }

        let response_time_ms = pending.issued_at.elapsed().as_millis() as u64;
        let now = now_ms();

        if now > pending.challenge.expires_at_ms {
            self.account(
                peer_id_hash,
                &pending.challenge,
                ChallengeStatus::TimedOut,
                None,
                response_time_ms,
            );
            return Err(VerificationError::Timeout);
        }

        let backup = match self.store.get_backup(&pending.challenge.backup_id) {
            Ok(Some(backup)) => backup,
            _ => {
                self.account(
                    peer_id_hash,
                    &pending.challenge,
                    ChallengeStatus::Failed,
                    None,
                    response_time_ms,
                );
                return Err(VerificationError::UnknownChallenge(
                    pending.challenge.backup_id.clone(),
                ));
            }
        };

        let verdict = verify_proof(&pending.challenge, proof, &backup);
        let status = if verdict.is_ok() {
            ChallengeStatus::Passed
        } else {
            ChallengeStatus::Failed
        };
        let response_json = serde_json::to_string(proof).ok();
        self.account(
            peer_id_hash,
            &pending.challenge,
            status,
            response_json.as_deref(),
            response_time_ms,
        );
        verdict
    }

    /// Time out every pending challenge past its expiry. Returns the ids
    /// that expired.
    pub fn expire_overdue(&self) -> Vec<String> {
        let now = now_ms();
        let overdue: Vec<PendingChallenge> = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, p)| now > p.challenge.expires_at_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| map.remove(&id)).collect()
        };

        let mut expired = Vec::with_capacity(overdue.len());
        for pending in overdue {
            let response_time_ms = pending.issued_at.elapsed().as_millis() as u64;
            self.account(
                &pending.peer_id_hash,
                &pending.challenge,
                ChallengeStatus::TimedOut,
                None,
                response_time_ms,
            );
            expired.push(pending.challenge.id.clone());
        }
        expired
    }

    /// Rolling outcome history for a peer, oldest first.
    pub fn history(&self, peer_id_hash: &str) -> Vec<ChallengeOutcome> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .get(peer_id_hash)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of challenges awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn account(
        &self,
        peer_id_hash: &str,
        challenge: &StorageChallenge,
        status: ChallengeStatus,
        response_json: Option<&str>,
        response_time_ms: u64,
    ) {
        let success = status == ChallengeStatus::Passed;
        let at_ms = now_ms();

        if let Err(err) = self.store.settle_challenge(
            &challenge.id,
            status,
            response_json,
            Some(response_time_ms),
        ) {
            tracing::warn!("challenge settle not persisted: {err}");
        }

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let entries = history.entry(peer_id_hash.to_string()).or_default();
            entries.push_back(ChallengeOutcome {
                challenge_id: challenge.id.clone(),
                backup_id: challenge.backup_id.clone(),
                success,
                response_time_ms,
                at_ms,
            });
            let cutoff = at_ms.saturating_sub(HISTORY_RETENTION_MS);
            while entries.len() > HISTORY_CAPACITY
                || entries.front().is_some_and(|e| e.at_ms < cutoff)
            {
                entries.pop_front();
            }
        }

        self.reputation
            .record_challenge(peer_id_hash, success, Some(response_time_ms));
        self.events.emit(PeerEvent::VerificationResult {
            peer_id_hash: peer_id_hash.to_string(),
            backup_id: challenge.backup_id.clone(),
            succeeded: success,
            response_time_ms,
        });
    }
}
