//! Periodic verification of our sent backups.
//!
//! A background task walks the persisted sync schedules, issues one
//! random-blocks challenge per due backup, and hands the challenges to the
//! owner over a channel for delivery on the right session. Issuance is
//! spaced by at least one second. The task is cancelled by aborting its
//! handle; schedules survive restarts in the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Verifier;
use crate::crypto::identity::now_ms;
use crate::store::{BackupStatus, Direction, Store, SyncSchedule};

/// A challenge ready for delivery to a peer.
#[derive(Debug, Clone)]
pub struct ScheduledChallenge {
    pub peer_id_hash: String,
    pub challenge: super::StorageChallenge,
}

/// How often the scheduler wakes to look for due work.
const TICK: Duration = Duration::from_secs(60);

/// Minimum spacing between issued challenges.
const ISSUE_SPACING: Duration = Duration::from_secs(1);

/// Spawn the verification scheduler. `interval_ms` is the per-backup
/// cadence (24 h by default); `outbox` receives challenges to deliver.
pub fn spawn_scheduler(
    verifier: Arc<Verifier>,
    store: Store,
    interval_ms: u64,
    outbox: mpsc::Sender<ScheduledChallenge>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            run_pass(&verifier, &store, interval_ms, &outbox).await;
            tokio::time::sleep(TICK).await;
        }
    })
}

/// One scheduler pass: expire overdue challenges, adopt unscheduled
/// backups, and issue challenges for everything due.
pub async fn run_pass(
    verifier: &Verifier,
    store: &Store,
    interval_ms: u64,
    outbox: &mpsc::Sender<ScheduledChallenge>,
) {
    let expired = verifier.expire_overdue();
    if !expired.is_empty() {
        tracing::debug!(count = expired.len(), "challenges timed out");
    }

    let now = now_ms();

    // Backups that exist but have never been scheduled start immediately.
    match store.list_backups(Some(Direction::Sent), Some(BackupStatus::Active)) {
        Ok(backups) => {
            for backup in backups {
                if let Ok(None) = store.get_sync_schedule(&backup.id) {
                    let _ = store.upsert_sync_schedule(&SyncSchedule {
                        backup_id: backup.id.clone(),
                        peer_id_hash: backup.peer_id_hash.clone(),
                        next_sync_ms: now,
                        interval_ms,
                        last_result: None,
                    });
                }
            }
        }
        Err(err) => {
            tracing::warn!("scheduler could not list backups: {err}");
            return;
        }
    }

    let due = match store.due_schedules(now) {
        Ok(due) => due,
        Err(err) => {
            tracing::warn!("scheduler could not read schedules: {err}");
            return;
        }
    };

    for schedule in due {
        let backup = match store.get_backup(&schedule.backup_id) {
            Ok(Some(backup))
                if backup.direction == Direction::Sent
                    && backup.status == BackupStatus::Active =>
            {
                backup
            }
            // Anything else no longer needs verification.
            _ => continue,
        };

        match verifier.issue(&schedule.peer_id_hash, &backup, "random_blocks") {
            Ok(challenge) => {
                let scheduled = ScheduledChallenge {
                    peer_id_hash: schedule.peer_id_hash.clone(),
                    challenge,
                };
                if outbox.send(scheduled).await.is_err() {
                    tracing::debug!("challenge outbox closed; scheduler idle");
                    return;
                }
                let _ = store.upsert_sync_schedule(&SyncSchedule {
                    next_sync_ms: now + schedule.interval_ms,
                    last_result: Some("issued".into()),
                    ..schedule
                });
            }
            Err(err) => {
                tracing::debug!(backup = %backup.id, "challenge not issued: {err}");
                let _ = store.upsert_sync_schedule(&SyncSchedule {
                    next_sync_ms: now + schedule.interval_ms,
                    last_result: Some(format!("skipped: {err}")),
                    ..schedule
                });
            }
        }

        tokio::time::sleep(ISSUE_SPACING).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSender;
    use crate::reputation::{ReputationConfig, ReputationEngine};
    use crate::store::{BackupMetadata, BackupRecord, FileEntry};

    fn seeded() -> (tempfile::TempDir, Arc<Verifier>, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory("seed").unwrap();
        let verifier = Arc::new(Verifier::new(
            store.clone(),
            EventSender::disconnected(),
            Arc::new(ReputationEngine::new(ReputationConfig::default())),
            dir.path().join("received"),
        ));

        store
            .upsert_backup(&BackupRecord {
                id: "b1".into(),
                name: "scheduled".into(),
                direction: Direction::Sent,
                peer_id_hash: "feedfacecafebeef".into(),
                created_at_ms: 0,
                status: BackupStatus::Active,
                file_count: 1,
                total_bytes: 2048,
                metadata: BackupMetadata {
                    files: vec![FileEntry {
                        path: "f".into(),
                        size: 2048,
                        hash: "aa".repeat(32),
                        chunk_hashes: Some(vec!["bb".repeat(32), "cc".repeat(32)]),
                    }],
                    chunk_size: 1024,
                },
            })
            .unwrap();
        (dir, verifier, store)
    }

    #[tokio::test]
    async fn test_pass_adopts_and_issues() {
        let (_dir, verifier, store) = seeded();
        let (tx, mut rx) = mpsc::channel(4);

        run_pass(&verifier, &store, 86_400_000, &tx).await;

        let scheduled = rx.try_recv().expect("one challenge issued");
        assert_eq!(scheduled.peer_id_hash, "feedfacecafebeef");
        assert_eq!(scheduled.challenge.backup_id, "b1");
        assert_eq!(verifier.pending_count(), 1);

        // The schedule advanced past now, so a second pass stays quiet.
        run_pass(&verifier, &store, 86_400_000, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completed_backups_not_challenged() {
        let (_dir, verifier, store) = seeded();
        store
            .set_backup_status("b1", BackupStatus::Completed)
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        run_pass(&verifier, &store, 86_400_000, &tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(verifier.pending_count(), 0);
    }
}
