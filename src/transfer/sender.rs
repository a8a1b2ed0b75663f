//! Outbound transfer path.
//!
//! A backup is sent file by file over the session channel, serially. Each
//! chunk is read, hashed, persisted as `transferring`, sealed under the
//! peer's shared secret, and sent; the chunk state settles on the matching
//! ack. Everything needed to resume lives in the chunk-state table, so a
//! crashed or cancelled transfer restarts from its incomplete chunks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use tokio::sync::mpsc;

use super::chunker;
use crate::crypto::hashing::ContentHash;
use crate::crypto::seal;
use crate::error::{CryptoError, Result, TransferError};
use crate::events::PeerEvent;
use crate::protocol::ChannelMessage;
use crate::store::{
    BackupRecord, BackupStatus, ChunkStateRecord, Direction, TransferSessionRecord, TransferState,
};
use crate::transport::session::SessionShared;

/// How long the sender waits for any single ack.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// An acknowledgement routed to the sending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Start {
        ready: bool,
        reason: Option<String>,
    },
    Chunk {
        index: u32,
        received: bool,
        error: Option<String>,
    },
    Complete {
        success: bool,
        relative_name: Option<String>,
        error: Option<String>,
    },
}

/// Routes inbound acks to whichever transfer task is waiting on them.
pub struct AckRouter {
    inner: Mutex<HashMap<String, mpsc::Sender<AckEvent>>>,
}

impl AckRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Open an ack stream for one transfer id.
    pub fn register(&self, transfer_id: &str) -> mpsc::Receiver<AckEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transfer_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, transfer_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(transfer_id);
    }

    /// Hand an ack to its transfer task. Unmatched acks are dropped with a
    /// debug line; they are late arrivals for settled transfers.
    pub fn deliver(&self, transfer_id: &str, event: AckEvent) {
        let sender = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.get(transfer_id).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.try_send(event).is_err() {
                    tracing::debug!(transfer_id, "ack queue full; dropping");
                }
            }
            None => tracing::debug!(transfer_id, "ack for unknown transfer"),
        }
    }
}

impl Default for AckRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable transfer id for one file of one backup.
pub fn transfer_id(backup_id: &str, file_path: &str) -> String {
    format!("{backup_id}:{file_path}")
}

/// Register a new outbound backup: hash every file, pre-create the chunk
/// states, and persist the full record. `root` holds the files at their
/// relative paths.
pub fn prepare_backup(
    ctx: &crate::context::PeerContext,
    backup_id: &str,
    name: &str,
    peer_id_hash: &str,
    root: &Path,
    files: &[String],
) -> Result<BackupRecord> {
    let chunk_size = ctx.config.chunk_size;
    let mut entries = Vec::with_capacity(files.len());
    let mut total_bytes = 0u64;

    for path in files {
        let absolute = root.join(path);
        let size = std::fs::metadata(&absolute).map_err(TransferError::Io)?.len();
        let hash = crate::crypto::hash_file(&absolute).map_err(TransferError::Io)?;
        let hashes = chunker::chunk_hashes(&absolute, size, chunk_size).map_err(TransferError::Io)?;
        total_bytes += size;
        entries.push(crate::store::FileEntry {
            path: path.clone(),
            size,
            hash: hash.to_hex(),
            chunk_hashes: Some(hashes),
        });
    }

    let backup = BackupRecord {
        id: backup_id.to_string(),
        name: name.to_string(),
        direction: Direction::Sent,
        peer_id_hash: peer_id_hash.to_string(),
        created_at_ms: crate::crypto::identity::now_ms(),
        status: BackupStatus::Active,
        file_count: files.len() as u32,
        total_bytes,
        metadata: crate::store::BackupMetadata {
            files: entries.clone(),
            chunk_size,
        },
    };
    ctx.store.upsert_backup(&backup)?;

    let mut global_index = 0u32;
    for entry in &entries {
        ctx.store.upsert_backup_file(&crate::store::BackupFileRecord {
            backup_id: backup.id.clone(),
            path: entry.path.clone(),
            size: entry.size,
            hash: entry.hash.clone(),
            chunk_count: entry.chunk_count(chunk_size),
            status: TransferState::Pending,
        })?;
        if let Some(hashes) = &entry.chunk_hashes {
            for (i, hash) in hashes.iter().enumerate() {
                ctx.store.upsert_chunk_state(&ChunkStateRecord {
                    backup_id: backup.id.clone(),
                    chunk_index: global_index + i as u32,
                    chunk_hash: hash.clone(),
                    chunk_size: chunker::chunk_len(entry.size, chunk_size, i as u32),
                    state: TransferState::Pending,
                    attempt_count: 0,
                    last_attempt_ms: 0,
                    error: None,
                })?;
            }
        }
        global_index += entry.chunk_count(chunk_size);
    }

    Ok(backup)
}

/// Send (or resume) a backup over the session. Serial per file; returns
/// once every file settled or a file-level failure stopped the run.
pub async fn send_backup(shared: &Arc<SessionShared>, backup_id: &str, root: &Path) -> Result<()> {
    let ctx = &shared.ctx;
    let backup = ctx
        .store
        .get_backup(backup_id)?
        .ok_or_else(|| TransferError::Rejected(format!("unknown backup {backup_id}")))?;
    if backup.direction != Direction::Sent {
        return Err(TransferError::Rejected("backup is not outbound".into()).into());
    }

    ctx.ledger
        .may_place(&shared.peer.peer_id_hash, backup.total_bytes)?;

    shared
        .writer
        .send(&ChannelMessage::BackupStart {
            backup_id: backup.id.clone(),
            name: backup.name.clone(),
            file_count: backup.file_count,
            total_bytes: backup.total_bytes,
        })
        .await?;
    let now = crate::crypto::identity::now_ms();
    ctx.store.upsert_transfer_session(&TransferSessionRecord {
        id: backup.id.clone(),
        backup_id: backup.id.clone(),
        peer_id_hash: shared.peer.peer_id_hash.clone(),
        direction: Direction::Sent,
        status: BackupStatus::Active,
        started_ms: now,
        updated_ms: now,
    })?;

    let mut failed_files = 0u32;
    let mut base_index = 0u32;
    for (i, entry) in backup.metadata.files.iter().enumerate() {
        let count = entry.chunk_count(backup.metadata.chunk_size);
        let result = send_file(shared, &backup, i, base_index, root).await;
        base_index += count;
        if let Err(err) = result {
            failed_files += 1;
            tracing::warn!(file = %entry.path, "file transfer failed: {err}");
            ctx.store
                .set_file_status(&backup.id, &entry.path, TransferState::Failed)?;
        }
    }

    if failed_files == 0 {
        shared
            .writer
            .send(&ChannelMessage::BackupComplete {
                backup_id: backup.id.clone(),
            })
            .await?;
        ctx.store
            .set_backup_status(&backup.id, BackupStatus::Completed)?;
        ctx.ledger.record_consumed(
            &shared.peer.peer_id_hash,
            backup.total_bytes,
            Some(&backup.id),
        );
        ctx.store.upsert_transfer_session(&TransferSessionRecord {
            id: backup.id.clone(),
            backup_id: backup.id.clone(),
            peer_id_hash: shared.peer.peer_id_hash.clone(),
            direction: Direction::Sent,
            status: BackupStatus::Completed,
            started_ms: now,
            updated_ms: crate::crypto::identity::now_ms(),
        })?;
        ctx.events.emit(PeerEvent::TransferFinished {
            backup_id: backup.id.clone(),
            succeeded: true,
            reason: None,
        });
        Ok(())
    } else {
        // The backup stays active; incomplete chunk states make it
        // resumable on the next attempt.
        ctx.events.emit(PeerEvent::TransferFinished {
            backup_id: backup.id.clone(),
            succeeded: false,
            reason: Some(format!("{failed_files} file(s) failed")),
        });
        Err(TransferError::Rejected(format!("{failed_files} file(s) failed")).into())
    }
}

async fn send_file(
    shared: &Arc<SessionShared>,
    backup: &BackupRecord,
    file_index: usize,
    base_index: u32,
    root: &Path,
) -> Result<()> {
    let ctx = &shared.ctx;
    let entry = &backup.metadata.files[file_index];
    let chunk_size = backup.metadata.chunk_size;
    let total_chunks = entry.chunk_count(chunk_size);
    let id = transfer_id(&backup.id, &entry.path);

    // Resume point: everything not yet completed or verified, scoped to
    // this file's slice of the global chunk index space.
    let pending: Vec<u32> = ctx
        .store
        .incomplete_chunks(&backup.id)?
        .into_iter()
        .map(|c| c.chunk_index)
        .filter(|index| *index >= base_index && *index < base_index + total_chunks)
        .map(|index| index - base_index)
        .collect();

    if pending.is_empty() && total_chunks > 0 {
        let settled = ctx
            .store
            .list_backup_files(&backup.id)?
            .into_iter()
            .find(|f| f.path == entry.path)
            .map(|f| f.status.is_settled())
            .unwrap_or(false);
        if settled {
            tracing::debug!(file = %entry.path, "already transferred; skipping");
            return Ok(());
        }
        // All chunks landed but the file never finalized; replay the
        // framing so the receiver can close it out.
    }

    let key = shared
        .shared_secret()
        .ok_or(CryptoError::KeyMissing("peer encryption key".into()))?;

    let mut acks = shared.acks.register(&id);
    let result = send_file_inner(
        shared, backup, entry, &id, base_index, &pending, total_chunks, root, &key, &mut acks,
    )
    .await;
    shared.acks.unregister(&id);

    match &result {
        Ok(()) => {
            ctx.store
                .set_file_status(&backup.id, &entry.path, TransferState::Completed)?;
        }
        Err(_) => {}
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn send_file_inner(
    shared: &Arc<SessionShared>,
    backup: &BackupRecord,
    entry: &crate::store::FileEntry,
    id: &str,
    base_index: u32,
    pending: &[u32],
    total_chunks: u32,
    root: &Path,
    key: &[u8; 32],
    acks: &mut mpsc::Receiver<AckEvent>,
) -> Result<()> {
    let ctx = &shared.ctx;
    let resume_from = pending.first().copied().unwrap_or(total_chunks);

    shared
        .writer
        .send(&ChannelMessage::FileStart {
            transfer_id: id.to_string(),
            file_name: entry.path.clone(),
            file_size: entry.size,
            total_chunks,
            chunk_size: backup.metadata.chunk_size,
            file_hash: entry.hash.clone(),
            resume_from_chunk: resume_from,
        })
        .await?;
    ctx.store
        .set_file_status(&backup.id, &entry.path, TransferState::Transferring)?;

    match wait_ack(acks).await? {
        AckEvent::Start { ready: true, .. } => {}
        AckEvent::Start { reason, .. } => {
            return Err(TransferError::Rejected(
                reason.unwrap_or_else(|| "receiver not ready".into()),
            )
            .into());
        }
        other => {
            return Err(TransferError::Rejected(format!("unexpected ack {other:?}")).into());
        }
    }

    let absolute = root.join(&entry.path);
    let mut sent = total_chunks - pending.len() as u32;

    for &index in pending {
        let global = base_index + index;
        let plaintext =
            chunker::read_chunk(&absolute, entry.size, backup.metadata.chunk_size, index)
                .map_err(TransferError::Io)?;
        let live_hash = ContentHash::from_data(&plaintext).to_hex();

        // A resumed chunk must still match what we originally promised;
        // a drifted source file is skipped, never silently re-hashed.
        let previous = ctx
            .store
            .chunk_states(&backup.id)?
            .into_iter()
            .find(|c| c.chunk_index == global);
        if let Some(previous) = &previous {
            if previous.chunk_hash != live_hash {
                tracing::warn!(file = %entry.path, chunk = global, "source changed; skipping chunk");
                ctx.store.upsert_chunk_state(&ChunkStateRecord {
                    state: TransferState::Failed,
                    error: Some("source file changed".into()),
                    last_attempt_ms: crate::crypto::identity::now_ms(),
                    ..previous.clone()
                })?;
                return Err(TransferError::SourceChanged { index: global }.into());
            }
        }

        let mut attempts = previous.as_ref().map(|p| p.attempt_count).unwrap_or(0);
        loop {
            if attempts >= ctx.config.max_chunk_attempts {
                ctx.store.upsert_chunk_state(&ChunkStateRecord {
                    backup_id: backup.id.clone(),
                    chunk_index: global,
                    chunk_hash: live_hash.clone(),
                    chunk_size: plaintext.len() as u32,
                    state: TransferState::Failed,
                    attempt_count: attempts,
                    last_attempt_ms: crate::crypto::identity::now_ms(),
                    error: Some("retry budget exhausted".into()),
                })?;
                return Err(TransferError::RetryExhausted { index: global }.into());
            }
            attempts += 1;

            ctx.store.upsert_chunk_state(&ChunkStateRecord {
                backup_id: backup.id.clone(),
                chunk_index: global,
                chunk_hash: live_hash.clone(),
                chunk_size: plaintext.len() as u32,
                state: TransferState::Transferring,
                attempt_count: attempts,
                last_attempt_ms: crate::crypto::identity::now_ms(),
                error: None,
            })?;

            let sealed = seal(key, &plaintext)?;
            shared
                .writer
                .send(&ChannelMessage::FileChunk {
                    transfer_id: id.to_string(),
                    chunk_index: index,
                    chunk_size: plaintext.len() as u32,
                    payload: base64::engine::general_purpose::STANDARD.encode(&sealed),
                    chunk_hash: live_hash.clone(),
                })
                .await?;

            match wait_chunk_ack(acks, index).await? {
                AckEvent::Chunk { received: true, .. } => {
                    ctx.store.upsert_chunk_state(&ChunkStateRecord {
                        backup_id: backup.id.clone(),
                        chunk_index: global,
                        chunk_hash: live_hash.clone(),
                        chunk_size: plaintext.len() as u32,
                        state: TransferState::Completed,
                        attempt_count: attempts,
                        last_attempt_ms: crate::crypto::identity::now_ms(),
                        error: None,
                    })?;
                    break;
                }
                AckEvent::Chunk { error, .. } => {
                    tracing::warn!(chunk = global, "chunk rejected: {error:?}");
                    ctx.store.upsert_chunk_state(&ChunkStateRecord {
                        backup_id: backup.id.clone(),
                        chunk_index: global,
                        chunk_hash: live_hash.clone(),
                        chunk_size: plaintext.len() as u32,
                        state: TransferState::Failed,
                        attempt_count: attempts,
                        last_attempt_ms: crate::crypto::identity::now_ms(),
                        error,
                    })?;
                }
                other => {
                    return Err(
                        TransferError::Rejected(format!("unexpected ack {other:?}")).into()
                    );
                }
            }
        }

        sent += 1;
        ctx.events.emit(PeerEvent::TransferProgress {
            backup_id: backup.id.clone(),
            file_name: entry.path.clone(),
            chunks_done: sent,
            chunks_total: total_chunks,
        });
    }

    shared
        .writer
        .send(&ChannelMessage::FileComplete {
            transfer_id: id.to_string(),
        })
        .await?;

    match wait_ack(acks).await? {
        AckEvent::Complete { success: true, .. } => Ok(()),
        AckEvent::Complete { error, .. } => Err(TransferError::FileIntegrity {
            name: error.unwrap_or_else(|| entry.path.clone()),
        }
        .into()),
        other => Err(TransferError::Rejected(format!("unexpected ack {other:?}")).into()),
    }
}

async fn wait_ack(acks: &mut mpsc::Receiver<AckEvent>) -> Result<AckEvent> {
    match tokio::time::timeout(ACK_TIMEOUT, acks.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(crate::error::TransportError::ChannelClosed.into()),
        Err(_) => Err(crate::error::TransportError::BackpressureTimeout.into()),
    }
}

/// Wait for the ack of a specific chunk, letting stale acks for earlier
/// retries drain past.
async fn wait_chunk_ack(acks: &mut mpsc::Receiver<AckEvent>, index: u32) -> Result<AckEvent> {
    loop {
        let event = wait_ack(acks).await?;
        match &event {
            AckEvent::Chunk { index: got, .. } if *got == index => return Ok(event),
            AckEvent::Chunk { index: got, .. } => {
                tracing::debug!(want = index, got = *got, "out-of-date chunk ack skipped");
            }
            _ => return Ok(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_router_delivers_and_drops() {
        let router = AckRouter::new();
        let mut rx = router.register("t1");

        router.deliver(
            "t1",
            AckEvent::Chunk {
                index: 0,
                received: true,
                error: None,
            },
        );
        assert_eq!(
            rx.recv().await,
            Some(AckEvent::Chunk {
                index: 0,
                received: true,
                error: None
            })
        );

        // Unknown transfers are dropped quietly.
        router.deliver(
            "t2",
            AckEvent::Start {
                ready: true,
                reason: None,
            },
        );

        router.unregister("t1");
        router.deliver(
            "t1",
            AckEvent::Start {
                ready: true,
                reason: None,
            },
        );
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_transfer_id_is_stable() {
        assert_eq!(transfer_id("b1", "docs/report.pdf"), "b1:docs/report.pdf");
    }
}
