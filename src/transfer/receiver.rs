//! Inbound transfer path.
//!
//! Chunks are unsealed, hash-verified, and staged on disk under the
//! chunks directory; a chunk that fails either check is never acked as
//! received. On file_complete the staged chunks are reassembled into a
//! quarantine path, the file hash is checked, and only then does the file
//! move atomically into the received tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::crypto::hashing::ContentHash;
use crate::crypto::open;
use crate::error::{Result, StoreError, TransferError};
use crate::events::PeerEvent;
use crate::protocol::ChannelMessage;
use crate::store::{
    BackupFileRecord, BackupMetadata, BackupRecord, BackupStatus, Direction, FileEntry,
    TransferState,
};
use crate::transport::session::SessionShared;

struct IncomingBackup {
    name: String,
    file_count: u32,
    total_bytes: u64,
    admitted: bool,
    deny_reason: Option<String>,
    completed_files: u32,
    corrupted_files: u32,
}

struct IncomingFile {
    backup_id: String,
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    chunk_size: u32,
    file_hash: String,
    stage_dir: PathBuf,
    chunk_hashes: Vec<Option<String>>,
}

impl IncomingFile {
    fn received_count(&self) -> u32 {
        self.chunk_hashes.iter().filter(|h| h.is_some()).count() as u32
    }
}

/// All in-flight inbound state for one session.
pub struct IncomingTransfers {
    chunks_dir: PathBuf,
    received_dir: PathBuf,
    backups: Mutex<HashMap<String, IncomingBackup>>,
    files: Mutex<HashMap<String, IncomingFile>>,
}

impl IncomingTransfers {
    pub fn new(chunks_dir: PathBuf, received_dir: PathBuf) -> Self {
        Self {
            chunks_dir,
            received_dir,
            backups: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Number of files currently mid-transfer.
    pub fn open_files(&self) -> usize {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// An inbound storage request: admit it against the ledger and open
    /// the backup record.
    pub async fn handle_backup_start(
        &self,
        shared: &SessionShared,
        backup_id: String,
        name: String,
        file_count: u32,
        total_bytes: u64,
    ) -> Result<()> {
        let ctx = &shared.ctx;
        let peer = &shared.peer.peer_id_hash;

        // The ledger formula alone would deadlock two fresh peers; a
        // verified commitment from the counterparty stands in for the
        // reciprocity it promises.
        let admission = match ctx.ledger.may_accept(peer, total_bytes) {
            Err(crate::error::AllocationError::RatioViolation) => {
                let covered = ctx.store.latest_commitment(peer).ok().flatten().is_some_and(|c| {
                    c.expires_ms > crate::crypto::identity::now_ms()
                        && c.bytes_offered >= total_bytes
                });
                if covered {
                    Ok(())
                } else {
                    Err(crate::error::AllocationError::RatioViolation)
                }
            }
            other => other,
        };
        let admitted = admission.is_ok();
        if admitted {
            ctx.ledger.record_offered(peer, total_bytes, Some(&backup_id));
        } else {
            tracing::warn!(%backup_id, "inbound backup denied: {admission:?}");
            ctx.events.emit(PeerEvent::Failure {
                failure_kind: "allocation".into(),
                reason: "inbound storage request denied".into(),
                correlation: Some(backup_id.clone()),
            });
        }

        if admitted {
            ctx.store.upsert_backup(&BackupRecord {
                id: backup_id.clone(),
                name: name.clone(),
                direction: Direction::Received,
                peer_id_hash: peer.clone(),
                created_at_ms: crate::crypto::identity::now_ms(),
                status: BackupStatus::Active,
                file_count,
                total_bytes,
                metadata: BackupMetadata {
                    files: Vec::new(),
                    chunk_size: 0,
                },
            })?;
        }

        let mut backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
        backups.insert(
            backup_id,
            IncomingBackup {
                name,
                file_count,
                total_bytes,
                admitted,
                deny_reason: admission.err().map(|e| e.to_string()),
                completed_files: 0,
                corrupted_files: 0,
            },
        );
        Ok(())
    }

    pub async fn handle_file_start(
        &self,
        shared: &SessionShared,
        transfer_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        chunk_size: u32,
        file_hash: String,
        resume_from_chunk: u32,
    ) -> Result<()> {
        let backup_id = backup_id_of(&transfer_id);

        let denial = {
            let backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
            match backups.get(&backup_id) {
                Some(backup) if backup.admitted => None,
                Some(backup) => Some(
                    backup
                        .deny_reason
                        .clone()
                        .unwrap_or_else(|| "backup not admitted".into()),
                ),
                None => Some("no backup_start for this transfer".into()),
            }
        };
        let framing_ok = chunk_size > 0
            && total_chunks == crate::transfer::chunker::chunk_count(file_size, chunk_size);
        let denial = denial
            .or_else(|| validate_relative_path(&file_name).err())
            .or_else(|| (!framing_ok).then(|| "inconsistent chunk framing".to_string()));
        if let Some(reason) = denial {
            shared
                .writer
                .send(&ChannelMessage::FileStartAck {
                    transfer_id,
                    ready: false,
                    reason: Some(reason),
                })
                .await?;
            return Ok(());
        }

        let stage_dir = self.chunks_dir.join(stage_name(&transfer_id));
        std::fs::create_dir_all(&stage_dir).map_err(StoreError::Io)?;

        // On resume, chunks staged by an earlier run are still good; their
        // hashes get re-checked during reassembly.
        let mut chunk_hashes = vec![None; total_chunks as usize];
        if resume_from_chunk > 0 {
            for (index, slot) in chunk_hashes.iter_mut().enumerate() {
                let path = stage_dir.join(format!("{index}.chunk"));
                if let Ok(data) = std::fs::read(&path) {
                    *slot = Some(ContentHash::from_data(&data).to_hex());
                }
            }
        }

        {
            let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            files.insert(
                transfer_id.clone(),
                IncomingFile {
                    backup_id,
                    file_name,
                    file_size,
                    total_chunks,
                    chunk_size,
                    file_hash,
                    stage_dir,
                    chunk_hashes,
                },
            );
        }

        shared
            .writer
            .send(&ChannelMessage::FileStartAck {
                transfer_id,
                ready: true,
                reason: None,
            })
            .await?;
        Ok(())
    }

    pub async fn handle_file_chunk(
        &self,
        shared: &SessionShared,
        transfer_id: String,
        chunk_index: u32,
        chunk_size: u32,
        payload: String,
        chunk_hash: String,
    ) -> Result<()> {
        let verdict = self.ingest_chunk(shared, &transfer_id, chunk_index, chunk_size, &payload, &chunk_hash);

        let (received, error) = match verdict {
            Ok(()) => (true, None),
            Err(reason) => {
                tracing::warn!(%transfer_id, chunk_index, "chunk rejected: {reason}");
                self.count_corruption(&transfer_id);
                (false, Some(reason))
            }
        };
        shared
            .writer
            .send(&ChannelMessage::ChunkAck {
                transfer_id,
                chunk_index,
                received,
                error,
            })
            .await?;
        Ok(())
    }

    /// Decrypt, verify, and stage one chunk. A failure here must never be
    /// acked as received.
    fn ingest_chunk(
        &self,
        shared: &SessionShared,
        transfer_id: &str,
        chunk_index: u32,
        chunk_size: u32,
        payload: &str,
        chunk_hash: &str,
    ) -> std::result::Result<(), String> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let file = files
            .get_mut(transfer_id)
            .ok_or_else(|| "unknown transfer".to_string())?;
        if chunk_index >= file.total_chunks {
            return Err(format!("chunk {chunk_index} out of range"));
        }

        let key = shared
            .shared_secret()
            .ok_or_else(|| "no shared secret for peer".to_string())?;
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| "payload is not base64".to_string())?;
        let plaintext = open(&key, &sealed).map_err(|_| "decryption failed".to_string())?;

        if plaintext.len() as u32 != chunk_size {
            return Err("chunk size mismatch".to_string());
        }
        let digest = ContentHash::from_data(&plaintext).to_hex();
        if digest != chunk_hash {
            return Err("chunk hash mismatch".to_string());
        }

        let path = file.stage_dir.join(format!("{chunk_index}.chunk"));
        std::fs::write(&path, &plaintext).map_err(|e| format!("stage write failed: {e}"))?;
        file.chunk_hashes[chunk_index as usize] = Some(digest);
        Ok(())
    }

    pub async fn handle_file_complete(
        &self,
        shared: &SessionShared,
        transfer_id: String,
    ) -> Result<()> {
        let outcome = self.finalize_file(shared, &transfer_id);

        let (success, relative_name, error) = match outcome {
            Ok(name) => (true, Some(name), None),
            Err(reason) => {
                self.count_corruption(&transfer_id);
                (false, None, Some(reason))
            }
        };
        shared
            .writer
            .send(&ChannelMessage::FileCompleteAck {
                transfer_id,
                success,
                relative_name,
                error,
            })
            .await?;
        Ok(())
    }

    fn finalize_file(
        &self,
        shared: &SessionShared,
        transfer_id: &str,
    ) -> std::result::Result<String, String> {
        let file = {
            let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            files
                .remove(transfer_id)
                .ok_or_else(|| "unknown transfer".to_string())?
        };

        if file.received_count() != file.total_chunks {
            let missing = file
                .chunk_hashes
                .iter()
                .position(|h| h.is_none())
                .unwrap_or(0);
            // Put it back so the sender can retry the gap.
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(transfer_id.to_string(), file);
            return Err(format!("missing chunk {missing}"));
        }

        // Reassemble into quarantine, verify, then move into place.
        let quarantine_dir = self.received_dir.join(".quarantine");
        std::fs::create_dir_all(&quarantine_dir).map_err(|e| e.to_string())?;
        let quarantine = quarantine_dir.join(stage_name(transfer_id));

        let mut hasher = Sha256::new();
        {
            let mut out = std::fs::File::create(&quarantine).map_err(|e| e.to_string())?;
            use std::io::Write;
            for index in 0..file.total_chunks {
                let path = file.stage_dir.join(format!("{index}.chunk"));
                let data = std::fs::read(&path).map_err(|e| e.to_string())?;
                hasher.update(&data);
                out.write_all(&data).map_err(|e| e.to_string())?;
            }
        }

        let digest = hex::encode(hasher.finalize());
        if digest != file.file_hash {
            let _ = std::fs::remove_file(&quarantine);
            let _ = std::fs::remove_dir_all(&file.stage_dir);
            return Err("file hash mismatch".to_string());
        }

        let final_path = self
            .received_dir
            .join(&file.backup_id)
            .join(&file.file_name);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::rename(&quarantine, &final_path).map_err(|e| e.to_string())?;
        let _ = std::fs::remove_dir_all(&file.stage_dir);

        self.record_received_file(shared, &file)
            .map_err(|e| e.to_string())?;

        {
            let mut backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(backup) = backups.get_mut(&file.backup_id) {
                backup.completed_files += 1;
            }
        }

        tracing::info!(file = %file.file_name, "file received and verified");
        Ok(file.file_name)
    }

    /// Fold the finished file into the stored backup record.
    fn record_received_file(
        &self,
        shared: &SessionShared,
        file: &IncomingFile,
    ) -> Result<()> {
        let ctx = &shared.ctx;
        let Some(mut backup) = ctx.store.get_backup(&file.backup_id)? else {
            return Err(TransferError::Rejected("backup record missing".into()).into());
        };

        backup.metadata.chunk_size = file.chunk_size;
        backup.metadata.files.retain(|f| f.path != file.file_name);
        backup.metadata.files.push(FileEntry {
            path: file.file_name.clone(),
            size: file.file_size,
            hash: file.file_hash.clone(),
            chunk_hashes: Some(
                file.chunk_hashes
                    .iter()
                    .map(|h| h.clone().unwrap_or_default())
                    .collect(),
            ),
        });
        ctx.store.upsert_backup(&backup)?;
        ctx.store.upsert_backup_file(&BackupFileRecord {
            backup_id: file.backup_id.clone(),
            path: file.file_name.clone(),
            size: file.file_size,
            hash: file.file_hash.clone(),
            chunk_count: file.total_chunks,
            status: TransferState::Completed,
        })?;
        Ok(())
    }

    pub async fn handle_backup_complete(
        &self,
        shared: &SessionShared,
        backup_id: String,
    ) -> Result<()> {
        let ctx = &shared.ctx;
        let summary = {
            let mut backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
            backups.remove(&backup_id)
        };
        let Some(summary) = summary else {
            tracing::warn!(%backup_id, "backup_complete for unknown backup");
            return Ok(());
        };

        let complete = summary.completed_files == summary.file_count;
        if complete {
            ctx.store
                .set_backup_status(&backup_id, BackupStatus::Completed)?;
        }
        ctx.reputation.record_transfer(
            &shared.peer.peer_id_hash,
            summary.file_count as u64,
            summary.corrupted_files as u64,
        );
        ctx.events.emit(PeerEvent::TransferFinished {
            backup_id: backup_id.clone(),
            succeeded: complete,
            reason: (!complete).then(|| {
                format!(
                    "{} of {} files arrived",
                    summary.completed_files, summary.file_count
                )
            }),
        });
        tracing::info!(
            %backup_id,
            name = %summary.name,
            bytes = summary.total_bytes,
            complete,
            "inbound backup finished"
        );
        Ok(())
    }

    fn count_corruption(&self, transfer_id: &str) {
        let backup_id = backup_id_of(transfer_id);
        let mut backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backup) = backups.get_mut(&backup_id) {
            backup.corrupted_files += 1;
        }
    }
}

/// The backup id half of a `backup:path` transfer id.
fn backup_id_of(transfer_id: &str) -> String {
    transfer_id
        .split_once(':')
        .map(|(backup, _)| backup.to_string())
        .unwrap_or_else(|| transfer_id.to_string())
}

/// Filesystem-safe staging directory name for a transfer id.
fn stage_name(transfer_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(transfer_id.as_bytes());
    hex::encode(hasher.finalize())[..24].to_string()
}

/// Reject absolute paths and traversal components before touching disk.
fn validate_relative_path(name: &str) -> std::result::Result<(), String> {
    let path = Path::new(name);
    if path.is_absolute() {
        return Err("absolute path rejected".to_string());
    }
    for component in path.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => return Err("path traversal rejected".to_string()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_relative_path() {
        assert!(validate_relative_path("docs/report.pdf").is_ok());
        assert!(validate_relative_path("../escape").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("a/../../b").is_err());
    }

    #[test]
    fn test_backup_id_extraction() {
        assert_eq!(backup_id_of("b1:docs/report.pdf"), "b1");
        assert_eq!(backup_id_of("loner"), "loner");
    }

    #[test]
    fn test_stage_name_is_safe_and_stable() {
        let a = stage_name("b1:docs/report.pdf");
        assert_eq!(a, stage_name("b1:docs/report.pdf"));
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
