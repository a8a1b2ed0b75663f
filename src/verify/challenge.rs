//! Challenge generation, proof computation, and proof verification.
//!
//! Three challenge kinds: random chunk indices, whole-file hashes, and a
//! nonce-bound metadata digest. The challenger derives expectations from
//! its backup metadata; the custodian answers by re-reading its stored
//! copy from disk, so a discarded backup cannot produce a valid proof.

use rand::rngs::OsRng;
use rand::seq::index::sample;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::crypto::hashing::{hash_file, ContentHash};
use crate::error::VerificationError;
use crate::store::{BackupMetadata, BackupRecord, FileEntry};

/// Challenges expire five minutes after issuance.
pub const CHALLENGE_TTL_MS: u64 = 5 * 60 * 1000;

/// How many chunk indices a random-blocks challenge requests.
pub const RANDOM_BLOCK_COUNT: usize = 10;

/// Upper bound of the index sample space.
pub const RANDOM_BLOCK_SAMPLE: usize = 1000;

/// Files requested by a file-hash challenge.
pub const FILE_HASH_COUNT: usize = 3;

/// Kind-specific challenge parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeParams {
    /// Prove retention of specific chunks, indexed across the backup's
    /// files flattened in metadata order.
    RandomBlocks { indices: Vec<u32> },
    /// Prove retention of whole files by index into the metadata list.
    FileHash { file_indices: Vec<u32> },
    /// Prove knowledge of the backup record bound to a caller nonce.
    MetadataProof { nonce: String },
}

impl ChallengeParams {
    pub fn kind(&self) -> &'static str {
        match self {
            ChallengeParams::RandomBlocks { .. } => "random_blocks",
            ChallengeParams::FileHash { .. } => "file_hash",
            ChallengeParams::MetadataProof { .. } => "metadata_proof",
        }
    }
}

/// A challenge as sent to the custodian.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageChallenge {
    pub id: String,
    pub backup_id: String,
    #[serde(flatten)]
    pub params: ChallengeParams,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

/// One proven chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockProof {
    pub index: u32,
    pub hash: String,
    pub size: u32,
}

/// One proven file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileProof {
    pub index: u32,
    pub hash: String,
}

/// Kind-specific proof payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProofBody {
    RandomBlocks { blocks: Vec<BlockProof> },
    FileHash { files: Vec<FileProof> },
    MetadataProof { hash: String },
}

/// The custodian's answer. `error` set means the custodian could not (or
/// would not) prove; the challenger accounts it as a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageProof {
    pub challenge_id: String,
    pub backup_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ProofBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Generate a challenge of the given kind for a backup we sent.
pub fn generate_challenge(
    kind: &str,
    backup: &BackupRecord,
    now: u64,
) -> Result<StorageChallenge, VerificationError> {
    let params = match kind {
        "random_blocks" => {
            let total = total_chunks(&backup.metadata) as usize;
            if total == 0 {
                return Err(VerificationError::UnsupportedKind(
                    "random_blocks on a chunkless backup".into(),
                ));
            }
            let space = total.min(RANDOM_BLOCK_SAMPLE);
            let count = RANDOM_BLOCK_COUNT.min(space);
            let mut indices: Vec<u32> = sample(&mut rand::thread_rng(), space, count)
                .into_iter()
                .map(|i| i as u32)
                .collect();
            indices.sort_unstable();
            ChallengeParams::RandomBlocks { indices }
        }
        "file_hash" => {
            let files = backup.metadata.files.len();
            if files == 0 {
                return Err(VerificationError::UnsupportedKind(
                    "file_hash on a fileless backup".into(),
                ));
            }
            let count = FILE_HASH_COUNT.min(files);
            let mut file_indices: Vec<u32> = sample(&mut rand::thread_rng(), files, count)
                .into_iter()
                .map(|i| i as u32)
                .collect();
            file_indices.sort_unstable();
            ChallengeParams::FileHash { file_indices }
        }
        "metadata_proof" => {
            let mut nonce = [0u8; 32];
            OsRng.fill_bytes(&mut nonce);
            ChallengeParams::MetadataProof {
                nonce: hex::encode(nonce),
            }
        }
        other => return Err(VerificationError::UnsupportedKind(other.to_string())),
    };

    let mut id_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut id_bytes);

    Ok(StorageChallenge {
        id: hex::encode(id_bytes),
        backup_id: backup.id.clone(),
        params,
        issued_at_ms: now,
        expires_at_ms: now + CHALLENGE_TTL_MS,
    })
}

/// Compute the proof for a challenge against our stored copy of the
/// backup, rooted at `backup_root`.
pub fn compute_proof(
    challenge: &StorageChallenge,
    backup: &BackupRecord,
    backup_root: &Path,
) -> StorageProof {
    let body = match &challenge.params {
        ChallengeParams::RandomBlocks { indices } => {
            read_block_proofs(&backup.metadata, backup_root, indices)
                .map(|blocks| ProofBody::RandomBlocks { blocks })
        }
        ChallengeParams::FileHash { file_indices } => {
            read_file_proofs(&backup.metadata, backup_root, file_indices)
                .map(|files| ProofBody::FileHash { files })
        }
        ChallengeParams::MetadataProof { nonce } => Ok(ProofBody::MetadataProof {
            hash: metadata_digest(backup, nonce),
        }),
    };

    match body {
        Ok(body) => StorageProof {
            challenge_id: challenge.id.clone(),
            backup_id: challenge.backup_id.clone(),
            body: Some(body),
            error: None,
        },
        Err(reason) => StorageProof {
            challenge_id: challenge.id.clone(),
            backup_id: challenge.backup_id.clone(),
            body: None,
            error: Some(reason),
        },
    }
}

/// Check a returned proof against our metadata for the same backup.
pub fn verify_proof(
    challenge: &StorageChallenge,
    proof: &StorageProof,
    backup: &BackupRecord,
) -> Result<(), VerificationError> {
    if proof.error.is_some() {
        return Err(VerificationError::ProofMismatch);
    }
    let Some(body) = &proof.body else {
        return Err(VerificationError::ProofMismatch);
    };

    match (&challenge.params, body) {
        (ChallengeParams::RandomBlocks { indices }, ProofBody::RandomBlocks { blocks }) => {
            if blocks.len() != indices.len() {
                return Err(VerificationError::ProofMismatch);
            }
            for (expected_index, block) in indices.iter().zip(blocks) {
                if block.index != *expected_index {
                    return Err(VerificationError::ProofMismatch);
                }
                let (hash, size) = expected_chunk(&backup.metadata, *expected_index)
                    .ok_or(VerificationError::ProofMismatch)?;
                if block.hash != hash || block.size != size {
                    return Err(VerificationError::ProofMismatch);
                }
            }
            Ok(())
        }
        (ChallengeParams::FileHash { file_indices }, ProofBody::FileHash { files }) => {
            if files.len() != file_indices.len() {
                return Err(VerificationError::ProofMismatch);
            }
            for (expected_index, file) in file_indices.iter().zip(files) {
                let entry = backup
                    .metadata
                    .files
                    .get(*expected_index as usize)
                    .ok_or(VerificationError::ProofMismatch)?;
                if file.index != *expected_index || file.hash != entry.hash {
                    return Err(VerificationError::ProofMismatch);
                }
            }
            Ok(())
        }
        (ChallengeParams::MetadataProof { nonce }, ProofBody::MetadataProof { hash }) => {
            if *hash == metadata_digest(backup, nonce) {
                Ok(())
            } else {
                Err(VerificationError::ProofMismatch)
            }
        }
        _ => Err(VerificationError::ProofMismatch),
    }
}

/// Total chunk count across a backup's files.
pub fn total_chunks(metadata: &BackupMetadata) -> u32 {
    metadata
        .files
        .iter()
        .map(|f| f.chunk_count(metadata.chunk_size))
        .sum()
}

/// Map a flattened chunk index to its file and in-file index.
fn locate_chunk(metadata: &BackupMetadata, index: u32) -> Option<(&FileEntry, u32)> {
    let mut remaining = index;
    for file in &metadata.files {
        let count = file.chunk_count(metadata.chunk_size);
        if remaining < count {
            return Some((file, remaining));
        }
        remaining -= count;
    }
    None
}

/// Expected hash and size for a flattened chunk index, from metadata.
fn expected_chunk(metadata: &BackupMetadata, index: u32) -> Option<(String, u32)> {
    let (file, within) = locate_chunk(metadata, index)?;
    let hashes = file.chunk_hashes.as_ref()?;
    let hash = hashes.get(within as usize)?.clone();
    let offset = within as u64 * metadata.chunk_size as u64;
    let size = (file.size - offset).min(metadata.chunk_size as u64) as u32;
    Some((hash, size))
}

fn read_block_proofs(
    metadata: &BackupMetadata,
    root: &Path,
    indices: &[u32],
) -> Result<Vec<BlockProof>, String> {
    let mut blocks = Vec::with_capacity(indices.len());
    for &index in indices {
        let (file, within) =
            locate_chunk(metadata, index).ok_or_else(|| format!("chunk {index} out of range"))?;
        let offset = within as u64 * metadata.chunk_size as u64;
        let size = (file.size - offset).min(metadata.chunk_size as u64) as usize;

        let path = root.join(&file.path);
        let mut handle =
            std::fs::File::open(&path).map_err(|e| format!("open {}: {e}", file.path))?;
        handle
            .seek(SeekFrom::Start(offset))
            .map_err(|e| format!("seek {}: {e}", file.path))?;
        let mut buf = vec![0u8; size];
        handle
            .read_exact(&mut buf)
            .map_err(|e| format!("read {}: {e}", file.path))?;

        blocks.push(BlockProof {
            index,
            hash: ContentHash::from_data(&buf).to_hex(),
            size: size as u32,
        });
    }
    Ok(blocks)
}

fn read_file_proofs(
    metadata: &BackupMetadata,
    root: &Path,
    file_indices: &[u32],
) -> Result<Vec<FileProof>, String> {
    let mut files = Vec::with_capacity(file_indices.len());
    for &index in file_indices {
        let entry = metadata
            .files
            .get(index as usize)
            .ok_or_else(|| format!("file {index} out of range"))?;
        let hash = hash_file(&root.join(&entry.path))
            .map_err(|e| format!("hash {}: {e}", entry.path))?;
        files.push(FileProof {
            index,
            hash: hash.to_hex(),
        });
    }
    Ok(files)
}

/// Digest binding the backup record to a caller nonce.
pub fn metadata_digest(backup: &BackupRecord, nonce: &str) -> String {
    let canonical = format!(
        "{}:{}:{}:{}",
        backup.id, backup.created_at_ms, backup.file_count, nonce
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BackupStatus, Direction};
    use std::io::Write;

    /// Write `files` under a temp root and build the matching record.
    fn fixture(files: &[(&str, usize)]) -> (tempfile::TempDir, BackupRecord) {
        let dir = tempfile::tempdir().unwrap();
        let chunk_size = 1024u32;
        let mut entries = Vec::new();
        let mut total = 0u64;

        for (i, (name, size)) in files.iter().enumerate() {
            let data: Vec<u8> = (0..*size).map(|b| (b as u8).wrapping_mul(i as u8 + 1)).collect();
            let path = dir.path().join(name);
            std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

            let chunk_hashes = data
                .chunks(chunk_size as usize)
                .map(|c| ContentHash::from_data(c).to_hex())
                .collect();
            entries.push(FileEntry {
                path: name.to_string(),
                size: *size as u64,
                hash: ContentHash::from_data(&data).to_hex(),
                chunk_hashes: Some(chunk_hashes),
            });
            total += *size as u64;
        }

        let record = BackupRecord {
            id: "backup-1".into(),
            name: "fixture".into(),
            direction: Direction::Sent,
            peer_id_hash: "feedfacecafebeef".into(),
            created_at_ms: 1_700_000_000_000,
            status: BackupStatus::Active,
            file_count: files.len() as u32,
            total_bytes: total,
            metadata: BackupMetadata {
                files: entries,
                chunk_size,
            },
        };
        (dir, record)
    }

    #[test]
    fn test_random_blocks_roundtrip() {
        let (dir, backup) = fixture(&[("a.bin", 2500), ("b.bin", 1024), ("c.bin", 10)]);
        let challenge = generate_challenge("random_blocks", &backup, 0).unwrap();

        let proof = compute_proof(&challenge, &backup, dir.path());
        assert!(proof.error.is_none());
        verify_proof(&challenge, &proof, &backup).unwrap();
    }

    #[test]
    fn test_tampered_block_rejected() {
        let (dir, backup) = fixture(&[("a.bin", 2500)]);
        let challenge = generate_challenge("random_blocks", &backup, 0).unwrap();
        let mut proof = compute_proof(&challenge, &backup, dir.path());

        if let Some(ProofBody::RandomBlocks { blocks }) = &mut proof.body {
            blocks[0].hash = "00".repeat(32);
        }
        assert_eq!(
            verify_proof(&challenge, &proof, &backup),
            Err(VerificationError::ProofMismatch)
        );
    }

    #[test]
    fn test_custodian_missing_file_reports_error() {
        let (dir, backup) = fixture(&[("a.bin", 2048)]);
        std::fs::remove_file(dir.path().join("a.bin")).unwrap();

        let challenge = generate_challenge("file_hash", &backup, 0).unwrap();
        let proof = compute_proof(&challenge, &backup, dir.path());
        assert!(proof.error.is_some());
        assert_eq!(
            verify_proof(&challenge, &proof, &backup),
            Err(VerificationError::ProofMismatch)
        );
    }

    #[test]
    fn test_file_hash_roundtrip() {
        let (dir, backup) = fixture(&[("a.bin", 100), ("b.bin", 200), ("c.bin", 300), ("d.bin", 400)]);
        let challenge = generate_challenge("file_hash", &backup, 0).unwrap();
        if let ChallengeParams::FileHash { file_indices } = &challenge.params {
            assert_eq!(file_indices.len(), 3);
        } else {
            panic!("wrong params kind");
        }

        let proof = compute_proof(&challenge, &backup, dir.path());
        verify_proof(&challenge, &proof, &backup).unwrap();
    }

    #[test]
    fn test_metadata_proof_roundtrip_and_nonce_binding() {
        let (dir, backup) = fixture(&[("a.bin", 64)]);
        let challenge = generate_challenge("metadata_proof", &backup, 0).unwrap();
        let proof = compute_proof(&challenge, &backup, dir.path());
        verify_proof(&challenge, &proof, &backup).unwrap();

        // The same proof against a different-nonce challenge must fail.
        let other = generate_challenge("metadata_proof", &backup, 0).unwrap();
        assert_eq!(
            verify_proof(&other, &proof, &backup),
            Err(VerificationError::ProofMismatch)
        );
    }

    #[test]
    fn test_unsupported_kind() {
        let (_dir, backup) = fixture(&[("a.bin", 64)]);
        assert_eq!(
            generate_challenge("quantum_proof", &backup, 0),
            Err(VerificationError::UnsupportedKind("quantum_proof".into()))
        );
    }

    #[test]
    fn test_wire_shape_has_kind_tag() {
        let (_dir, backup) = fixture(&[("a.bin", 64)]);
        let challenge = generate_challenge("metadata_proof", &backup, 1000).unwrap();
        let json = serde_json::to_string(&challenge).unwrap();
        assert!(json.contains(r#""kind":"metadata_proof""#));
        let back: StorageChallenge = serde_json::from_str(&json).unwrap();
        assert_eq!(back, challenge);
    }
}
