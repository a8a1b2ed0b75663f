//! Record types persisted by the relational store.

use serde::{Deserialize, Serialize};

use crate::reputation::TrustLevel;

/// Which way a backup flows relative to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We are the owner; the counterparty is the custodian.
    Sent,
    /// We are the custodian.
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// Lifecycle status of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Active => "active",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Cancelled => "cancelled",
            BackupStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BackupStatus::Active),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            "cancelled" => Some(BackupStatus::Cancelled),
            "paused" => Some(BackupStatus::Paused),
            _ => None,
        }
    }
}

/// Per-file and per-chunk transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Transferring,
    Completed,
    Failed,
    Verified,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Verified => "verified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferState::Pending),
            "transferring" => Some(TransferState::Transferring),
            "completed" => Some(TransferState::Completed),
            "failed" => Some(TransferState::Failed),
            "verified" => Some(TransferState::Verified),
            _ => None,
        }
    }

    /// States that count as done for resumption purposes.
    pub fn is_settled(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Verified)
    }
}

/// One file inside a backup's structured metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the backup root.
    pub path: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the file content.
    pub hash: String,
    /// Per-chunk hex SHA-256 list, present once the file has been chunked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hashes: Option<Vec<String>>,
}

impl FileEntry {
    /// Number of chunks for a given chunk size, zero for an empty file.
    pub fn chunk_count(&self, chunk_size: u32) -> u32 {
        if self.size == 0 {
            0
        } else {
            self.size.div_ceil(chunk_size as u64) as u32
        }
    }
}

/// Structured metadata column of a backup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupMetadata {
    pub files: Vec<FileEntry>,
    /// Chunk size the backup was framed with.
    pub chunk_size: u32,
}

/// A named, immutable-at-completion collection of files.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub peer_id_hash: String,
    pub created_at_ms: u64,
    pub status: BackupStatus,
    pub file_count: u32,
    pub total_bytes: u64,
    pub metadata: BackupMetadata,
}

/// One file row under a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFileRecord {
    pub backup_id: String,
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub chunk_count: u32,
    pub status: TransferState,
}

/// Durable per-chunk transfer state, unique on (backup id, chunk index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStateRecord {
    pub backup_id: String,
    pub chunk_index: u32,
    pub chunk_hash: String,
    pub chunk_size: u32,
    pub state: TransferState,
    pub attempt_count: u32,
    pub last_attempt_ms: u64,
    pub error: Option<String>,
}

/// A known counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id_hash: String,
    /// Hex signing key. Encrypted at rest.
    pub public_key: String,
    pub trust_level: TrustLevel,
    /// Opaque JSON metadata. Encrypted at rest.
    pub metadata: Option<String>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

/// Cached material for reconnecting without the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPeerConnection {
    pub peer_id_hash: String,
    /// Hex signing key. Encrypted at rest.
    pub public_key: String,
    /// Opaque session-resumption blob. Encrypted at rest.
    pub session_data: String,
    pub last_seen_ms: u64,
    pub trust_level: TrustLevel,
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub last_success_ms: Option<u64>,
}

impl CachedPeerConnection {
    /// successful ≤ total must hold for every cached row.
    pub fn attempts_consistent(&self) -> bool {
        self.successful_attempts <= self.total_attempts
    }
}

/// One transfer session row per backup transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSessionRecord {
    pub id: String,
    pub backup_id: String,
    pub peer_id_hash: String,
    pub direction: Direction,
    pub status: BackupStatus,
    pub started_ms: u64,
    pub updated_ms: u64,
}

/// Persisted verification bookkeeping for the 24 h scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchedule {
    pub backup_id: String,
    pub peer_id_hash: String,
    pub next_sync_ms: u64,
    pub interval_ms: u64,
    pub last_result: Option<String>,
}

/// Terminal status of a persisted challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Passed,
    Failed,
    TimedOut,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Passed => "passed",
            ChallengeStatus::Failed => "failed",
            ChallengeStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChallengeStatus::Pending),
            "passed" => Some(ChallengeStatus::Passed),
            "failed" => Some(ChallengeStatus::Failed),
            "timed_out" => Some(ChallengeStatus::TimedOut),
            _ => None,
        }
    }
}

/// A persisted challenge with its (eventual) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub id: String,
    pub backup_id: String,
    pub peer_id_hash: String,
    pub kind: String,
    /// JSON challenge parameters. Encrypted at rest.
    pub challenge_data: String,
    /// JSON proof payload, once received. Encrypted at rest.
    pub response_data: Option<String>,
    pub status: ChallengeStatus,
    pub issued_ms: u64,
    pub expires_ms: u64,
    pub response_time_ms: Option<u64>,
}

/// A persisted storage commitment from (or to) a counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentRecord {
    pub peer_id_hash: String,
    pub encryption_public_key: String,
    pub bytes_offered: u64,
    pub availability: String,
    pub retention_ms: u64,
    pub created_ms: u64,
    pub expires_ms: u64,
    /// Hex signature over the canonical subset. Encrypted at rest.
    pub signature: String,
}

/// Aggregate counts for the UI collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub sent_backups: u32,
    pub received_backups: u32,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    /// (trust level, peer count) histogram.
    pub peers_by_trust: Vec<(String, u32)>,
}
