//! Durable state: backups, peers, challenges, chunk states, schedules.

pub mod crypter;
pub mod db;
pub mod records;

pub use crypter::FieldCrypter;
pub use db::{MaintenanceReport, Store};
pub use records::{
    BackupFileRecord, BackupMetadata, BackupRecord, BackupStatus, CachedPeerConnection,
    ChallengeRecord, ChallengeStatus, ChunkStateRecord, CommitmentRecord, Direction, FileEntry,
    PeerRecord, StoreStats, SyncSchedule, TransferSessionRecord, TransferState,
};
