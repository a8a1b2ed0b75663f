//! backup-peer - mutual peer-to-peer encrypted backup exchange
//!
//! Two peers trade storage capacity: each stores the other's encrypted,
//! chunked backups and periodically proves it still holds them. The crate
//! is the peer core:
//! - Ed25519 identity with hash-derived peer handles and signed session proofs
//! - X25519 + HKDF shared secrets sealing every chunk on the wire
//! - A relational store with field-level encryption of sensitive columns
//! - Sliding-window rate limiting with per-message-type caps and bans
//! - A symmetric allocation ledger enforcing give-to-get
//! - Weighted reputation scoring with trust levels and a blacklist
//! - Chunked, resumable transfers over a broker-introduced direct channel
//! - Storage commitments and random challenge/response retention proofs
//!
//! The signaling broker, UI, and CLI are external collaborators; this
//! crate exposes the components and a [`PeerContext`] bundle that wires
//! them together.

pub mod allocation;
pub mod config;
pub mod context;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod limiter;
pub mod protocol;
pub mod reputation;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod verify;

pub use allocation::{AllocationEntry, AllocationLedger};
pub use config::{PeerConfig, RateLimitConfig};
pub use context::{spawn_maintenance, PeerContext};
pub use crypto::{ContentHash, KeyStore, SecretCache, SignedPeerIdentity, VerifiedIdentity};
pub use error::{Error, Result};
pub use events::{event_channel, EventSender, PeerEvent};
pub use limiter::RateLimiter;
pub use protocol::ChannelMessage;
pub use reputation::{PeerReputation, ReputationEngine, TrustLevel};
pub use store::{BackupRecord, BackupStatus, Direction, Store, TransferState};
pub use transfer::{prepare_backup, send_backup};
pub use transport::{PeerSession, SessionState, Signaling, WebSocketSignaling};
pub use verify::{spawn_scheduler, StorageChallenge, StorageCommitment, StorageProof, Verifier};
