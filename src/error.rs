//! Error taxonomy for the peer core.
//!
//! Each component surfaces its own error enum with stable discriminants;
//! the crate-level [`Error`] aggregates them for task boundaries. Only the
//! top of a task converts an error into a user-visible event or a session
//! close.

use thiserror::Error;

/// Result alias using the crate-level error.
pub type Result<T> = std::result::Result<T, Error>;

/// Key lifecycle and cipher failures.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// A required key file is absent and could not be generated.
    #[error("key missing: {0}")]
    KeyMissing(String),
    /// A detached signature did not verify.
    #[error("invalid signature")]
    SignatureInvalid,
    /// Authenticated encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,
    /// Authenticated decryption failed; the data is corrupt or the key is wrong.
    #[error("decryption failed")]
    DecryptionFailed,
    /// A recomputed digest did not match its claimed value.
    #[error("hash mismatch")]
    HashMismatch,
    /// Key material had the wrong length or encoding.
    #[error("malformed key material: {0}")]
    KeyFormat(String),
    /// I/O while reading or writing key files.
    #[error("key I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signed-identity verification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Protocol version not supported by this build.
    #[error("unsupported protocol version {0}")]
    VersionUnsupported(u32),
    /// Identity or session proof timestamp outside the accepted window.
    #[error("identity expired")]
    Expired,
    /// The bundled peer-id-hash does not match the bundled public key.
    #[error("peer id hash mismatch")]
    HashMismatch,
    /// Public key is not the expected length.
    #[error("bad key length: {0}")]
    KeyLength(usize),
    /// The signature over the identity hash did not verify.
    #[error("invalid signature")]
    SignatureInvalid,
}

/// Connection establishment and channel failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No peer was matched before the deadline.
    #[error("matching timed out")]
    MatchingTimeout,
    /// The data channel closed underneath us.
    #[error("channel closed")]
    ChannelClosed,
    /// The outbound queue stayed full past the backpressure deadline.
    #[error("send backpressure timed out")]
    BackpressureTimeout,
    /// Signaling broker rejected or failed the connection.
    #[error("signaling error: {0}")]
    Signaling(String),
    /// Underlying socket error.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Admission-control denials. Denials never mutate window counters.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Burst window exceeded.
    #[error("burst limit exceeded")]
    Burst,
    /// Coarse window exceeded.
    #[error("window limit exceeded")]
    Window,
    /// Per-message-type cap exceeded.
    #[error("message type limit exceeded")]
    MessageType,
    /// Peer is currently banned.
    #[error("peer is banned")]
    Banned,
}

/// Give-to-get ledger violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Accepting or placing would break consumed ≤ offered.
    #[error("allocation ratio violation")]
    RatioViolation,
    /// The configured offer ceiling is exhausted.
    #[error("offered capacity exhausted")]
    CapacityExhausted,
}

/// Persistent store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    /// Schema bootstrap or migration failed.
    #[error("schema error: {0}")]
    Schema(String),
    /// An encrypted column failed to decrypt; ciphertext is never returned.
    #[error("field decryption failed for {0}")]
    FieldDecrypt(&'static str),
    /// Filesystem error around the database or snapshots.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted value could not be parsed.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Transfer pipeline failures.
#[derive(Error, Debug)]
pub enum TransferError {
    /// A chunk failed decryption or hash verification.
    #[error("chunk {index} integrity failure")]
    ChunkIntegrity { index: u32 },
    /// The reassembled file hash did not match the sender's.
    #[error("file integrity failure for {name}")]
    FileIntegrity { name: String },
    /// Reassembly found a hole in the chunk sequence.
    #[error("missing chunk {index}")]
    MissingChunk { index: u32 },
    /// A chunk exhausted its retry budget.
    #[error("chunk {index} retries exhausted")]
    RetryExhausted { index: u32 },
    /// The source file changed between the original send and the resume.
    #[error("source file changed at chunk {index}")]
    SourceChanged { index: u32 },
    /// The receiver rejected the transfer or an ack reported an error.
    #[error("peer rejected transfer: {0}")]
    Rejected(String),
    /// Disk I/O while reading the source or writing the received tree.
    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Proof-of-storage protocol failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// A proof arrived for a challenge we never issued or already settled.
    #[error("unknown challenge {0}")]
    UnknownChallenge(String),
    /// The challenge kind is not supported by this build.
    #[error("unsupported challenge kind {0}")]
    UnsupportedKind(String),
    /// The returned proof did not match local metadata.
    #[error("proof mismatch")]
    ProofMismatch,
    /// No response arrived before the challenge expired.
    #[error("challenge timed out")]
    Timeout,
    /// The challenge was already past its expiry when processed.
    #[error("challenge expired")]
    ChallengeExpired,
    /// The commitment failed its bounds or signature checks.
    #[error("invalid commitment: {0}")]
    InvalidCommitment(String),
}

/// Wire decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame was not a well-formed message.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The `type` discriminator is not part of the closed union.
    #[error("unknown message type {0}")]
    UnknownType(String),
}

/// Crate-level aggregate used at task boundaries.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// Stable kind discriminant for structured events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Crypto(_) => "crypto",
            Error::Identity(_) => "identity",
            Error::Transport(_) => "transport",
            Error::RateLimit(_) => "rate_limit",
            Error::Allocation(_) => "allocation",
            Error::Store(_) => "store",
            Error::Transfer(_) => "transfer",
            Error::Verification(_) => "verification",
            Error::Protocol(_) => "protocol",
        }
    }

    /// Whether an inbound occurrence of this error must close the session.
    pub fn closes_session(&self) -> bool {
        matches!(self, Error::Crypto(_) | Error::Identity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_discriminants_are_stable() {
        let err: Error = RateLimitError::Burst.into();
        assert_eq!(err.kind(), "rate_limit");

        let err: Error = VerificationError::ProofMismatch.into();
        assert_eq!(err.kind(), "verification");
    }

    #[test]
    fn test_crypto_errors_close_session() {
        let err: Error = CryptoError::SignatureInvalid.into();
        assert!(err.closes_session());

        let err: Error = RateLimitError::Window.into();
        assert!(!err.closes_session());
    }
}
