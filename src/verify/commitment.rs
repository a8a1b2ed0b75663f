//! Storage commitments.
//!
//! On entering the connected state each peer signs a declaration of how
//! much it will hold and for how long. The commitment must embed the same
//! signing key the handshake verified; a mismatch on either side rejects.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::identity::now_ms;
use crate::crypto::keys::KeyStore;
use crate::error::VerificationError;
use crate::store::CommitmentRecord;

/// Smallest acceptable commitment: 1 MiB.
pub const MIN_COMMITMENT_BYTES: u64 = 1 << 20;

/// Largest acceptable commitment: 1 TiB.
pub const MAX_COMMITMENT_BYTES: u64 = 1 << 40;

/// A signed storage declaration, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageCommitment {
    pub peer_id_hash: String,
    /// Hex Ed25519 key the signature verifies against. Must match the
    /// session's verified identity key.
    pub signing_public_key: String,
    /// Hex X25519 key chunks for this peer are sealed under.
    pub encryption_public_key: String,
    pub bytes_offered: u64,
    /// Free-form availability terms, e.g. "24/7" or "nightly".
    pub availability: String,
    pub retention_ms: u64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    /// Hex signature over the canonical subset.
    pub signature: String,
}

impl StorageCommitment {
    /// The exact bytes the signature covers.
    fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.peer_id_hash,
            self.encryption_public_key,
            self.bytes_offered,
            self.availability,
            self.retention_ms,
            self.created_at_ms,
            self.expires_at_ms
        )
    }

    /// Persisted form of this commitment.
    pub fn to_record(&self) -> CommitmentRecord {
        CommitmentRecord {
            peer_id_hash: self.peer_id_hash.clone(),
            encryption_public_key: self.encryption_public_key.clone(),
            bytes_offered: self.bytes_offered,
            availability: self.availability.clone(),
            retention_ms: self.retention_ms,
            created_ms: self.created_at_ms,
            expires_ms: self.expires_at_ms,
            signature: self.signature.clone(),
        }
    }
}

/// Build and sign the local peer's commitment.
pub fn build_commitment(
    keys: &KeyStore,
    bytes_offered: u64,
    availability: &str,
    retention_ms: u64,
) -> StorageCommitment {
    let created_at_ms = now_ms();
    let mut commitment = StorageCommitment {
        peer_id_hash: keys.peer_id_hash().to_string(),
        signing_public_key: hex::encode(keys.verifying_key().as_bytes()),
        encryption_public_key: hex::encode(keys.encryption_public()),
        bytes_offered,
        availability: availability.to_string(),
        retention_ms,
        created_at_ms,
        expires_at_ms: created_at_ms + retention_ms,
        signature: String::new(),
    };
    commitment.signature = hex::encode(keys.sign(commitment.canonical().as_bytes()));
    commitment
}

/// Verify a counterparty commitment against the identity key the session
/// handshake established.
pub fn verify_commitment(
    commitment: &StorageCommitment,
    session_identity_key: &[u8; 32],
    now: u64,
) -> Result<(), VerificationError> {
    if commitment.bytes_offered < MIN_COMMITMENT_BYTES {
        return Err(VerificationError::InvalidCommitment(format!(
            "offer below 1 MiB: {}",
            commitment.bytes_offered
        )));
    }
    if commitment.bytes_offered > MAX_COMMITMENT_BYTES {
        return Err(VerificationError::InvalidCommitment(format!(
            "offer above 1 TiB: {}",
            commitment.bytes_offered
        )));
    }
    if now >= commitment.expires_at_ms {
        return Err(VerificationError::InvalidCommitment("expired".into()));
    }

    if commitment.signing_public_key != hex::encode(session_identity_key) {
        return Err(VerificationError::InvalidCommitment(
            "signing key does not match session identity".into(),
        ));
    }

    let verifying = VerifyingKey::from_bytes(session_identity_key)
        .map_err(|_| VerificationError::InvalidCommitment("bad identity key".into()))?;
    let sig_bytes = hex::decode(&commitment.signature)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .ok_or_else(|| VerificationError::InvalidCommitment("malformed signature".into()))?;
    verifying
        .verify_strict(
            commitment.canonical().as_bytes(),
            &Signature::from_bytes(&sig_bytes),
        )
        .map_err(|_| VerificationError::InvalidCommitment("signature invalid".into()))
}
