//! Peer identity: hash-derived handles, signed identity bundles, and
//! per-connection session proofs.
//!
//! The peer-id-hash is the lower 16 hex characters of SHA-256 over the
//! Ed25519 public key. A signed identity binds that hash, the key, a
//! timestamp, the protocol version, and declared capabilities; a session
//! proof additionally binds a connection instance to time and a nonce.

use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::keys::KeyStore;
use crate::error::IdentityError;

/// Identities older than this fail verification.
pub const IDENTITY_MAX_AGE_MS: u64 = 60 * 60 * 1000;

/// Session proofs are accepted within ± this window.
pub const SESSION_PROOF_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Length of a peer-id-hash in hex characters.
pub const PEER_ID_HASH_LEN: usize = 16;

/// Derive the peer-id-hash from a signing public key.
pub fn peer_id_hash_from_key(public_key: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let digest = hasher.finalize();
    hex::encode(digest)[..PEER_ID_HASH_LEN].to_string()
}

/// A transmissible, signed peer identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedPeerIdentity {
    /// Lower 16 hex chars of SHA-256(public key).
    pub peer_id_hash: String,
    /// Hex Ed25519 signature over the hash string's bytes.
    pub signature: String,
    /// Hex Ed25519 public key.
    pub public_key: String,
    /// Issue time, milliseconds since the epoch.
    pub issued_at_ms: u64,
    /// Protocol version of the issuer.
    pub protocol_version: u32,
    /// Declared capabilities, free-form tags.
    pub capabilities: Vec<String>,
}

/// The accepted output of identity verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub peer_id_hash: String,
    pub public_key: [u8; 32],
    /// Verification tier; key-only verification yields `software-verified`.
    pub trust: &'static str,
}

/// Construct a signed identity for the local peer.
pub fn signed_identity(
    keys: &KeyStore,
    protocol_version: u32,
    capabilities: Vec<String>,
) -> SignedPeerIdentity {
    let hash = keys.peer_id_hash().to_string();
    let signature = keys.sign(hash.as_bytes());
    SignedPeerIdentity {
        peer_id_hash: hash,
        signature: hex::encode(signature),
        public_key: hex::encode(keys.verifying_key().as_bytes()),
        issued_at_ms: now_ms(),
        protocol_version,
        capabilities,
    }
}

/// Verify a received identity bundle.
///
/// Checks, in order: key length, protocol version, freshness, hash
/// recomputation, and the detached signature.
pub fn verify_identity(
    identity: &SignedPeerIdentity,
    supported_version: u32,
    now: u64,
) -> Result<VerifiedIdentity, IdentityError> {
    let key_bytes = decode_key(&identity.public_key)?;

    if identity.protocol_version != supported_version {
        return Err(IdentityError::VersionUnsupported(identity.protocol_version));
    }

    if now.saturating_sub(identity.issued_at_ms) > IDENTITY_MAX_AGE_MS {
        return Err(IdentityError::Expired);
    }

    if peer_id_hash_from_key(&key_bytes) != identity.peer_id_hash {
        return Err(IdentityError::HashMismatch);
    }

    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| IdentityError::SignatureInvalid)?;
    let signature = decode_signature(&identity.signature)?;
    verifying
        .verify_strict(identity.peer_id_hash.as_bytes(), &signature)
        .map_err(|_| IdentityError::SignatureInvalid)?;

    Ok(VerifiedIdentity {
        peer_id_hash: identity.peer_id_hash.clone(),
        public_key: key_bytes,
        trust: "software-verified",
    })
}

/// A fresh, signed artifact binding a connection instance to time and nonce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionProof {
    /// Transport candidate fingerprint, or a placeholder when none exists.
    pub candidate_fingerprint: String,
    /// Proof creation time, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Hex 32-byte random nonce.
    pub nonce: String,
    /// Hex SHA-256 over fingerprint, timestamp, and nonce.
    pub hash: String,
    /// Hex Ed25519 signature over the hash string's bytes.
    pub signature: String,
}

/// Construct a session proof for the local peer.
pub fn session_proof(keys: &KeyStore, candidate_fingerprint: Option<&str>) -> SessionProof {
    let fingerprint = candidate_fingerprint.unwrap_or("none").to_string();
    let timestamp_ms = now_ms();
    let mut nonce_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);

    let hash = proof_hash(&fingerprint, timestamp_ms, &nonce);
    let signature = hex::encode(keys.sign(hash.as_bytes()));

    SessionProof {
        candidate_fingerprint: fingerprint,
        timestamp_ms,
        nonce,
        hash,
        signature,
    }
}

/// Verify a counterparty session proof against their verified identity key.
pub fn verify_session_proof(
    proof: &SessionProof,
    peer_public_key: &[u8; 32],
    now: u64,
) -> Result<(), IdentityError> {
    let age = now.abs_diff(proof.timestamp_ms);
    if age > SESSION_PROOF_WINDOW_MS {
        return Err(IdentityError::Expired);
    }

    let expected = proof_hash(&proof.candidate_fingerprint, proof.timestamp_ms, &proof.nonce);
    if expected != proof.hash {
        return Err(IdentityError::HashMismatch);
    }

    let verifying = VerifyingKey::from_bytes(peer_public_key)
        .map_err(|_| IdentityError::SignatureInvalid)?;
    let signature = decode_signature(&proof.signature)?;
    verifying
        .verify_strict(proof.hash.as_bytes(), &signature)
        .map_err(|_| IdentityError::SignatureInvalid)
}

fn proof_hash(fingerprint: &str, timestamp_ms: u64, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(b":");
    hasher.update(timestamp_ms.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

fn decode_key(hex_key: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(hex_key).map_err(|_| IdentityError::KeyLength(hex_key.len()))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| IdentityError::KeyLength(len))
}

fn decode_signature(hex_sig: &str) -> Result<Signature, IdentityError> {
    let bytes = hex::decode(hex_sig).map_err(|_| IdentityError::SignatureInvalid)?;
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| IdentityError::SignatureInvalid)?;
    Ok(Signature::from_bytes(&arr))
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_keys() -> (tempfile::TempDir, KeyStore) {
        let dir = tempdir().unwrap();
        let keys = KeyStore::open(dir.path()).unwrap();
        (dir, keys)
    }

    #[test]
    fn test_identity_roundtrip() {
        let (_dir, keys) = test_keys();
        let identity = signed_identity(&keys, 1, vec!["backup".into()]);

        let verified = verify_identity(&identity, 1, now_ms()).unwrap();
        assert_eq!(verified.peer_id_hash, keys.peer_id_hash());
        assert_eq!(verified.trust, "software-verified");
        assert_eq!(
            peer_id_hash_from_key(&verified.public_key),
            identity.peer_id_hash
        );
    }

    #[test]
    fn test_flipped_signature_byte_rejected() {
        let (_dir, keys) = test_keys();
        let mut identity = signed_identity(&keys, 1, vec![]);

        let mut sig = hex::decode(&identity.signature).unwrap();
        sig[7] ^= 0xff;
        identity.signature = hex::encode(sig);

        assert_eq!(
            verify_identity(&identity, 1, now_ms()),
            Err(IdentityError::SignatureInvalid)
        );
    }

    #[test]
    fn test_wrong_version_rejected() {
        let (_dir, keys) = test_keys();
        let identity = signed_identity(&keys, 2, vec![]);
        assert_eq!(
            verify_identity(&identity, 1, now_ms()),
            Err(IdentityError::VersionUnsupported(2))
        );
    }

    #[test]
    fn test_stale_identity_rejected() {
        let (_dir, keys) = test_keys();
        let mut identity = signed_identity(&keys, 1, vec![]);
        identity.issued_at_ms = now_ms() - IDENTITY_MAX_AGE_MS - 1000;
        assert_eq!(
            verify_identity(&identity, 1, now_ms()),
            Err(IdentityError::Expired)
        );
    }

    #[test]
    fn test_substituted_key_fails_hash_check() {
        let (_dir, keys) = test_keys();
        let (_dir2, other) = test_keys();
        let mut identity = signed_identity(&keys, 1, vec![]);
        identity.public_key = hex::encode(other.verifying_key().as_bytes());
        assert_eq!(
            verify_identity(&identity, 1, now_ms()),
            Err(IdentityError::HashMismatch)
        );
    }

    #[test]
    fn test_session_proof_roundtrip() {
        let (_dir, keys) = test_keys();
        let proof = session_proof(&keys, Some("candidate:udp/4242"));
        let public = keys.verifying_key().to_bytes();
        verify_session_proof(&proof, &public, now_ms()).unwrap();
    }

    #[test]
    fn test_session_proof_outside_window_rejected() {
        let (_dir, keys) = test_keys();
        let mut proof = session_proof(&keys, None);
        proof.timestamp_ms -= SESSION_PROOF_WINDOW_MS + 1000;
        let public = keys.verifying_key().to_bytes();
        assert_eq!(
            verify_session_proof(&proof, &public, now_ms()),
            Err(IdentityError::Expired)
        );
    }

    #[test]
    fn test_session_proof_tampered_nonce_rejected() {
        let (_dir, keys) = test_keys();
        let mut proof = session_proof(&keys, None);
        proof.nonce = hex::encode([0u8; 32]);
        let public = keys.verifying_key().to_bytes();
        assert_eq!(
            verify_session_proof(&proof, &public, now_ms()),
            Err(IdentityError::HashMismatch)
        );
    }
}
