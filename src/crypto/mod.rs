//! Cryptographic identity, hashing, and channel encryption.

pub mod encryption;
pub mod hashing;
pub mod identity;
pub mod keys;

pub use encryption::{open, seal, SecretCache};
pub use hashing::{hash_file, verify_data, ContentHash};
pub use identity::{
    peer_id_hash_from_key, session_proof, signed_identity, verify_identity, verify_session_proof,
    SessionProof, SignedPeerIdentity, VerifiedIdentity,
};
pub use keys::KeyStore;
