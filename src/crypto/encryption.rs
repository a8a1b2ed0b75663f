//! Authenticated channel encryption.
//!
//! Shared secrets come from a static X25519 agreement expanded through
//! HKDF-SHA256; both sides sort the public keys into the HKDF info so the
//! derived key is identical regardless of who derives first. Payloads are
//! sealed with XChaCha20-Poly1305, whose 24-byte nonce is safe to draw at
//! random per message.
//!
//! Output format: nonce (24 bytes) || ciphertext || tag (16 bytes)

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::crypto::keys::KeyStore;
use crate::error::CryptoError;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HKDF_SALT: &[u8] = b"backup-peer shared secret v1";

/// Default capacity of the per-peer secret cache.
pub const SECRET_CACHE_CAPACITY: usize = 256;

/// In-memory cache of per-peer symmetric keys. Secrets are derived once per
/// counterparty and never persisted; eviction is LRU by last use.
pub struct SecretCache {
    keys: Arc<KeyStore>,
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    secrets: HashMap<String, [u8; 32]>,
    order: VecDeque<String>,
}

impl SecretCache {
    /// Create a cache backed by the local key store.
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self::with_capacity(keys, SECRET_CACHE_CAPACITY)
    }

    /// Create a cache with an explicit capacity.
    pub fn with_capacity(keys: Arc<KeyStore>, capacity: usize) -> Self {
        Self {
            keys,
            inner: Mutex::new(CacheInner {
                secrets: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Derive (or fetch) the symmetric key shared with a counterparty.
    pub fn shared_key(&self, peer_id_hash: &str, their_public: &[u8; 32]) -> [u8; 32] {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(secret) = inner.secrets.get(peer_id_hash).copied() {
            inner.order.retain(|k| k != peer_id_hash);
            inner.order.push_back(peer_id_hash.to_string());
            return secret;
        }

        let secret = derive_shared_key(
            &self.keys.diffie_hellman(their_public),
            &self.keys.encryption_public(),
            their_public,
        );

        if inner.secrets.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.secrets.remove(&oldest);
            }
        }
        inner.secrets.insert(peer_id_hash.to_string(), secret);
        inner.order.push_back(peer_id_hash.to_string());
        secret
    }

    /// Drop a cached secret, forcing re-derivation on next use.
    pub fn invalidate(&self, peer_id_hash: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.secrets.remove(peer_id_hash);
        inner.order.retain(|k| k != peer_id_hash);
    }

    /// Number of cached secrets.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .secrets
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn derive_shared_key(dh_output: &[u8; 32], ours: &[u8; 32], theirs: &[u8; 32]) -> [u8; 32] {
    // Sort the public keys so both peers feed HKDF identical info bytes.
    let (lo, hi) = if ours <= theirs {
        (ours, theirs)
    } else {
        (theirs, ours)
    };
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(lo);
    info.extend_from_slice(hi);

    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), dh_output);
    let mut key = [0u8; 32];
    // 32-byte output always fits HKDF-SHA256's bound.
    if hkdf.expand(&info, &mut key).is_err() {
        unreachable!("HKDF output length is fixed at 32 bytes");
    }
    key
}

/// Encrypt a byte slice under a shared key.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a sealed slice. Failure means corruption or a wrong key and is
/// fatal for the chunk that carried it.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(&sealed[..NONCE_LEN]);

    cipher
        .decrypt(nonce, &sealed[NONCE_LEN..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn keystore() -> (tempfile::TempDir, Arc<KeyStore>) {
        let dir = tempdir().unwrap();
        let keys = Arc::new(KeyStore::open(dir.path()).unwrap());
        (dir, keys)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [42u8; 32];
        let plaintext = b"chunk payload";
        let sealed = seal(&key, plaintext).unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; 32], b"secret").unwrap();
        assert!(matches!(
            open(&[2u8; 32], &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let sealed = seal(&[1u8; 32], b"secret").unwrap();
        assert!(matches!(
            open(&[1u8; 32], &sealed[..NONCE_LEN + 3]),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_both_peers_derive_same_key() {
        let (_da, a_keys) = keystore();
        let (_db, b_keys) = keystore();

        let a_cache = SecretCache::new(a_keys.clone());
        let b_cache = SecretCache::new(b_keys.clone());

        let key_at_a = a_cache.shared_key("peer-b", &b_keys.encryption_public());
        let key_at_b = b_cache.shared_key("peer-a", &a_keys.encryption_public());
        assert_eq!(key_at_a, key_at_b);

        let sealed = seal(&key_at_a, b"cross-peer").unwrap();
        assert_eq!(open(&key_at_b, &sealed).unwrap(), b"cross-peer");
    }

    #[test]
    fn test_cache_hits_and_eviction() {
        let (_da, a_keys) = keystore();
        let (_db, b_keys) = keystore();
        let their_public = b_keys.encryption_public();

        let cache = SecretCache::with_capacity(a_keys, 2);
        let k1 = cache.shared_key("p1", &their_public);
        assert_eq!(cache.shared_key("p1", &their_public), k1);
        assert_eq!(cache.len(), 1);

        cache.shared_key("p2", &their_public);
        cache.shared_key("p3", &their_public);
        assert_eq!(cache.len(), 2);

        cache.invalidate("p3");
        assert_eq!(cache.len(), 1);
    }
}
