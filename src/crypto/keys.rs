//! Long-term key material.
//!
//! Two keypairs live under `<home>/keys/`: an Ed25519 signing pair that is
//! the peer's identity, and an X25519 pair used only for channel encryption.
//! Private files are owner read/write only. Key bytes never leave this
//! module; signing and key agreement take inputs and return outputs.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::identity::peer_id_hash_from_key;
use crate::error::CryptoError;

const SIGNING_PUBLIC: &str = "signing_public.key";
const SIGNING_PRIVATE: &str = "signing_private.key";
const ENCRYPTION_PUBLIC: &str = "public.key";
const ENCRYPTION_PRIVATE: &str = "private.key";

/// Owner of the peer's private key material.
pub struct KeyStore {
    signing: SigningKey,
    encryption: StaticSecret,
    peer_id_hash: String,
}

impl KeyStore {
    /// Load the keypairs from `dir`, generating and persisting fresh ones
    /// atomically on first use.
    pub fn open(dir: &Path) -> Result<Self, CryptoError> {
        fs::create_dir_all(dir)?;

        let signing = match load_key_bytes(&dir.join(SIGNING_PRIVATE))? {
            Some(bytes) => SigningKey::from_bytes(&bytes),
            None => {
                let key = SigningKey::generate(&mut OsRng);
                persist_keypair(
                    dir,
                    SIGNING_PRIVATE,
                    SIGNING_PUBLIC,
                    &key.to_bytes(),
                    key.verifying_key().as_bytes(),
                )?;
                key
            }
        };

        let encryption = match load_key_bytes(&dir.join(ENCRYPTION_PRIVATE))? {
            Some(bytes) => StaticSecret::from(bytes),
            None => {
                let secret = StaticSecret::random_from_rng(OsRng);
                let public = X25519Public::from(&secret);
                persist_keypair(
                    dir,
                    ENCRYPTION_PRIVATE,
                    ENCRYPTION_PUBLIC,
                    &secret.to_bytes(),
                    public.as_bytes(),
                )?;
                secret
            }
        };

        let peer_id_hash = peer_id_hash_from_key(signing.verifying_key().as_bytes());
        tracing::info!(peer_id_hash = %peer_id_hash, "key material ready");

        Ok(Self {
            signing,
            encryption,
            peer_id_hash,
        })
    }

    /// The stable handle derived from the signing public key.
    pub fn peer_id_hash(&self) -> &str {
        &self.peer_id_hash
    }

    /// The signing public key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The encryption (X25519) public key bytes.
    pub fn encryption_public(&self) -> [u8; 32] {
        X25519Public::from(&self.encryption).to_bytes()
    }

    /// Produce a detached Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Raw X25519 agreement with a counterparty public key. The output
    /// feeds HKDF in the encryption layer and is not a usable key by itself.
    pub(crate) fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let public = X25519Public::from(*their_public);
        self.encryption.diffie_hellman(&public).to_bytes()
    }
}

fn load_key_bytes(path: &Path) -> Result<Option<[u8; 32]>, CryptoError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut encoded = fs::read_to_string(path)?;
    let decoded = hex::decode(encoded.trim())
        .map_err(|_| CryptoError::KeyFormat(format!("{} is not hex", path.display())))?;
    encoded.zeroize();
    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| CryptoError::KeyFormat(format!("{} has wrong length", path.display())))?;
    Ok(Some(bytes))
}

/// Write both halves of a keypair, private first, using tmp + rename so a
/// crash never leaves a partial key on disk.
fn persist_keypair(
    dir: &Path,
    private_name: &str,
    public_name: &str,
    private_bytes: &[u8; 32],
    public_bytes: &[u8; 32],
) -> Result<(), CryptoError> {
    write_key_file(&dir.join(private_name), private_bytes, true)?;
    write_key_file(&dir.join(public_name), public_bytes, false)?;
    Ok(())
}

fn write_key_file(path: &Path, bytes: &[u8; 32], private: bool) -> Result<(), CryptoError> {
    let tmp: PathBuf = path.with_extension("tmp");
    let mut encoded = hex::encode(bytes);
    fs::write(&tmp, encoded.as_bytes())?;
    encoded.zeroize();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_then_reload_same_identity() {
        let dir = tempdir().unwrap();

        let first = KeyStore::open(dir.path()).unwrap();
        let hash = first.peer_id_hash().to_string();
        drop(first);

        let second = KeyStore::open(dir.path()).unwrap();
        assert_eq!(second.peer_id_hash(), hash);
    }

    #[test]
    fn test_peer_id_hash_is_sixteen_hex_chars() {
        let dir = tempdir().unwrap();
        let keys = KeyStore::open(dir.path()).unwrap();
        assert_eq!(keys.peer_id_hash().len(), 16);
        assert!(keys.peer_id_hash().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let _keys = KeyStore::open(dir.path()).unwrap();

        let meta = std::fs::metadata(dir.path().join(SIGNING_PRIVATE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let meta = std::fs::metadata(dir.path().join(SIGNING_PUBLIC)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_dh_is_symmetric() {
        let a_dir = tempdir().unwrap();
        let b_dir = tempdir().unwrap();
        let a = KeyStore::open(a_dir.path()).unwrap();
        let b = KeyStore::open(b_dir.path()).unwrap();

        let ab = a.diffie_hellman(&b.encryption_public());
        let ba = b.diffie_hellman(&a.encryption_public());
        assert_eq!(ab, ba);
    }
}
