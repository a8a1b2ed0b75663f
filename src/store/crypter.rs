//! Field-level encryption for sensitive columns.
//!
//! The column key is derived once at startup via PBKDF2-SHA256 from the
//! deployment seed and a per-database random salt. Values are sealed with
//! the same XChaCha20-Poly1305 construction the channel layer uses, so each
//! stored value carries its own fresh random nonce and tag.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::crypto::{open, seal};
use crate::error::StoreError;

/// PBKDF2 iteration count for the column key.
pub const KDF_ITERATIONS: u32 = 150_000;

/// Length of the per-database salt.
pub const SALT_LEN: usize = 16;

/// Encrypts and decrypts individual column values.
#[derive(Clone)]
pub struct FieldCrypter {
    key: [u8; 32],
}

impl FieldCrypter {
    /// Derive the column key from the deployment seed and database salt.
    pub fn derive(seed: &str, salt: &[u8; SALT_LEN]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(seed.as_bytes(), salt, KDF_ITERATIONS, &mut key);
        Self { key }
    }

    /// Encrypt a value before it is bound as a query parameter.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        seal(&self.key, plaintext).map_err(|_| StoreError::Schema("field encryption failed".into()))
    }

    /// Decrypt a stored value. Ciphertext is never surfaced on failure.
    pub fn decrypt(&self, column: &'static str, stored: &[u8]) -> Result<Vec<u8>, StoreError> {
        open(&self.key, stored).map_err(|_| StoreError::FieldDecrypt(column))
    }

    /// Decrypt a stored value into a UTF-8 string.
    pub fn decrypt_string(
        &self,
        column: &'static str,
        stored: &[u8],
    ) -> Result<String, StoreError> {
        let bytes = self.decrypt(column, stored)?;
        String::from_utf8(bytes).map_err(|_| StoreError::FieldDecrypt(column))
    }
}

impl Drop for FieldCrypter {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
