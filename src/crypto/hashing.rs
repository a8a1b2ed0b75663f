//! SHA-256 content hashing.
//!
//! Every chunk and file is identified by its SHA-256 digest, which drives
//! integrity verification on both ends of a transfer and the proof-of-storage
//! challenges.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// A SHA-256 digest of chunk or file content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute the digest of a byte slice.
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.to_hex()[..8])
    }
}

/// Hash a file by streaming it in 64 KiB reads.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash(hasher.finalize().into()))
}

/// Verify that data matches its claimed hash.
pub fn verify_data(expected: &ContentHash, data: &[u8]) -> bool {
    ContentHash::from_data(data) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_same_content_same_hash() {
        let data = b"test data";
        assert_eq!(ContentHash::from_data(data), ContentHash::from_data(data));
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(
            ContentHash::from_data(b"data1"),
            ContentHash::from_data(b"data2")
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = ContentHash::from_data(b"test");
        let parsed = ContentHash::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_known_vector() {
        // SHA-256 of the empty string.
        let empty = ContentHash::from_data(b"");
        assert_eq!(
            empty.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_hash_matches_slice_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data = vec![7u8; 200_000];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        assert_eq!(hash_file(&path).unwrap(), ContentHash::from_data(&data));
    }
}
