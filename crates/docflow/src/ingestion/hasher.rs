//! Content fingerprints for deduplication

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the raw bytes
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
