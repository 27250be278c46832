use sha2::{Digest, Sha256};

/// Calculate SHA-256 checksum of text content.
pub fn calculate_checksum(content: &str) -> String {
    let hash = Sha256::digest(content.as_bytes());
    hex::encode(hash)
}
