//! Integrity: SHA-256 hex digests for chunks and Merkle nodes.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Hash a buffer. Returns the lowercase 64-character hex digest.
pub fn hash_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Hash of an internal Merkle node: digest of the two child hex strings, left then right.
pub fn combine_hex(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a payload against an expected hex hash. Comparison is case-sensitive.
pub fn verify_chunk(payload: &[u8], expected_hash: &str) -> bool {
    hash_hex(payload) == expected_hash
}

/// True if `s` has the shape of a hex digest (64 ASCII hex digits).
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
