//! Content hashing for chunk verification and duplicate detection.
//!
//! SHA-256 as lowercase hex. Kept off the hot path: chunk hashes are
//! computed only when verification is enabled.

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a byte sub-range `[start, end)` of `data`, clamped to bounds.
pub fn sha256_range(data: &[u8], start: u64, end: u64) -> String {
    let len = data.len() as u64;
    let start = start.min(len) as usize;
    let end = end.min(len) as usize;
    sha256_bytes(&data[start..end.max(start)])
}
