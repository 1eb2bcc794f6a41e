pub mod aggregate;
pub mod anomaly;
pub mod decoder;
pub mod filter;
pub mod grouper;
pub mod parser;
pub mod rules;
pub mod topk;

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a byte slice; identifies log file content.
pub fn content_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_string(&digest)
}

/// Stable finding fingerprint: first 16 bytes of
/// sha256(rule_id | site | subject | window_key), hex encoded.
pub fn finding_fingerprint(rule_id: &str, site_id: &str, subject: &str, window_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(b"|");
    hasher.update(site_id.as_bytes());
    hasher.update(b"|");
    hasher.update(subject.as_bytes());
    hasher.update(b"|");
    hasher.update(window_key.as_bytes());
    hex_string(&hasher.finalize()[..16])
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
