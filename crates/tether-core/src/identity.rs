//! Host identity fingerprints.
//!
//! Fingerprints use the OpenSSH display format: `SHA256:` followed by the
//! unpadded base64 of the SHA-256 digest of the key's wire encoding, so
//! they can be compared by eye against `ssh-keygen -lf` output.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

const PREFIX: &str = "SHA256:";

/// Compute the fingerprint of a server key from its wire encoding.
pub fn fingerprint(key_blob: &[u8]) -> String {
    let hash = Sha256::digest(key_blob);
    format!("{PREFIX}{}", STANDARD_NO_PAD.encode(hash))
}

/// Abbreviated fingerprint for display (algorithm prefix plus 12 digest chars).
pub fn short_fingerprint(fp: &str) -> &str {
    let len = (PREFIX.len() + 12).min(fp.len());
    // Fingerprints are ASCII, but stored values may come from a hand-edited file.
    match fp.get(..len) {
        Some(short) => short,
        None => fp,
    }
}
