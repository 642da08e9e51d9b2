//! Fingerprints of applied settings.
//!
//! A fingerprint is the SHA-256 of the JSON serialization of the argument values passed to
//! a setter. The ledger stores the fingerprint of every confirmed Wire/Configure call so a
//! later plan can tell whether the on-chain value already matches the desired one.

use sha2::{Digest, Sha256};

use crate::ArgValue;

/// Compute the fingerprint of a setter's argument list.
///
/// The fingerprint is deterministic: the same values always produce the same hex string.
pub fn fingerprint(args: &[ArgValue]) -> String {
    let mut hasher = Sha256::new();
    for arg in args {
        // ArgValue only contains plain data; serialization cannot fail.
        let json = serde_json::to_vec(arg).unwrap_or_default();
        hasher.update((json.len() as u64).to_be_bytes());
        hasher.update(&json);
    }
    hex::encode(hasher.finalize())
}
