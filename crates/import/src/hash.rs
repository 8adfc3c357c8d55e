use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::value::normalize_description;

/// Field separator inside the fingerprint preimage. A control character so
/// that no statement field can collide with the frame itself.
const SEP: char = '\u{1f}';

/// Content-address for one logical transaction, scoped to an owner and
/// institution. Case and whitespace variants of the description hash
/// identically.
pub fn row_fingerprint(
    owner_id: i64,
    institution: &str,
    date: NaiveDate,
    description: &str,
    amount: i64,
) -> String {
    let desc = normalize_description(description).to_lowercase();
    let preimage = format!(
        "{owner_id}{SEP}{institution}{SEP}{}{SEP}{desc}{SEP}{amount}",
        date.format("%Y-%m-%d")
    );
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest over an entire uploaded byte stream, for literal file
/// re-submission detection.
pub fn file_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
