//! Canonical hashing.
//!
//! - crank hash: SHA-256 over the sorted change set of one commit
//! - activity hash: SHA-256 chain `H(prev || crank_hash)` across commits
//! - state hash: SHA-256 over the full sorted record set
//!
//! All hashes are lowercase hex. Record values are length-prefixed so that
//! no two distinct change sets serialize to the same byte stream.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::store::ChangeSet;

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

fn feed_record(hasher: &mut Sha256, key: &str, value: Option<&[u8]>) {
    hasher.update((key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    match value {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v);
        }
        None => hasher.update([0u8]),
    }
}

/// Hash of one commit's changes. Callers leave out the metadata record,
/// which embeds the resulting hash.
pub fn crank_hash(changes: &ChangeSet) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in changes {
        feed_record(&mut hasher, key, value.as_deref());
    }
    to_hex(&hasher.finalize())
}

/// Next link of the activity chain.
pub fn chain(previous: &str, crank_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(crank_hash.as_bytes());
    to_hex(&hasher.finalize())
}

/// Hash of a complete record set.
pub fn state_hash(entries: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        feed_record(&mut hasher, key, Some(value));
    }
    to_hex(&hasher.finalize())
}
