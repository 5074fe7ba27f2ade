//! Snapshot codec: record sets <-> hex-valued JSON maps.
//!
//! Pure codec layer. No side-effects, no timestamps.
//!
//! - `encode_entries`: record set -> key -> lowercase hex value
//! - `decode_entries`: strict inverse, rejects non-hex input
//! - `restore_state`: decode records into a `KernelState` + invariant validation

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use ocap_kernel::encoding::{self, EncodingError};
use ocap_kernel::hashing::to_hex;
use ocap_kernel::invariants::{check_invariants, InvariantViolation};
use ocap_kernel::state::KernelState;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed snapshot value for {key}: {detail}")]
    Malformed { key: String, detail: String },
    #[error("snapshot {sequence} hash mismatch: recorded {recorded}, computed {computed}")]
    HashMismatch { sequence: u64, recorded: String, computed: String },
    #[error("snapshot written by kernel version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

pub fn encode_entries(entries: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    entries.iter().map(|(k, v)| (k.clone(), to_hex(v))).collect()
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

pub fn decode_entries(hexed: &BTreeMap<String, String>) -> Result<BTreeMap<String, Vec<u8>>, SnapshotError> {
    let mut out = BTreeMap::new();
    for (key, value) in hexed {
        let bytes = from_hex(value).map_err(|detail| SnapshotError::Malformed { key: key.clone(), detail })?;
        out.insert(key.clone(), bytes);
    }
    Ok(out)
}

/// Only lowercase hex is accepted, matching what `to_hex` produces.
fn from_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("odd length {}", s.len()));
    }
    fn nibble(c: u8) -> Result<u8, String> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            _ => Err(format!("bad hex digit {:?}", c as char)),
        }
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| -> Result<u8, String> { Ok(nibble(pair[0])? << 4 | nibble(pair[1])?) })
        .collect()
}

// ---------------------------------------------------------------------------
// Restore (decode + validate)
// ---------------------------------------------------------------------------

/// Decodes a record set and validates the kernel invariants. This is the
/// entry point for anything loaded from disk.
pub fn restore_state(entries: &BTreeMap<String, Vec<u8>>) -> Result<KernelState, SnapshotError> {
    let state = encoding::decode(entries)?;
    check_invariants(&state)?;
    Ok(state)
}
