//! Snapshot layer: full record-set snapshots used to compact the journal.
//!
//! A snapshot holds every record at a journal sequence plus the canonical
//! state hash of those records. No timestamps in snapshot content.
//!
//! Files are written to a temporary name, fsynced, then renamed, so a
//! crash never leaves a half-written `snapshot_NNNNNNNNNN.json`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use ocap_kernel::hashing::state_hash;
use ocap_kernel::KERNEL_VERSION;

use crate::snapshot_codec::{decode_entries, encode_entries, SnapshotError};

/// Snapshot on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    /// Journal sequence the snapshot was taken at.
    pub sequence: u64,
    pub kernel_version: u32,
    /// `state_hash` of the decoded records.
    pub hash: String,
    /// Record values, lowercase hex.
    pub entries: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn capture(sequence: u64, entries: &BTreeMap<String, Vec<u8>>) -> Self {
        Snapshot {
            sequence,
            kernel_version: KERNEL_VERSION,
            hash: state_hash(entries),
            entries: encode_entries(entries),
        }
    }

    /// Decoded records, after checking version and hash.
    pub fn records(&self) -> Result<BTreeMap<String, Vec<u8>>, SnapshotError> {
        if self.kernel_version != KERNEL_VERSION {
            return Err(SnapshotError::VersionMismatch { found: self.kernel_version, expected: KERNEL_VERSION });
        }
        let entries = decode_entries(&self.entries)?;
        let computed = state_hash(&entries);
        if computed != self.hash {
            return Err(SnapshotError::HashMismatch {
                sequence: self.sequence,
                recorded: self.hash.clone(),
                computed,
            });
        }
        Ok(entries)
    }
}

fn snapshot_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("snapshot_{:010}.json", sequence))
}

fn parse_sequence(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("snapshot_")
        .and_then(|s| s.strip_suffix(".json"))
        .and_then(|s| s.parse().ok())
}

/// Writes a snapshot of `entries` taken at `sequence`.
pub fn save_snapshot(dir: &Path, sequence: u64, entries: &BTreeMap<String, Vec<u8>>) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(dir)?;
    let snap = Snapshot::capture(sequence, entries);
    let content = serde_json::to_vec(&snap)?;

    let path = snapshot_path(dir, sequence);
    let tmp = dir.join(format!(".snapshot_{:010}.tmp", sequence));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    debug!("saved snapshot at sequence {} ({} records)", sequence, entries.len());
    Ok(path)
}

/// Loads the snapshot taken at `sequence`, if any.
pub fn load_snapshot(dir: &Path, sequence: u64) -> Result<Option<Snapshot>, SnapshotError> {
    let path = snapshot_path(dir, sequence);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&content)?))
}

/// Sequences of every snapshot in `dir`, ascending.
pub fn list_snapshots(dir: &Path) -> Result<Vec<u64>, SnapshotError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(seq) = parse_sequence(&entry.file_name().to_string_lossy()) {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

pub fn load_latest_snapshot(dir: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    match list_snapshots(dir)?.last() {
        Some(seq) => load_snapshot(dir, *seq),
        None => Ok(None),
    }
}

/// Deletes every snapshot older than `keep_from`.
pub fn prune_snapshots(dir: &Path, keep_from: u64) -> Result<usize, SnapshotError> {
    let mut removed = 0;
    for seq in list_snapshots(dir)? {
        if seq < keep_from {
            fs::remove_file(snapshot_path(dir, seq))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// True if the recorded hash matches the snapshot content.
pub fn verify_snapshot_hash(snap: &Snapshot) -> bool {
    match decode_entries(&snap.entries) {
        Ok(entries) => state_hash(&entries) == snap.hash,
        Err(_) => false,
    }
}
