//! Replay: rebuild kernel state from a store directory.
//!
//! Read-only. Starts from the latest snapshot, applies every journal frame
//! after it and re-derives the activity chain from the change sets, so a
//! journal whose frames were altered, reordered or dropped is caught even
//! when each frame is individually well-formed.

use std::collections::BTreeMap;
use std::path::Path;

use ocap_kernel::encoding::{EncodingError, META_KEY};
use ocap_kernel::hashing::{chain, crank_hash, state_hash};
use ocap_kernel::state::{KernelMeta, KernelState, GENESIS_HASH};
use ocap_kernel::store::apply_changes;

use crate::journal::{read_journal, JournalError, JOURNAL_FILE, SNAPSHOT_DIR};
use crate::proto_bridge::proto_to_changes;
use crate::proto_types::ProtoCommit;
use crate::snapshot;
use crate::snapshot_codec::restore_state;

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub state: KernelState,
    pub entries: BTreeMap<String, Vec<u8>>,
    pub state_hash: String,
    pub activity_hash: String,
    /// Journal sequence of the last applied commit.
    pub sequence: u64,
    pub commits_replayed: u64,
}

/// Replays the store in `dir`. A torn final frame is ignored, as the store
/// itself would on open.
pub fn replay_dir(dir: &Path, max_frame_len: usize) -> Result<ReplayOutcome, JournalError> {
    let (base, start) = match snapshot::load_latest_snapshot(&dir.join(SNAPSHOT_DIR))? {
        Some(snap) => (snap.records()?, snap.sequence),
        None => (BTreeMap::new(), 0),
    };
    let contents = read_journal(&dir.join(JOURNAL_FILE), max_frame_len)?;
    let frames: Vec<ProtoCommit> = contents.frames.into_iter().filter(|f| f.sequence > start).collect();
    replay_commits(base, start, &frames)
}

/// Applies `commits` on top of `base` (taken at journal sequence `start`),
/// checking sequence continuity and the activity chain.
pub fn replay_commits(
    base: BTreeMap<String, Vec<u8>>,
    start: u64,
    commits: &[ProtoCommit],
) -> Result<ReplayOutcome, JournalError> {
    let mut entries = base;
    let mut activity = match entries.get(META_KEY) {
        Some(bytes) => decode_meta(bytes)?.activity_hash,
        None => GENESIS_HASH.to_string(),
    };
    let mut sequence = start;

    for commit in commits {
        if commit.sequence != sequence + 1 {
            return Err(JournalError::SequenceGap { expected: sequence + 1, found: commit.sequence });
        }
        let mut changes = proto_to_changes(commit);
        let meta = match changes.remove(META_KEY) {
            Some(Some(bytes)) => decode_meta(&bytes)?,
            _ => return Err(JournalError::MissingMeta { sequence: commit.sequence }),
        };
        let crank = crank_hash(&changes);
        let expected = chain(&activity, &crank);
        if meta.activity_hash != expected || meta.last_crank_hash != crank {
            return Err(JournalError::ChainBroken {
                sequence: commit.sequence,
                expected,
                recorded: meta.activity_hash,
            });
        }
        activity = expected;
        apply_changes(&mut entries, &proto_to_changes(commit));
        sequence = commit.sequence;
    }

    let state = restore_state(&entries)?;
    Ok(ReplayOutcome {
        state,
        state_hash: state_hash(&entries),
        entries,
        activity_hash: activity,
        sequence,
        commits_replayed: commits.len() as u64,
    })
}

/// Replays `dir` and returns only the canonical state hash.
pub fn rebuild_hash(dir: &Path, max_frame_len: usize) -> Result<String, JournalError> {
    Ok(replay_dir(dir, max_frame_len)?.state_hash)
}

fn decode_meta(bytes: &[u8]) -> Result<KernelMeta, JournalError> {
    serde_json::from_slice(bytes).map_err(|e| {
        JournalError::Encoding(EncodingError::Decode {
            key: META_KEY.to_string(),
            detail: e.to_string(),
        })
    })
}
