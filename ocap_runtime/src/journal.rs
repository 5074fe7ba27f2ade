//! Append-only commit journal: a file-backed `DurableStore`.
//!
//! Storage format: length-prefixed protobuf frames, one per commit.
//!   [4-byte LE length][ProtoCommit bytes][4-byte LE length][ProtoCommit bytes]...
//!
//! Rules:
//!   - append only; a frame is never rewritten in place
//!   - fsync after every commit, before the commit is reported
//!   - sequence strictly increasing and gap-free
//!   - a torn final frame (crash mid-write) is cut off at open
//!   - every `snapshot_interval` commits the record set is snapshotted and
//!     the journal restarts empty

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use prost::Message;
use thiserror::Error;

use ocap_kernel::encoding::EncodingError;
use ocap_kernel::invariants::InvariantViolation;
use ocap_kernel::store::apply_changes;
use ocap_kernel::{ChangeSet, DurableStore, StoreError};

use crate::proto_bridge::{changes_to_proto, digest_matches, proto_to_changes};
use crate::proto_types::ProtoCommit;
use crate::snapshot::{self, Snapshot};
use crate::snapshot_codec::SnapshotError;

pub const JOURNAL_FILE: &str = "journal.log";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame length {len} at offset {offset} (max {max})")]
    FrameLength { offset: u64, len: usize, max: usize },
    #[error("undecodable frame at offset {offset}: {detail}")]
    Decode { offset: u64, detail: String },
    #[error("frame {sequence} digest does not match its changes")]
    DigestMismatch { sequence: u64 },
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("commit {sequence} carries no kernel metadata")]
    MissingMeta { sequence: u64 },
    #[error("activity chain broken at commit {sequence}: expected {expected}, recorded {recorded}")]
    ChainBroken { sequence: u64, expected: String, recorded: String },
    #[error("injected commit failure")]
    Injected,
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl From<JournalError> for StoreError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Io(e) => StoreError::Io(e),
            other => StoreError::CommitFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalOptions {
    /// Commits between compactions; 0 disables automatic compaction.
    pub snapshot_interval: u64,
    pub max_frame_len: usize,
}

impl Default for JournalOptions {
    fn default() -> Self {
        JournalOptions { snapshot_interval: 0, max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}

/// Frames read from a journal file, plus where the valid prefix ends.
#[derive(Debug, Default)]
pub struct JournalContents {
    pub frames: Vec<ProtoCommit>,
    pub valid_len: u64,
    pub file_len: u64,
}

impl JournalContents {
    pub fn is_torn(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Reads every complete frame. A truncated final frame ends the read
/// without error; anything else malformed is an error.
pub fn read_journal(path: &Path, max_frame_len: usize) -> Result<JournalContents, JournalError> {
    if !path.exists() {
        return Ok(JournalContents::default());
    }
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut contents = JournalContents { file_len, ..Default::default() };
    let mut len_buf = [0u8; 4];

    loop {
        let offset = contents.valid_len;
        if file_len - offset < 4 {
            break;
        }
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > max_frame_len {
            return Err(JournalError::FrameLength { offset, len, max: max_frame_len });
        }
        if file_len - offset - 4 < len as u64 {
            break;
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame)?;
        let commit = ProtoCommit::decode(frame.as_slice())
            .map_err(|e| JournalError::Decode { offset, detail: e.to_string() })?;
        if !digest_matches(&commit) {
            return Err(JournalError::DigestMismatch { sequence: commit.sequence });
        }
        contents.frames.push(commit);
        contents.valid_len = offset + 4 + len as u64;
    }
    Ok(contents)
}

/// File-backed store: the latest snapshot plus the journal written since.
pub struct FileStore {
    journal_path: PathBuf,
    snapshot_dir: PathBuf,
    data: BTreeMap<String, Vec<u8>>,
    last_sequence: u64,
    journal_len: u64,
    options: JournalOptions,
    fail_commits: u32,
}

impl FileStore {
    /// Opens or creates a store in `dir`.
    ///
    /// Layout:
    ///   <dir>/journal.log
    ///   <dir>/snapshots/snapshot_NNNNNNNNNN.json
    pub fn open(dir: &Path, options: JournalOptions) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        let journal_path = dir.join(JOURNAL_FILE);
        let snapshot_dir = dir.join(SNAPSHOT_DIR);

        let (mut data, mut last_sequence) = match snapshot::load_latest_snapshot(&snapshot_dir)? {
            Some(snap) => (snap.records()?, snap.sequence),
            None => (BTreeMap::new(), 0),
        };
        let base = last_sequence;

        let contents = read_journal(&journal_path, options.max_frame_len)?;
        if contents.is_torn() {
            warn!(
                "journal {}: cutting torn tail at {} of {} bytes",
                journal_path.display(),
                contents.valid_len,
                contents.file_len
            );
            OpenOptions::new().write(true).open(&journal_path)?.set_len(contents.valid_len)?;
        }
        for frame in &contents.frames {
            // left behind by a compaction interrupted before the journal reset
            if frame.sequence <= base {
                continue;
            }
            if frame.sequence != last_sequence + 1 {
                return Err(JournalError::SequenceGap { expected: last_sequence + 1, found: frame.sequence });
            }
            apply_changes(&mut data, &proto_to_changes(frame));
            last_sequence = frame.sequence;
        }
        info!(
            "opened store {} at sequence {} ({} from snapshot, {} records)",
            dir.display(),
            last_sequence,
            base,
            data.len()
        );

        Ok(FileStore {
            journal_path,
            snapshot_dir,
            data,
            last_sequence,
            journal_len: contents.valid_len,
            options,
            fail_commits: 0,
        })
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn options(&self) -> JournalOptions {
        self.options
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }

    /// The next `n` commits fail before anything is written.
    pub fn fail_next_commits(&mut self, n: u32) {
        self.fail_commits = n;
    }

    /// Snapshots the current records and restarts the journal empty.
    pub fn compact(&mut self) -> Result<u64, JournalError> {
        snapshot::save_snapshot(&self.snapshot_dir, self.last_sequence, &self.data)?;
        let file = File::create(&self.journal_path)?;
        file.sync_all()?;
        self.journal_len = 0;
        let pruned = snapshot::prune_snapshots(&self.snapshot_dir, self.last_sequence)?;
        debug!("compacted at sequence {} (pruned {} old snapshots)", self.last_sequence, pruned);
        Ok(self.last_sequence)
    }

    /// The latest snapshot on disk, if any.
    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>, JournalError> {
        Ok(snapshot::load_latest_snapshot(&self.snapshot_dir)?)
    }

    fn append(&mut self, changes: &ChangeSet) -> Result<(), JournalError> {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(JournalError::Injected);
        }
        let sequence = self.last_sequence + 1;
        let buf = changes_to_proto(sequence, changes).encode_to_vec();
        if buf.len() > self.options.max_frame_len {
            return Err(JournalError::FrameLength {
                offset: self.journal_len,
                len: buf.len(),
                max: self.options.max_frame_len,
            });
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.journal_path)?;
        let written = write_frame(&mut file, &buf);
        if let Err(e) = written {
            // leave no partial frame for the next append to land behind
            if let Err(cut) = file.set_len(self.journal_len) {
                warn!("journal {}: cannot cut failed append: {}", self.journal_path.display(), cut);
            }
            return Err(e.into());
        }

        self.journal_len += 4 + buf.len() as u64;
        self.last_sequence = sequence;
        apply_changes(&mut self.data, changes);
        Ok(())
    }
}

fn write_frame(file: &mut File, buf: &[u8]) -> io::Result<()> {
    {
        let mut writer = BufWriter::new(&mut *file);
        writer.write_all(&(buf.len() as u32).to_le_bytes())?;
        writer.write_all(buf)?;
        writer.flush()?;
    }
    file.sync_all()
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.get(key).cloned())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn commit(&mut self, changes: &ChangeSet) -> Result<(), StoreError> {
        self.append(changes)?;
        let interval = self.options.snapshot_interval;
        if interval > 0 && self.last_sequence % interval == 0 {
            // the commit is already durable; a failed compaction only costs replay time
            if let Err(e) = self.compact() {
                warn!("compaction at sequence {} failed: {}", self.last_sequence, e);
            }
        }
        Ok(())
    }

    fn load_all(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        Ok(self.data.clone())
    }
}
