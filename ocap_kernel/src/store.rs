//! Durable key/value store contract and an in-memory implementation.
//!
//! The kernel never writes partially: every crank produces one `ChangeSet`
//! that the store must apply atomically or not at all.

use std::collections::BTreeMap;

use thiserror::Error;

/// Key -> new value, or `None` to delete. Ordered so commits are deterministic.
pub type ChangeSet = BTreeMap<String, Option<Vec<u8>>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("commit rejected: {0}")]
    CommitFailed(String),
    #[error("corrupt record {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

pub trait DurableStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Applies all changes or none of them.
    fn commit(&mut self, changes: &ChangeSet) -> Result<(), StoreError>;

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut changes = ChangeSet::new();
        changes.insert(key.to_string(), Some(value.to_vec()));
        self.commit(&changes)
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let mut changes = ChangeSet::new();
        changes.insert(key.to_string(), None);
        self.commit(&changes)
    }

    /// Every entry, in key order.
    fn load_all(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let mut out = BTreeMap::new();
        for key in self.keys("")? {
            if let Some(value) = self.get(&key)? {
                out.insert(key, value);
            }
        }
        Ok(out)
    }
}

/// Applies a change set to an in-memory map.
pub fn apply_changes(data: &mut BTreeMap<String, Vec<u8>>, changes: &ChangeSet) {
    for (key, value) in changes {
        match value {
            Some(v) => {
                data.insert(key.clone(), v.clone());
            }
            None => {
                data.remove(key);
            }
        }
    }
}

/// In-memory store with commit failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: BTreeMap<String, Vec<u8>>,
    fail_commits: u32,
    commits: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` commits fail without touching the data.
    pub fn fail_next_commits(&mut self, n: u32) {
        self.fail_commits = n;
    }

    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.clone()
    }
}

impl DurableStore for MemoryStore {
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
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(StoreError::CommitFailed("injected failure".to_string()));
        }
        apply_changes(&mut self.data, changes);
        self.commits += 1;
        Ok(())
    }
}
