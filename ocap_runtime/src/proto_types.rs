//! Hand-written prost messages for the commit journal.
//!
//! One `ProtoCommit` per kernel commit, written as a length-prefixed frame.
//! Field tags are frozen: existing journals must stay readable.

use prost::Message;

// ── Commit Frame ──

#[derive(Clone, PartialEq, Message)]
pub struct ProtoCommit {
    /// Strictly increasing, starting at 1 for a fresh store.
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    /// SHA-256 over the full change set, lowercase hex.
    #[prost(string, tag = "2")]
    pub digest: String,
    /// Sorted by key.
    #[prost(message, repeated, tag = "3")]
    pub changes: Vec<ProtoChange>,
}

// ── Record Change ──

#[derive(Clone, PartialEq, Message)]
pub struct ProtoChange {
    #[prost(string, tag = "1")]
    pub key: String,
    /// Absent for a deletion.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub value: Option<Vec<u8>>,
}
