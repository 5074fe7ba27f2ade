#![forbid(unsafe_code)]

//! Durable runtime for `ocap_kernel`.
//!
//! A `Host` runs one kernel over a directory holding an append-only commit
//! journal and compaction snapshots. Replay rebuilds a host's state from
//! disk and checks its activity chain; the bridge links hosts' mailboxes.

pub mod proto_types;
pub mod proto_bridge;
pub mod snapshot_codec;
pub mod snapshot;
pub mod journal;
pub mod replay;
pub mod drift;
pub mod config;
pub mod host;
pub mod bridge;

pub use bridge::{Link, LinkFaults, LinkStats};
pub use config::{ConfigError, RuntimeConfig};
pub use host::{Host, HostError, SharedHost};
pub use journal::{FileStore, JournalError, JournalOptions};
pub use snapshot_codec::SnapshotError;
