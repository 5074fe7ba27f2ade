#![forbid(unsafe_code)]

//! Deterministic object-capability kernel.
//!
//! Vats exchange eventual sends and promises through a single FIFO
//! run-queue. Each crank delivers one item and commits its effects to a
//! `DurableStore` as one atomic change set; peer kernels are reached
//! through per-peer c-lists and an acknowledged mailbox.

/// Version of the persisted record layout.
pub const KERNEL_VERSION: u32 = 1;

pub mod slots;
pub mod message;
pub mod clist;
pub mod mailbox;
pub mod promises;
pub mod store;
pub mod state;
pub mod encoding;
pub mod hashing;
pub mod invariants;
pub mod vat;
pub mod comms;
pub mod gc;
pub mod plugin;
pub mod weak;
pub mod virtual_objects;
pub mod options;
pub mod kernel;

pub use kernel::{CrankBudget, CrankOutcome, CrankPhase, CrankReport, InboundHandler, Kernel, KernelError, RunForever, RunPolicy};
pub use message::{CapData, Message, Outcome, RejectionReason};
pub use options::{KernelOptions, VatOptions};
pub use promises::{PromiseStatus, Subscriber};
pub use slots::{KernelSlot, PeerId, SlotKind, VatId, VatSlot, WireRole, WireSlot};
pub use store::{ChangeSet, DurableStore, MemoryStore, StoreError};
pub use vat::{vat_fn, Vat, VatDelivery, VatError, VatStore, VatSyscalls};
pub use virtual_objects::{VirtualObjectId, VirtualObjectManager, VomError};
pub use weak::{StrongRef, WeakHandle, WeakMode};
