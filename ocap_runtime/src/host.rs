//! Hosts: one kernel over one journal directory.
//!
//! Each host gets its own directory under the configured `data_dir`.
//! Concurrency: `SharedHost` serializes every entry point behind a mutex,
//! so mailbox deliveries and cranks never interleave.
//!
//! Order of a mailbox delivery:
//!   1. the kernel accepts the batch on a copy of its state
//!   2. the journal appends and fsyncs the resulting commit
//!   3. only then is the copy installed as the live state

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;
use thiserror::Error;

use ocap_kernel::hashing::state_hash;
use ocap_kernel::mailbox::{InboundReceipt, OutboundBatch};
use ocap_kernel::slots::SlotError;
use ocap_kernel::{InboundHandler, Kernel, KernelError, PeerId, Vat, VatId};

use crate::config::RuntimeConfig;
use crate::journal::{FileStore, JournalError};
use crate::replay::{self, ReplayOutcome};

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("invalid host name: {0}")]
    Name(#[from] SlotError),
    #[error("host lock poisoned")]
    Poisoned,
    #[error("replay of {host} diverged: live {live}, replayed {replayed}")]
    ReplayMismatch { host: String, live: String, replayed: String },
    #[error("hosts did not quiesce within {rounds} rounds")]
    NoQuiescence { rounds: usize },
}

/// A kernel bound to its journal directory.
pub struct Host {
    name: PeerId,
    dir: PathBuf,
    config: RuntimeConfig,
    kernel: Kernel<FileStore>,
}

impl Host {
    /// Opens (or creates) the host `name` under `config.data_dir`, replaying
    /// whatever its journal holds. Vats must be re-attached afterwards.
    pub fn open(config: &RuntimeConfig, name: &str) -> Result<Self, HostError> {
        let name = PeerId::new(name)?;
        let dir = config.data_dir.join(name.as_str());
        let store = FileStore::open(&dir, config.journal_options())?;
        let mut kernel = Kernel::open(store, config.kernel.clone())?;
        kernel.register_inbound_handler(InboundHandler::Comms)?;
        info!("host {} up at crank {}", name, kernel.crank_number());
        Ok(Host { name, dir, config: config.clone(), kernel })
    }

    pub fn name(&self) -> &PeerId {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel<FileStore> {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel<FileStore> {
        &mut self.kernel
    }

    /// Creates the vat on first boot, re-attaches it on later ones.
    pub fn ensure_vat(&mut self, name: &str, behavior: Box<dyn Vat>) -> Result<VatId, HostError> {
        let id = match self.kernel.vat_id(name) {
            Some(_) => self.kernel.attach_vat(name, behavior)?,
            None => self.kernel.create_vat(name, behavior)?,
        };
        Ok(id)
    }

    pub fn run_until_idle(&mut self) -> Result<u64, HostError> {
        Ok(self.kernel.run_until_idle()?)
    }

    pub fn deliver_inbound(
        &mut self,
        from: &PeerId,
        messages: Vec<(u64, Vec<u8>)>,
        ack: u64,
    ) -> Result<InboundReceipt, HostError> {
        Ok(self.kernel.deliver_inbound(from, messages, ack)?)
    }

    pub fn outbound(&self, to: &PeerId) -> OutboundBatch {
        self.kernel.outbound(to)
    }

    pub fn activity_hash(&self) -> String {
        self.kernel.activity_hash().to_string()
    }

    /// Canonical hash of every committed record.
    pub fn state_hash(&self) -> String {
        state_hash(self.kernel.store().entries())
    }

    /// Journal sequence of the last commit.
    pub fn sequence(&self) -> u64 {
        self.kernel.store().last_sequence()
    }

    pub fn compact(&mut self) -> Result<u64, HostError> {
        Ok(self.kernel.store_mut().compact()?)
    }

    /// Replays the journal from disk and checks it reproduces the live state.
    pub fn verify_replay(&self) -> Result<ReplayOutcome, HostError> {
        let outcome = replay::replay_dir(&self.dir, self.config.max_frame_len)?;
        let live = self.state_hash();
        if outcome.state_hash != live {
            return Err(HostError::ReplayMismatch {
                host: self.name.to_string(),
                live,
                replayed: outcome.state_hash,
            });
        }
        if outcome.activity_hash != self.kernel.activity_hash() {
            return Err(HostError::ReplayMismatch {
                host: self.name.to_string(),
                live: self.activity_hash(),
                replayed: outcome.activity_hash,
            });
        }
        Ok(outcome)
    }
}

/// Thread-safe host handle.
#[derive(Clone)]
pub struct SharedHost {
    inner: Arc<Mutex<Host>>,
}

impl SharedHost {
    pub fn new(host: Host) -> Self {
        SharedHost { inner: Arc::new(Mutex::new(host)) }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Host>, HostError> {
        self.inner.lock().map_err(|_| HostError::Poisoned)
    }

    /// Runs `f` with the host locked.
    pub fn with<T>(&self, f: impl FnOnce(&mut Host) -> Result<T, HostError>) -> Result<T, HostError> {
        let mut host = self.lock()?;
        f(&mut host)
    }

    pub fn name(&self) -> Result<PeerId, HostError> {
        Ok(self.lock()?.name().clone())
    }

    pub fn deliver_inbound(
        &self,
        from: &PeerId,
        messages: Vec<(u64, Vec<u8>)>,
        ack: u64,
    ) -> Result<InboundReceipt, HostError> {
        self.lock()?.deliver_inbound(from, messages, ack)
    }

    pub fn outbound(&self, to: &PeerId) -> Result<OutboundBatch, HostError> {
        Ok(self.lock()?.outbound(to))
    }

    pub fn run_until_idle(&self) -> Result<u64, HostError> {
        self.lock()?.run_until_idle()
    }

    pub fn activity_hash(&self) -> Result<String, HostError> {
        Ok(self.lock()?.activity_hash())
    }

    pub fn state_hash(&self) -> Result<String, HostError> {
        Ok(self.lock()?.state_hash())
    }
}
