//! The kernel: owns all state, runs cranks, commits them atomically.
//!
//! A crank pops the oldest run-queue item, works on a copy of the state,
//! delivers to at most one vat, and then commits the difference between the
//! copy and the last committed record set as a single change set. Only
//! after the store accepted the change set does the copy become the
//! kernel's state, so a failed commit leaves the kernel exactly at the
//! previous crank boundary.
//!
//! Every external input (queued messages, mailbox traffic, plugin
//! responses, vat lifecycle calls) goes through the same commit bracket.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::clist::ClistError;
use crate::comms::{self, CommsError, InboundEffect};
use crate::encoding::{self, EncodingError, META_KEY};
use crate::gc;
use crate::hashing;
use crate::invariants::{check_invariants, InvariantViolation};
use crate::mailbox::{InboundReceipt, MailboxDevice, MailboxError, OutboundBatch};
use crate::message::{CapData, Message, Outcome, RejectionReason};
use crate::options::{KernelOptions, VatOptions};
use crate::plugin::{ChannelStatus, PluginError, PluginHost, PluginDevice};
use crate::promises::{Decider, PromiseError, PromiseState, PromiseStatus, Subscriber};
use crate::slots::{KernelSlot, PeerId, SlotError, SlotKind, VatId, VatSlot, WireRole, WireSlot};
use crate::state::{KernelState, Owner, RunQueueItem, VatRecord, VatState, VatStatus};
use crate::store::{DurableStore, StoreError};
use crate::vat::{Syscall, SyscallLog, Vat, VatDelivery, VatError, VatSyscalls};
use crate::virtual_objects::{VirtualObjectManager, VomError};
use crate::clist::VatClist;
use crate::plugin::PluginChannelRecord;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel is already inside a crank")]
    Reentrancy,
    #[error("commit failed, crank aborted: {0}")]
    Commit(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Promise(#[from] PromiseError),
    #[error(transparent)]
    Clist(#[from] ClistError),
    #[error(transparent)]
    Comms(#[from] CommsError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    VirtualObject(#[from] VomError),
    #[error("unknown vat {0}")]
    UnknownVat(String),
    #[error("vat {0} already exists")]
    DuplicateVat(String),
    #[error("vat {0} has no behavior attached")]
    VatNotAttached(VatId),
    #[error("vat {0} is terminated")]
    VatTerminated(VatId),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrankPhase {
    Idle,
    Delivering,
    Committing,
}

/// Where the mailbox hands inbound payloads. Process-local, registered at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundHandler {
    /// Decode payloads as wire messages and route them through the c-lists.
    Comms,
    /// Hand raw payloads to a vat.
    Vat(VatId),
}

/// What one crank did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrankOutcome {
    Delivered { vat: VatId },
    VatFailed { vat: VatId, reason: String },
    /// Parked on an unresolved promise.
    Queued { promise: KernelSlot },
    /// Handed to a peer through the mailbox.
    Forwarded { peer: PeerId },
    /// The result promise was rejected instead.
    Splatted { reason: String },
    Inbound { peer: PeerId, effect: String },
    /// Nothing to deliver to (dead vat, unknown reference).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankReport {
    pub crank_number: u64,
    pub crank_hash: String,
    pub outcome: CrankOutcome,
}

/// Decides after every crank whether `run` continues.
pub trait RunPolicy {
    fn crank_complete(&mut self, report: &CrankReport) -> bool;
}

/// Runs until the run-queue is empty.
pub struct RunForever;

impl RunPolicy for RunForever {
    fn crank_complete(&mut self, _report: &CrankReport) -> bool {
        true
    }
}

/// Stops after a fixed number of cranks.
pub struct CrankBudget(pub u64);

impl RunPolicy for CrankBudget {
    fn crank_complete(&mut self, _report: &CrankReport) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 > 0
    }
}

const ROOT_OBJECT: VatSlot = VatSlot { kind: SlotKind::Object, allocated_by_vat: true, id: 0 };

pub struct Kernel<S: DurableStore> {
    store: S,
    state: KernelState,
    committed: BTreeMap<String, Vec<u8>>,
    behaviors: BTreeMap<VatId, Box<dyn Vat>>,
    /// Process-local, one per attached incarnation.
    objects: BTreeMap<VatId, VirtualObjectManager>,
    mailbox_device: MailboxDevice<InboundHandler>,
    plugin_device: PluginDevice,
    options: KernelOptions,
    phase: CrankPhase,
}

impl<S: DurableStore> Kernel<S> {
    /// Opens the kernel stored in `store`, initializing it if empty.
    pub fn open(store: S, options: KernelOptions) -> Result<Self, KernelError> {
        let entries = store.load_all()?;
        let mut kernel = Kernel {
            store,
            state: KernelState::default(),
            committed: BTreeMap::new(),
            behaviors: BTreeMap::new(),
            objects: BTreeMap::new(),
            mailbox_device: MailboxDevice::new(),
            plugin_device: PluginDevice::new(),
            options,
            phase: CrankPhase::Idle,
        };
        if entries.is_empty() {
            info!("initializing fresh kernel");
            let mut genesis = KernelState::default();
            genesis.alloc_device("mailbox");
            genesis.alloc_device("plugin");
            kernel.commit(genesis)?;
        } else {
            let state = encoding::decode(&entries)?;
            check_invariants(&state)?;
            info!(
                "resumed kernel at crank {} with {} queued items",
                state.meta.crank_number,
                state.run_queue.len()
            );
            kernel.state = state;
            kernel.committed = entries;
        }
        Ok(kernel)
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Gives the store back, e.g. to reopen the kernel after a restart.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    pub fn phase(&self) -> CrankPhase {
        self.phase
    }

    pub fn crank_number(&self) -> u64 {
        self.state.meta.crank_number
    }

    pub fn activity_hash(&self) -> &str {
        &self.state.meta.activity_hash
    }

    pub fn run_queue_len(&self) -> usize {
        self.state.run_queue.len()
    }

    pub fn kp_status(&self, kp: KernelSlot) -> Option<PromiseStatus> {
        self.state.promises.status(&kp)
    }

    pub fn kp_resolution(&self, kp: KernelSlot) -> Option<Outcome<KernelSlot>> {
        self.state.promises.get(&kp).and_then(|p| p.outcome())
    }

    // ── Commit bracket ──────────────────────────────────────────────

    fn commit(&mut self, mut next: KernelState) -> Result<String, KernelError> {
        self.phase = CrankPhase::Committing;
        let result = self.try_commit(&mut next);
        self.phase = CrankPhase::Idle;
        let crank_hash = result?;
        self.state = next;
        Ok(crank_hash)
    }

    fn try_commit(&mut self, next: &mut KernelState) -> Result<String, KernelError> {
        if cfg!(debug_assertions) {
            check_invariants(next)?;
        }
        let mut encoded = encoding::encode(next)?;
        let mut changes = encoding::diff(&self.committed, &encoded);
        changes.remove(META_KEY);
        let crank_hash = hashing::crank_hash(&changes);
        next.meta.activity_hash = hashing::chain(&next.meta.activity_hash, &crank_hash);
        next.meta.last_crank_hash = crank_hash.clone();
        let meta = encoding::encode_meta(&next.meta)?;
        changes.insert(META_KEY.to_string(), Some(meta.clone()));
        encoded.insert(META_KEY.to_string(), meta);

        if let Err(e) = self.store.commit(&changes) {
            warn!("commit of {} changes failed: {}", changes.len(), e);
            return Err(KernelError::Commit(e));
        }
        self.committed = encoded;
        Ok(crank_hash)
    }

    /// Runs `f` on a copy of the state and commits the result.
    fn transact<T>(&mut self, f: impl FnOnce(&mut KernelState) -> Result<T, KernelError>) -> Result<T, KernelError> {
        if self.phase != CrankPhase::Idle {
            return Err(KernelError::Reentrancy);
        }
        let mut next = self.state.clone();
        let out = f(&mut next)?;
        self.commit(next)?;
        Ok(out)
    }

    // ── Vats ────────────────────────────────────────────────────────

    pub fn create_vat(&mut self, name: &str, behavior: Box<dyn Vat>) -> Result<VatId, KernelError> {
        let options = VatOptions { pipelining: self.options.pipelining_default };
        self.create_vat_with_options(name, behavior, options)
    }

    /// Registers a new vat and queues its start delivery. The vat's root
    /// object (`o+0`) exists immediately.
    pub fn create_vat_with_options(
        &mut self,
        name: &str,
        behavior: Box<dyn Vat>,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        crate::slots::validate_name(name)?;
        let vat = self.transact(|next| {
            if next.vat_by_name(name).is_some() {
                return Err(KernelError::DuplicateVat(name.to_string()));
            }
            let vat = VatId(next.meta.next_vat);
            next.meta.next_vat += 1;
            let root = next.alloc_object(Owner::Vat(vat));
            let mut clist = VatClist::new();
            clist.export(vat, ROOT_OBJECT, root);
            let record = VatRecord {
                name: name.to_string(),
                incarnation: 0,
                status: VatStatus::Running,
                pipelining: options.pipelining,
                next_object: 1,
                next_promise: 1,
            };
            next.vats.insert(vat, VatState { record, clist, vatstore: BTreeMap::new() });
            next.push_run_queue(RunQueueItem::StartVat { vat });
            Ok(vat)
        })?;
        info!("created vat {} ({})", name, vat);
        self.install(vat, behavior);
        Ok(vat)
    }

    /// Re-attaches behavior to a vat restored from the store.
    pub fn attach_vat(&mut self, name: &str, behavior: Box<dyn Vat>) -> Result<VatId, KernelError> {
        let vat = self.state.vat_by_name(name).ok_or_else(|| KernelError::UnknownVat(name.to_string()))?;
        self.install(vat, behavior);
        Ok(vat)
    }

    /// New behavior starts with a fresh object manager: representatives
    /// never outlive the behavior that held them.
    fn install(&mut self, vat: VatId, behavior: Box<dyn Vat>) {
        self.behaviors.insert(vat, behavior);
        self.objects.insert(vat, VirtualObjectManager::from_options(&self.options));
    }

    pub fn vat_id(&self, name: &str) -> Option<VatId> {
        self.state.vat_by_name(name)
    }

    pub fn vat_root(&self, vat: VatId) -> Result<KernelSlot, KernelError> {
        self.state
            .vats
            .get(&vat)
            .and_then(|vs| vs.clist.kslot_for(&ROOT_OBJECT))
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    pub fn vat_status(&self, vat: VatId) -> Option<&VatStatus> {
        self.state.vats.get(&vat).map(|vs| &vs.record.status)
    }

    pub fn terminate_vat(&mut self, vat: VatId, reason: &str) -> Result<(), KernelError> {
        self.transact(|next| {
            let vs = next.vats.get(&vat).ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
            if !vs.record.is_running() {
                return Err(KernelError::VatTerminated(vat));
            }
            retire_vat(next, vat, reason, false)?;
            Ok(())
        })?;
        self.behaviors.remove(&vat);
        self.objects.remove(&vat);
        Ok(())
    }

    /// Replaces a vat's behavior. Its exports and vatstore survive; promises
    /// it decided are rejected as disconnected by the upgrade.
    pub fn upgrade_vat(&mut self, vat: VatId, behavior: Box<dyn Vat>) -> Result<u64, KernelError> {
        let incarnation = self.transact(|next| {
            let vs = next.vats.get(&vat).ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
            if !vs.record.is_running() {
                return Err(KernelError::VatTerminated(vat));
            }
            let incarnation = retire_vat(next, vat, "upgraded", true)?;
            next.push_run_queue(RunQueueItem::StartVat { vat });
            Ok(incarnation)
        })?;
        self.install(vat, behavior);
        Ok(incarnation)
    }

    // ── External sends and promises ─────────────────────────────────

    /// Queues `target~.method(args)` and returns the result promise.
    pub fn queue_message(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<KernelSlot, KernelError> {
        self.transact(|next| {
            let kp = next.alloc_promise(None);
            next.push_run_queue(RunQueueItem::Send { target, message: Message::new(method, args, Some(kp)) });
            Ok(kp)
        })
    }

    /// Eventual send from outside any vat; the target may be a promise.
    pub fn send(&mut self, target: KernelSlot, method: &str, args: CapData<KernelSlot>) -> Result<KernelSlot, KernelError> {
        self.queue_message(target, method, args)
    }

    /// A promise decided by the host rather than by any vat or peer.
    pub fn new_promise(&mut self) -> Result<KernelSlot, KernelError> {
        self.transact(|next| Ok(next.alloc_promise(None)))
    }

    pub fn subscribe(&mut self, kp: KernelSlot, subscriber: Subscriber) -> Result<(), KernelError> {
        self.transact(|next| Ok(next.subscribe(kp, subscriber)?))
    }

    /// Settles a promise with no decider.
    pub fn resolve(&mut self, kp: KernelSlot, outcome: Outcome<KernelSlot>) -> Result<(), KernelError> {
        self.transact(|next| {
            if let Some(decider) = next.promises.get(&kp).and_then(|p| p.decider()) {
                return Err(PromiseError::NotDecider { slot: kp, who: format!("host (decider {:?})", decider) }.into());
            }
            Ok(next.settle(kp, outcome)?)
        })
    }

    // ── Scheduler ───────────────────────────────────────────────────

    /// Executes one crank. `Ok(None)` when the run-queue is empty.
    pub fn step(&mut self) -> Result<Option<CrankReport>, KernelError> {
        if self.phase != CrankPhase::Idle {
            return Err(KernelError::Reentrancy);
        }
        let mut next = self.state.clone();
        let Some((index, item)) = next.pop_run_queue() else {
            return Ok(None);
        };
        next.meta.crank_number += 1;
        let crank_number = next.meta.crank_number;
        debug!("crank {} start: run-queue item {}", crank_number, index);

        self.phase = CrankPhase::Delivering;
        let outcome = self.process(&mut next, item);
        self.phase = CrankPhase::Idle;
        let committed = outcome.and_then(|outcome| Ok((outcome, self.commit(next)?)));
        let (outcome, crank_hash) = match committed {
            Ok(done) => done,
            Err(e) => {
                // cached virtual-object state may hold writes that were just dropped
                for objects in self.objects.values_mut() {
                    objects.discard_cached_states();
                }
                return Err(e);
            }
        };
        debug!("crank {} done: {:?} ({})", crank_number, outcome, crank_hash);

        if let Err(e) = self.bring_out_your_dead() {
            warn!("virtual object collection after crank {} failed: {}", crank_number, e);
        }
        Ok(Some(CrankReport { crank_number, crank_hash, outcome }))
    }

    /// Runs queued finalizers and deletes unreachable virtual objects in
    /// every running vat. `step` calls this after each committed crank; the
    /// deletions commit on their own and do not advance the crank number.
    /// Returns how many objects were deleted.
    pub fn bring_out_your_dead(&mut self) -> Result<usize, KernelError> {
        if self.phase != CrankPhase::Idle {
            return Err(KernelError::Reentrancy);
        }
        let mut collected = BTreeMap::new();
        let mut deleted = 0;
        for (vat, objects) in self.objects.iter_mut() {
            if !objects.has_pending_collection() {
                continue;
            }
            let Some(vs) = self.state.vats.get(vat).filter(|vs| vs.record.is_running()) else {
                continue;
            };
            let mut vatstore = vs.vatstore.clone();
            let dead = objects.bring_out_your_dead(&mut vatstore)?;
            if !dead.is_empty() {
                debug!("vat {}: collected {} virtual objects", vat, dead.len());
                deleted += dead.len();
                collected.insert(*vat, vatstore);
            }
        }
        if collected.is_empty() {
            return Ok(0);
        }
        self.transact(|next| {
            for (vat, vatstore) in collected {
                if let Some(vs) = next.vats.get_mut(&vat) {
                    vs.vatstore = vatstore;
                }
            }
            Ok(())
        })?;
        Ok(deleted)
    }

    /// Runs cranks until the queue is empty, the policy says stop, or the
    /// configured per-run limit is hit. Returns the number of cranks run.
    pub fn run(&mut self, policy: &mut dyn RunPolicy) -> Result<u64, KernelError> {
        let mut cranks = 0;
        loop {
            if self.options.max_cranks_per_run.is_some_and(|max| cranks >= max) {
                break;
            }
            let Some(report) = self.step()? else {
                break;
            };
            cranks += 1;
            if !policy.crank_complete(&report) {
                break;
            }
        }
        Ok(cranks)
    }

    pub fn run_until_idle(&mut self) -> Result<u64, KernelError> {
        self.run(&mut RunForever)
    }

    fn process(&mut self, next: &mut KernelState, item: RunQueueItem) -> Result<CrankOutcome, KernelError> {
        match item {
            RunQueueItem::Send { target, message } => self.route_send(next, target, message),
            RunQueueItem::Notify { subscriber, promise } => self.notify(next, subscriber, promise),
            RunQueueItem::Inbound { peer, seq, payload } => self.process_inbound(next, peer, seq, payload),
            RunQueueItem::DropExports { vat, slots } => self.drop_exports(next, vat, slots),
            RunQueueItem::PluginResponse { vat, index, payload } => {
                self.deliver(next, vat, VatDelivery::PluginResponse { index, payload })
            }
            RunQueueItem::PluginBroken { vat, index, reason } => {
                self.deliver(next, vat, VatDelivery::PluginBroken { index, reason })
            }
            RunQueueItem::StartVat { vat } => {
                let incarnation = next
                    .vats
                    .get(&vat)
                    .map(|vs| vs.record.incarnation)
                    .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
                self.deliver(next, vat, VatDelivery::Start { incarnation })
            }
        }
    }

    fn splat(
        &mut self,
        next: &mut KernelState,
        message: Message<KernelSlot>,
        reason: RejectionReason,
    ) -> Result<CrankOutcome, KernelError> {
        trace!("splat {}: {:?}", message.method, reason);
        let data: CapData<KernelSlot> = reason.to_capdata();
        self.splat_with(next, message, data)
    }

    fn splat_with(
        &mut self,
        next: &mut KernelState,
        message: Message<KernelSlot>,
        data: CapData<KernelSlot>,
    ) -> Result<CrankOutcome, KernelError> {
        if let Some(kp) = message.result {
            if next.promises.get(&kp).is_some_and(|p| !p.is_resolved()) {
                next.promises.set_decider(&kp, None)?;
                next.settle(kp, Outcome::Rejected(data.clone()))?;
            }
        }
        Ok(CrankOutcome::Splatted { reason: data.body })
    }

    fn route_send(
        &mut self,
        next: &mut KernelState,
        target: KernelSlot,
        message: Message<KernelSlot>,
    ) -> Result<CrankOutcome, KernelError> {
        let undeliverable = |detail: &str| RejectionReason::Undeliverable {
            method: message.method.clone(),
            detail: detail.to_string(),
        };
        let mut target = target;
        let mut seen = BTreeSet::new();
        loop {
            if !seen.insert(target) {
                let reason = undeliverable("promise fulfilled to itself");
                return self.splat(next, message, reason);
            }
            match target.kind {
                SlotKind::Object => {
                    let Some(obj) = next.object(&target) else {
                        let reason = undeliverable("unknown object");
                        return self.splat(next, message, reason);
                    };
                    return match obj.owner.clone() {
                        Owner::Vat(vat) => {
                            let running = next.vats.get(&vat).is_some_and(|vs| vs.record.is_running());
                            if running {
                                self.deliver_message(next, vat, target, message)
                            } else {
                                let reason = RejectionReason::VatTerminated {
                                    vat: vat.to_string(),
                                    reason: "target vat is terminated".to_string(),
                                };
                                self.splat(next, message, reason)
                            }
                        }
                        Owner::Peer(peer) => self.forward_send(next, peer, target, message),
                    };
                }
                SlotKind::Promise => {
                    let Some(promise) = next.promises.get(&target) else {
                        let reason = undeliverable("unknown promise");
                        return self.splat(next, message, reason);
                    };
                    match &promise.state {
                        PromiseState::Fulfilled(data) => match data.as_reference() {
                            Some(k) if k.kind != SlotKind::Device => {
                                target = *k;
                                continue;
                            }
                            _ => {
                                let reason = undeliverable("promise fulfilled to data");
                                return self.splat(next, message, reason);
                            }
                        },
                        PromiseState::Rejected(data) => {
                            let data = data.clone();
                            return self.splat_with(next, message, data);
                        }
                        PromiseState::Unresolved { decider, .. } => {
                            return match decider.clone() {
                                Some(Decider::Peer(peer)) => self.forward_send(next, peer, target, message),
                                Some(Decider::Vat(vat))
                                    if next
                                        .vats
                                        .get(&vat)
                                        .is_some_and(|vs| vs.record.pipelining && vs.record.is_running()) =>
                                {
                                    self.deliver_message(next, vat, target, message)
                                }
                                _ => {
                                    next.promises.enqueue(&target, message)?;
                                    Ok(CrankOutcome::Queued { promise: target })
                                }
                            };
                        }
                    }
                }
                SlotKind::Device => {
                    let reason = undeliverable("devices do not accept messages");
                    return self.splat(next, message, reason);
                }
            }
        }
    }

    fn deliver_message(
        &mut self,
        next: &mut KernelState,
        vat: VatId,
        target: KernelSlot,
        message: Message<KernelSlot>,
    ) -> Result<CrankOutcome, KernelError> {
        if let Some(kp) = message.result {
            if next.promises.get(&kp).is_some_and(|p| !p.is_resolved()) {
                next.promises.set_decider(&kp, Some(Decider::Vat(vat)))?;
            }
        }
        let vs = next.vats.get_mut(&vat).ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
        let target = vs.clist.import(vat, target);
        let args = message.args.try_map(|k| Ok::<_, KernelError>(vs.clist.import(vat, *k)))?;
        let result = message.result.map(|kp| vs.clist.import(vat, kp));
        let delivery = VatDelivery::Message { target, message: Message::new(message.method, args, result) };
        self.deliver(next, vat, delivery)
    }

    fn notify(
        &mut self,
        next: &mut KernelState,
        subscriber: Subscriber,
        kp: KernelSlot,
    ) -> Result<CrankOutcome, KernelError> {
        let Some(outcome) = next.promises.get(&kp).and_then(|p| p.outcome()) else {
            warn!("notification for unresolved {} dropped", kp);
            return Ok(CrankOutcome::Skipped);
        };
        match subscriber {
            Subscriber::Vat(vat) => {
                let Some(vs) = next.vats.get_mut(&vat) else {
                    return Ok(CrankOutcome::Skipped);
                };
                if !vs.record.is_running() {
                    return Ok(CrankOutcome::Skipped);
                }
                let promise = vs.clist.import(vat, kp);
                let outcome = outcome.try_map(|k| Ok::<_, KernelError>(vs.clist.import(vat, *k)))?;
                self.deliver(next, vat, VatDelivery::Notify { promise, outcome })
            }
            Subscriber::Peer(peer) => {
                let mut trial = next.clone();
                if let Err(e) = comms::transmit_resolve(&mut trial, &peer, kp, &outcome) {
                    // the peer still learns the promise settled, just not to what
                    warn!("resolution of {} cannot reach {}: {}", kp, peer, e);
                    trial = next.clone();
                    let rejected = Outcome::Rejected(RejectionReason::protocol_violation(&e).to_capdata());
                    comms::transmit_resolve(&mut trial, &peer, kp, &rejected)?;
                }
                *next = trial;
                Ok(CrankOutcome::Forwarded { peer })
            }
        }
    }

    /// Hands a send to the peer that hosts or decides `target`. A message
    /// that cannot be expressed on the wire rejects its result instead.
    fn forward_send(
        &mut self,
        next: &mut KernelState,
        peer: PeerId,
        target: KernelSlot,
        message: Message<KernelSlot>,
    ) -> Result<CrankOutcome, KernelError> {
        let mut trial = next.clone();
        match comms::transmit_send(&mut trial, &peer, target, message.clone()) {
            Ok(_) => {
                *next = trial;
                Ok(CrankOutcome::Forwarded { peer })
            }
            Err(e) => {
                warn!("send of {} to {} not transmitted: {}", message.method, peer, e);
                self.splat(next, message, RejectionReason::protocol_violation(&e))
            }
        }
    }

    fn process_inbound(
        &mut self,
        next: &mut KernelState,
        peer: PeerId,
        seq: u64,
        payload: Vec<u8>,
    ) -> Result<CrankOutcome, KernelError> {
        match self.mailbox_device.handler()?.clone() {
            InboundHandler::Vat(vat) => self.deliver(next, vat, VatDelivery::Inbound { peer, seq, payload }),
            InboundHandler::Comms => {
                // a bad message must not leave half its effects behind
                let mut trial = next.clone();
                match comms::handle_inbound(&mut trial, &peer, &payload) {
                    Ok(effect) => {
                        *next = trial;
                        if let InboundEffect::Rejected(detail) = &effect {
                            warn!("inbound {} #{} rejected: {}", peer, seq, detail);
                        }
                        Ok(CrankOutcome::Inbound { peer, effect: format!("{:?}", effect) })
                    }
                    Err(e) => {
                        warn!("protocol violation from {} in #{}: {}", peer, seq, e);
                        Ok(CrankOutcome::Inbound { peer, effect: format!("violation: {}", e) })
                    }
                }
            }
        }
    }

    fn drop_exports(
        &mut self,
        next: &mut KernelState,
        vat: VatId,
        slots: Vec<KernelSlot>,
    ) -> Result<CrankOutcome, KernelError> {
        let mut vrefs = Vec::new();
        for kslot in slots {
            // re-imported since the drop was queued
            if gc::has_importers(next, &kslot) {
                continue;
            }
            let Some(vs) = next.vats.get_mut(&vat) else {
                continue;
            };
            if let Some(vref) = vs.clist.vref_for(&kslot).filter(|v| v.allocated_by_vat && *v != ROOT_OBJECT) {
                vs.clist.drop_vref(&vref);
                next.objects.remove(&kslot.id);
                vrefs.push(vref);
            }
        }
        if vrefs.is_empty() {
            return Ok(CrankOutcome::Skipped);
        }
        self.deliver(next, vat, VatDelivery::DropExports(vrefs))
    }

    /// Hands one delivery to a vat and applies its syscalls. A vat error,
    /// panic or illegal syscall terminates the vat instead.
    fn deliver(&mut self, next: &mut KernelState, vat: VatId, delivery: VatDelivery) -> Result<CrankOutcome, KernelError> {
        let running = next
            .vats
            .get(&vat)
            .map(|vs| vs.record.is_running())
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
        if !running {
            return Ok(CrankOutcome::Skipped);
        }

        let (result, log) = {
            let behavior = self.behaviors.get_mut(&vat).ok_or(KernelError::VatNotAttached(vat))?;
            let vs = next.vats.get(&vat).ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
            let options = &self.options;
            let objects = self.objects.entry(vat).or_insert_with(|| VirtualObjectManager::from_options(options));
            let mut syscalls = VatSyscalls::new(
                vat,
                &vs.vatstore,
                &next.plugins,
                objects,
                vs.record.next_object,
                vs.record.next_promise,
                next.meta.next_plugin,
            );
            let result = panic::catch_unwind(AssertUnwindSafe(|| behavior.dispatch(delivery, &mut syscalls)));
            let result = match result {
                Ok(Ok(())) => Ok(syscalls.flush_virtual_objects().map(|_| ()).map_err(VatError::from)),
                other => other,
            };
            (result, syscalls.finish())
        };

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => {
                let text = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Some(VatError::Panicked(text))
            }
        };
        if let Some(err) = failure {
            return self.fail_vat(next, vat, err);
        }

        let mut trial = next.clone();
        match self.apply_syscalls(&mut trial, vat, log) {
            Ok(exit) => {
                *next = trial;
                if let Some(reason) = exit {
                    info!("vat {} exited: {}", vat, reason);
                    retire_vat(next, vat, &reason, false)?;
                    self.objects.remove(&vat);
                }
                Ok(CrankOutcome::Delivered { vat })
            }
            Err(SyscallFault::Illegal(detail)) => self.fail_vat(next, vat, VatError::IllegalSyscall(detail)),
            Err(SyscallFault::Kernel(e)) => Err(e),
        }
    }

    fn fail_vat(&mut self, next: &mut KernelState, vat: VatId, err: VatError) -> Result<CrankOutcome, KernelError> {
        warn!("vat {} failed: {}", vat, err);
        retire_vat(next, vat, &err.to_string(), false)?;
        self.objects.remove(&vat);
        Ok(CrankOutcome::VatFailed { vat, reason: err.to_string() })
    }

    /// Applies a successful delivery's syscalls to `trial`. Returns the exit
    /// reason if the vat asked to terminate.
    fn apply_syscalls(
        &mut self,
        trial: &mut KernelState,
        vat: VatId,
        log: SyscallLog,
    ) -> Result<Option<String>, SyscallFault> {
        {
            let vs = trial.vats.get_mut(&vat).ok_or_else(|| SyscallFault::illegal("vat vanished"))?;
            for (key, value) in log.writes {
                match value {
                    Some(v) => {
                        vs.vatstore.insert(key, v);
                    }
                    None => {
                        vs.vatstore.remove(&key);
                    }
                }
            }
            vs.record.next_object = log.next_object;
            vs.record.next_promise = log.next_promise;
        }
        trial.meta.next_plugin = log.next_plugin;

        let mut exit = None;
        let mut plugin_sends = Vec::new();
        for syscall in log.syscalls {
            match syscall {
                Syscall::Send { target, message } => {
                    let target = vat_to_kernel(trial, vat, target)?;
                    let args = message.args.try_map(|v| vat_to_kernel(trial, vat, *v))?;
                    let result = match message.result {
                        Some(vref) => {
                            if trial.vats.get(&vat).and_then(|vs| vs.clist.kslot_for(&vref)).is_some()
                                || !vref.allocated_by_vat
                                || vref.kind != SlotKind::Promise
                            {
                                return Err(SyscallFault::illegal(format!("result {} is not a fresh promise", vref)));
                            }
                            let kp = trial.alloc_promise(None);
                            if let Some(vs) = trial.vats.get_mut(&vat) {
                                vs.clist.export(vat, vref, kp);
                            }
                            trial.subscribe(kp, Subscriber::Vat(vat))?;
                            Some(kp)
                        }
                        None => None,
                    };
                    trial.push_run_queue(RunQueueItem::Send {
                        target,
                        message: Message::new(message.method, args, result),
                    });
                }
                Syscall::Subscribe(vref) => {
                    let kp = vat_to_kernel(trial, vat, vref)?;
                    if !kp.is_promise() {
                        return Err(SyscallFault::illegal(format!("subscribe to non-promise {}", vref)));
                    }
                    trial.subscribe(kp, Subscriber::Vat(vat))?;
                }
                Syscall::Resolve { promise, outcome } => {
                    let kp = trial
                        .vats
                        .get(&vat)
                        .and_then(|vs| vs.clist.kslot_for(&promise))
                        .ok_or_else(|| SyscallFault::illegal(format!("resolve of unknown {}", promise)))?;
                    if trial.promises.get(&kp).and_then(|p| p.decider()) != Some(&Decider::Vat(vat)) {
                        return Err(SyscallFault::illegal(format!("{} is not decided by {}", promise, vat)));
                    }
                    let outcome = outcome.try_map(|v| vat_to_kernel(trial, vat, *v))?;
                    trial.promises.set_decider(&kp, None)?;
                    trial.settle(kp, outcome)?;
                }
                Syscall::DropImports(vrefs) => {
                    for vref in vrefs {
                        if vref.allocated_by_vat {
                            return Err(SyscallFault::illegal(format!("drop of own export {}", vref)));
                        }
                        let dropped = trial.vats.get_mut(&vat).and_then(|vs| vs.clist.drop_vref(&vref));
                        if let Some(kslot) = dropped {
                            gc::release(trial, kslot).map_err(|e| SyscallFault::Kernel(e.into()))?;
                        }
                    }
                }
                Syscall::PluginConnect { index, module_ref } => {
                    trial.plugins.insert(index, PluginChannelRecord { module_ref, owner: vat });
                }
                Syscall::PluginSend { index, payload } => match trial.plugins.get(&index) {
                    Some(rec) if rec.owner == vat => plugin_sends.push((index, rec.clone(), payload)),
                    _ => return Err(SyscallFault::illegal(format!("send on foreign plugin channel {}", index))),
                },
                Syscall::Exit { reason } => exit = Some(reason),
            }
        }

        for (index, record, payload) in plugin_sends {
            if let Err(e) = self.plugin_device.send(index, &record, &payload) {
                trial.push_run_queue(RunQueueItem::PluginBroken { vat, index, reason: e.to_string() });
            }
        }
        Ok(exit)
    }

    // ── Mailbox device ──────────────────────────────────────────────

    pub fn register_inbound_handler(&mut self, handler: InboundHandler) -> Result<(), KernelError> {
        Ok(self.mailbox_device.register_inbound_handler(handler)?)
    }

    pub fn add_peer(&mut self, peer: &PeerId) -> Result<(), KernelError> {
        if self.state.peers.contains_key(peer) {
            return Ok(());
        }
        self.transact(|next| {
            next.ensure_peer(peer);
            Ok(())
        })
    }

    /// Accepts a mailbox batch from `peer`. Newly delivered messages become
    /// run-queue items; a batch that changes nothing commits nothing.
    pub fn deliver_inbound(
        &mut self,
        peer: &PeerId,
        messages: Vec<(u64, Vec<u8>)>,
        ack: u64,
    ) -> Result<InboundReceipt, KernelError> {
        self.mailbox_device.handler()?;
        if self.phase != CrankPhase::Idle {
            return Err(KernelError::Reentrancy);
        }
        let mut next = self.state.clone();
        next.ensure_peer(peer);
        let receipt = next.mailbox.receive_inbound(peer, messages, ack)?;
        if !receipt.did_change {
            return Ok(receipt);
        }
        for (seq, payload) in &receipt.delivered {
            next.push_run_queue(RunQueueItem::Inbound { peer: peer.clone(), seq: *seq, payload: payload.clone() });
        }
        self.commit(next)?;
        Ok(receipt)
    }

    pub fn deliver_inbound_messages(
        &mut self,
        peer: &PeerId,
        messages: Vec<(u64, Vec<u8>)>,
    ) -> Result<InboundReceipt, KernelError> {
        self.deliver_inbound(peer, messages, 0)
    }

    pub fn deliver_inbound_ack(&mut self, peer: &PeerId, ack: u64) -> Result<InboundReceipt, KernelError> {
        self.deliver_inbound(peer, Vec::new(), ack)
    }

    /// Everything `peer` has not acknowledged, with our ack piggybacked.
    pub fn outbound(&self, peer: &PeerId) -> OutboundBatch {
        self.state.mailbox.outbound(peer)
    }

    /// Sends raw bytes to a peer through the mailbox.
    pub fn enqueue_outbound(&mut self, peer: &PeerId, payload: Vec<u8>) -> Result<u64, KernelError> {
        self.transact(|next| {
            next.ensure_peer(peer);
            Ok(next.mailbox.enqueue_outbound(peer, payload))
        })
    }

    // ── Comms bootstrap ─────────────────────────────────────────────

    /// Makes `kslot` reachable by `peer` under a well-known id, so the peer
    /// can `import_from_peer` it without a prior message.
    pub fn export_to_peer(&mut self, peer: &PeerId, kslot: KernelSlot, id: u64) -> Result<WireSlot, KernelError> {
        self.transact(|next| {
            if !kslot.is_object() {
                return Err(ClistError::DeviceCrossing(kslot).into());
            }
            next.ensure_peer(peer);
            let wire = WireSlot::new(WireRole::YourIngress, id, true);
            if let Some(clist) = next.slots.peers.get_mut(peer) {
                clist.add_known(kslot, wire);
            }
            Ok(wire)
        })
    }

    /// Imports the object `peer` exported under the well-known `id`.
    pub fn import_from_peer(&mut self, peer: &PeerId, id: u64) -> Result<KernelSlot, KernelError> {
        self.transact(|next| {
            next.ensure_peer(peer);
            let their = WireSlot::new(WireRole::YourIngress, id, true);
            Ok(comms::import_slot(next, peer, their)?)
        })
    }

    /// Forgets the live session with `peer`: bumps its epoch and rejects
    /// every promise it decides. C-lists and mailbox state are kept.
    pub fn disconnect_peer(&mut self, peer: &PeerId) -> Result<u64, KernelError> {
        let epoch = self.transact(|next| {
            let record = next.peers.get_mut(peer).ok_or_else(|| KernelError::UnknownPeer(peer.clone()))?;
            let lost = record.epoch;
            record.epoch += 1;
            let reason = RejectionReason::Disconnected { name: peer.to_string(), incarnation: lost, upgrade: false };
            for kp in next.promises_decided_by(&Decider::Peer(peer.clone())) {
                next.promises.set_decider(&kp, None)?;
                next.settle(kp, Outcome::Rejected(reason.to_capdata()))?;
            }
            Ok(lost + 1)
        })?;
        info!("peer {} disconnected, epoch now {}", peer, epoch);
        Ok(epoch)
    }

    // ── Plugin device ───────────────────────────────────────────────

    pub fn set_plugin_host(&mut self, host: Box<dyn PluginHost>) {
        self.plugin_device.set_host(host);
    }

    pub fn plugin_channel_status(&self, index: u32) -> ChannelStatus {
        self.plugin_device.status(index)
    }

    pub fn plugin_channel_broken_reason(&self, index: u32) -> Option<&str> {
        self.plugin_device.broken_reason(index)
    }

    /// Host-side notification that a channel's connection went away.
    pub fn plugin_channel_broken(&mut self, index: u32, reason: &str) {
        self.plugin_device.mark_broken(index, reason);
    }

    /// Queues a plugin's response for delivery to the channel owner.
    pub fn deliver_plugin_response(&mut self, index: u32, payload: Vec<u8>) -> Result<(), KernelError> {
        self.transact(|next| {
            let vat = next.plugins.get(&index).map(|r| r.owner).ok_or(PluginError::UnknownChannel(index))?;
            next.push_run_queue(RunQueueItem::PluginResponse { vat, index, payload });
            Ok(())
        })
    }
}

enum SyscallFault {
    Illegal(String),
    Kernel(KernelError),
}

impl SyscallFault {
    fn illegal(detail: impl Into<String>) -> Self {
        SyscallFault::Illegal(detail.into())
    }
}

impl From<PromiseError> for SyscallFault {
    fn from(e: PromiseError) -> Self {
        // double resolution and the like are the vat's fault
        SyscallFault::Illegal(e.to_string())
    }
}

/// Kernel slot for a vref used in a syscall. Vat-allocated vrefs seen for
/// the first time become new kernel objects or promises owned by the vat.
fn vat_to_kernel(state: &mut KernelState, vat: VatId, vref: VatSlot) -> Result<KernelSlot, SyscallFault> {
    let vs = state.vats.get(&vat).ok_or_else(|| SyscallFault::illegal("vat vanished"))?;
    if let Some(k) = vs.clist.kslot_for(&vref) {
        return Ok(k);
    }
    if !vref.allocated_by_vat {
        return Err(SyscallFault::illegal(format!("unknown import {}", vref)));
    }
    let kslot = match vref.kind {
        SlotKind::Object => state.alloc_object(Owner::Vat(vat)),
        SlotKind::Promise => state.alloc_promise(Some(Decider::Vat(vat))),
        SlotKind::Device => return Err(SyscallFault::illegal(format!("vat-allocated device {}", vref))),
    };
    if let Some(vs) = state.vats.get_mut(&vat) {
        vs.clist.export(vat, vref, kslot);
    }
    Ok(kslot)
}

/// Terminates (or, with `upgrade`, starts a new incarnation of) a vat and
/// rejects every promise it decides. Returns the new incarnation.
fn retire_vat(state: &mut KernelState, vat: VatId, reason: &str, upgrade: bool) -> Result<u64, KernelError> {
    let vs = state.vats.get_mut(&vat).ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
    let incarnation = vs.record.incarnation;
    let name = vs.record.name.clone();
    if upgrade {
        vs.record.incarnation += 1;
        info!("vat {} upgraded to incarnation {}", name, incarnation + 1);
    } else {
        vs.record.status = VatStatus::Terminated { reason: reason.to_string() };
        info!("vat {} terminated: {}", name, reason);
    }
    let rejection = RejectionReason::Disconnected { name, incarnation, upgrade };
    for kp in state.promises_decided_by(&Decider::Vat(vat)) {
        state.promises.set_decider(&kp, None)?;
        state.settle(kp, Outcome::Rejected(rejection.to_capdata()))?;
    }
    Ok(if upgrade { incarnation + 1 } else { incarnation })
}
