//! In-memory kernel state. Everything here is persisted through
//! `encoding` at the end of every crank; nothing outside it survives a
//! restart.

use std::collections::BTreeMap;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::clist::{SlotTable, VatClist};
use crate::mailbox::Mailbox;
use crate::message::{Message, Outcome};
use crate::plugin::PluginChannelRecord;
use crate::promises::{Decider, KernelPromise, PromiseError, PromiseTable, SubscribeEffect, Subscriber};
use crate::slots::{KernelSlot, PeerId, VatId};
use crate::KERNEL_VERSION;

/// Hash the activity chain starts from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMeta {
    pub version: u32,
    pub crank_number: u64,
    pub next_object: u64,
    pub next_promise: u64,
    pub next_device: u64,
    pub next_vat: u32,
    pub next_plugin: u32,
    pub next_run_queue: u64,
    pub activity_hash: String,
    pub last_crank_hash: String,
}

impl Default for KernelMeta {
    fn default() -> Self {
        KernelMeta {
            version: KERNEL_VERSION,
            crank_number: 0,
            next_object: 1,
            next_promise: 1,
            next_device: 1,
            next_vat: 1,
            next_plugin: 1,
            next_run_queue: 0,
            activity_hash: GENESIS_HASH.to_string(),
            last_crank_hash: GENESIS_HASH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Owner {
    Vat(VatId),
    Peer(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelObject {
    pub owner: Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDevice {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatStatus {
    Running,
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRecord {
    pub name: String,
    pub incarnation: u64,
    pub status: VatStatus,
    /// Accepts messages addressed to promises it decides before resolving them.
    pub pipelining: bool,
    pub next_object: u64,
    pub next_promise: u64,
}

impl VatRecord {
    pub fn is_running(&self) -> bool {
        self.status == VatStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatState {
    pub record: VatRecord,
    pub clist: VatClist,
    pub vatstore: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Bumped on every disconnect.
    pub epoch: u64,
}

/// One unit of work. Each item is processed by exactly one crank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunQueueItem {
    Send { target: KernelSlot, message: Message<KernelSlot> },
    Notify { subscriber: Subscriber, promise: KernelSlot },
    Inbound { peer: PeerId, seq: u64, payload: Vec<u8> },
    DropExports { vat: VatId, slots: Vec<KernelSlot> },
    PluginResponse { vat: VatId, index: u32, payload: Vec<u8> },
    PluginBroken { vat: VatId, index: u32, reason: String },
    StartVat { vat: VatId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub meta: KernelMeta,
    pub run_queue: BTreeMap<u64, RunQueueItem>,
    pub objects: BTreeMap<u64, KernelObject>,
    pub promises: PromiseTable,
    pub devices: BTreeMap<u64, KernelDevice>,
    pub vats: BTreeMap<VatId, VatState>,
    pub peers: BTreeMap<PeerId, PeerRecord>,
    pub slots: SlotTable,
    pub mailbox: Mailbox,
    pub plugins: BTreeMap<u32, PluginChannelRecord>,
}

impl KernelState {
    pub fn push_run_queue(&mut self, item: RunQueueItem) {
        let idx = self.meta.next_run_queue;
        self.meta.next_run_queue += 1;
        self.run_queue.insert(idx, item);
    }

    pub fn pop_run_queue(&mut self) -> Option<(u64, RunQueueItem)> {
        self.run_queue.pop_first()
    }

    pub fn alloc_object(&mut self, owner: Owner) -> KernelSlot {
        let ko = KernelSlot::object(self.meta.next_object);
        self.meta.next_object += 1;
        trace!("allocated {} for {:?}", ko, owner);
        self.objects.insert(ko.id, KernelObject { owner });
        ko
    }

    pub fn alloc_promise(&mut self, decider: Option<Decider>) -> KernelSlot {
        let kp = KernelSlot::promise(self.meta.next_promise);
        self.meta.next_promise += 1;
        trace!("allocated {} decided by {:?}", kp, decider);
        self.promises.insert(kp, KernelPromise::new(decider));
        kp
    }

    pub fn alloc_device(&mut self, name: &str) -> KernelSlot {
        let kd = KernelSlot::device(self.meta.next_device);
        self.meta.next_device += 1;
        self.devices.insert(kd.id, KernelDevice { name: name.to_string() });
        kd
    }

    pub fn object(&self, ko: &KernelSlot) -> Option<&KernelObject> {
        if !ko.is_object() {
            return None;
        }
        self.objects.get(&ko.id)
    }

    pub fn vat_by_name(&self, name: &str) -> Option<VatId> {
        self.vats.iter().find(|(_, v)| v.record.name == name).map(|(id, _)| *id)
    }

    pub fn ensure_peer(&mut self, peer: &PeerId) {
        self.peers.entry(peer.clone()).or_default();
        self.slots.ensure_peer(peer);
        self.mailbox.ensure_peer(peer);
    }

    /// Subscribes and, if `kp` is already settled, queues the notification
    /// for a later crank.
    pub fn subscribe(&mut self, kp: KernelSlot, subscriber: Subscriber) -> Result<(), PromiseError> {
        if self.promises.subscribe(&kp, subscriber.clone())? == SubscribeEffect::NotifyNow {
            self.push_run_queue(RunQueueItem::Notify { subscriber, promise: kp });
        }
        Ok(())
    }

    /// Settles `kp`, puts its queued messages back on the run-queue and
    /// queues one notification per subscriber.
    pub fn settle(&mut self, kp: KernelSlot, outcome: Outcome<KernelSlot>) -> Result<(), PromiseError> {
        let settlement = self.promises.resolve(&kp, outcome)?;
        for message in settlement.requeue {
            self.push_run_queue(RunQueueItem::Send { target: kp, message });
        }
        for subscriber in settlement.notify {
            self.push_run_queue(RunQueueItem::Notify { subscriber, promise: kp });
        }
        Ok(())
    }

    /// Unresolved promises whose decider is `decider`.
    pub fn promises_decided_by(&self, decider: &Decider) -> Vec<KernelSlot> {
        self.promises
            .iter()
            .filter(|(_, p)| p.decider() == Some(decider))
            .map(|(kp, _)| kp)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_queue_is_fifo() {
        let mut s = KernelState::default();
        for v in 1..4 {
            s.push_run_queue(RunQueueItem::StartVat { vat: VatId(v) });
        }
        let order: Vec<u64> = std::iter::from_fn(|| s.pop_run_queue().map(|(i, _)| i)).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(s.meta.next_run_queue, 3);
    }

    #[test]
    fn test_settle_requeues_then_notifies() {
        let mut s = KernelState::default();
        let kp = s.alloc_promise(None);
        s.subscribe(kp, Subscriber::Vat(VatId(2))).unwrap();
        s.promises.enqueue(&kp, Message::new("m", crate::message::CapData::data("[]"), None)).unwrap();
        assert!(s.run_queue.is_empty());
        s.settle(kp, Outcome::Fulfilled(crate::message::CapData::data("1"))).unwrap();
        let items: Vec<RunQueueItem> = s.run_queue.values().cloned().collect();
        assert!(matches!(items[0], RunQueueItem::Send { target, .. } if target == kp));
        assert!(matches!(&items[1], RunQueueItem::Notify { promise, .. } if *promise == kp));
        // a late subscriber is queued, never notified synchronously
        s.subscribe(kp, Subscriber::Vat(VatId(3))).unwrap();
        assert_eq!(s.run_queue.len(), 3);
    }

    #[test]
    fn test_allocators_are_monotonic() {
        let mut s = KernelState::default();
        let a = s.alloc_object(Owner::Vat(VatId(1)));
        let b = s.alloc_object(Owner::Vat(VatId(1)));
        let p = s.alloc_promise(None);
        assert_eq!((a.id, b.id, p.id), (1, 2, 1));
        assert!(s.promises.get(&p).is_some());
    }
}
