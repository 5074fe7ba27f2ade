//! Vat dispatch surface.
//!
//! A vat receives one `VatDelivery` per crank and talks back to the kernel
//! only through `VatSyscalls`. Syscalls are recorded, not executed: the
//! kernel applies them after the delivery returns successfully, so a vat
//! that fails leaves no trace of the crank except its own termination.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::message::{CapData, Message, Outcome};
use crate::plugin::{resolve_connect, PluginChannelRecord, PluginError};
use crate::slots::{PeerId, SlotKind, VatId, VatSlot};
use crate::virtual_objects::{VirtualObjectManager, VomError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VatError {
    #[error("delivery failed: {0}")]
    Failed(String),
    #[error("vat panicked: {0}")]
    Panicked(String),
    #[error("illegal syscall: {0}")]
    IllegalSyscall(String),
}

impl From<VomError> for VatError {
    fn from(e: VomError) -> Self {
        VatError::Failed(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VatDelivery {
    /// First delivery of every incarnation.
    Start { incarnation: u64 },
    Message { target: VatSlot, message: Message<VatSlot> },
    Notify { promise: VatSlot, outcome: Outcome<VatSlot> },
    /// The kernel no longer holds any importer of these exports.
    DropExports(Vec<VatSlot>),
    /// Raw mailbox traffic, for a vat registered as the inbound handler.
    Inbound { peer: PeerId, seq: u64, payload: Vec<u8> },
    PluginResponse { index: u32, payload: Vec<u8> },
    PluginBroken { index: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syscall {
    Send { target: VatSlot, message: Message<VatSlot> },
    Subscribe(VatSlot),
    Resolve { promise: VatSlot, outcome: Outcome<VatSlot> },
    DropImports(Vec<VatSlot>),
    PluginConnect { index: u32, module_ref: String },
    PluginSend { index: u32, payload: Vec<u8> },
    Exit { reason: String },
}

/// Vat behavior. Implementations keep anything that must survive a
/// restart or an upgrade in the vatstore.
pub trait Vat: Send {
    fn dispatch(&mut self, delivery: VatDelivery, syscalls: &mut VatSyscalls<'_>) -> Result<(), VatError>;
}

struct FnVat<F>(F);

impl<F> Vat for FnVat<F>
where
    F: FnMut(VatDelivery, &mut VatSyscalls<'_>) -> Result<(), VatError> + Send,
{
    fn dispatch(&mut self, delivery: VatDelivery, syscalls: &mut VatSyscalls<'_>) -> Result<(), VatError> {
        (self.0)(delivery, syscalls)
    }
}

/// Wraps a closure as a vat.
pub fn vat_fn<F>(f: F) -> Box<dyn Vat>
where
    F: FnMut(VatDelivery, &mut VatSyscalls<'_>) -> Result<(), VatError> + Send + 'static,
{
    Box::new(FnVat(f))
}

/// Durable key/value namespace of one vat.
pub trait VatStore {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&mut self, key: &str, value: Vec<u8>);
    fn delete(&mut self, key: &str);
}

impl VatStore for BTreeMap<String, Vec<u8>> {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        BTreeMap::get(self, key).cloned()
    }

    fn set(&mut self, key: &str, value: Vec<u8>) {
        self.insert(key.to_string(), value);
    }

    fn delete(&mut self, key: &str) {
        self.remove(key);
    }
}

/// Pending vatstore writes over the committed vatstore of one vat.
struct StoreOverlay<'a> {
    base: &'a BTreeMap<String, Vec<u8>>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl VatStore for StoreOverlay<'_> {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.base.get(key).cloned(),
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>) {
        self.writes.insert(key.to_string(), Some(value));
    }

    fn delete(&mut self, key: &str) {
        self.writes.insert(key.to_string(), None);
    }
}

/// What a successful delivery produced.
#[derive(Debug, Default)]
pub(crate) struct SyscallLog {
    pub writes: BTreeMap<String, Option<Vec<u8>>>,
    pub next_object: u64,
    pub next_promise: u64,
    pub next_plugin: u32,
    pub syscalls: Vec<Syscall>,
}

pub struct VatSyscalls<'a> {
    vat: VatId,
    store: StoreOverlay<'a>,
    plugins: &'a BTreeMap<u32, PluginChannelRecord>,
    objects: &'a mut VirtualObjectManager,
    log: SyscallLog,
    pending_channels: BTreeMap<u32, String>,
}

impl<'a> VatSyscalls<'a> {
    pub(crate) fn new(
        vat: VatId,
        vatstore: &'a BTreeMap<String, Vec<u8>>,
        plugins: &'a BTreeMap<u32, PluginChannelRecord>,
        objects: &'a mut VirtualObjectManager,
        next_object: u64,
        next_promise: u64,
        next_plugin: u32,
    ) -> Self {
        VatSyscalls {
            vat,
            store: StoreOverlay { base: vatstore, writes: BTreeMap::new() },
            plugins,
            objects,
            log: SyscallLog { next_object, next_promise, next_plugin, ..Default::default() },
            pending_channels: BTreeMap::new(),
        }
    }

    /// Writes cached virtual-object state into this delivery's vatstore
    /// writes, so it commits with the crank.
    pub(crate) fn flush_virtual_objects(&mut self) -> Result<usize, VomError> {
        self.objects.flush(&mut self.store)
    }

    pub(crate) fn finish(self) -> SyscallLog {
        let mut log = self.log;
        log.writes = self.store.writes;
        log
    }

    pub fn vat_id(&self) -> VatId {
        self.vat
    }

    /// The vat's root object, exported when the vat was created.
    pub fn root(&self) -> VatSlot {
        VatSlot::export(SlotKind::Object, 0)
    }

    /// Allocates a vref for a new object this vat exports.
    pub fn export_object(&mut self) -> VatSlot {
        let id = self.log.next_object;
        self.log.next_object += 1;
        VatSlot::export(SlotKind::Object, id)
    }

    /// Allocates a vref for a promise this vat will decide.
    pub fn new_promise(&mut self) -> VatSlot {
        let id = self.log.next_promise;
        self.log.next_promise += 1;
        VatSlot::export(SlotKind::Promise, id)
    }

    /// Eventual send. Returns the result promise right away; the sender is
    /// subscribed to it.
    pub fn send(&mut self, target: VatSlot, method: &str, args: CapData<VatSlot>) -> VatSlot {
        let result = self.new_promise();
        self.log.syscalls.push(Syscall::Send { target, message: Message::new(method, args, Some(result)) });
        result
    }

    pub fn send_only(&mut self, target: VatSlot, method: &str, args: CapData<VatSlot>) {
        self.log.syscalls.push(Syscall::Send { target, message: Message::new(method, args, None) });
    }

    pub fn subscribe(&mut self, promise: VatSlot) {
        self.log.syscalls.push(Syscall::Subscribe(promise));
    }

    pub fn resolve(&mut self, promise: VatSlot, outcome: Outcome<VatSlot>) {
        self.log.syscalls.push(Syscall::Resolve { promise, outcome });
    }

    pub fn fulfill(&mut self, promise: VatSlot, data: CapData<VatSlot>) {
        self.resolve(promise, Outcome::Fulfilled(data));
    }

    pub fn reject(&mut self, promise: VatSlot, data: CapData<VatSlot>) {
        self.resolve(promise, Outcome::Rejected(data));
    }

    pub fn drop_imports(&mut self, vrefs: Vec<VatSlot>) {
        self.log.syscalls.push(Syscall::DropImports(vrefs));
    }

    /// Terminates this vat once the delivery returns.
    pub fn exit(&mut self, reason: &str) {
        self.log.syscalls.push(Syscall::Exit { reason: reason.to_string() });
    }

    pub fn vatstore_get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key)
    }

    pub fn vatstore_set(&mut self, key: &str, value: Vec<u8>) {
        self.store.set(key, value);
    }

    pub fn vatstore_delete(&mut self, key: &str) {
        self.store.delete(key);
    }

    /// Runs `f` against this vat's virtual-object manager, backed by the
    /// vatstore. The manager outlives the delivery but not the incarnation;
    /// collection happens between cranks.
    pub fn virtual_objects<T>(
        &mut self,
        f: impl FnOnce(&mut VirtualObjectManager, &mut dyn VatStore) -> Result<T, VomError>,
    ) -> Result<T, VomError> {
        f(&mut *self.objects, &mut self.store)
    }

    /// Opens (or reopens, when `index` names a channel this vat owns) a
    /// plugin channel. No connection is made until the first send.
    pub fn plugin_connect(&mut self, module_ref: &str, index: Option<u32>) -> Result<u32, PluginError> {
        let index = match index {
            Some(i) if self.pending_channels.contains_key(&i) => i,
            requested => resolve_connect(self.plugins, self.log.next_plugin, self.vat, requested)?,
        };
        if index == self.log.next_plugin {
            self.log.next_plugin += 1;
        }
        self.pending_channels.insert(index, module_ref.to_string());
        self.log.syscalls.push(Syscall::PluginConnect { index, module_ref: module_ref.to_string() });
        Ok(index)
    }

    pub fn plugin_send(&mut self, index: u32, payload: Vec<u8>) {
        self.log.syscalls.push(Syscall::PluginSend { index, payload });
    }
}

impl VatStore for VatSyscalls<'_> {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.vatstore_get(key)
    }

    fn set(&mut self, key: &str, value: Vec<u8>) {
        self.vatstore_set(key, value);
    }

    fn delete(&mut self, key: &str) {
        self.vatstore_delete(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::weak::WeakMode;

    fn manager() -> VirtualObjectManager {
        VirtualObjectManager::new(WeakMode::Weak, 4)
    }

    #[test]
    fn test_vatstore_overlay_reads_own_writes() {
        let mut base = BTreeMap::new();
        base.insert("a".to_string(), b"1".to_vec());
        base.insert("b".to_string(), b"2".to_vec());
        let plugins = BTreeMap::new();
        let mut vom = manager();
        let mut sys = VatSyscalls::new(VatId(1), &base, &plugins, &mut vom, 1, 1, 1);
        sys.vatstore_set("a", b"9".to_vec());
        sys.vatstore_delete("b");
        assert_eq!(sys.vatstore_get("a"), Some(b"9".to_vec()));
        assert_eq!(sys.vatstore_get("b"), None);
        let log = sys.finish();
        assert_eq!(log.writes.len(), 2);
        // base untouched until the kernel applies the log
        assert_eq!(base["b"], b"2".to_vec());
    }

    #[test]
    fn test_send_allocates_result_promise() {
        let base = BTreeMap::new();
        let plugins = BTreeMap::new();
        let mut vom = manager();
        let mut sys = VatSyscalls::new(VatId(1), &base, &plugins, &mut vom, 1, 4, 1);
        let target: VatSlot = "o-1".parse().unwrap();
        let p = sys.send(target, "foo", CapData::data("[]"));
        assert_eq!(p.to_string(), "p+4");
        assert_eq!(sys.export_object().to_string(), "o+1");
        let log = sys.finish();
        assert_eq!(log.next_promise, 5);
        assert!(matches!(&log.syscalls[0], Syscall::Send { message, .. } if message.result == Some(p)));
    }

    #[test]
    fn test_plugin_connect_allocates_and_reuses() {
        let base = BTreeMap::new();
        let mut plugins = BTreeMap::new();
        plugins.insert(1, PluginChannelRecord { module_ref: "m".into(), owner: VatId(2) });
        let mut vom = manager();
        let mut sys = VatSyscalls::new(VatId(1), &base, &plugins, &mut vom, 1, 1, 2);
        let i = sys.plugin_connect("m", None).unwrap();
        assert_eq!(i, 2);
        assert_eq!(sys.plugin_connect("m", Some(2)).unwrap(), 2);
        assert_eq!(sys.plugin_connect("m", None).unwrap(), 3);
        assert!(matches!(sys.plugin_connect("m", Some(1)), Err(PluginError::NotOwner { .. })));
    }

    #[test]
    fn test_virtual_object_state_lands_in_vatstore_writes() {
        let base = BTreeMap::new();
        let plugins = BTreeMap::new();
        let mut vom = manager();
        let mut sys = VatSyscalls::new(VatId(1), &base, &plugins, &mut vom, 1, 1, 1);
        let id = sys
            .virtual_objects(|vom, store| {
                let kind = vom.define_kind(store, "thing")?;
                let (id, rep) = vom.make_instance(store, kind, serde_json::json!(1))?;
                vom.set_state(store, id, serde_json::json!(2))?;
                vom.release(rep);
                Ok(id)
            })
            .unwrap();
        assert_eq!(sys.flush_virtual_objects().unwrap(), 1);
        let log = sys.finish();
        assert_eq!(log.writes.get(&format!("vom.o.{}.{}", id.kind, id.instance)), Some(&Some(b"2".to_vec())));
        // collection waits for the kernel
        assert!(vom.has_pending_collection());
    }
}
