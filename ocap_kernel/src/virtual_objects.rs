//! Virtual objects: vat-side objects whose state lives in the vatstore.
//!
//! An instance is identified by `(kind, instance)` for its whole life. At
//! most a bounded number of instance states are held in memory (an LRU
//! cache with write-back); everything else is reloaded on demand.
//! In-memory representatives are kept in a `WeakArena`, so releasing the
//! last strong reference lets the representative go without touching the
//! stored state. `reanimate` brings back a representative with the same
//! identity.
//!
//! An instance is garbage once it has no live representative, no
//! references from other instances' state, and is not exported.
//! `bring_out_your_dead` deletes such instances, cascading through the
//! references their state held. Deleted identities never come back. The
//! kernel runs it between cranks; vat code only queues candidates.
//!
//! Store layout (all keys inside the vat's namespace):
//!
//! | key                      | value                          |
//! |--------------------------|--------------------------------|
//! | `vom.next_kind`          | next kind id                   |
//! | `vom.kind.{k}`           | kind name                      |
//! | `vom.kind_name.{name}`   | kind id                        |
//! | `vom.next.{k}`           | next instance id of kind `k`   |
//! | `vom.o.{k}.{i}`          | instance state (JSON)          |
//! | `vom.rc.{k}.{i}`         | count of references in state   |
//! | `vom.export.{k}.{i}`     | present while exported         |
//! | `vom.deleted.{k}.{i}`    | tombstone                      |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use serde_json::Value;
use thiserror::Error;

use crate::options::KernelOptions;
use crate::vat::VatStore;
use crate::weak::{Deref, Identity, StrongRef, WeakArena, WeakHandle, WeakMode};

const VREF_FIELD: &str = "$vref";

#[derive(Debug, Error)]
pub enum VomError {
    #[error("unknown kind {0}")]
    UnknownKind(u32),
    #[error("unknown virtual object {0}")]
    UnknownObject(VirtualObjectId),
    #[error("virtual object {0} was deleted")]
    ObjectDeleted(VirtualObjectId),
    #[error("state codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt vatstore entry {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualObjectId {
    pub kind: u32,
    pub instance: u64,
}

impl VirtualObjectId {
    /// The JSON value that stores a reference to this instance inside
    /// another instance's state.
    pub fn to_ref_value(self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(VREF_FIELD.to_string(), Value::String(self.to_string()));
        Value::Object(map)
    }

    fn suffix(self) -> String {
        format!("{}.{}", self.kind, self.instance)
    }
}

impl fmt::Display for VirtualObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vo{}.{}", self.kind, self.instance)
    }
}

impl FromStr for VirtualObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("vo").ok_or_else(|| format!("not a virtual object ref: {}", s))?;
        let (kind, instance) = rest.split_once('.').ok_or_else(|| format!("not a virtual object ref: {}", s))?;
        let kind = kind.parse().map_err(|_| format!("bad kind in {}", s))?;
        let instance = instance.parse().map_err(|_| format!("bad instance in {}", s))?;
        Ok(VirtualObjectId { kind, instance })
    }
}

/// In-memory stand-in for a virtual object.
#[derive(Debug, PartialEq, Eq)]
pub struct Representative {
    id: VirtualObjectId,
}

impl Representative {
    pub fn id(&self) -> VirtualObjectId {
        self.id
    }
}

impl Identity for Representative {
    type Token = VirtualObjectId;

    fn identity(&self) -> VirtualObjectId {
        self.id
    }
}

/// References to other virtual objects found anywhere inside `value`.
pub fn collect_refs(value: &Value) -> Vec<VirtualObjectId> {
    let mut out = Vec::new();
    walk_refs(value, &mut out);
    out
}

fn walk_refs(value: &Value, out: &mut Vec<VirtualObjectId>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(id) = map.get(VREF_FIELD).and_then(Value::as_str).and_then(|s| s.parse().ok()) {
                    out.push(id);
                    return;
                }
            }
            for v in map.values() {
                walk_refs(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                walk_refs(v, out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// State cache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry {
    state: Value,
    dirty: bool,
    stamp: u64,
}

#[derive(Debug)]
struct StateCache {
    capacity: usize,
    clock: u64,
    entries: BTreeMap<VirtualObjectId, CacheEntry>,
}

impl StateCache {
    fn new(capacity: usize) -> Self {
        StateCache { capacity: capacity.max(1), clock: 0, entries: BTreeMap::new() }
    }

    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, id: &VirtualObjectId) -> Option<&Value> {
        let stamp = self.touch();
        let entry = self.entries.get_mut(id)?;
        entry.stamp = stamp;
        Some(&entry.state)
    }

    /// Inserts, returning the least recently used entry if over capacity.
    fn put(&mut self, id: VirtualObjectId, state: Value, dirty: bool) -> Option<(VirtualObjectId, CacheEntry)> {
        let stamp = self.touch();
        let dirty = dirty || self.entries.get(&id).is_some_and(|e| e.dirty);
        self.entries.insert(id, CacheEntry { state, dirty, stamp });
        if self.entries.len() <= self.capacity {
            return None;
        }
        let oldest = self.entries.iter().min_by_key(|(_, e)| e.stamp).map(|(id, _)| *id)?;
        self.entries.remove(&oldest).map(|e| (oldest, e))
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct VirtualObjectManager {
    arena: WeakArena<Representative>,
    live: BTreeMap<VirtualObjectId, WeakHandle>,
    cache: StateCache,
    possibly_dead: Arc<Mutex<BTreeSet<VirtualObjectId>>>,
}

impl fmt::Debug for VirtualObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualObjectManager")
            .field("arena", &self.arena)
            .field("cached", &self.cache.entries.len())
            .finish()
    }
}

fn read_u64(store: &dyn VatStore, key: &str) -> Result<Option<u64>, VomError> {
    match store.get(key) {
        None => Ok(None),
        Some(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| VomError::Corrupt { key: key.to_string(), detail: "expected a decimal counter".into() }),
    }
}

fn write_u64(store: &mut dyn VatStore, key: &str, value: u64) {
    store.set(key, value.to_string().into_bytes());
}

impl VirtualObjectManager {
    pub fn new(mode: WeakMode, cache_size: usize) -> Self {
        VirtualObjectManager {
            arena: WeakArena::new(mode),
            live: BTreeMap::new(),
            cache: StateCache::new(cache_size),
            possibly_dead: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn from_options(options: &KernelOptions) -> Self {
        Self::new(options.weak_mode, options.vom_cache_size)
    }

    /// `WeakMode::Strong` means representatives are never collected.
    pub fn mode(&self) -> WeakMode {
        self.arena.mode()
    }

    pub fn live_representatives(&self) -> usize {
        self.arena.live_count()
    }

    pub fn cached_states(&self) -> usize {
        self.cache.entries.len()
    }

    /// True when finalizers or collection candidates are waiting.
    pub fn has_pending_collection(&self) -> bool {
        self.arena.pending_finalizers() > 0 || self.possibly_dead.lock().is_ok_and(|set| !set.is_empty())
    }

    /// Forgets every cached state without writing it back. Used when the
    /// writes a crank made were thrown away.
    pub fn discard_cached_states(&mut self) {
        self.cache.entries.clear();
    }

    /// Returns the id of kind `name`, defining it on first use. Kinds are
    /// durable, so a new incarnation gets the same id back.
    pub fn define_kind(&mut self, store: &mut dyn VatStore, name: &str) -> Result<u32, VomError> {
        let by_name = format!("vom.kind_name.{}", name);
        if let Some(id) = read_u64(store, &by_name)? {
            return u32::try_from(id).map_err(|_| VomError::Corrupt { key: by_name, detail: "kind id overflow".into() });
        }
        let next = read_u64(store, "vom.next_kind")?.unwrap_or(1);
        let id = u32::try_from(next)
            .map_err(|_| VomError::Corrupt { key: "vom.next_kind".into(), detail: "kind id overflow".into() })?;
        write_u64(store, "vom.next_kind", next + 1);
        store.set(&format!("vom.kind.{}", id), name.as_bytes().to_vec());
        write_u64(store, &by_name, next);
        debug!("vom: defined kind {} as {}", name, id);
        Ok(id)
    }

    pub fn kind_name(&self, store: &dyn VatStore, kind: u32) -> Option<String> {
        store.get(&format!("vom.kind.{}", kind)).and_then(|b| String::from_utf8(b).ok())
    }

    /// Creates an instance and returns it with its first representative.
    pub fn make_instance(
        &mut self,
        store: &mut dyn VatStore,
        kind: u32,
        initial: Value,
    ) -> Result<(VirtualObjectId, StrongRef), VomError> {
        if store.get(&format!("vom.kind.{}", kind)).is_none() {
            return Err(VomError::UnknownKind(kind));
        }
        let counter = format!("vom.next.{}", kind);
        let instance = read_u64(store, &counter)?.unwrap_or(1);
        write_u64(store, &counter, instance + 1);
        let id = VirtualObjectId { kind, instance };

        for referenced in collect_refs(&initial) {
            self.adjust_refcount(store, referenced, 1)?;
        }
        // write through once so the instance exists even if never flushed
        store.set(&state_key(id), serde_json::to_vec(&initial)?);
        self.cache_put(store, id, initial, false)?;
        trace!("vom: made {}", id);
        Ok((id, self.new_representative(id)))
    }

    fn new_representative(&mut self, id: VirtualObjectId) -> StrongRef {
        let strong = self.arena.insert(Representative { id });
        let dead = Arc::clone(&self.possibly_dead);
        self.arena.register_finalizer(
            &strong,
            Box::new(move |id| {
                if let Ok(mut set) = dead.lock() {
                    set.insert(id);
                }
            }),
        );
        self.live.insert(id, strong.handle());
        strong
    }

    pub fn is_deleted(&self, store: &dyn VatStore, id: VirtualObjectId) -> bool {
        store.get(&deleted_key(id)).is_some()
    }

    fn check_usable(&self, store: &dyn VatStore, id: VirtualObjectId) -> Result<(), VomError> {
        if self.is_deleted(store, id) {
            return Err(VomError::ObjectDeleted(id));
        }
        Ok(())
    }

    pub fn get_state(&mut self, store: &mut dyn VatStore, id: VirtualObjectId) -> Result<Value, VomError> {
        self.check_usable(store, id)?;
        if let Some(state) = self.cache.get(&id) {
            return Ok(state.clone());
        }
        let bytes = store.get(&state_key(id)).ok_or(VomError::UnknownObject(id))?;
        let state: Value = serde_json::from_slice(&bytes)?;
        self.cache_put(store, id, state.clone(), false)?;
        Ok(state)
    }

    /// Replaces an instance's state, adjusting the reference counts of
    /// every virtual object the old and new states mention.
    pub fn set_state(&mut self, store: &mut dyn VatStore, id: VirtualObjectId, state: Value) -> Result<(), VomError> {
        let old = self.get_state(store, id)?;
        let mut delta: BTreeMap<VirtualObjectId, i64> = BTreeMap::new();
        for r in collect_refs(&state) {
            *delta.entry(r).or_default() += 1;
        }
        for r in collect_refs(&old) {
            *delta.entry(r).or_default() -= 1;
        }
        for (referenced, change) in delta {
            if change != 0 {
                self.adjust_refcount(store, referenced, change)?;
            }
        }
        self.cache_put(store, id, state, true)
    }

    fn cache_put(&mut self, store: &mut dyn VatStore, id: VirtualObjectId, state: Value, dirty: bool) -> Result<(), VomError> {
        if let Some((evicted, entry)) = self.cache.put(id, state, dirty) {
            if entry.dirty {
                trace!("vom: writing back {}", evicted);
                store.set(&state_key(evicted), serde_json::to_vec(&entry.state)?);
            }
        }
        Ok(())
    }

    /// Writes every dirty cached state back to the store.
    pub fn flush(&mut self, store: &mut dyn VatStore) -> Result<usize, VomError> {
        let mut written = 0;
        for (id, entry) in self.cache.entries.iter_mut().filter(|(_, e)| e.dirty) {
            store.set(&state_key(*id), serde_json::to_vec(&entry.state)?);
            entry.dirty = false;
            written += 1;
        }
        Ok(written)
    }

    /// Drops the cached state of `id`, writing it back first if needed.
    pub fn evict(&mut self, store: &mut dyn VatStore, id: VirtualObjectId) -> Result<bool, VomError> {
        let Some(entry) = self.cache.entries.remove(&id) else {
            return Ok(false);
        };
        if entry.dirty {
            store.set(&state_key(id), serde_json::to_vec(&entry.state)?);
        }
        Ok(true)
    }

    /// A strong reference to the representative of `id`, reusing the live
    /// one if there is one.
    pub fn reanimate(&mut self, store: &dyn VatStore, id: VirtualObjectId) -> Result<StrongRef, VomError> {
        self.check_usable(store, id)?;
        if let Some(strong) = self.live.get(&id).and_then(|h| self.arena.upgrade(*h)) {
            return Ok(strong);
        }
        if !self.cache.entries.contains_key(&id) && store.get(&state_key(id)).is_none() {
            return Err(VomError::UnknownObject(id));
        }
        trace!("vom: reanimating {}", id);
        Ok(self.new_representative(id))
    }

    pub fn representative(&self, strong: &StrongRef) -> Option<&Representative> {
        self.arena.get(strong)
    }

    pub fn weak_handle(&self, strong: &StrongRef) -> WeakHandle {
        self.arena.make_weak_handle(strong)
    }

    pub fn dereference(&self, handle: WeakHandle) -> Deref<'_, Representative> {
        self.arena.dereference(handle)
    }

    pub fn retain(&mut self, strong: &StrongRef) -> StrongRef {
        self.arena.retain(strong)
    }

    /// Gives back a strong reference. The stored state is unaffected.
    pub fn release(&mut self, strong: StrongRef) -> bool {
        self.arena.release(strong)
    }

    pub fn refcount(&self, store: &dyn VatStore, id: VirtualObjectId) -> Result<u64, VomError> {
        Ok(read_u64(store, &rc_key(id))?.unwrap_or(0))
    }

    fn adjust_refcount(&mut self, store: &mut dyn VatStore, id: VirtualObjectId, change: i64) -> Result<(), VomError> {
        self.check_usable(store, id)?;
        let key = rc_key(id);
        let current = read_u64(store, &key)?.unwrap_or(0);
        let next = current.saturating_add_signed(change);
        if next == 0 {
            store.delete(&key);
            self.mark_possibly_dead(id);
        } else {
            write_u64(store, &key, next);
        }
        Ok(())
    }

    fn mark_possibly_dead(&self, id: VirtualObjectId) {
        if let Ok(mut set) = self.possibly_dead.lock() {
            set.insert(id);
        }
    }

    /// Pins `id` while it is reachable from outside the vat.
    pub fn export(&mut self, store: &mut dyn VatStore, id: VirtualObjectId) -> Result<(), VomError> {
        self.check_usable(store, id)?;
        store.set(&export_key(id), Vec::new());
        Ok(())
    }

    pub fn unexport(&mut self, store: &mut dyn VatStore, id: VirtualObjectId) -> Result<(), VomError> {
        if store.get(&export_key(id)).is_some() {
            store.delete(&export_key(id));
            self.mark_possibly_dead(id);
        }
        Ok(())
    }

    pub fn is_exported(&self, store: &dyn VatStore, id: VirtualObjectId) -> bool {
        store.get(&export_key(id)).is_some()
    }

    /// Deletes `id` now, whoever still refers to it. References held in its
    /// state are released.
    pub fn delete(&mut self, store: &mut dyn VatStore, id: VirtualObjectId) -> Result<(), VomError> {
        self.check_usable(store, id)?;
        let state = match self.cache.entries.remove(&id) {
            Some(entry) => entry.state,
            None => {
                let bytes = store.get(&state_key(id)).ok_or(VomError::UnknownObject(id))?;
                serde_json::from_slice(&bytes)?
            }
        };
        store.delete(&state_key(id));
        store.delete(&rc_key(id));
        store.delete(&export_key(id));
        store.set(&deleted_key(id), Vec::new());
        self.live.remove(&id);
        debug!("vom: deleted {}", id);
        for referenced in collect_refs(&state) {
            if !self.is_deleted(store, referenced) {
                self.adjust_refcount(store, referenced, -1)?;
            }
        }
        Ok(())
    }

    fn has_live_representative(&self, id: &VirtualObjectId) -> bool {
        self.live.get(id).is_some_and(|h| !self.arena.dereference(*h).is_absent())
    }

    /// Runs pending finalizers and deletes every candidate that is no
    /// longer reachable, repeating until nothing more dies. Returns the
    /// deleted ids in deletion order.
    pub(crate) fn bring_out_your_dead(&mut self, store: &mut dyn VatStore) -> Result<Vec<VirtualObjectId>, VomError> {
        self.arena.drain_finalizers();
        let mut deleted = Vec::new();
        loop {
            let candidates = match self.possibly_dead.lock() {
                Ok(mut set) => std::mem::take(&mut *set),
                Err(_) => BTreeSet::new(),
            };
            if candidates.is_empty() {
                break;
            }
            for id in candidates {
                if self.is_deleted(store, id) || store.get(&state_key(id)).is_none() {
                    continue;
                }
                if self.has_live_representative(&id) || self.is_exported(store, id) || self.refcount(store, id)? > 0 {
                    continue;
                }
                self.delete(store, id)?;
                deleted.push(id);
            }
        }
        for id in &deleted {
            self.live.remove(id);
        }
        // forget handles whose representatives are gone
        let arena = &self.arena;
        self.live.retain(|_, h| !arena.dereference(*h).is_absent());
        Ok(deleted)
    }
}

fn state_key(id: VirtualObjectId) -> String {
    format!("vom.o.{}", id.suffix())
}

fn rc_key(id: VirtualObjectId) -> String {
    format!("vom.rc.{}", id.suffix())
}

fn export_key(id: VirtualObjectId) -> String {
    format!("vom.export.{}", id.suffix())
}

fn deleted_key(id: VirtualObjectId) -> String {
    format!("vom.deleted.{}", id.suffix())
}
