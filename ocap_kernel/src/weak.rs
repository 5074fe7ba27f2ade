//! Generational arena with weak handles and deferred finalizers.
//!
//! Strong references are explicit, non-copyable tokens. When the last one
//! is released the value is collected, the slot's generation is bumped so
//! every outstanding `WeakHandle` dereferences to `Absent`, and the
//! registered finalizers are queued. Finalizers only run from
//! `drain_finalizers`, which the owner calls between cranks, and they
//! receive the collected value's identity token, never the value.
//!
//! `WeakMode::Strong` is the degraded mode for hosts that cannot observe
//! collection: nothing is ever collected and finalizers never fire.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeakMode {
    #[default]
    Weak,
    Strong,
}

/// Opaque, copyable, serializable reference that never keeps its target alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeakHandle {
    index: u32,
    generation: u64,
}

/// Proof of one strong reference. Must be handed back with `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct StrongRef {
    handle: WeakHandle,
}

impl StrongRef {
    pub fn handle(&self) -> WeakHandle {
        self.handle
    }
}

pub enum Deref<'a, T> {
    Live(&'a T),
    Absent,
}

impl<'a, T> Deref<'a, T> {
    pub fn live(self) -> Option<&'a T> {
        match self {
            Deref::Live(v) => Some(v),
            Deref::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Deref::Absent)
    }
}

/// Values stored in the arena expose the token their finalizers receive.
pub trait Identity {
    type Token: Clone;
    fn identity(&self) -> Self::Token;
}

pub type Finalizer<K> = Box<dyn FnOnce(K) + Send>;

struct Entry<T: Identity> {
    value: T,
    strong: usize,
    finalizers: Vec<Finalizer<T::Token>>,
}

struct Slot<T: Identity> {
    generation: u64,
    entry: Option<Entry<T>>,
}

pub struct WeakArena<T: Identity> {
    mode: WeakMode,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    pending: VecDeque<(Finalizer<T::Token>, T::Token)>,
}

impl<T: Identity> fmt::Debug for WeakArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakArena")
            .field("mode", &self.mode)
            .field("live", &self.live_count())
            .field("pending_finalizers", &self.pending.len())
            .finish()
    }
}

impl<T: Identity> WeakArena<T> {
    pub fn new(mode: WeakMode) -> Self {
        WeakArena { mode, slots: Vec::new(), free: Vec::new(), pending: VecDeque::new() }
    }

    pub fn mode(&self) -> WeakMode {
        self.mode
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn pending_finalizers(&self) -> usize {
        self.pending.len()
    }

    fn entry(&self, handle: WeakHandle) -> Option<&Entry<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: WeakHandle) -> Option<&mut Entry<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Stores `value` and returns its first strong reference.
    pub fn insert(&mut self, value: T) -> StrongRef {
        let entry = Entry { value, strong: 1, finalizers: Vec::new() };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        StrongRef { handle: WeakHandle { index, generation } }
    }

    pub fn retain(&mut self, strong: &StrongRef) -> StrongRef {
        if let Some(entry) = self.entry_mut(strong.handle) {
            entry.strong += 1;
        }
        StrongRef { handle: strong.handle }
    }

    /// New strong reference from a weak handle, if the target is live.
    pub fn upgrade(&mut self, handle: WeakHandle) -> Option<StrongRef> {
        let entry = self.entry_mut(handle)?;
        entry.strong += 1;
        Some(StrongRef { handle })
    }

    /// Gives back one strong reference. Returns true if this collected the value.
    pub fn release(&mut self, strong: StrongRef) -> bool {
        let handle = strong.handle;
        let mode = self.mode;
        let Some(entry) = self.entry_mut(handle) else {
            return false;
        };
        entry.strong = entry.strong.saturating_sub(1);
        if entry.strong > 0 || mode == WeakMode::Strong {
            return false;
        }
        let slot = &mut self.slots[handle.index as usize];
        let Some(entry) = slot.entry.take() else {
            return false;
        };
        slot.generation += 1;
        self.free.push(handle.index);
        let token = entry.value.identity();
        for finalizer in entry.finalizers {
            self.pending.push_back((finalizer, token.clone()));
        }
        true
    }

    pub fn get(&self, strong: &StrongRef) -> Option<&T> {
        self.entry(strong.handle).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, strong: &StrongRef) -> Option<&mut T> {
        self.entry_mut(strong.handle).map(|e| &mut e.value)
    }

    pub fn make_weak_handle(&self, strong: &StrongRef) -> WeakHandle {
        strong.handle
    }

    pub fn dereference(&self, handle: WeakHandle) -> Deref<'_, T> {
        match self.entry(handle) {
            Some(e) => Deref::Live(&e.value),
            None => Deref::Absent,
        }
    }

    pub fn strong_count(&self, handle: WeakHandle) -> usize {
        self.entry(handle).map_or(0, |e| e.strong)
    }

    /// Registers a callback to run once after the value is collected.
    pub fn register_finalizer(&mut self, strong: &StrongRef, callback: Finalizer<T::Token>) {
        if let Some(entry) = self.entry_mut(strong.handle) {
            entry.finalizers.push(callback);
        }
    }

    /// Runs queued finalizers in collection order. Returns how many ran.
    pub fn drain_finalizers(&mut self) -> usize {
        let mut ran = 0;
        while let Some((finalizer, token)) = self.pending.pop_front() {
            finalizer(token);
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, PartialEq)]
    struct Obj(u32);

    impl Identity for Obj {
        type Token = u32;
        fn identity(&self) -> u32 {
            self.0
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn() -> Finalizer<u32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let make = move || -> Finalizer<u32> {
            let s = s.clone();
            Box::new(move |token| s.lock().unwrap().push(token))
        };
        (seen, make)
    }

    #[test]
    fn test_collected_handle_is_absent_and_slot_reuse_is_safe() {
        let mut arena = WeakArena::new(WeakMode::Weak);
        let a = arena.insert(Obj(1));
        let weak_a = arena.make_weak_handle(&a);
        assert!(matches!(arena.dereference(weak_a), Deref::Live(Obj(1))));

        assert!(arena.release(a));
        assert!(arena.dereference(weak_a).is_absent());

        // the freed slot is reused, but the old handle cannot see the newcomer
        let b = arena.insert(Obj(2));
        assert_eq!(arena.make_weak_handle(&b).index, weak_a.index);
        assert!(arena.dereference(weak_a).is_absent());
        assert_eq!(arena.get(&b), Some(&Obj(2)));
    }

    #[test]
    fn test_finalizers_fire_once_and_only_when_drained() {
        let (seen, make) = recorder();
        let mut arena = WeakArena::new(WeakMode::Weak);
        let a = arena.insert(Obj(7));
        arena.register_finalizer(&a, make());
        let a2 = arena.retain(&a);
        assert!(!arena.release(a));
        assert!(arena.release(a2));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(arena.drain_finalizers(), 1);
        assert_eq!(arena.drain_finalizers(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_strong_mode_never_collects() {
        let (seen, make) = recorder();
        let mut arena = WeakArena::new(WeakMode::Strong);
        assert_eq!(arena.mode(), WeakMode::Strong);
        let a = arena.insert(Obj(3));
        let weak = a.handle();
        arena.register_finalizer(&a, make());
        assert!(!arena.release(a));
        assert_eq!(arena.drain_finalizers(), 0);
        assert!(matches!(arena.dereference(weak), Deref::Live(_)));
        assert!(seen.lock().unwrap().is_empty());
        // still reachable again through the weak handle
        assert!(arena.upgrade(weak).is_some());
    }

    #[test]
    fn test_upgrade_dead_handle_fails() {
        let mut arena = WeakArena::new(WeakMode::Weak);
        let a = arena.insert(Obj(1));
        let weak = a.handle();
        arena.release(a);
        assert!(arena.upgrade(weak).is_none());
        assert_eq!(arena.strong_count(weak), 0);
    }
}
