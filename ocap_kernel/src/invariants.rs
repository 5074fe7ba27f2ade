//! Structural invariants of a kernel state.
//!
//! Checked when a state is loaded from the store and, in debug builds,
//! before every commit. The first violation found is returned.

use thiserror::Error;

use crate::promises::PromiseState;
use crate::slots::KernelSlot;
use crate::state::{KernelState, RunQueueItem};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invariant violation [{check}]: {detail}")]
pub struct InvariantViolation {
    pub check: &'static str,
    pub detail: String,
}

fn violation(check: &'static str, detail: String) -> Result<(), InvariantViolation> {
    Err(InvariantViolation { check, detail })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn check_invariants(state: &KernelState) -> Result<(), InvariantViolation> {
    check_counters(state)?;
    check_vat_clists(state)?;
    check_peer_clists(state)?;
    check_mailboxes(state)?;
    check_promises(state)?;
    check_run_queue(state)?;
    check_plugin_owners(state)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Individual checks (private)
// ---------------------------------------------------------------------------

/// Allocation counters are past every id in use.
fn check_counters(state: &KernelState) -> Result<(), InvariantViolation> {
    let meta = &state.meta;
    let tables: [(&str, Option<u64>, u64); 5] = [
        ("objects", state.objects.keys().next_back().copied(), meta.next_object),
        ("promises", state.promises.promises.keys().next_back().copied(), meta.next_promise),
        ("devices", state.devices.keys().next_back().copied(), meta.next_device),
        ("run_queue", state.run_queue.keys().next_back().copied(), meta.next_run_queue),
        ("vats", state.vats.keys().next_back().map(|v| u64::from(v.0)), u64::from(meta.next_vat)),
    ];
    for (table, highest, next) in tables {
        if let Some(highest) = highest {
            if highest >= next {
                return violation("counters", format!("{} id {} not below counter {}", table, highest, next));
            }
        }
    }
    if let Some(highest) = state.plugins.keys().next_back() {
        if *highest >= meta.next_plugin {
            return violation("counters", format!("plugin channel {} not below counter {}", highest, meta.next_plugin));
        }
    }
    Ok(())
}

/// Each vat c-list is a bijection over live kernel records.
fn check_vat_clists(state: &KernelState) -> Result<(), InvariantViolation> {
    for (vat, vs) in &state.vats {
        for (kslot, vref) in vs.clist.entries() {
            if vs.clist.kslot_for(vref) != Some(*kslot) {
                return violation("vat_clist", format!("{}: {} -> {} has no matching reverse entry", vat, kslot, vref));
            }
            if kslot.kind != vref.kind {
                return violation("vat_clist", format!("{}: {} mapped to {} of another kind", vat, kslot, vref));
            }
            if !vref.allocated_by_vat && vref.id >= vs.clist.next_import() {
                return violation("vat_clist", format!("{}: import {} not below counter", vat, vref));
            }
        }
    }
    Ok(())
}

/// Per peer, reverse entries are exactly the flipped forward entries.
fn check_peer_clists(state: &KernelState) -> Result<(), InvariantViolation> {
    for (peer, clist) in state.slots.peers() {
        if !state.peers.contains_key(peer) {
            return violation("peer_clist", format!("c-list for unregistered peer {}", peer));
        }
        for (kslot, wire) in clist.access_entries().iter().chain(clist.resolver_entries()) {
            if clist.inbound_entries().get(&wire.flip()) != Some(kslot) {
                return violation("peer_clist", format!("{}: {} -> {} not reachable from {}", peer, kslot, wire, wire.flip()));
            }
        }
        if clist.inbound_entries().len() != clist.len() {
            return violation(
                "peer_clist",
                format!("{}: {} reverse entries for {} forward entries", peer, clist.inbound_entries().len(), clist.len()),
            );
        }
    }
    Ok(())
}

/// Unacknowledged outbound messages are in order and past the peer's ack.
fn check_mailboxes(state: &KernelState) -> Result<(), InvariantViolation> {
    for (peer, mb) in state.mailbox.peers() {
        if !state.peers.contains_key(peer) {
            return violation("mailbox", format!("mailbox for unregistered peer {}", peer));
        }
        if mb.next_outbound_seq == 0 {
            return violation("mailbox", format!("{}: outbound seqs start at 1", peer));
        }
        let mut previous = mb.highest_inbound_acknowledged;
        for (seq, _) in &mb.outbound {
            if *seq <= previous {
                return violation("mailbox", format!("{}: outbound seq {} out of order", peer, seq));
            }
            previous = *seq;
        }
        if previous >= mb.next_outbound_seq {
            return violation("mailbox", format!("{}: outbound seq {} not below counter", peer, previous));
        }
    }
    Ok(())
}

fn check_promises(state: &KernelState) -> Result<(), InvariantViolation> {
    for (kp, promise) in state.promises.iter() {
        if let PromiseState::Unresolved { .. } = promise.state {
            if !promise.notified.is_empty() {
                return violation("promises", format!("{} is unresolved but has notified subscribers", kp));
            }
        }
    }
    Ok(())
}

/// Promises named by queued work exist; they are never deleted.
fn check_run_queue(state: &KernelState) -> Result<(), InvariantViolation> {
    let known = |kp: &KernelSlot| !kp.is_promise() || state.promises.get(kp).is_some();
    for (index, item) in &state.run_queue {
        let missing = match item {
            RunQueueItem::Send { target, message } => {
                [Some(target), message.result.as_ref()].into_iter().flatten().find(|k| !known(*k))
            }
            RunQueueItem::Notify { promise, .. } => Some(promise).filter(|k| !known(*k)),
            RunQueueItem::StartVat { vat }
            | RunQueueItem::DropExports { vat, .. }
            | RunQueueItem::PluginResponse { vat, .. }
            | RunQueueItem::PluginBroken { vat, .. } => {
                if !state.vats.contains_key(vat) {
                    return violation("run_queue", format!("item {} names unknown vat {}", index, vat));
                }
                None
            }
            RunQueueItem::Inbound { .. } => None,
        };
        if let Some(kp) = missing {
            return violation("run_queue", format!("item {} names unknown promise {}", index, kp));
        }
    }
    Ok(())
}

fn check_plugin_owners(state: &KernelState) -> Result<(), InvariantViolation> {
    for (index, record) in &state.plugins {
        if !state.vats.contains_key(&record.owner) {
            return violation("plugins", format!("channel {} owned by unknown vat {}", index, record.owner));
        }
    }
    Ok(())
}
