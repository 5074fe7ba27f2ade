//! Drop protocol hook.
//!
//! When the last importer of a kernel object lets go of it, the owner is
//! told: an owning vat gets a `DropExports` delivery, an owning peer gets a
//! `Drop` wire message for the slot it exported to us.

use log::debug;

use crate::comms::{self, CommsError};
use crate::message::{CapData, Message};
use crate::promises::PromiseState;
use crate::slots::KernelSlot;
use crate::state::{KernelState, Owner, RunQueueItem};

fn capdata_mentions(data: &CapData<KernelSlot>, kslot: &KernelSlot) -> bool {
    data.slots.contains(kslot)
}

fn message_mentions(message: &Message<KernelSlot>, kslot: &KernelSlot) -> bool {
    capdata_mentions(&message.args, kslot) || message.result.as_ref() == Some(kslot)
}

/// True while anything other than the owner can still reach `kslot`.
pub(crate) fn has_importers(state: &KernelState, kslot: &KernelSlot) -> bool {
    let owner = state.object(kslot).map(|o| o.owner.clone());

    let vat_import = state
        .vats
        .values()
        .any(|vs| vs.clist.vref_for(kslot).is_some_and(|v| !v.allocated_by_vat));
    if vat_import {
        return true;
    }

    let peer_import = state.slots.peers().any(|(peer, clist)| {
        clist.holds(kslot) && owner.as_ref() != Some(&Owner::Peer(peer.clone()))
    });
    if peer_import {
        return true;
    }

    let queued = state.run_queue.values().any(|item| match item {
        RunQueueItem::Send { target, message } => target == kslot || message_mentions(message, kslot),
        RunQueueItem::Notify { promise, .. } => promise == kslot,
        _ => false,
    });
    if queued {
        return true;
    }

    state.promises.iter().any(|(_, p)| match &p.state {
        PromiseState::Unresolved { queue, .. } => queue.iter().any(|m| message_mentions(m, kslot)),
        PromiseState::Fulfilled(d) | PromiseState::Rejected(d) => capdata_mentions(d, kslot),
    })
}

/// Tells the owner of `kslot` once nothing else references it.
pub(crate) fn release(state: &mut KernelState, kslot: KernelSlot) -> Result<(), CommsError> {
    if !kslot.is_object() || has_importers(state, &kslot) {
        return Ok(());
    }
    let Some(owner) = state.object(&kslot).map(|o| o.owner.clone()) else {
        return Ok(());
    };
    match owner {
        Owner::Vat(vat) => {
            if state.vats.get(&vat).is_some_and(|vs| vs.record.is_running()) {
                debug!("gc: {} unreferenced, dropping export of {}", kslot, vat);
                state.push_run_queue(RunQueueItem::DropExports { vat, slots: vec![kslot] });
            }
        }
        Owner::Peer(peer) => {
            if let Some(wire) = state.slots.drop_entry(&peer, &kslot) {
                debug!("gc: {} unreferenced, dropping import from {}", kslot, peer);
                comms::transmit_drop(state, &peer, vec![wire])?;
            }
            state.objects.remove(&kslot.id);
        }
    }
    Ok(())
}
