//! Machine-to-machine messaging on top of the mailbox.
//!
//! Outbound: kernel-slot messages are rewritten into wire slots through the
//! peer c-list and queued as mailbox payloads. Inbound: payloads handed over
//! by the mailbox are decoded, rewritten back into kernel slots (minting
//! fresh kernel slots for anything the peer introduces) and queued on the
//! run-queue.
//!
//! Promise flow across machines:
//! - a result promise is sent as a resolver slot and its decider becomes the
//!   peer; the peer subscribes us implicitly and answers with `Resolve`
//! - any other promise we reveal to a peer subscribes that peer, so the peer
//!   always learns the settlement

use log::{trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clist::ClistError;
use crate::gc;
use crate::message::{CapData, Message, Outcome, RejectionReason};
use crate::promises::{Decider, PromiseError, Subscriber};
use crate::slots::{KernelSlot, PeerId, WireRole, WireSlot};
use crate::state::{KernelState, Owner, RunQueueItem};

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("malformed wire message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Clist(#[from] ClistError),
    #[error(transparent)]
    Promise(#[from] PromiseError),
    #[error("protocol violation from {peer}: {detail}")]
    Violation { peer: PeerId, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Deliver {
        target: WireSlot,
        method: String,
        args: CapData<WireSlot>,
        result: Option<WireSlot>,
    },
    Resolve {
        promise: WireSlot,
        rejected: bool,
        data: CapData<WireSlot>,
    },
    Drop {
        slots: Vec<WireSlot>,
    },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CommsError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommsError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// What an inbound payload turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEffect {
    Queued(KernelSlot),
    Resolved(KernelSlot),
    Dropped(usize),
    /// Undeliverable; the sender's result promise was rejected.
    Rejected(String),
}

fn enqueue(state: &mut KernelState, peer: &PeerId, msg: &WireMessage) -> Result<u64, CommsError> {
    let bytes = msg.encode()?;
    Ok(state.mailbox.enqueue_outbound(peer, bytes))
}

/// Our wire form of `kslot` for `peer`. A promise revealed to the peer for
/// the first time subscribes the peer to it.
pub(crate) fn export_slot(state: &mut KernelState, peer: &PeerId, kslot: KernelSlot) -> Result<WireSlot, CommsError> {
    let (wire, fresh) = state.slots.translate_outbound_fresh(peer, kslot)?;
    if fresh && kslot.is_promise() {
        state.subscribe(kslot, Subscriber::Peer(peer.clone()))?;
    }
    Ok(wire)
}

/// Kernel slot for a wire slot written by `peer`, creating kernel records
/// for anything the peer minted.
pub(crate) fn import_slot(state: &mut KernelState, peer: &PeerId, wire: WireSlot) -> Result<KernelSlot, CommsError> {
    if let Some(k) = state.slots.peer(peer).and_then(|c| c.inbound_entries().get(&wire)) {
        return Ok(*k);
    }
    // The slot is new, so a successful translation mints it. The kernel
    // record is created right after with the same id.
    let provisional = match wire.kind() {
        crate::slots::SlotKind::Object => KernelSlot::object(state.meta.next_object),
        _ => KernelSlot::promise(state.meta.next_promise),
    };
    let kslot = state.slots.translate_inbound(peer, wire, |_| provisional)?;
    let allocated = match wire.role {
        WireRole::YourIngress => state.alloc_object(Owner::Peer(peer.clone())),
        WireRole::YourPromise => state.alloc_promise(Some(Decider::Peer(peer.clone()))),
        WireRole::YourResolver => {
            let kp = state.alloc_promise(None);
            state.subscribe(kp, Subscriber::Peer(peer.clone()))?;
            kp
        }
        WireRole::YourEgress => {
            return Err(CommsError::Violation { peer: peer.clone(), detail: format!("minted egress {}", wire) })
        }
    };
    debug_assert_eq!(allocated, kslot);
    Ok(kslot)
}

fn known_slot(state: &KernelState, peer: &PeerId, wire: &WireSlot) -> Option<KernelSlot> {
    state.slots.peer(peer).and_then(|c| c.inbound_entries().get(wire)).copied()
}

/// Forwards a send to the peer that hosts (or decides) `target`.
pub(crate) fn transmit_send(
    state: &mut KernelState,
    peer: &PeerId,
    target: KernelSlot,
    message: Message<KernelSlot>,
) -> Result<u64, CommsError> {
    state.ensure_peer(peer);
    let target = state.slots.translate_outbound(peer, target)?;
    let args = message.args.try_map(|k| export_slot(state, peer, *k))?;
    let result = match message.result {
        Some(kp) => {
            let wire = state.slots.translate_result_slot(peer, kp)?;
            if state.promises.get(&kp).is_some_and(|p| !p.is_resolved()) {
                state.promises.set_decider(&kp, Some(Decider::Peer(peer.clone())))?;
            }
            Some(wire)
        }
        None => None,
    };
    trace!("comms {}: deliver {}.{}", peer, target, message.method);
    enqueue(state, peer, &WireMessage::Deliver { target, method: message.method, args, result })
}

/// Tells a subscribed peer how `kp` settled.
pub(crate) fn transmit_resolve(
    state: &mut KernelState,
    peer: &PeerId,
    kp: KernelSlot,
    outcome: &Outcome<KernelSlot>,
) -> Result<Option<u64>, CommsError> {
    let Some(promise) = state.slots.peer(peer).and_then(|c| c.wire_for(&kp)) else {
        return Ok(None);
    };
    let data = outcome.data().try_map(|k| export_slot(state, peer, *k))?;
    let msg = WireMessage::Resolve { promise, rejected: outcome.is_rejected(), data };
    trace!("comms {}: resolve {}", peer, promise);
    enqueue(state, peer, &msg).map(Some)
}

pub(crate) fn transmit_drop(state: &mut KernelState, peer: &PeerId, slots: Vec<WireSlot>) -> Result<u64, CommsError> {
    enqueue(state, peer, &WireMessage::Drop { slots })
}

/// Rejects the peer's result promise, if any. The peer is subscribed to
/// it, so the rejection travels back.
fn reject_delivery(
    state: &mut KernelState,
    peer: &PeerId,
    result: Option<KernelSlot>,
    detail: String,
) -> Result<InboundEffect, CommsError> {
    warn!("comms {}: {}", peer, detail);
    if let Some(kp) = result {
        let reason = RejectionReason::ProtocolViolation { detail: detail.clone() };
        state.settle(kp, Outcome::Rejected(reason.to_capdata()))?;
    }
    Ok(InboundEffect::Rejected(detail))
}

/// Handles one payload the mailbox delivered from `peer`.
pub(crate) fn handle_inbound(state: &mut KernelState, peer: &PeerId, payload: &[u8]) -> Result<InboundEffect, CommsError> {
    state.ensure_peer(peer);
    match WireMessage::decode(payload)? {
        WireMessage::Deliver { target, method, args, result } => {
            // the result comes first so that every later failure can reject it
            let result = result.map(|w| import_slot(state, peer, w)).transpose()?;
            let Some(target) = known_slot(state, peer, &target) else {
                return reject_delivery(state, peer, result, format!("unknown target {}", target));
            };
            let mut scratch = state.clone();
            let args = match args.try_map(|w| import_slot(&mut scratch, peer, *w)) {
                Ok(args) => {
                    *state = scratch;
                    args
                }
                Err(e) => return reject_delivery(state, peer, result, format!("bad arguments: {}", e)),
            };
            state.push_run_queue(RunQueueItem::Send { target, message: Message::new(method, args, result) });
            Ok(InboundEffect::Queued(target))
        }
        WireMessage::Resolve { promise, rejected, data } => {
            let violation = |detail: String| CommsError::Violation { peer: peer.clone(), detail };
            let kp = known_slot(state, peer, &promise).ok_or_else(|| violation(format!("unknown promise {}", promise)))?;
            if state.promises.get(&kp).and_then(|p| p.decider()) != Some(&Decider::Peer(peer.clone())) {
                return Err(violation(format!("{} does not decide {}", peer, promise)));
            }
            let data = data.try_map(|w| import_slot(state, peer, *w))?;
            state.promises.set_decider(&kp, None)?;
            let outcome = if rejected { Outcome::Rejected(data) } else { Outcome::Fulfilled(data) };
            state.settle(kp, outcome)?;
            Ok(InboundEffect::Resolved(kp))
        }
        WireMessage::Drop { slots } => {
            let mut dropped = 0;
            for wire in slots {
                let Some(kslot) = known_slot(state, peer, &wire) else {
                    trace!("comms {}: drop of unknown {}", peer, wire);
                    continue;
                };
                state.slots.drop_entry(peer, &kslot);
                gc::release(state, kslot)?;
                dropped += 1;
            }
            Ok(InboundEffect::Dropped(dropped))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promises::PromiseStatus;
    use crate::slots::VatId;

    fn bob() -> PeerId {
        PeerId::new("bob").unwrap()
    }

    fn deliver(target: &str, result: Option<&str>) -> Vec<u8> {
        WireMessage::Deliver {
            target: target.parse().unwrap(),
            method: "go".into(),
            args: CapData::data("[]"),
            result: result.map(|r| r.parse().unwrap()),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_wire_message_json_shape() {
        let bytes = deliver("re-1", Some("rr+2"));
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with(r#"{"type":"deliver","target":"re-1""#), "{text}");
        assert_eq!(WireMessage::decode(&bytes).unwrap(), WireMessage::decode(text.as_bytes()).unwrap());
    }

    #[test]
    fn test_transmit_send_marks_peer_decider() {
        let mut s = KernelState::default();
        let ko = s.alloc_object(Owner::Peer(bob()));
        s.ensure_peer(&bob());
        s.slots.translate_inbound(&bob(), "ri+1".parse().unwrap(), |_| ko).unwrap();
        let kp = s.alloc_promise(None);
        transmit_send(&mut s, &bob(), ko, Message::new("go", CapData::data("[]"), Some(kp))).unwrap();
        assert_eq!(s.promises.get(&kp).unwrap().decider(), Some(&Decider::Peer(bob())));
        let batch = s.mailbox.outbound(&bob());
        match WireMessage::decode(&batch.messages[0].1).unwrap() {
            WireMessage::Deliver { target, result, .. } => {
                assert_eq!(target.to_string(), "re-1");
                assert_eq!(result.unwrap().role, WireRole::YourResolver);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_inbound_to_unknown_target_rejects_result() {
        let mut s = KernelState::default();
        let effect = handle_inbound(&mut s, &bob(), &deliver("re-9", Some("rr+1"))).unwrap();
        assert!(matches!(effect, InboundEffect::Rejected(_)));
        let kp = known_slot(&s, &bob(), &"rr+1".parse().unwrap()).unwrap();
        assert_eq!(s.promises.status(&kp), Some(PromiseStatus::Rejected));
        // the rejection travels back because the peer is subscribed
        assert!(matches!(
            s.run_queue.values().next(),
            Some(RunQueueItem::Notify { subscriber: Subscriber::Peer(_), .. })
        ));
    }

    #[test]
    fn test_inbound_with_unknown_argument_rejects_result() {
        let mut s = KernelState::default();
        let ko = s.alloc_object(Owner::Vat(VatId(1)));
        let ours = export_slot(&mut s, &bob(), ko).unwrap();
        let objects = s.objects.len();
        let payload = WireMessage::Deliver {
            target: ours.flip(),
            method: "go".into(),
            args: CapData::new("[]", vec!["ri+40".parse().unwrap(), "re-99".parse().unwrap()]),
            result: Some("rr+5".parse().unwrap()),
        }
        .encode()
        .unwrap();

        let effect = handle_inbound(&mut s, &bob(), &payload).unwrap();
        assert!(matches!(effect, InboundEffect::Rejected(ref d) if d.starts_with("bad arguments")));
        let kp = known_slot(&s, &bob(), &"rr+5".parse().unwrap()).unwrap();
        assert_eq!(s.promises.status(&kp), Some(PromiseStatus::Rejected));
        // nothing queued for delivery; the argument minted before the failure is gone too
        assert!(!s.run_queue.values().any(|item| matches!(item, RunQueueItem::Send { .. })));
        assert!(known_slot(&s, &bob(), &"ri+40".parse().unwrap()).is_none());
        assert_eq!(s.objects.len(), objects);
    }

    #[test]
    fn test_resolve_from_non_decider_is_violation() {
        let mut s = KernelState::default();
        s.ensure_peer(&bob());
        let kp = s.alloc_promise(Some(Decider::Vat(VatId(1))));
        let wire = export_slot(&mut s, &bob(), kp).unwrap();
        let payload = WireMessage::Resolve { promise: wire.flip(), rejected: false, data: CapData::data("1") }
            .encode()
            .unwrap();
        assert!(matches!(handle_inbound(&mut s, &bob(), &payload), Err(CommsError::Violation { .. })));
        assert_eq!(s.promises.status(&kp), Some(PromiseStatus::Unresolved));
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let mut s = KernelState::default();
        assert!(matches!(handle_inbound(&mut s, &bob(), b"not json"), Err(CommsError::Codec(_))));
    }
}
