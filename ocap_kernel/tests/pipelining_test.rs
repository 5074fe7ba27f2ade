mod common;

use common::*;
use ocap_kernel::comms::WireMessage;
use ocap_kernel::mailbox::MailboxError;
use ocap_kernel::promises::PromiseStatus;
use ocap_kernel::{CapData, CrankOutcome, InboundHandler, KernelError, KernelSlot, Outcome, RejectionReason};

/// Alice's kernel ("left") holds a reference to bob's factory root on the
/// "right" kernel under the well-known id 1.
fn linked_pair() -> (ocap_kernel::Kernel<ocap_kernel::MemoryStore>, ocap_kernel::Kernel<ocap_kernel::MemoryStore>, ocap_kernel::KernelSlot) {
    let mut left = comms_kernel();
    let mut right = comms_kernel();
    let bob = right.create_vat("bob", factory_vat()).unwrap();
    let bob_root = right.vat_root(bob).unwrap();
    right.export_to_peer(&peer("left"), bob_root, 1).unwrap();
    right.run_until_idle().unwrap();
    let remote_bob = left.import_from_peer(&peer("right"), 1).unwrap();
    (left, right, remote_bob)
}

#[test]
fn test_end_to_end_pipelining_across_kernels() {
    let (mut left, mut right, remote_bob) = linked_pair();

    let made = left.send(remote_bob, "make", CapData::data("[]")).unwrap();
    let used = left.send(made, "poke", CapData::data("[]")).unwrap();

    // both sends leave before the first answer exists
    let first = left.step().unwrap().unwrap();
    let second = left.step().unwrap().unwrap();
    let right_id = peer("right");
    assert_eq!(first.outcome, CrankOutcome::Forwarded { peer: right_id.clone() });
    assert_eq!(second.outcome, CrankOutcome::Forwarded { peer: right_id.clone() });
    assert_eq!(left.outbound(&right_id).messages.len(), 2);

    settle_pair(&mut left, "left", &mut right, "right");

    let Some(Outcome::Fulfilled(data)) = left.kp_resolution(made) else {
        panic!("make was not fulfilled");
    };
    // the answer is a proxy for an object hosted by the right kernel
    let proxy = *data.as_reference().unwrap();
    assert!(proxy.is_object());
    assert_ne!(proxy, remote_bob);
    assert_eq!(left.kp_resolution(used), Some(Outcome::Fulfilled(CapData::data("\"poke-result\""))));

    // the proxy is usable for further sends
    let again = left.send(proxy, "ping", CapData::data("[]")).unwrap();
    settle_pair(&mut left, "left", &mut right, "right");
    assert_eq!(left.kp_resolution(again), Some(Outcome::Fulfilled(CapData::data("\"ping-result\""))));

    // acknowledgements eventually empty both outbound queues
    assert!(left.outbound(&right_id).messages.is_empty());
    assert!(right.outbound(&peer("left")).messages.is_empty());
}

#[test]
fn test_replayed_batches_are_absorbed() {
    let (mut left, mut right, remote_bob) = linked_pair();
    let kp = left.send(remote_bob, "make", CapData::data("[]")).unwrap();
    left.run_until_idle().unwrap();

    let batch = left.outbound(&peer("right"));
    let receipt = right.deliver_inbound(&peer("left"), batch.messages.clone(), batch.ack).unwrap();
    assert_eq!(receipt.delivered.len(), 1);
    let commits = right.store().commit_count();

    let replay = right.deliver_inbound(&peer("left"), batch.messages, batch.ack).unwrap();
    assert!(replay.delivered.is_empty());
    assert!(!replay.did_change);
    assert_eq!(right.store().commit_count(), commits);

    settle_pair(&mut left, "left", &mut right, "right");
    assert_eq!(left.kp_status(kp), Some(PromiseStatus::Fulfilled));
}

#[test]
fn test_ack_beyond_sent_is_rejected() {
    let mut k = comms_kernel();
    let err = k.deliver_inbound(&peer("x"), Vec::new(), 4).unwrap_err();
    assert!(matches!(err, KernelError::Mailbox(MailboxError::AckBeyondSent { ack: 4, sent: 0, .. })));
}

#[test]
fn test_inbound_requires_handler_registered_once() {
    let mut k = kernel();
    assert!(matches!(
        k.deliver_inbound_messages(&peer("x"), vec![(1, b"{}".to_vec())]),
        Err(KernelError::Mailbox(MailboxError::NoHandler))
    ));
    k.register_inbound_handler(InboundHandler::Comms).unwrap();
    assert!(matches!(
        k.register_inbound_handler(InboundHandler::Comms),
        Err(KernelError::Mailbox(MailboxError::HandlerAlreadyRegistered))
    ));
}

#[test]
fn test_garbage_from_peer_does_not_stop_the_kernel() {
    let mut k = comms_kernel();
    k.deliver_inbound_messages(&peer("mallory"), vec![(1, b"not json".to_vec())]).unwrap();
    let report = k.step().unwrap().unwrap();
    assert!(matches!(report.outcome, CrankOutcome::Inbound { ref effect, .. } if effect.starts_with("violation")));
    assert_eq!(k.run_queue_len(), 0);
}

#[test]
fn test_unknown_target_rejects_senders_result() {
    let mut k = comms_kernel();
    let msg = WireMessage::Deliver {
        target: "re-77".parse().unwrap(),
        method: "steal".into(),
        args: CapData::data("[]"),
        result: Some("rr+1".parse().unwrap()),
    };
    k.deliver_inbound_messages(&peer("mallory"), vec![(1, msg.encode().unwrap())]).unwrap();
    k.run_until_idle().unwrap();

    // the rejection goes back to the sender
    let batch = k.outbound(&peer("mallory"));
    assert_eq!(batch.ack, 1);
    let reply = WireMessage::decode(&batch.messages[0].1).unwrap();
    let WireMessage::Resolve { promise, rejected, data } = reply else {
        panic!("expected a resolve");
    };
    assert_eq!(promise.to_string(), "rp-1");
    assert!(rejected);
    assert!(matches!(RejectionReason::from_capdata(&data), Some(RejectionReason::ProtocolViolation { .. })));
}

fn is_protocol_violation<S>(data: &CapData<S>) -> bool {
    matches!(RejectionReason::from_capdata(data), Some(RejectionReason::ProtocolViolation { .. }))
}

#[test]
fn test_device_in_send_to_peer_rejects_result() {
    let (mut left, mut right, remote_bob) = linked_pair();
    let kp = left.send(remote_bob, "m", CapData::reference(KernelSlot::device(1))).unwrap();

    let report = left.step().unwrap().unwrap();
    assert!(matches!(report.outcome, CrankOutcome::Splatted { .. }));
    assert_eq!(left.run_queue_len(), 0);
    assert!(left.step().unwrap().is_none());
    let Some(Outcome::Rejected(data)) = left.kp_resolution(kp) else {
        panic!("expected rejection");
    };
    assert!(is_protocol_violation(&data));
    assert!(left.outbound(&peer("right")).messages.is_empty());

    // the link keeps working afterwards
    let made = left.send(remote_bob, "make", CapData::data("[]")).unwrap();
    settle_pair(&mut left, "left", &mut right, "right");
    assert_eq!(left.kp_status(made), Some(PromiseStatus::Fulfilled));
}

#[test]
fn test_device_in_resolution_reaches_peer_as_rejection() {
    let (mut left, _right, remote_bob) = linked_pair();
    let kp = left.new_promise().unwrap();
    left.send(remote_bob, "take", CapData::reference(kp)).unwrap();
    left.run_until_idle().unwrap();

    left.resolve(kp, Outcome::Fulfilled(CapData::reference(KernelSlot::device(1)))).unwrap();
    left.run_until_idle().unwrap();
    assert_eq!(left.run_queue_len(), 0);

    let resolution = left
        .outbound(&peer("right"))
        .messages
        .iter()
        .find_map(|(_, payload)| match WireMessage::decode(payload).unwrap() {
            WireMessage::Resolve { rejected, data, .. } => Some((rejected, data)),
            _ => None,
        })
        .expect("a resolve was queued");
    assert!(resolution.0);
    assert!(is_protocol_violation(&resolution.1));
}

#[test]
fn test_unknown_argument_rejects_senders_result() {
    let (_left, mut right, _remote_bob) = linked_pair();
    let msg = WireMessage::Deliver {
        target: "re-1".parse().unwrap(),
        method: "make".into(),
        args: CapData::new("[]", vec!["re-99".parse().unwrap()]),
        result: Some("rr+5".parse().unwrap()),
    };
    right.deliver_inbound_messages(&peer("left"), vec![(1, msg.encode().unwrap())]).unwrap();
    right.run_until_idle().unwrap();

    let batch = right.outbound(&peer("left"));
    assert_eq!(batch.ack, 1);
    assert_eq!(batch.messages.len(), 1);
    let WireMessage::Resolve { promise, rejected, data } = WireMessage::decode(&batch.messages[0].1).unwrap() else {
        panic!("expected a resolve");
    };
    assert_eq!(promise.to_string(), "rp-5");
    assert!(rejected);
    assert!(is_protocol_violation(&data));
}

#[test]
fn test_disconnect_rejects_promises_decided_by_peer() {
    let (mut left, _right, remote_bob) = linked_pair();
    let kp = left.send(remote_bob, "make", CapData::data("[]")).unwrap();
    left.run_until_idle().unwrap();
    assert_eq!(left.kp_status(kp), Some(PromiseStatus::Unresolved));

    assert_eq!(left.disconnect_peer(&peer("right")).unwrap(), 1);
    let Some(Outcome::Rejected(data)) = left.kp_resolution(kp) else {
        panic!("expected rejection");
    };
    assert_eq!(
        RejectionReason::from_capdata(&data),
        Some(RejectionReason::Disconnected { name: "right".into(), incarnation: 0, upgrade: false })
    );
    assert!(matches!(left.disconnect_peer(&peer("nobody")), Err(KernelError::UnknownPeer(_))));
}

#[test]
fn test_remote_promise_resolution_reaches_local_vat() {
    // a local vat subscribed to a promise decided on the other machine
    use std::sync::{Arc, Mutex};
    use ocap_kernel::{vat_fn, VatDelivery};

    let (mut left, mut right, remote_bob) = linked_pair();
    let got = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&got);
    let alice = left
        .create_vat(
            "alice",
            vat_fn(move |delivery, sys| {
                match delivery {
                    VatDelivery::Message { message, .. } => {
                        let bob = message.args.slots[0];
                        sys.send(bob, "make", CapData::data("[]"));
                    }
                    VatDelivery::Notify { outcome, .. } => {
                        *sink.lock().unwrap() = Some(outcome.is_rejected());
                    }
                    _ => {}
                }
                Ok(())
            }),
        )
        .unwrap();
    let alice_root = left.vat_root(alice).unwrap();
    left.send(alice_root, "start", CapData::reference(remote_bob)).unwrap();
    settle_pair(&mut left, "left", &mut right, "right");
    assert_eq!(*got.lock().unwrap(), Some(false));
}
