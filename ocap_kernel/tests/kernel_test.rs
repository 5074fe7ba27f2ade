mod common;

use std::sync::{Arc, Mutex};

use common::*;
use ocap_kernel::plugin::{ChannelStatus, PluginConnection, PluginHost};
use ocap_kernel::promises::PromiseStatus;
use ocap_kernel::state::VatStatus;
use ocap_kernel::{
    vat_fn, CapData, CrankOutcome, KernelError, Outcome, RejectionReason, StrongRef, VatDelivery, VatOptions, VatSlot,
    VirtualObjectId, VomError, WeakHandle, WeakMode,
};
use serde_json::{json, Value};

fn rejection(k: &ocap_kernel::Kernel<ocap_kernel::MemoryStore>, kp: ocap_kernel::KernelSlot) -> RejectionReason {
    match k.kp_resolution(kp) {
        Some(Outcome::Rejected(data)) => RejectionReason::from_capdata(&data).unwrap(),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[test]
fn test_local_send_is_fulfilled() {
    let mut k = kernel();
    let v = k.create_vat("echo", echo_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    let kp = k.queue_message(root, "echo", CapData::data("[1,2]")).unwrap();
    assert_eq!(k.kp_status(kp), Some(PromiseStatus::Unresolved));

    k.run_until_idle().unwrap();
    assert_eq!(k.kp_resolution(kp), Some(Outcome::Fulfilled(CapData::data("[1,2]"))));
    assert_eq!(k.run_queue_len(), 0);
}

#[test]
fn test_send_to_promise_waits_for_resolution() {
    let mut k = kernel();
    let v = k.create_vat("factory", factory_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    k.run_until_idle().unwrap();

    let p = k.new_promise().unwrap();
    let used = k.send(p, "poke", CapData::data("[]")).unwrap();
    assert_eq!(k.step().unwrap().unwrap().outcome, CrankOutcome::Queued { promise: p });
    assert_eq!(k.run_queue_len(), 0);

    k.resolve(p, Outcome::Fulfilled(CapData::reference(root))).unwrap();
    assert_eq!(k.run_queue_len(), 1);
    k.run_until_idle().unwrap();
    assert_eq!(k.kp_resolution(used), Some(Outcome::Fulfilled(CapData::data("\"poke-result\""))));
}

#[test]
fn test_send_to_vat_result_promise_follows_fulfillment() {
    let mut k = kernel();
    let v = k.create_vat("factory", factory_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    let made = k.send(root, "make", CapData::data("[]")).unwrap();
    let used = k.send(made, "poke", CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();

    let Some(Outcome::Fulfilled(data)) = k.kp_resolution(made) else {
        panic!("make was not fulfilled");
    };
    let obj = *data.as_reference().unwrap();
    assert!(obj.is_object());
    assert_eq!(k.kp_resolution(used), Some(Outcome::Fulfilled(CapData::data("\"poke-result\""))));
}

#[test]
fn test_pipelining_vat_receives_sends_to_its_promises() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let behavior = vat_fn(move |delivery, sys| {
        if let VatDelivery::Message { target, message } = delivery {
            log.lock().unwrap().push((target, message.method.clone()));
            if let Some(result) = message.result {
                if message.method == "later" {
                    // leave unresolved so the next send must pipeline
                    return Ok(());
                }
                sys.fulfill(result, CapData::data("\"ok\""));
            }
        }
        Ok(())
    });
    let mut k = kernel();
    let v = k.create_vat_with_options("pipe", behavior, VatOptions { pipelining: true }).unwrap();
    let root = k.vat_root(v).unwrap();
    let first = k.send(root, "later", CapData::data("[]")).unwrap();
    let second = k.send(first, "then", CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].1, "then");
    assert!(seen[1].0.to_string().starts_with("p-"));
    assert_eq!(k.kp_status(first), Some(PromiseStatus::Unresolved));
    assert_eq!(k.kp_status(second), Some(PromiseStatus::Fulfilled));
}

#[test]
fn test_subscribers_notified_exactly_once() {
    let notified = Arc::new(Mutex::new(Vec::new()));
    let mut k = kernel();
    let mut watchers = Vec::new();
    for name in ["w1", "w2"] {
        let log = Arc::clone(&notified);
        let tag = name.to_string();
        let v = k
            .create_vat(
                name,
                vat_fn(move |delivery, _| {
                    if let VatDelivery::Notify { .. } = delivery {
                        log.lock().unwrap().push(tag.clone());
                    }
                    Ok(())
                }),
            )
            .unwrap();
        watchers.push(v);
    }
    let kp = k.new_promise().unwrap();
    for v in &watchers {
        k.subscribe(kp, ocap_kernel::Subscriber::Vat(*v)).unwrap();
        k.subscribe(kp, ocap_kernel::Subscriber::Vat(*v)).unwrap();
    }
    k.resolve(kp, Outcome::Fulfilled(CapData::data("7"))).unwrap();
    assert!(matches!(
        k.resolve(kp, Outcome::Fulfilled(CapData::data("8"))),
        Err(KernelError::Promise(_))
    ));
    // late subscription after settlement is still notified, once, later
    k.subscribe(kp, ocap_kernel::Subscriber::Vat(watchers[0])).unwrap();
    assert!(notified.lock().unwrap().is_empty());

    k.run_until_idle().unwrap();
    assert_eq!(*notified.lock().unwrap(), vec!["w1".to_string(), "w2".to_string()]);
}

#[test]
fn test_send_to_data_or_rejected_promise_is_undeliverable() {
    let mut k = kernel();
    let kp = k.new_promise().unwrap();
    k.resolve(kp, Outcome::Fulfilled(CapData::data("3"))).unwrap();
    let r1 = k.send(kp, "foo", CapData::data("[]")).unwrap();

    let broken = k.new_promise().unwrap();
    let reason = RejectionReason::Abandoned;
    k.resolve(broken, Outcome::Rejected(reason.to_capdata())).unwrap();
    let r2 = k.send(broken, "foo", CapData::data("[]")).unwrap();

    k.run_until_idle().unwrap();
    assert!(matches!(rejection(&k, r1), RejectionReason::Undeliverable { method, .. } if method == "foo"));
    assert_eq!(rejection(&k, r2), RejectionReason::Abandoned);
}

#[test]
fn test_vat_failure_terminates_vat_and_rejects_its_promises() {
    let mut k = kernel();
    let v = k.create_vat("bad", failing_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    let kp = k.send(root, "explode", CapData::data("[]")).unwrap();
    k.step().unwrap();
    let report = k.step().unwrap().unwrap();
    assert!(matches!(report.outcome, CrankOutcome::VatFailed { vat, .. } if vat == v));
    assert!(matches!(k.vat_status(v), Some(VatStatus::Terminated { .. })));
    assert!(matches!(
        rejection(&k, kp),
        RejectionReason::Disconnected { name, incarnation: 0, upgrade: false } if name == "bad"
    ));

    // later sends are splatted, the scheduler keeps going
    let again = k.send(root, "explode", CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();
    assert!(matches!(rejection(&k, again), RejectionReason::VatTerminated { .. }));
}

#[test]
fn test_panicking_vat_is_contained() {
    let mut k = kernel();
    let v = k
        .create_vat(
            "panicky",
            vat_fn(|delivery, _| {
                if let VatDelivery::Message { .. } = delivery {
                    panic!("vat bug");
                }
                Ok(())
            }),
        )
        .unwrap();
    let kp = k.send(k.vat_root(v).unwrap(), "go", CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();
    assert!(matches!(k.vat_status(v), Some(VatStatus::Terminated { reason }) if reason.contains("vat bug")));
    assert_eq!(k.kp_status(kp), Some(PromiseStatus::Rejected));
}

#[test]
fn test_illegal_syscall_discards_delivery_effects() {
    let mut k = kernel();
    let v = k
        .create_vat(
            "liar",
            vat_fn(|delivery, sys| {
                if let VatDelivery::Message { .. } = delivery {
                    sys.vatstore_set("touched", b"yes".to_vec());
                    // never imported
                    let bogus: VatSlot = "o-99".parse().unwrap();
                    sys.send_only(bogus, "x", CapData::data("[]"));
                }
                Ok(())
            }),
        )
        .unwrap();
    k.send(k.vat_root(v).unwrap(), "go", CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();
    let vs = &k.state().vats[&v];
    assert!(!vs.record.is_running());
    assert!(!vs.vatstore.contains_key("touched"));
}

#[test]
fn test_vat_exit_syscall() {
    let mut k = kernel();
    let v = k
        .create_vat(
            "quitter",
            vat_fn(|delivery, sys| {
                if let VatDelivery::Start { .. } = delivery {
                    sys.exit("done");
                }
                Ok(())
            }),
        )
        .unwrap();
    k.run_until_idle().unwrap();
    assert_eq!(k.vat_status(v), Some(&VatStatus::Terminated { reason: "done".into() }));
}

#[test]
fn test_upgrade_keeps_vatstore_and_rejects_pending_results() {
    let mut k = kernel();
    let v1 = vat_fn(|delivery, sys| {
        if let VatDelivery::Message { message, .. } = delivery {
            sys.vatstore_set("last", message.method.into_bytes());
            // result left unresolved on purpose
        }
        Ok(())
    });
    let v = k.create_vat("svc", v1).unwrap();
    let root = k.vat_root(v).unwrap();
    let pending = k.send(root, "remember", CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();

    let started = Arc::new(Mutex::new(None));
    let flag = Arc::clone(&started);
    let v2 = vat_fn(move |delivery, sys| {
        if let VatDelivery::Start { incarnation } = delivery {
            *flag.lock().unwrap() = Some((incarnation, sys.vatstore_get("last")));
        }
        Ok(())
    });
    assert_eq!(k.upgrade_vat(v, v2).unwrap(), 1);
    assert!(matches!(rejection(&k, pending), RejectionReason::Disconnected { upgrade: true, incarnation: 0, .. }));

    k.run_until_idle().unwrap();
    assert_eq!(*started.lock().unwrap(), Some((1, Some(b"remember".to_vec()))));
    assert_eq!(k.vat_root(v).unwrap(), root);
}

#[test]
fn test_terminate_vat() {
    let mut k = kernel();
    let v = k.create_vat("gone", echo_vat()).unwrap();
    k.terminate_vat(v, "operator").unwrap();
    assert!(matches!(k.terminate_vat(v, "again"), Err(KernelError::VatTerminated(_))));
    // the queued start delivery is skipped
    let report = k.step().unwrap().unwrap();
    assert_eq!(report.outcome, CrankOutcome::Skipped);
}

#[test]
fn test_dropped_import_notifies_exporter() {
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&dropped);
    let giver = vat_fn(move |delivery, sys| {
        match delivery {
            VatDelivery::Message { message, .. } => {
                let obj = sys.export_object();
                sys.send_only(message.args.slots[0], "take", CapData::reference(obj));
                if let Some(result) = message.result {
                    sys.fulfill(result, CapData::data("null"));
                }
            }
            VatDelivery::DropExports(vrefs) => log.lock().unwrap().extend(vrefs),
            _ => {}
        }
        Ok(())
    });
    let taker = vat_fn(|delivery, sys| {
        if let VatDelivery::Message { message, .. } = delivery {
            sys.drop_imports(message.args.slots.clone());
        }
        Ok(())
    });
    let mut k = kernel();
    let g = k.create_vat("giver", giver).unwrap();
    let t = k.create_vat("taker", taker).unwrap();
    let taker_root = k.vat_root(t).unwrap();
    k.send(k.vat_root(g).unwrap(), "give", CapData::reference(taker_root)).unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(*dropped.lock().unwrap(), vec!["o+1".parse::<VatSlot>().unwrap()]);
    assert_eq!(k.state().objects.len(), 2, "only the two roots remain");
}

#[test]
fn test_failed_commit_leaves_kernel_at_previous_boundary() {
    let mut k = kernel();
    let v = k.create_vat("echo", echo_vat()).unwrap();
    k.run_until_idle().unwrap();
    let kp = k.send(k.vat_root(v).unwrap(), "echo", CapData::data("1")).unwrap();

    let before_state = k.state().clone();
    let before_store = k.store().snapshot();
    k.store_mut().fail_next_commits(1);
    assert!(matches!(k.step(), Err(KernelError::Commit(_))));
    assert_eq!(k.state(), &before_state);
    assert_eq!(k.store().snapshot(), before_store);
    assert_eq!(k.phase(), ocap_kernel::CrankPhase::Idle);

    // the same item runs again and succeeds
    k.run_until_idle().unwrap();
    assert_eq!(k.kp_status(kp), Some(PromiseStatus::Fulfilled));
}

#[test]
fn test_restart_resumes_from_store() {
    let mut k = kernel();
    let v = k.create_vat("echo", echo_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    let kp = k.send(root, "echo", CapData::data("5")).unwrap();
    k.step().unwrap();
    let hash = k.activity_hash().to_string();
    let cranks = k.crank_number();

    let store = k.into_store();
    let mut k = ocap_kernel::Kernel::open(store, ocap_kernel::KernelOptions::default()).unwrap();
    assert_eq!(k.activity_hash(), hash);
    assert_eq!(k.crank_number(), cranks);
    assert!(matches!(k.step(), Err(KernelError::VatNotAttached(_))));

    assert_eq!(k.attach_vat("echo", echo_vat()).unwrap(), v);
    k.run_until_idle().unwrap();
    assert_eq!(k.kp_resolution(kp), Some(Outcome::Fulfilled(CapData::data("5"))));
}

#[test]
fn test_vatstore_commits_with_the_crank() {
    let mut k = kernel();
    let counter = vat_fn(|delivery, sys| {
        if let VatDelivery::Message { message, .. } = delivery {
            let n: u64 = sys
                .vatstore_get("n")
                .and_then(|b| String::from_utf8(b).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            sys.vatstore_set("n", (n + 1).to_string().into_bytes());
            if let Some(result) = message.result {
                sys.fulfill(result, CapData::data((n + 1).to_string()));
            }
        }
        Ok(())
    });
    let v = k.create_vat("counter", counter).unwrap();
    let root = k.vat_root(v).unwrap();
    for _ in 0..3 {
        k.send(root, "inc", CapData::data("[]")).unwrap();
    }
    k.run_until_idle().unwrap();
    assert_eq!(k.state().vats[&v].vatstore.get("n"), Some(&b"3".to_vec()));
    let key = format!("vat.{}.vs.n", v);
    assert_eq!(k.store().snapshot().get(&key), Some(&b"3".to_vec()));
}

// ---------------------------------------------------------------------------
// Virtual objects
// ---------------------------------------------------------------------------

/// Keeps one exported virtual counter. The counter's id is in the vatstore;
/// its representative is held by the behavior and dies with it.
fn counter_vat() -> Box<dyn ocap_kernel::Vat> {
    let mut held: Option<StrongRef> = None;
    let mut weak: Option<WeakHandle> = None;
    vat_fn(move |delivery, sys| {
        let kind = sys.virtual_objects(|vom, store| vom.define_kind(store, "counter"))?;
        let VatDelivery::Message { message, .. } = delivery else {
            return Ok(());
        };
        let Some(result) = message.result else {
            return Ok(());
        };
        let current = sys
            .vatstore_get("app.counter")
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse::<VirtualObjectId>().ok());
        let answer = match (message.method.as_str(), current) {
            ("make", _) => {
                let (id, rep) = sys.virtual_objects(|vom, store| {
                    let (id, rep) = vom.make_instance(store, kind, json!({"n": 0}))?;
                    vom.export(store, id)?;
                    Ok((id, rep))
                })?;
                sys.vatstore_set("app.counter", id.to_string().into_bytes());
                weak = Some(rep.handle());
                held = Some(rep);
                format!("{:?}", id.to_string())
            }
            ("bump", Some(id)) => sys
                .virtual_objects(|vom, store| {
                    let rep = vom.reanimate(store, id)?;
                    let n = vom.get_state(store, id)?["n"].as_u64().unwrap_or(0) + 1;
                    vom.set_state(store, id, json!({ "n": n }))?;
                    // eviction writes back and never deletes
                    vom.evict(store, id)?;
                    vom.release(rep);
                    Ok(n)
                })?
                .to_string(),
            ("read", Some(id)) => match sys.virtual_objects(|vom, store| vom.get_state(store, id)) {
                Ok(state) => state["n"].to_string(),
                Err(VomError::ObjectDeleted(_)) => "\"deleted\"".to_string(),
                Err(e) => return Err(e.into()),
            },
            ("drop", Some(id)) => sys
                .virtual_objects(|vom, store| {
                    vom.unexport(store, id)?;
                    if let Some(rep) = held.take() {
                        vom.release(rep);
                    }
                    // still readable: nothing is deleted while the vat runs
                    vom.get_state(store, id)
                })?["n"]
                .to_string(),
            ("gone", _) => match weak {
                Some(h) => sys.virtual_objects(|vom, _| Ok(vom.dereference(h).is_absent()))?.to_string(),
                None => "null".to_string(),
            },
            (method, _) => return Err(ocap_kernel::VatError::Failed(format!("unexpected {method}"))),
        };
        sys.fulfill(result, CapData::data(answer));
        Ok(())
    })
}

fn ask(k: &mut ocap_kernel::Kernel<ocap_kernel::MemoryStore>, target: ocap_kernel::KernelSlot, method: &str) -> String {
    let kp = k.send(target, method, CapData::data("[]")).unwrap();
    k.run_until_idle().unwrap();
    match k.kp_resolution(kp) {
        Some(Outcome::Fulfilled(data)) => data.body,
        other => panic!("{method}: {other:?}"),
    }
}

fn stored_state(k: &ocap_kernel::Kernel<ocap_kernel::MemoryStore>, vat: ocap_kernel::VatId, key: &str) -> Option<Value> {
    k.state().vats[&vat].vatstore.get(key).map(|b| serde_json::from_slice(b).unwrap())
}

#[test]
fn test_virtual_objects_survive_eviction_restart_and_upgrade() {
    let mut k = kernel();
    let v = k.create_vat("counters", counter_vat()).unwrap();
    let root = k.vat_root(v).unwrap();

    assert_eq!(ask(&mut k, root, "make"), "\"vo1.1\"");
    assert_eq!(ask(&mut k, root, "bump"), "1");
    assert_eq!(ask(&mut k, root, "bump"), "2");
    assert_eq!(ask(&mut k, root, "gone"), "false");
    assert_eq!(stored_state(&k, v, "vom.o.1.1"), Some(json!({"n": 2})));

    // restart: a fresh process knows the counter only by its stored id
    let store = k.into_store();
    let mut k = ocap_kernel::Kernel::open(store, ocap_kernel::KernelOptions::default()).unwrap();
    k.attach_vat("counters", counter_vat()).unwrap();
    assert_eq!(ask(&mut k, root, "read"), "2");
    assert_eq!(ask(&mut k, root, "gone"), "null");
    // the reanimated representative is released and collected; the export keeps the state
    assert_eq!(ask(&mut k, root, "bump"), "3");
    assert_eq!(ask(&mut k, root, "read"), "3");

    k.upgrade_vat(v, counter_vat()).unwrap();
    k.run_until_idle().unwrap();
    assert_eq!(ask(&mut k, root, "read"), "3");
    assert_eq!(ask(&mut k, root, "bump"), "4");
}

#[test]
fn test_unreachable_virtual_object_is_collected_between_cranks() {
    let mut k = kernel();
    let v = k.create_vat("counters", counter_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    assert_eq!(ask(&mut k, root, "make"), "\"vo1.1\"");
    assert_eq!(ask(&mut k, root, "bump"), "1");

    let before = k.crank_number();
    assert_eq!(ask(&mut k, root, "read"), "1");
    let per_request = k.crank_number() - before;

    let before = k.crank_number();
    assert_eq!(ask(&mut k, root, "drop"), "1");
    // the deletion committed without a crank of its own
    assert_eq!(k.crank_number() - before, per_request);
    assert_eq!(stored_state(&k, v, "vom.o.1.1"), None);
    assert!(k.state().vats[&v].vatstore.contains_key("vom.deleted.1.1"));

    assert_eq!(ask(&mut k, root, "gone"), "true");
    assert_eq!(ask(&mut k, root, "read"), "\"deleted\"");
    assert_eq!(ask(&mut k, root, "gone"), "true");
    assert_eq!(k.bring_out_your_dead().unwrap(), 0);
}

#[test]
fn test_strong_mode_never_collects_virtual_objects() {
    let options = ocap_kernel::KernelOptions { weak_mode: WeakMode::Strong, ..Default::default() };
    let mut k = ocap_kernel::Kernel::open(ocap_kernel::MemoryStore::new(), options).unwrap();
    let v = k.create_vat("counters", counter_vat()).unwrap();
    let root = k.vat_root(v).unwrap();
    ask(&mut k, root, "make");
    assert_eq!(ask(&mut k, root, "drop"), "0");
    assert_eq!(ask(&mut k, root, "gone"), "false");
    assert_eq!(ask(&mut k, root, "read"), "0");
    assert_eq!(stored_state(&k, v, "vom.o.1.1"), Some(json!({"n": 0})));
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HostLog {
    connects: Vec<String>,
    sent: Vec<Vec<u8>>,
}

struct RecordingHost {
    log: Arc<Mutex<HostLog>>,
    fail_connect: bool,
}

struct RecordingConnection {
    log: Arc<Mutex<HostLog>>,
}

impl PluginConnection for RecordingConnection {
    fn send(&mut self, payload: &[u8]) -> Result<(), String> {
        self.log.lock().unwrap().sent.push(payload.to_vec());
        Ok(())
    }
}

impl PluginHost for RecordingHost {
    fn connect(&mut self, module_ref: &str, _index: u32) -> Result<Box<dyn PluginConnection>, String> {
        if self.fail_connect {
            return Err("module not found".into());
        }
        self.log.lock().unwrap().connects.push(module_ref.to_string());
        Ok(Box::new(RecordingConnection { log: Arc::clone(&self.log) }))
    }
}

fn plugin_user(events: Arc<Mutex<Vec<String>>>) -> Box<dyn ocap_kernel::Vat> {
    vat_fn(move |delivery, sys| {
        match delivery {
            VatDelivery::Start { .. } => {
                let index = sys.plugin_connect("weather", None).map_err(|e| ocap_kernel::VatError::Failed(e.to_string()))?;
                sys.plugin_send(index, b"forecast?".to_vec());
            }
            VatDelivery::PluginResponse { index, payload } => {
                events.lock().unwrap().push(format!("response {} {}", index, String::from_utf8_lossy(&payload)));
            }
            VatDelivery::PluginBroken { index, reason } => {
                events.lock().unwrap().push(format!("broken {} {}", index, reason));
            }
            _ => {}
        }
        Ok(())
    })
}

#[test]
fn test_plugin_round_trip() {
    let log = Arc::new(Mutex::new(HostLog::default()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut k = kernel();
    k.set_plugin_host(Box::new(RecordingHost { log: Arc::clone(&log), fail_connect: false }));
    k.create_vat("user", plugin_user(Arc::clone(&events))).unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(log.lock().unwrap().connects, vec!["weather".to_string()]);
    assert_eq!(log.lock().unwrap().sent, vec![b"forecast?".to_vec()]);
    assert_eq!(k.plugin_channel_status(1), ChannelStatus::Bound);

    k.deliver_plugin_response(1, b"sunny".to_vec()).unwrap();
    k.run_until_idle().unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["response 1 sunny".to_string()]);
    assert!(matches!(k.deliver_plugin_response(9, Vec::new()), Err(KernelError::Plugin(_))));
}

#[test]
fn test_plugin_load_failure_reported_to_vat() {
    let log = Arc::new(Mutex::new(HostLog::default()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut k = kernel();
    k.set_plugin_host(Box::new(RecordingHost { log, fail_connect: true }));
    k.create_vat("user", plugin_user(Arc::clone(&events))).unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(k.plugin_channel_status(1), ChannelStatus::Broken);
    assert_eq!(k.plugin_channel_broken_reason(1), Some("module not found"));
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("broken 1"));
}
