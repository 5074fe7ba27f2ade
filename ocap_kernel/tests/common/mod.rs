#![allow(dead_code)]

use ocap_kernel::{
    vat_fn, CapData, InboundHandler, Kernel, KernelOptions, MemoryStore, PeerId, Vat, VatDelivery, VatError,
};

pub fn kernel() -> Kernel<MemoryStore> {
    Kernel::open(MemoryStore::new(), KernelOptions::default()).unwrap()
}

pub fn comms_kernel() -> Kernel<MemoryStore> {
    let mut k = kernel();
    k.register_inbound_handler(InboundHandler::Comms).unwrap();
    k
}

pub fn peer(name: &str) -> PeerId {
    PeerId::new(name).unwrap()
}

/// Fulfills every result promise with the message arguments.
pub fn echo_vat() -> Box<dyn Vat> {
    vat_fn(|delivery, sys| {
        if let VatDelivery::Message { message, .. } = delivery {
            if let Some(result) = message.result {
                sys.fulfill(result, message.args);
            }
        }
        Ok(())
    })
}

/// `make` answers with a fresh exported object; any message to that object
/// is answered with `"<method>-result"`.
pub fn factory_vat() -> Box<dyn Vat> {
    vat_fn(|delivery, sys| {
        if let VatDelivery::Message { target, message } = delivery {
            let Some(result) = message.result else {
                return Ok(());
            };
            if target == sys.root() && message.method == "make" {
                let obj = sys.export_object();
                sys.fulfill(result, CapData::reference(obj));
            } else {
                sys.fulfill(result, CapData::data(format!("\"{}-result\"", message.method)));
            }
        }
        Ok(())
    })
}

/// Fails every message delivery.
pub fn failing_vat() -> Box<dyn Vat> {
    vat_fn(|delivery, _| match delivery {
        VatDelivery::Message { .. } => Err(VatError::Failed("boom".into())),
        _ => Ok(()),
    })
}

/// Moves everything `from` has not had acknowledged into `to`. Returns the
/// number of newly delivered messages.
pub fn pump(from: &Kernel<MemoryStore>, from_name: &str, to: &mut Kernel<MemoryStore>, to_name: &str) -> usize {
    let batch = from.outbound(&peer(to_name));
    to.deliver_inbound(&peer(from_name), batch.messages, batch.ack).unwrap().delivered.len()
}

/// Runs both kernels and pumps both directions until nothing moves.
pub fn settle_pair(a: &mut Kernel<MemoryStore>, a_name: &str, b: &mut Kernel<MemoryStore>, b_name: &str) {
    for _ in 0..50 {
        let cranks = a.run_until_idle().unwrap() + b.run_until_idle().unwrap();
        let moved = pump(a, a_name, b, b_name) + pump(b, b_name, a, a_name);
        if cranks == 0 && moved == 0 {
            return;
        }
    }
    panic!("kernels did not quiesce");
}
