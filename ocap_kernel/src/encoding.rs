//! Kernel state <-> durable key/value records.
//!
//! Key layout (names are `[a-zA-Z0-9_-]+`, so `.` is a safe separator):
//!
//! ```text
//! kernel.meta                 KernelMeta
//! rq.{idx:020}                RunQueueItem
//! ko.{id} / kp.{id} / kd.{id} object, promise and device records
//! vat.{vat}                   VatEntry
//! vat.{vat}.c.{kslot}         vref the vat knows kslot by
//! vat.{vat}.vs.{key}          raw vatstore bytes
//! peer.{peer}                 PeerEntry
//! peer.{peer}.a.{kslot}       access wire slot (our form)
//! peer.{peer}.r.{kslot}       resolver wire slot (our form)
//! mbox.{peer}                 PeerMailbox
//! plugin.{index}              PluginChannelRecord
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clist::{PeerClist, SlotTable, VatClist};
use crate::mailbox::{Mailbox, PeerMailbox};
use crate::promises::PromiseTable;
use crate::slots::{KernelSlot, PeerId, VatId, VatSlot, WireSlot};
use crate::state::{KernelMeta, KernelState, PeerRecord, VatRecord, VatState};
use crate::store::ChangeSet;

pub const META_KEY: &str = "kernel.meta";

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("cannot encode {key}: {source}")]
    Encode { key: String, source: serde_json::Error },
    #[error("cannot decode {key}: {detail}")]
    Decode { key: String, detail: String },
    #[error("unrecognized key {0:?}")]
    UnknownKey(String),
    #[error("missing {0}")]
    Missing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VatEntry {
    record: VatRecord,
    next_import: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerEntry {
    record: PeerRecord,
    next_wire_id: u64,
}

fn put<T: Serialize>(out: &mut BTreeMap<String, Vec<u8>>, key: String, value: &T) -> Result<(), EncodingError> {
    let bytes = serde_json::to_vec(value).map_err(|source| EncodingError::Encode { key: key.clone(), source })?;
    out.insert(key, bytes);
    Ok(())
}

fn get<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, EncodingError> {
    serde_json::from_slice(bytes).map_err(|e| EncodingError::Decode { key: key.to_string(), detail: e.to_string() })
}

fn parse<T: std::str::FromStr>(key: &str, s: &str) -> Result<T, EncodingError>
where
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| EncodingError::Decode { key: key.to_string(), detail: e.to_string() })
}

pub fn encode_meta(meta: &KernelMeta) -> Result<Vec<u8>, EncodingError> {
    serde_json::to_vec(meta).map_err(|source| EncodingError::Encode { key: META_KEY.to_string(), source })
}

/// Full record set for `state`.
pub fn encode(state: &KernelState) -> Result<BTreeMap<String, Vec<u8>>, EncodingError> {
    let mut out = BTreeMap::new();
    put(&mut out, META_KEY.to_string(), &state.meta)?;
    for (idx, item) in &state.run_queue {
        put(&mut out, format!("rq.{:020}", idx), item)?;
    }
    for (id, obj) in &state.objects {
        put(&mut out, format!("ko.{}", id), obj)?;
    }
    for (kp, promise) in state.promises.iter() {
        put(&mut out, format!("kp.{}", kp.id), promise)?;
    }
    for (id, dev) in &state.devices {
        put(&mut out, format!("kd.{}", id), dev)?;
    }
    for (vat, vs) in &state.vats {
        let entry = VatEntry { record: vs.record.clone(), next_import: vs.clist.next_import() };
        put(&mut out, format!("vat.{}", vat), &entry)?;
        for (kslot, vref) in vs.clist.entries() {
            put(&mut out, format!("vat.{}.c.{}", vat, kslot), vref)?;
        }
        for (key, value) in &vs.vatstore {
            out.insert(format!("vat.{}.vs.{}", vat, key), value.clone());
        }
    }
    for (peer, record) in &state.peers {
        let clist = state.slots.peer(peer);
        let entry = PeerEntry { record: record.clone(), next_wire_id: clist.map_or(1, |c| c.next_id()) };
        put(&mut out, format!("peer.{}", peer), &entry)?;
        if let Some(clist) = clist {
            for (kslot, wire) in clist.access_entries() {
                put(&mut out, format!("peer.{}.a.{}", peer, kslot), wire)?;
            }
            for (kslot, wire) in clist.resolver_entries() {
                put(&mut out, format!("peer.{}.r.{}", peer, kslot), wire)?;
            }
        }
    }
    for (peer, mb) in state.mailbox.peers() {
        put(&mut out, format!("mbox.{}", peer), mb)?;
    }
    for (index, rec) in &state.plugins {
        put(&mut out, format!("plugin.{}", index), rec)?;
    }
    Ok(out)
}

/// Changes turning `old` into `new`.
pub fn diff(old: &BTreeMap<String, Vec<u8>>, new: &BTreeMap<String, Vec<u8>>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }
    changes
}

#[derive(Default)]
struct PeerParts {
    record: Option<PeerEntry>,
    access: BTreeMap<KernelSlot, WireSlot>,
    resolvers: BTreeMap<KernelSlot, WireSlot>,
}

#[derive(Default)]
struct VatParts {
    entry: Option<VatEntry>,
    clist: BTreeMap<KernelSlot, VatSlot>,
    vatstore: BTreeMap<String, Vec<u8>>,
}

/// Rebuilds state from a full record set.
pub fn decode(entries: &BTreeMap<String, Vec<u8>>) -> Result<KernelState, EncodingError> {
    let mut meta: Option<KernelMeta> = None;
    let mut state = KernelState::default();
    let mut promises = PromiseTable::default();
    let mut vats: BTreeMap<VatId, VatParts> = BTreeMap::new();
    let mut peers: BTreeMap<PeerId, PeerParts> = BTreeMap::new();
    let mut mailbox = Mailbox::default();

    for (key, bytes) in entries {
        let (head, rest) = key.split_once('.').ok_or_else(|| EncodingError::UnknownKey(key.clone()))?;
        match head {
            "kernel" if rest == "meta" => meta = Some(get(key, bytes)?),
            "rq" => {
                let idx: u64 = parse(key, rest)?;
                state.run_queue.insert(idx, get(key, bytes)?);
            }
            "ko" => {
                state.objects.insert(parse(key, rest)?, get(key, bytes)?);
            }
            "kp" => {
                let id: u64 = parse(key, rest)?;
                promises.insert(KernelSlot::promise(id), get(key, bytes)?);
            }
            "kd" => {
                state.devices.insert(parse(key, rest)?, get(key, bytes)?);
            }
            "vat" => {
                let (vat, sub) = match rest.split_once('.') {
                    Some((vat, sub)) => (vat, Some(sub)),
                    None => (rest, None),
                };
                let parts = vats.entry(parse(key, vat)?).or_default();
                match sub.map(|s| s.split_once('.')) {
                    None => parts.entry = Some(get(key, bytes)?),
                    Some(Some(("c", kslot))) => {
                        parts.clist.insert(parse(key, kslot)?, get(key, bytes)?);
                    }
                    Some(Some(("vs", vkey))) => {
                        parts.vatstore.insert(vkey.to_string(), bytes.clone());
                    }
                    _ => return Err(EncodingError::UnknownKey(key.clone())),
                }
            }
            "peer" => {
                let (peer, sub) = match rest.split_once('.') {
                    Some((peer, sub)) => (peer, Some(sub)),
                    None => (rest, None),
                };
                let parts = peers.entry(parse(key, peer)?).or_default();
                match sub.map(|s| s.split_once('.')) {
                    None => parts.record = Some(get(key, bytes)?),
                    Some(Some(("a", kslot))) => {
                        parts.access.insert(parse(key, kslot)?, get(key, bytes)?);
                    }
                    Some(Some(("r", kslot))) => {
                        parts.resolvers.insert(parse(key, kslot)?, get(key, bytes)?);
                    }
                    _ => return Err(EncodingError::UnknownKey(key.clone())),
                }
            }
            "mbox" => {
                let peer: PeerId = parse(key, rest)?;
                let mb: PeerMailbox = get(key, bytes)?;
                mailbox.peers.insert(peer, mb);
            }
            "plugin" => {
                state.plugins.insert(parse(key, rest)?, get(key, bytes)?);
            }
            _ => return Err(EncodingError::UnknownKey(key.clone())),
        }
    }

    state.meta = meta.ok_or_else(|| EncodingError::Missing(META_KEY.to_string()))?;
    state.promises = promises;
    state.mailbox = mailbox;

    for (vat, parts) in vats {
        let entry = parts.entry.ok_or_else(|| EncodingError::Missing(format!("vat.{}", vat)))?;
        state.vats.insert(
            vat,
            VatState {
                record: entry.record,
                clist: VatClist::from_entries(parts.clist, entry.next_import),
                vatstore: parts.vatstore,
            },
        );
    }

    let mut slots = SlotTable::default();
    for (peer, parts) in peers {
        let entry = parts.record.ok_or_else(|| EncodingError::Missing(format!("peer.{}", peer)))?;
        slots
            .peers
            .insert(peer.clone(), PeerClist::from_entries(parts.access, parts.resolvers, entry.next_wire_id));
        state.peers.insert(peer, entry.record);
    }
    state.slots = slots;
    Ok(state)
}
