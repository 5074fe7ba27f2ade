//! Capability lists: the translation tables between kernel slots and the
//! identifiers seen by each peer machine (`PeerClist`) and each vat
//! (`VatClist`).
//!
//! Per peer, `kernel_slot -> my_wire` is a bijection inside each of the two
//! tables (access entries and resolver entries), and the reverse index is
//! always keyed by `flip(my_wire)`, the form the peer writes.

use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;

use crate::slots::{KernelSlot, PeerId, SlotKind, VatId, VatSlot, WireRole, WireSlot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClistError {
    #[error("devices never cross machines: {0}")]
    DeviceCrossing(KernelSlot),
    #[error("{0} is not a promise and cannot be a result slot")]
    NotAPromise(KernelSlot),
    #[error("peer {peer} used unknown wire slot {slot}")]
    UnknownWireSlot { peer: PeerId, slot: WireSlot },
    #[error("peer {peer} minted wire slot {slot} with a role only the receiver may mint")]
    IllegalMint { peer: PeerId, slot: WireSlot },
    #[error("no peer holds a wire slot for {0}")]
    NoWireSlot(KernelSlot),
    #[error("vat {vat} has no c-list entry for {slot}")]
    UnknownVatSlot { vat: VatId, slot: VatSlot },
}

// ---------------------------------------------------------------------------
// Peer c-lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerClist {
    access: BTreeMap<KernelSlot, WireSlot>,
    resolvers: BTreeMap<KernelSlot, WireSlot>,
    inbound: BTreeMap<WireSlot, KernelSlot>,
    next_id: u64,
}

impl PeerClist {
    pub fn new() -> Self {
        PeerClist { next_id: 1, ..Default::default() }
    }

    /// Rebuilds a table from its persisted entries.
    pub fn from_entries(
        access: BTreeMap<KernelSlot, WireSlot>,
        resolvers: BTreeMap<KernelSlot, WireSlot>,
        next_id: u64,
    ) -> Self {
        let inbound = access
            .iter()
            .chain(resolvers.iter())
            .map(|(k, w)| (w.flip(), *k))
            .collect();
        PeerClist { access, resolvers, inbound, next_id }
    }

    pub fn access_entries(&self) -> &BTreeMap<KernelSlot, WireSlot> {
        &self.access
    }

    pub fn resolver_entries(&self) -> &BTreeMap<KernelSlot, WireSlot> {
        &self.resolvers
    }

    pub fn inbound_entries(&self) -> &BTreeMap<WireSlot, KernelSlot> {
        &self.inbound
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.access.len() + self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Our wire form of `kslot`, looking at access entries first.
    pub fn wire_for(&self, kslot: &KernelSlot) -> Option<WireSlot> {
        self.access.get(kslot).or_else(|| self.resolvers.get(kslot)).copied()
    }

    pub fn holds(&self, kslot: &KernelSlot) -> bool {
        self.access.contains_key(kslot) || self.resolvers.contains_key(kslot)
    }

    fn mint(&mut self, role: WireRole) -> WireSlot {
        let id = self.next_id;
        self.next_id += 1;
        WireSlot::new(role, id, true)
    }

    /// Returns the wire slot for `kslot` and whether it was freshly minted.
    pub fn translate_outbound(&mut self, peer: &PeerId, kslot: KernelSlot) -> Result<(WireSlot, bool), ClistError> {
        if let Some(w) = self.wire_for(&kslot) {
            return Ok((w, false));
        }
        let role = match kslot.kind {
            SlotKind::Object => WireRole::YourIngress,
            SlotKind::Promise => WireRole::YourPromise,
            SlotKind::Device => return Err(ClistError::DeviceCrossing(kslot)),
        };
        let w = self.mint(role);
        trace!("clist {}: {} -> {} (access)", peer, kslot, w);
        self.access.insert(kslot, w);
        self.inbound.insert(w.flip(), kslot);
        Ok((w, true))
    }

    pub fn translate_result_slot(&mut self, peer: &PeerId, kslot: KernelSlot) -> Result<WireSlot, ClistError> {
        if !kslot.is_promise() {
            return Err(ClistError::NotAPromise(kslot));
        }
        if let Some(w) = self.resolvers.get(&kslot) {
            return Ok(*w);
        }
        let w = self.mint(WireRole::YourResolver);
        trace!("clist {}: {} -> {} (resolver)", peer, kslot, w);
        self.resolvers.insert(kslot, w);
        self.inbound.insert(w.flip(), kslot);
        Ok(w)
    }

    /// Maps a slot written by the peer. Peer-minted `ri`, `rp` and `rr`
    /// slots seen for the first time get a kernel slot from `mint`.
    pub fn translate_inbound(
        &mut self,
        peer: &PeerId,
        their: WireSlot,
        mint: impl FnOnce(WireRole) -> KernelSlot,
    ) -> Result<KernelSlot, ClistError> {
        if let Some(k) = self.inbound.get(&their) {
            return Ok(*k);
        }
        if !their.minted_by_sender {
            return Err(ClistError::UnknownWireSlot { peer: peer.clone(), slot: their });
        }
        if their.role == WireRole::YourEgress {
            return Err(ClistError::IllegalMint { peer: peer.clone(), slot: their });
        }
        let kslot = mint(their.role);
        let mine = their.flip();
        trace!("clist {}: {} <- {} (minted by peer)", peer, kslot, their);
        self.access.insert(kslot, mine);
        self.inbound.insert(their, kslot);
        Ok(kslot)
    }

    /// Removes every entry for `kslot`, returning our wire form if one existed.
    pub fn drop_entry(&mut self, kslot: &KernelSlot) -> Option<WireSlot> {
        let access = self.access.remove(kslot);
        let resolver = self.resolvers.remove(kslot);
        for w in access.iter().chain(resolver.iter()) {
            self.inbound.remove(&w.flip());
        }
        access.or(resolver)
    }

    /// Seeds an access entry under a well-known id agreed out of band.
    pub fn add_known(&mut self, kslot: KernelSlot, mine: WireSlot) {
        self.next_id = self.next_id.max(mine.id + 1);
        self.access.insert(kslot, mine);
        self.inbound.insert(mine.flip(), kslot);
    }
}

/// All peer c-lists of one kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTable {
    pub(crate) peers: BTreeMap<PeerId, PeerClist>,
}

impl SlotTable {
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerClist> {
        self.peers.get(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &PeerClist)> {
        self.peers.iter()
    }

    fn peer_mut(&mut self, peer: &PeerId) -> &mut PeerClist {
        self.peers.entry(peer.clone()).or_insert_with(PeerClist::new)
    }

    pub fn ensure_peer(&mut self, peer: &PeerId) {
        self.peer_mut(peer);
    }

    pub fn translate_outbound(&mut self, peer: &PeerId, kslot: KernelSlot) -> Result<WireSlot, ClistError> {
        self.translate_outbound_fresh(peer, kslot).map(|(w, _)| w)
    }

    pub(crate) fn translate_outbound_fresh(
        &mut self,
        peer: &PeerId,
        kslot: KernelSlot,
    ) -> Result<(WireSlot, bool), ClistError> {
        self.peer_mut(peer).translate_outbound(peer, kslot)
    }

    pub fn translate_result_slot(&mut self, peer: &PeerId, kslot: KernelSlot) -> Result<WireSlot, ClistError> {
        self.peer_mut(peer).translate_result_slot(peer, kslot)
    }

    /// Every peer holding a wire slot for `kslot`.
    pub fn translate_outbound_target(&self, kslot: &KernelSlot) -> Result<Vec<PeerId>, ClistError> {
        let holders: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, clist)| clist.holds(kslot))
            .map(|(peer, _)| peer.clone())
            .collect();
        if holders.is_empty() {
            return Err(ClistError::NoWireSlot(*kslot));
        }
        Ok(holders)
    }

    pub fn translate_inbound(
        &mut self,
        peer: &PeerId,
        their: WireSlot,
        mint: impl FnOnce(WireRole) -> KernelSlot,
    ) -> Result<KernelSlot, ClistError> {
        self.peer_mut(peer).translate_inbound(peer, their, mint)
    }

    pub fn drop_entry(&mut self, peer: &PeerId, kslot: &KernelSlot) -> Option<WireSlot> {
        self.peers.get_mut(peer).and_then(|c| c.drop_entry(kslot))
    }

    pub fn holds_anywhere(&self, kslot: &KernelSlot) -> bool {
        self.peers.values().any(|c| c.holds(kslot))
    }
}

// ---------------------------------------------------------------------------
// Vat c-lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VatClist {
    to_vat: BTreeMap<KernelSlot, VatSlot>,
    to_kernel: BTreeMap<VatSlot, KernelSlot>,
    next_import: u64,
}

impl VatClist {
    pub fn new() -> Self {
        VatClist { next_import: 1, ..Default::default() }
    }

    pub fn from_entries(to_vat: BTreeMap<KernelSlot, VatSlot>, next_import: u64) -> Self {
        let to_kernel = to_vat.iter().map(|(k, v)| (*v, *k)).collect();
        VatClist { to_vat, to_kernel, next_import }
    }

    pub fn entries(&self) -> &BTreeMap<KernelSlot, VatSlot> {
        &self.to_vat
    }

    pub fn next_import(&self) -> u64 {
        self.next_import
    }

    pub fn len(&self) -> usize {
        self.to_vat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_vat.is_empty()
    }

    pub fn vref_for(&self, kslot: &KernelSlot) -> Option<VatSlot> {
        self.to_vat.get(kslot).copied()
    }

    pub fn kslot_for(&self, vref: &VatSlot) -> Option<KernelSlot> {
        self.to_kernel.get(vref).copied()
    }

    /// Existing vref for `kslot`, or a fresh import (`o-N`, `p-N`, `d-N`).
    pub fn import(&mut self, vat: VatId, kslot: KernelSlot) -> VatSlot {
        if let Some(v) = self.to_vat.get(&kslot) {
            return *v;
        }
        let vref = VatSlot::import(kslot.kind, self.next_import);
        self.next_import += 1;
        trace!("clist {}: {} -> {} (import)", vat, kslot, vref);
        self.to_vat.insert(kslot, vref);
        self.to_kernel.insert(vref, kslot);
        vref
    }

    /// Records a vat-allocated vref as the vat's name for `kslot`.
    pub fn export(&mut self, vat: VatId, vref: VatSlot, kslot: KernelSlot) {
        trace!("clist {}: {} -> {} (export)", vat, kslot, vref);
        self.to_vat.insert(kslot, vref);
        self.to_kernel.insert(vref, kslot);
    }

    pub fn drop_vref(&mut self, vref: &VatSlot) -> Option<KernelSlot> {
        let kslot = self.to_kernel.remove(vref)?;
        self.to_vat.remove(&kslot);
        Some(kslot)
    }
}
