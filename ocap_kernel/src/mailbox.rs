//! Ordered, deduplicated, acknowledged mailbox transport.
//!
//! Each peer has an inbound watermark (everything up to it was handed to the
//! kernel exactly once) and an outbound queue of messages the peer has not
//! acknowledged yet. Payloads are opaque bytes.

use std::collections::BTreeMap;

use log::trace;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slots::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("inbound handler already registered")]
    HandlerAlreadyRegistered,
    #[error("no inbound handler registered")]
    NoHandler,
    #[error("peer {peer} acknowledged seq {ack} but only {sent} messages were sent")]
    AckBeyondSent { peer: PeerId, ack: u64, sent: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMailbox {
    pub highest_inbound_delivered: u64,
    /// Highest of our outbound seqs the peer has acknowledged.
    pub highest_inbound_acknowledged: u64,
    pub outbound: Vec<(u64, Vec<u8>)>,
    pub next_outbound_seq: u64,
}

impl Default for PeerMailbox {
    fn default() -> Self {
        PeerMailbox {
            highest_inbound_delivered: 0,
            highest_inbound_acknowledged: 0,
            outbound: Vec::new(),
            next_outbound_seq: 1,
        }
    }
}

/// Result of one `receive_inbound` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundReceipt {
    /// Newly delivered messages, in seq order.
    pub delivered: Vec<(u64, Vec<u8>)>,
    /// Our outbound seqs released by the peer's ack.
    pub pruned: Vec<u64>,
    pub did_change: bool,
}

/// Everything the peer has not acknowledged, plus our piggybacked ack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundBatch {
    pub messages: Vec<(u64, Vec<u8>)>,
    pub ack: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mailbox {
    pub(crate) peers: BTreeMap<PeerId, PeerMailbox>,
}

impl Mailbox {
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerMailbox> {
        self.peers.get(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &PeerMailbox)> {
        self.peers.iter()
    }

    pub fn ensure_peer(&mut self, peer: &PeerId) {
        self.peers.entry(peer.clone()).or_default();
    }

    pub fn enqueue_outbound(&mut self, peer: &PeerId, payload: Vec<u8>) -> u64 {
        let mb = self.peers.entry(peer.clone()).or_default();
        let seq = mb.next_outbound_seq;
        mb.next_outbound_seq += 1;
        mb.outbound.push((seq, payload));
        trace!("mailbox {}: queued outbound seq {}", peer, seq);
        seq
    }

    /// Accepts a batch from `peer`. Messages are taken in ascending seq
    /// order and only the one right after the watermark is delivered, so
    /// delivered messages always form a gap-free prefix. Replaying the same
    /// batch is a no-op. The ack is applied even when every message is a
    /// duplicate.
    pub fn receive_inbound(
        &mut self,
        peer: &PeerId,
        mut messages: Vec<(u64, Vec<u8>)>,
        ack: u64,
    ) -> Result<InboundReceipt, MailboxError> {
        let mb = self.peers.entry(peer.clone()).or_default();
        let sent = mb.next_outbound_seq.saturating_sub(1);
        if ack > sent {
            return Err(MailboxError::AckBeyondSent { peer: peer.clone(), ack, sent });
        }

        messages.sort_by_key(|(seq, _)| *seq);
        let mut receipt = InboundReceipt::default();
        for (seq, payload) in messages {
            if seq == mb.highest_inbound_delivered + 1 {
                mb.highest_inbound_delivered = seq;
                receipt.delivered.push((seq, payload));
            } else if seq <= mb.highest_inbound_delivered {
                trace!("mailbox {}: duplicate seq {}", peer, seq);
            } else {
                trace!("mailbox {}: seq {} past gap at {}", peer, seq, mb.highest_inbound_delivered + 1);
            }
        }

        if ack > mb.highest_inbound_acknowledged {
            mb.highest_inbound_acknowledged = ack;
            receipt.did_change = true;
            mb.outbound.retain(|(seq, _)| {
                if *seq <= ack {
                    receipt.pruned.push(*seq);
                    false
                } else {
                    true
                }
            });
        }
        receipt.did_change |= !receipt.delivered.is_empty();
        Ok(receipt)
    }

    pub fn outbound(&self, peer: &PeerId) -> OutboundBatch {
        match self.peers.get(peer) {
            Some(mb) => OutboundBatch {
                messages: mb.outbound.clone(),
                ack: mb.highest_inbound_delivered,
            },
            None => OutboundBatch::default(),
        }
    }
}

/// Holds the process-local inbound handler. Not persisted: it is wired up
/// again at every boot.
#[derive(Debug, Default)]
pub struct MailboxDevice<H> {
    handler: Option<H>,
}

impl<H> MailboxDevice<H> {
    pub fn new() -> Self {
        MailboxDevice { handler: None }
    }

    pub fn register_inbound_handler(&mut self, handler: H) -> Result<(), MailboxError> {
        if self.handler.is_some() {
            return Err(MailboxError::HandlerAlreadyRegistered);
        }
        self.handler = Some(handler);
        Ok(())
    }

    pub fn handler(&self) -> Result<&H, MailboxError> {
        self.handler.as_ref().ok_or(MailboxError::NoHandler)
    }
}
