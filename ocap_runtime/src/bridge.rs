//! Mailbox bridge: moves outbound batches of one host into the inbound
//! side of another.
//!
//! Stands in for a network. Faults are injected deterministically by
//! counting transmitted messages, so a faulty run is reproducible. Dropped
//! messages stay in the sender's outbound queue until acknowledged and go
//! out again on the next pump.

use log::trace;

use ocap_kernel::mailbox::OutboundBatch;

use crate::host::{Host, HostError, SharedHost};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkFaults {
    /// Drop every n-th transmitted message; 0 never drops.
    pub drop_every: u32,
    /// Send every n-th transmitted message twice; 0 never duplicates.
    pub duplicate_every: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub transmitted: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub delivered: u64,
}

#[derive(Debug, Default)]
pub struct Link {
    faults: LinkFaults,
    stats: LinkStats,
}

impl Link {
    pub fn reliable() -> Self {
        Link::default()
    }

    pub fn with_faults(faults: LinkFaults) -> Self {
        Link { faults, stats: LinkStats::default() }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Applies the fault schedule to one batch.
    pub fn transmit(&mut self, batch: OutboundBatch) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::with_capacity(batch.messages.len());
        for (seq, payload) in batch.messages {
            self.stats.transmitted += 1;
            let n = self.stats.transmitted;
            if hits(self.faults.drop_every, n) {
                self.stats.dropped += 1;
                trace!("link: dropped seq {}", seq);
                continue;
            }
            if hits(self.faults.duplicate_every, n) {
                self.stats.duplicated += 1;
                out.push((seq, payload.clone()));
            }
            out.push((seq, payload));
        }
        out
    }

    /// Moves `from`'s batch for `to` across the link. Returns the number of
    /// messages `to` newly accepted.
    pub fn pump(&mut self, from: &Host, to: &mut Host) -> Result<usize, HostError> {
        let batch = from.outbound(to.name());
        let ack = batch.ack;
        let messages = self.transmit(batch);
        let receipt = to.deliver_inbound(from.name(), messages, ack)?;
        self.stats.delivered += receipt.delivered.len() as u64;
        Ok(receipt.delivered.len())
    }

    /// `pump` for shared hosts. The two locks are never held together.
    pub fn pump_shared(&mut self, from: &SharedHost, to: &SharedHost) -> Result<usize, HostError> {
        let to_name = to.name()?;
        let (from_name, batch) = from.with(|h| Ok((h.name().clone(), h.outbound(&to_name))))?;
        let ack = batch.ack;
        let messages = self.transmit(batch);
        let receipt = to.deliver_inbound(&from_name, messages, ack)?;
        self.stats.delivered += receipt.delivered.len() as u64;
        Ok(receipt.delivered.len())
    }

    /// Runs both hosts and pumps both directions until no crank runs and
    /// both outbound queues are empty. Returns the rounds taken.
    pub fn settle(&mut self, a: &mut Host, b: &mut Host, max_rounds: usize) -> Result<usize, HostError> {
        for round in 1..=max_rounds {
            let cranks = a.run_until_idle()? + b.run_until_idle()?;
            let moved = self.pump(a, b)? + self.pump(b, a)?;
            let drained = a.outbound(b.name()).messages.is_empty() && b.outbound(a.name()).messages.is_empty();
            if cranks == 0 && moved == 0 && drained {
                return Ok(round);
            }
        }
        Err(HostError::NoQuiescence { rounds: max_rounds })
    }
}

fn hits(every: u32, n: u64) -> bool {
    every > 0 && n % u64::from(every) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(seqs: &[u64]) -> OutboundBatch {
        OutboundBatch { messages: seqs.iter().map(|s| (*s, vec![*s as u8])).collect(), ack: 0 }
    }

    #[test]
    fn test_reliable_link_passes_everything() {
        let mut link = Link::reliable();
        assert_eq!(link.transmit(batch(&[1, 2, 3])).len(), 3);
        assert_eq!(link.stats().transmitted, 3);
    }

    #[test]
    fn test_fault_schedule_is_deterministic() {
        let faults = LinkFaults { drop_every: 3, duplicate_every: 2 };
        let mut link = Link::with_faults(faults);
        let seqs: Vec<u64> = link.transmit(batch(&[1, 2, 3, 4, 5, 6])).into_iter().map(|(s, _)| s).collect();
        // 3 and 6 dropped; 2 and 4 doubled
        assert_eq!(seqs, vec![1, 2, 2, 4, 4, 5]);
        assert_eq!(link.stats().dropped, 2);
        assert_eq!(link.stats().duplicated, 2);
    }
}
