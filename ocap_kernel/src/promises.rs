//! Kernel promise table.
//!
//! A promise is unresolved (with an optional decider, its subscribers and
//! the messages queued on it) or settled. Every subscriber, whether it
//! subscribed before or after settlement, is scheduled for notification
//! exactly once; `notified` records who has been scheduled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{CapData, Message, Outcome};
use crate::slots::{KernelSlot, PeerId, VatId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    #[error("unknown promise {0}")]
    Unknown(KernelSlot),
    #[error("promise {0} is already resolved")]
    AlreadyResolved(KernelSlot),
    #[error("{slot} is not decided by {who}")]
    NotDecider { slot: KernelSlot, who: String },
}

/// Who has the right to resolve a promise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Decider {
    Vat(VatId),
    Peer(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subscriber {
    Vat(VatId),
    Peer(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseState {
    Unresolved {
        decider: Option<Decider>,
        subscribers: BTreeSet<Subscriber>,
        queue: Vec<Message<KernelSlot>>,
    },
    Fulfilled(CapData<KernelSlot>),
    Rejected(CapData<KernelSlot>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPromise {
    pub state: PromiseState,
    pub notified: BTreeSet<Subscriber>,
}

impl KernelPromise {
    pub fn new(decider: Option<Decider>) -> Self {
        KernelPromise {
            state: PromiseState::Unresolved { decider, subscribers: BTreeSet::new(), queue: Vec::new() },
            notified: BTreeSet::new(),
        }
    }

    pub fn decider(&self) -> Option<&Decider> {
        match &self.state {
            PromiseState::Unresolved { decider, .. } => decider.as_ref(),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.state, PromiseState::Unresolved { .. })
    }

    pub fn outcome(&self) -> Option<Outcome<KernelSlot>> {
        match &self.state {
            PromiseState::Unresolved { .. } => None,
            PromiseState::Fulfilled(d) => Some(Outcome::Fulfilled(d.clone())),
            PromiseState::Rejected(d) => Some(Outcome::Rejected(d.clone())),
        }
    }
}

/// Coarse promise status for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseStatus {
    Unresolved,
    Fulfilled,
    Rejected,
}

/// What the scheduler must enqueue after a settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    pub requeue: Vec<Message<KernelSlot>>,
    pub notify: Vec<Subscriber>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeEffect {
    /// Settled and not yet scheduled for this subscriber: notify next crank.
    NotifyNow,
    /// Recorded; notification comes with settlement.
    Pending,
    /// Already subscribed or already notified.
    Nothing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromiseTable {
    pub(crate) promises: BTreeMap<u64, KernelPromise>,
}

impl PromiseTable {
    pub fn get(&self, kp: &KernelSlot) -> Option<&KernelPromise> {
        if !kp.is_promise() {
            return None;
        }
        self.promises.get(&kp.id)
    }

    fn get_mut(&mut self, kp: &KernelSlot) -> Result<&mut KernelPromise, PromiseError> {
        if !kp.is_promise() {
            return Err(PromiseError::Unknown(*kp));
        }
        self.promises.get_mut(&kp.id).ok_or(PromiseError::Unknown(*kp))
    }

    pub fn iter(&self) -> impl Iterator<Item = (KernelSlot, &KernelPromise)> {
        self.promises.iter().map(|(id, p)| (KernelSlot::promise(*id), p))
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }

    pub fn insert(&mut self, kp: KernelSlot, promise: KernelPromise) {
        self.promises.insert(kp.id, promise);
    }

    pub fn status(&self, kp: &KernelSlot) -> Option<PromiseStatus> {
        self.get(kp).map(|p| match p.state {
            PromiseState::Unresolved { .. } => PromiseStatus::Unresolved,
            PromiseState::Fulfilled(_) => PromiseStatus::Fulfilled,
            PromiseState::Rejected(_) => PromiseStatus::Rejected,
        })
    }

    pub fn set_decider(&mut self, kp: &KernelSlot, new: Option<Decider>) -> Result<(), PromiseError> {
        match &mut self.get_mut(kp)?.state {
            PromiseState::Unresolved { decider, .. } => {
                *decider = new;
                Ok(())
            }
            _ => Err(PromiseError::AlreadyResolved(*kp)),
        }
    }

    pub fn subscribe(&mut self, kp: &KernelSlot, subscriber: Subscriber) -> Result<SubscribeEffect, PromiseError> {
        let promise = self.get_mut(kp)?;
        if promise.notified.contains(&subscriber) {
            return Ok(SubscribeEffect::Nothing);
        }
        match &mut promise.state {
            PromiseState::Unresolved { subscribers, .. } => {
                if subscribers.insert(subscriber) {
                    Ok(SubscribeEffect::Pending)
                } else {
                    Ok(SubscribeEffect::Nothing)
                }
            }
            _ => {
                promise.notified.insert(subscriber);
                Ok(SubscribeEffect::NotifyNow)
            }
        }
    }

    /// Parks a message on an unresolved promise.
    pub fn enqueue(&mut self, kp: &KernelSlot, message: Message<KernelSlot>) -> Result<(), PromiseError> {
        match &mut self.get_mut(kp)?.state {
            PromiseState::Unresolved { queue, .. } => {
                queue.push(message);
                Ok(())
            }
            _ => Err(PromiseError::AlreadyResolved(*kp)),
        }
    }

    /// Settles `kp`. Returns the queued messages to put back on the
    /// run-queue and the subscribers to notify, each exactly once.
    pub fn resolve(&mut self, kp: &KernelSlot, outcome: Outcome<KernelSlot>) -> Result<Settlement, PromiseError> {
        let promise = self.get_mut(kp)?;
        let new_state = match outcome {
            Outcome::Fulfilled(d) => PromiseState::Fulfilled(d),
            Outcome::Rejected(d) => PromiseState::Rejected(d),
        };
        let old = match &promise.state {
            PromiseState::Unresolved { .. } => std::mem::replace(&mut promise.state, new_state),
            _ => return Err(PromiseError::AlreadyResolved(*kp)),
        };
        let PromiseState::Unresolved { subscribers, queue, .. } = old else {
            return Err(PromiseError::AlreadyResolved(*kp));
        };
        let notify: Vec<Subscriber> = subscribers
            .into_iter()
            .filter(|s| promise.notified.insert(s.clone()))
            .collect();
        Ok(Settlement { requeue: queue, notify })
    }
}
