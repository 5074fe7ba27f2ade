//! Message and data shapes shared by every layer, parameterized over the
//! slot type of the layer they travel in.

use serde::{Deserialize, Serialize};

use crate::slots::SlotError;

/// Body of a value that is exactly one reference, `slots[0]`.
pub const REFERENCE_BODY: &str = r#"{"@slot":0}"#;

/// Opaque serialized data plus the references it carries. The kernel never
/// looks inside `body`; only `slots` are translated between layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    pub body: String,
    pub slots: Vec<S>,
}

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        CapData { body: body.into(), slots }
    }

    /// Plain data with no references.
    pub fn data(body: impl Into<String>) -> Self {
        CapData { body: body.into(), slots: Vec::new() }
    }

    /// A value that is a single reference.
    pub fn reference(slot: S) -> Self {
        CapData { body: REFERENCE_BODY.to_string(), slots: vec![slot] }
    }

    /// The referenced slot if this value is a single reference.
    pub fn as_reference(&self) -> Option<&S> {
        match self.slots.as_slice() {
            [slot] if self.body == REFERENCE_BODY => Some(slot),
            _ => None,
        }
    }

    /// Rewrites every slot, keeping the body.
    pub fn try_map<T, E>(&self, mut f: impl FnMut(&S) -> Result<T, E>) -> Result<CapData<T>, E> {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, E>>()?;
        Ok(CapData { body: self.body.clone(), slots })
    }
}

/// An eventual send. `result` is the promise the sender will observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<S> {
    pub method: String,
    pub args: CapData<S>,
    pub result: Option<S>,
}

impl<S> Message<S> {
    pub fn new(method: impl Into<String>, args: CapData<S>, result: Option<S>) -> Self {
        Message { method: method.into(), args, result }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome<S> {
    Fulfilled(CapData<S>),
    Rejected(CapData<S>),
}

impl<S> Outcome<S> {
    pub fn data(&self) -> &CapData<S> {
        match self {
            Outcome::Fulfilled(d) | Outcome::Rejected(d) => d,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    pub fn try_map<T, E>(&self, f: impl FnMut(&S) -> Result<T, E>) -> Result<Outcome<T>, E> {
        Ok(match self {
            Outcome::Fulfilled(d) => Outcome::Fulfilled(d.try_map(f)?),
            Outcome::Rejected(d) => Outcome::Rejected(d.try_map(f)?),
        })
    }
}

/// Structured reasons the kernel itself rejects promises with. Carried as
/// the JSON body of the rejection data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The target cannot accept messages (rejected promise, plain data, dead vat).
    Undeliverable { method: String, detail: String },
    /// The decider went away. `incarnation` is the vat incarnation or the
    /// peer epoch that was lost.
    Disconnected { name: String, incarnation: u64, upgrade: bool },
    VatTerminated { vat: String, reason: String },
    ProtocolViolation { detail: String },
    Abandoned,
}

impl RejectionReason {
    pub fn to_capdata<S>(&self) -> CapData<S> {
        // Serializing a field-only enum into a String cannot fail.
        let body = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        CapData::data(body)
    }

    pub fn from_capdata<S>(data: &CapData<S>) -> Option<Self> {
        serde_json::from_str(&data.body).ok()
    }

    pub fn protocol_violation(err: impl std::fmt::Display) -> Self {
        RejectionReason::ProtocolViolation { detail: err.to_string() }
    }
}

impl From<SlotError> for RejectionReason {
    fn from(err: SlotError) -> Self {
        RejectionReason::protocol_violation(err)
    }
}
