//! Slot identifiers at the three layers of the system.
//!
//! - `KernelSlot` (`ko12`, `kp3`, `kd1`): kernel-global, immutable once allocated.
//! - `VatSlot` (`o+4`, `o-2`, `p+1`, `p-9`, `d-1`): what a single vat sees.
//! - `WireSlot` (`ri+5`, `re-5`, `rp+2`, `rr-2`): what crosses a machine boundary.
//!
//! All three render to short strings and serialize as those strings, so they
//! can be used directly as JSON map keys in persisted records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("malformed slot {0:?}")]
    Malformed(String),
    #[error("invalid name {0:?}: must match [a-zA-Z0-9_-]+")]
    InvalidName(String),
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Names used inside store keys must match `[a-zA-Z0-9_-]+`.
pub fn validate_name(name: &str) -> Result<(), SlotError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(SlotError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Identifier of a remote machine this kernel exchanges mailbox traffic with.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Result<Self, SlotError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(PeerId(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = SlotError;
    fn try_from(s: String) -> Result<Self, SlotError> {
        PeerId::new(s)
    }
}

impl From<PeerId> for String {
    fn from(p: PeerId) -> String {
        p.0
    }
}

impl FromStr for PeerId {
    type Err = SlotError;
    fn from_str(s: &str) -> Result<Self, SlotError> {
        PeerId::new(s)
    }
}

/// Kernel-assigned vat number, rendered `v3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatId(pub u32);

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = SlotError;
    fn from_str(s: &str) -> Result<Self, SlotError> {
        s.strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .map(VatId)
            .ok_or_else(|| SlotError::Malformed(s.to_string()))
    }
}

impl TryFrom<String> for VatId {
    type Error = SlotError;
    fn try_from(s: String) -> Result<Self, SlotError> {
        s.parse()
    }
}

impl From<VatId> for String {
    fn from(v: VatId) -> String {
        v.to_string()
    }
}

// ---------------------------------------------------------------------------
// Kernel slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    fn letter(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c {
            'o' => Some(SlotKind::Object),
            'p' => Some(SlotKind::Promise),
            'd' => Some(SlotKind::Device),
            _ => None,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotKind::Object => "object",
            SlotKind::Promise => "promise",
            SlotKind::Device => "device",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelSlot {
    pub kind: SlotKind,
    pub id: u64,
}

impl KernelSlot {
    pub fn object(id: u64) -> Self {
        KernelSlot { kind: SlotKind::Object, id }
    }

    pub fn promise(id: u64) -> Self {
        KernelSlot { kind: SlotKind::Promise, id }
    }

    pub fn device(id: u64) -> Self {
        KernelSlot { kind: SlotKind::Device, id }
    }

    pub fn is_promise(&self) -> bool {
        self.kind == SlotKind::Promise
    }

    pub fn is_object(&self) -> bool {
        self.kind == SlotKind::Object
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}{}", self.kind.letter(), self.id)
    }
}

impl FromStr for KernelSlot {
    type Err = SlotError;
    fn from_str(s: &str) -> Result<Self, SlotError> {
        let malformed = || SlotError::Malformed(s.to_string());
        let rest = s.strip_prefix('k').ok_or_else(malformed)?;
        let mut chars = rest.chars();
        let kind = chars.next().and_then(SlotKind::from_letter).ok_or_else(malformed)?;
        let id = parse_id(chars.as_str()).ok_or_else(malformed)?;
        Ok(KernelSlot { kind, id })
    }
}

impl TryFrom<String> for KernelSlot {
    type Error = SlotError;
    fn try_from(s: String) -> Result<Self, SlotError> {
        s.parse()
    }
}

impl From<KernelSlot> for String {
    fn from(k: KernelSlot) -> String {
        k.to_string()
    }
}

// ---------------------------------------------------------------------------
// Vat slots
// ---------------------------------------------------------------------------

/// A vat-local reference. `allocated_by_vat` is the `+` form: the vat minted
/// the id (its own export or its own result promise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatSlot {
    pub kind: SlotKind,
    pub allocated_by_vat: bool,
    pub id: u64,
}

impl VatSlot {
    pub fn export(kind: SlotKind, id: u64) -> Self {
        VatSlot { kind, allocated_by_vat: true, id }
    }

    pub fn import(kind: SlotKind, id: u64) -> Self {
        VatSlot { kind, allocated_by_vat: false, id }
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{}{}", self.kind.letter(), sign, self.id)
    }
}

impl FromStr for VatSlot {
    type Err = SlotError;
    fn from_str(s: &str) -> Result<Self, SlotError> {
        let malformed = || SlotError::Malformed(s.to_string());
        let mut chars = s.chars();
        let kind = chars.next().and_then(SlotKind::from_letter).ok_or_else(malformed)?;
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(malformed()),
        };
        // devices are only ever imported
        if kind == SlotKind::Device && allocated_by_vat {
            return Err(malformed());
        }
        let id = parse_id(chars.as_str()).ok_or_else(malformed)?;
        Ok(VatSlot { kind, allocated_by_vat, id })
    }
}

impl TryFrom<String> for VatSlot {
    type Error = SlotError;
    fn try_from(s: String) -> Result<Self, SlotError> {
        s.parse()
    }
}

impl From<VatSlot> for String {
    fn from(v: VatSlot) -> String {
        v.to_string()
    }
}

// ---------------------------------------------------------------------------
// Wire slots
// ---------------------------------------------------------------------------

/// Role tag of a wire slot, always phrased from the receiver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WireRole {
    /// An object the receiver may invoke; the sender hosts it.
    YourIngress,
    /// An object the receiver hosts and previously exported.
    YourEgress,
    /// A promise the sender decides.
    YourPromise,
    /// A promise the receiver is being asked to decide.
    YourResolver,
}

impl WireRole {
    pub fn kind(self) -> SlotKind {
        match self {
            WireRole::YourIngress | WireRole::YourEgress => SlotKind::Object,
            WireRole::YourPromise | WireRole::YourResolver => SlotKind::Promise,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            WireRole::YourIngress => WireRole::YourEgress,
            WireRole::YourEgress => WireRole::YourIngress,
            WireRole::YourPromise => WireRole::YourResolver,
            WireRole::YourResolver => WireRole::YourPromise,
        }
    }

    fn code(self) -> &'static str {
        match self {
            WireRole::YourIngress => "ri",
            WireRole::YourEgress => "re",
            WireRole::YourPromise => "rp",
            WireRole::YourResolver => "rr",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "ri" => Some(WireRole::YourIngress),
            "re" => Some(WireRole::YourEgress),
            "rp" => Some(WireRole::YourPromise),
            "rr" => Some(WireRole::YourResolver),
            _ => None,
        }
    }
}

/// A slot as written on the wire by its sender. `minted_by_sender` renders
/// as `+` and records which side allocated `id`, so ids minted by the two
/// machines never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WireSlot {
    pub role: WireRole,
    pub id: u64,
    pub minted_by_sender: bool,
}

impl WireSlot {
    pub fn new(role: WireRole, id: u64, minted_by_sender: bool) -> Self {
        WireSlot { role, id, minted_by_sender }
    }

    pub fn kind(&self) -> SlotKind {
        self.role.kind()
    }

    /// Rewrites the slot as the other side would write it. Pure and
    /// involutive; the numeric id never changes.
    pub fn flip(self) -> Self {
        WireSlot {
            role: self.role.flip(),
            id: self.id,
            minted_by_sender: !self.minted_by_sender,
        }
    }
}

impl fmt::Display for WireSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.minted_by_sender { '+' } else { '-' };
        write!(f, "{}{}{}", self.role.code(), sign, self.id)
    }
}

impl FromStr for WireSlot {
    type Err = SlotError;
    fn from_str(s: &str) -> Result<Self, SlotError> {
        let malformed = || SlotError::Malformed(s.to_string());
        let role = s.get(..2).and_then(WireRole::from_code).ok_or_else(malformed)?;
        let minted_by_sender = match s.get(2..3) {
            Some("+") => true,
            Some("-") => false,
            _ => return Err(malformed()),
        };
        let id = s.get(3..).and_then(parse_id).ok_or_else(malformed)?;
        Ok(WireSlot { role, id, minted_by_sender })
    }
}

impl TryFrom<String> for WireSlot {
    type Error = SlotError;
    fn try_from(s: String) -> Result<Self, SlotError> {
        s.parse()
    }
}

impl From<WireSlot> for String {
    fn from(w: WireSlot) -> String {
        w.to_string()
    }
}

/// Decimal ids without sign or leading zeros, so every id has one rendering.
fn parse_id(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || (s.len() > 1 && s.starts_with('0')) {
        return None;
    }
    s.parse().ok()
}
