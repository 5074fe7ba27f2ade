//! Kernel tuning knobs. Deserializable so hosts can embed them in their
//! own configuration files.

use serde::{Deserialize, Serialize};

use crate::weak::WeakMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelOptions {
    /// Collection mode handed to vat-side object managers.
    pub weak_mode: WeakMode,
    /// Virtual-object state cache entries kept per vat.
    pub vom_cache_size: usize,
    /// Upper bound on cranks per `run` call; `None` runs until idle.
    pub max_cranks_per_run: Option<u64>,
    /// Default for vats created without explicit options.
    pub pipelining_default: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            weak_mode: WeakMode::Weak,
            vom_cache_size: 64,
            max_cranks_per_run: None,
            pipelining_default: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VatOptions {
    /// Deliver messages addressed to this vat's unresolved promises to the
    /// vat instead of queueing them.
    pub pipelining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let opts: KernelOptions = serde_json::from_str(r#"{"weak_mode":"strong"}"#).unwrap();
        assert_eq!(opts.weak_mode, WeakMode::Strong);
        assert_eq!(opts.vom_cache_size, 64);
        assert!(serde_json::from_str::<KernelOptions>(r#"{"bogus":1}"#).is_err());
    }
}
