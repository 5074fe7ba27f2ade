//! Drift detection: determinism verification and state comparison.
//!
//! All counts are i64 so deltas can go negative.

use std::collections::{BTreeMap, BTreeSet};

use ocap_kernel::hashing::state_hash;
use ocap_kernel::state::KernelState;
use ocap_kernel::{Kernel, KernelError, KernelOptions, MemoryStore};

/// What a finished run looks like from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub crank_number: u64,
    pub activity_hash: String,
    pub state_hash: String,
}

impl Fingerprint {
    pub fn of(kernel: &Kernel<MemoryStore>) -> Self {
        Fingerprint {
            crank_number: kernel.crank_number(),
            activity_hash: kernel.activity_hash().to_string(),
            state_hash: state_hash(&kernel.store().snapshot()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeterminismCheck {
    pub first: Fingerprint,
    pub second: Fingerprint,
}

impl DeterminismCheck {
    pub fn is_deterministic(&self) -> bool {
        self.first == self.second
    }
}

/// Drives two fresh in-memory kernels with the same script and fingerprints
/// both. The script must register its own vats and inputs.
pub fn verify_determinism<F>(options: &KernelOptions, script: F) -> Result<DeterminismCheck, KernelError>
where
    F: Fn(&mut Kernel<MemoryStore>) -> Result<(), KernelError>,
{
    let run = || -> Result<Fingerprint, KernelError> {
        let mut kernel = Kernel::open(MemoryStore::new(), options.clone())?;
        script(&mut kernel)?;
        Ok(Fingerprint::of(&kernel))
    };
    let first = run()?;
    let second = run()?;
    Ok(DeterminismCheck { first, second })
}

/// Structured comparison of two kernel states.
pub fn compare_states(a: &KernelState, b: &KernelState) -> DriftReport {
    let names = |s: &KernelState| -> BTreeSet<String> { s.vats.values().map(|v| v.record.name.clone()).collect() };
    let names_a = names(a);
    let names_b = names(b);

    let incarnations = |s: &KernelState| -> BTreeMap<String, (u64, bool)> {
        s.vats
            .values()
            .map(|v| (v.record.name.clone(), (v.record.incarnation, v.record.is_running())))
            .collect()
    };
    let inc_a = incarnations(a);
    let inc_b = incarnations(b);

    let mut upgraded = Vec::new();
    let mut terminated = Vec::new();
    for name in names_a.intersection(&names_b) {
        let (ia, running_a) = inc_a[name];
        let (ib, running_b) = inc_b[name];
        if ib > ia {
            upgraded.push(name.clone());
        }
        if running_a && !running_b {
            terminated.push(name.clone());
        }
    }

    let unresolved = |s: &KernelState| s.promises.iter().filter(|(_, p)| !p.is_resolved()).count() as i64;
    let count = |n: usize| n as i64;

    DriftReport {
        crank_a: a.meta.crank_number as i64,
        crank_b: b.meta.crank_number as i64,
        crank_delta: b.meta.crank_number as i64 - a.meta.crank_number as i64,
        object_count_a: count(a.objects.len()),
        object_count_b: count(b.objects.len()),
        object_count_delta: count(b.objects.len()) - count(a.objects.len()),
        promise_count_a: count(a.promises.len()),
        promise_count_b: count(b.promises.len()),
        promise_count_delta: count(b.promises.len()) - count(a.promises.len()),
        unresolved_a: unresolved(a),
        unresolved_b: unresolved(b),
        unresolved_delta: unresolved(b) - unresolved(a),
        run_queue_a: count(a.run_queue.len()),
        run_queue_b: count(b.run_queue.len()),
        run_queue_delta: count(b.run_queue.len()) - count(a.run_queue.len()),
        added_vats: names_b.difference(&names_a).cloned().collect(),
        removed_vats: names_a.difference(&names_b).cloned().collect(),
        upgraded_vats: upgraded,
        terminated_vats: terminated,
        added_peers: b.peers.keys().filter(|p| !a.peers.contains_key(*p)).map(|p| p.to_string()).collect(),
        activity_diverged: a.meta.activity_hash != b.meta.activity_hash,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub crank_a: i64,
    pub crank_b: i64,
    pub crank_delta: i64,
    pub object_count_a: i64,
    pub object_count_b: i64,
    pub object_count_delta: i64,
    pub promise_count_a: i64,
    pub promise_count_b: i64,
    pub promise_count_delta: i64,
    pub unresolved_a: i64,
    pub unresolved_b: i64,
    pub unresolved_delta: i64,
    pub run_queue_a: i64,
    pub run_queue_b: i64,
    pub run_queue_delta: i64,
    pub added_vats: Vec<String>,
    pub removed_vats: Vec<String>,
    pub upgraded_vats: Vec<String>,
    pub terminated_vats: Vec<String>,
    pub added_peers: Vec<String>,
    pub activity_diverged: bool,
}

impl DriftReport {
    /// True when nothing observable differs.
    pub fn is_empty(&self) -> bool {
        self.crank_delta == 0
            && self.object_count_delta == 0
            && self.promise_count_delta == 0
            && self.unresolved_delta == 0
            && self.run_queue_delta == 0
            && self.added_vats.is_empty()
            && self.removed_vats.is_empty()
            && self.upgraded_vats.is_empty()
            && self.terminated_vats.is_empty()
            && self.added_peers.is_empty()
            && !self.activity_diverged
    }
}
