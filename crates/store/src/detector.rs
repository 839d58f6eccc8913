use chrono::Utc;
use phasewatch_core::{PodIdentity, PodPhase, PodState, TransitionEvent, VersionToken};
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::cache::PhaseCache;

/// Outcome of reconciling the cache against a full listing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reconciliation {
    /// Divergences and first sights, in snapshot order.
    pub transitions: Vec<TransitionEvent>,
    /// Cached identities missing from the snapshot, sorted.
    pub evicted: Vec<PodIdentity>,
}

/// Turns phase observations into transitions using an owned [`PhaseCache`].
#[derive(Debug, Default)]
pub struct Detector {
    cache: PhaseCache,
}

impl Detector {
    pub fn new(cache: PhaseCache) -> Self { Self { cache } }

    pub fn cache(&self) -> &PhaseCache { &self.cache }

    /// Record one observation; yields a transition iff the phase differs from the cached one.
    pub fn observe(&mut self, identity: PodIdentity, phase: PodPhase, version: VersionToken) -> Option<TransitionEvent> {
        if !self.cache.changed(&identity, phase) {
            self.cache.touch(&identity, version);
            return None;
        }
        let old_phase = self.cache.get(&identity);
        self.cache.update(identity.clone(), phase, version);
        Some(TransitionEvent { identity, old_phase, new_phase: phase, observed_at: Utc::now() })
    }

    /// Version bookkeeping for an event that carries no phase observation.
    pub fn touch(&mut self, identity: &PodIdentity, version: VersionToken) {
        self.cache.touch(identity, version);
    }

    /// Drop the entry for a deleted Pod. No transition is produced.
    pub fn forget(&mut self, identity: &PodIdentity) -> bool {
        self.cache.remove(identity).is_some()
    }

    /// Bring the cache in line with a full current-state listing.
    pub fn reconcile(&mut self, items: Vec<PodState>) -> Reconciliation {
        let mut out = Reconciliation::default();
        let mut present: FxHashSet<PodIdentity> = FxHashSet::default();
        present.reserve(items.len());
        for item in items {
            present.insert(item.identity.clone());
            if let Some(t) = self.observe(item.identity, item.phase, item.version) {
                out.transitions.push(t);
            }
        }
        let mut gone: Vec<PodIdentity> = self.cache.identities().filter(|id| !present.contains(*id)).cloned().collect();
        gone.sort_unstable();
        for id in &gone {
            self.cache.remove(id);
        }
        out.evicted = gone;
        out
    }
}
