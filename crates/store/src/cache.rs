use std::collections::VecDeque;

use phasewatch_core::{PodIdentity, PodPhase, VersionToken};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Last observation recorded for one Pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseCacheEntry {
    pub identity: PodIdentity,
    pub phase: PodPhase,
    pub last_seen_version: VersionToken,
    #[serde(skip)]
    seq: u64,
}

/// Identity -> last observed phase. One cache per watch loop.
///
/// Unbounded by default; entries leave on deletion or resync. With a capacity
/// the least recently updated or touched identity is evicted first once full.
#[derive(Debug, Default)]
pub struct PhaseCache {
    map: FxHashMap<PodIdentity, PhaseCacheEntry>,
    // use order for capacity eviction; stale (identity, seq) pairs are skipped lazily
    order: VecDeque<(PodIdentity, u64)>,
    cap: Option<usize>,
    next_seq: u64,
    evicted: u64,
}

impl PhaseCache {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(cap: usize) -> Self {
        Self { cap: Some(cap.max(1)), ..Self::default() }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Entries dropped to respect the capacity bound.
    pub fn evicted(&self) -> u64 { self.evicted }

    /// True iff there is no entry for `identity` or its phase differs from `phase`.
    pub fn changed(&self, identity: &PodIdentity, phase: PodPhase) -> bool {
        self.map.get(identity).map(|e| e.phase != phase).unwrap_or(true)
    }

    pub fn get(&self, identity: &PodIdentity) -> Option<PodPhase> {
        self.map.get(identity).map(|e| e.phase)
    }

    pub fn entry(&self, identity: &PodIdentity) -> Option<&PhaseCacheEntry> {
        self.map.get(identity)
    }

    /// Insert or overwrite the entry for `identity`.
    pub fn update(&mut self, identity: PodIdentity, phase: PodPhase, version: VersionToken) {
        let seq = self.bump_seq();
        if let Some(e) = self.map.get_mut(&identity) {
            e.phase = phase;
            e.last_seen_version = version;
            e.seq = seq;
            self.record_use(identity, seq);
            return;
        }
        if let Some(cap) = self.cap {
            while self.map.len() >= cap {
                if !self.evict_oldest() { break; }
            }
        }
        self.map.insert(identity.clone(), PhaseCacheEntry { identity: identity.clone(), phase, last_seen_version: version, seq });
        self.record_use(identity, seq);
    }

    /// Refresh the version of an existing entry. Returns false when absent.
    pub fn touch(&mut self, identity: &PodIdentity, version: VersionToken) -> bool {
        let seq = self.bump_seq();
        match self.map.get_mut(identity) {
            Some(e) => {
                e.last_seen_version = version;
                e.seq = seq;
                self.record_use(identity.clone(), seq);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, identity: &PodIdentity) -> Option<PhaseCacheEntry> {
        let removed = self.map.remove(identity);
        if self.map.is_empty() {
            self.order.clear();
        }
        removed
    }

    pub fn identities(&self) -> impl Iterator<Item = &PodIdentity> + '_ {
        self.map.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PhaseCacheEntry> + '_ {
        self.map.values()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn record_use(&mut self, identity: PodIdentity, seq: u64) {
        let Some(cap) = self.cap else { return };
        self.order.push_back((identity, seq));
        if self.order.len() > cap.saturating_mul(2) {
            let map = &self.map;
            self.order.retain(|(id, s)| map.get(id).map(|e| e.seq == *s).unwrap_or(false));
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((id, seq)) = self.order.pop_front() {
            let live = self.map.get(&id).map(|e| e.seq == seq).unwrap_or(false);
            if live {
                self.map.remove(&id);
                self.evicted += 1;
                return true;
            }
        }
        false
    }
}
