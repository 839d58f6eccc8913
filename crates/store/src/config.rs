use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::cache::PhaseCache;

/// Tunables for one watch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Fraction of the current base delay added as random jitter (0.0..=1.0).
    pub backoff_jitter: f64,
    /// Treat `Created` events as phase observations instead of ignoring them.
    pub observe_created: bool,
    /// Bound on cached identities; unbounded when `None`.
    pub cache_capacity: Option<usize>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: 0.2,
            observe_created: false,
            cache_capacity: None,
        }
    }
}

fn parse_jitter(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|j| j.is_finite())
}

impl WatchConfig {
    /// Defaults overridden by `PHASEWATCH_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let backoff_initial = std::env::var("PHASEWATCH_BACKOFF_INITIAL_MS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.backoff_initial);
        let backoff_max = std::env::var("PHASEWATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.backoff_max);
        let backoff_jitter = std::env::var("PHASEWATCH_BACKOFF_JITTER").ok().and_then(|s| parse_jitter(&s)).unwrap_or(d.backoff_jitter);
        let cache_capacity = std::env::var("PHASEWATCH_CACHE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).filter(|c| *c > 0);
        Self { backoff_initial, backoff_max, backoff_jitter, observe_created: d.observe_created, cache_capacity }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max, self.backoff_jitter)
    }

    pub(crate) fn cache(&self) -> PhaseCache {
        match self.cache_capacity {
            Some(cap) => PhaseCache::with_capacity(cap),
            None => PhaseCache::new(),
        }
    }
}
