//! Phasewatch store: per-loop phase cache, transition detector and the
//! reconnecting watch loop that drives them.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod cache;
pub mod config;
pub mod detector;
pub mod notify;
pub mod shard;
pub mod watch_loop;

pub use backoff::Backoff;
pub use cache::{PhaseCache, PhaseCacheEntry};
pub use config::WatchConfig;
pub use detector::{Detector, Reconciliation};
pub use notify::{Fanout, LogFormat, LogNotifier};
pub use shard::ShardedSource;
pub use watch_loop::{LoopStats, WatchError, WatchLoop};
