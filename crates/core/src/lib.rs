//! Phasewatch core types: pod identity, phases, raw source events and transitions.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod source;

pub use source::{EventStream, NotifyError, Notifier, ResourceSource, SourceError};

/// Namespace-qualified Pod name. Stable for the lifetime of a Pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Coarse lifecycle state of a Pod as reported in `status.phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized pod phase: {0:?}")]
pub struct UnknownPhase(pub String);

impl FromStr for PodPhase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(PodPhase::Pending),
            "Running" => Ok(PodPhase::Running),
            "Succeeded" => Ok(PodPhase::Succeeded),
            "Failed" => Ok(PodPhase::Failed),
            "Unknown" => Ok(PodPhase::Unknown),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

/// Opaque change-sequence marker (`resourceVersion`). Only stored and handed
/// back to the source; never ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// One decoded Pod notification from the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub identity: PodIdentity,
    pub phase: PodPhase,
    pub version: VersionToken,
}

/// Item yielded by an open watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Pod(RawEvent),
    /// Resume point without an object attached (watch bookmark).
    Bookmark(VersionToken),
}

/// One element of a full current-state listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodState {
    pub identity: PodIdentity,
    pub phase: PodPhase,
    pub version: VersionToken,
}

/// Full listing used for resync. `version` is where streaming resumes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub items: Vec<PodState>,
    pub version: VersionToken,
}

/// A detected phase change. `old_phase` is `None` on first sight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionEvent {
    pub identity: PodIdentity,
    pub old_phase: Option<PodPhase>,
    pub new_phase: PodPhase,
    pub observed_at: DateTime<Utc>,
}

impl TransitionEvent {
    /// Operator-facing note, also used as the Kubernetes Event message.
    pub fn message(&self) -> String {
        match self.old_phase {
            Some(old) => format!("Pod phase changed from {} to {}", old, self.new_phase),
            None => format!("Pod phase changed to {}", self.new_phase),
        }
    }
}

pub mod prelude {
    pub use super::{
        EventKind, PodIdentity, PodPhase, PodState, RawEvent, Snapshot, SourceEvent, TransitionEvent, VersionToken,
    };
    pub use super::{ModuloNsPlanner, ShardPlanner};
    pub use super::source::{EventStream, NotifyError, Notifier, ResourceSource, SourceError};
}

// ---- sharding primitives ----

/// Maps a namespace onto one of several independent watch loops.
/// Every identity maps to exactly one shard, so per-identity ordering holds.
pub trait ShardPlanner: Send + Sync {
    fn shards(&self) -> u16;
    fn plan(&self, namespace: &str) -> u16;
}

/// Default planner: modulo bucketing by namespace using a simple FNV-1a hash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModuloNsPlanner { buckets: u16 }

impl ModuloNsPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.max(1).min(u16::MAX as usize) as u16 }
    }
}

impl ShardPlanner for ModuloNsPlanner {
    fn shards(&self) -> u16 { self.buckets }

    fn plan(&self, namespace: &str) -> u16 {
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        for b in namespace.as_bytes() { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
        if self.buckets <= 1 { 0 } else { (h % self.buckets as u64) as u16 }
    }
}
