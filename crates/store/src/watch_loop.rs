//! Reconnecting watch loop: source events in, deduplicated transitions out.
//!
//! Per epoch the loop is in one of three places: streaming from an open watch,
//! resyncing from a full listing, or sleeping in backoff. Transient failures
//! and normal closes lead to backoff; an expired resume token leads to resync;
//! auth/config failures end the loop. A token taken from a listing that
//! expires before any item arrives backs off before the next listing.

use futures::StreamExt;
use metrics::{counter, gauge};
use phasewatch_core::{EventKind, Notifier, ResourceSource, SourceError, SourceEvent, TransitionEvent, VersionToken};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::cache::PhaseCache;
use crate::config::WatchConfig;
use crate::detector::Detector;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The source reported an error that cannot succeed on retry (auth/config).
    #[error("fatal source error: {0}")]
    Fatal(#[from] SourceError),
}

/// Counters kept per loop, mostly for tests and the final log line.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LoopStats {
    pub epochs: u64,
    pub resyncs: u64,
    pub transitions: u64,
    pub malformed: u64,
    pub notify_failures: u64,
}

enum EpochEnd {
    Cancelled,
    Closed,
    Resynced,
    Failed(SourceError),
}

pub struct WatchLoop<S, N> {
    name: String,
    source: S,
    notifier: N,
    detector: Detector,
    backoff: Backoff,
    observe_created: bool,
    resume: Option<VersionToken>,
    needs_resync: bool,
    // resume token came from the last listing and no item has arrived since
    fresh_snapshot: bool,
    stats: LoopStats,
}

impl<S: ResourceSource, N: Notifier> WatchLoop<S, N> {
    pub fn new(name: impl Into<String>, source: S, notifier: N, config: &WatchConfig) -> Self {
        Self {
            name: name.into(),
            source,
            notifier,
            detector: Detector::new(config.cache()),
            backoff: config.backoff(),
            observe_created: config.observe_created,
            resume: None,
            needs_resync: false,
            fresh_snapshot: false,
            stats: LoopStats::default(),
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn cache(&self) -> &PhaseCache { self.detector.cache() }
    pub fn resume_token(&self) -> Option<&VersionToken> { self.resume.as_ref() }
    pub fn stats(&self) -> LoopStats { self.stats }

    /// Run until cancelled or until the source reports a fatal error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), WatchError> {
        info!(watch = %self.name, "watch loop started");
        loop {
            let end = if self.needs_resync {
                self.resync(&cancel).await
            } else {
                self.stream_epoch(&cancel).await
            };
            match end {
                EpochEnd::Cancelled => break,
                EpochEnd::Resynced => continue,
                EpochEnd::Closed => debug!(watch = %self.name, "watch stream closed"),
                EpochEnd::Failed(SourceError::ResumeTokenExpired) if !self.needs_resync => {
                    self.needs_resync = true;
                    if !self.fresh_snapshot {
                        warn!(watch = %self.name, resume = ?self.resume.as_ref().map(|v| v.as_str()), "resume token expired; falling back to full resync");
                        continue;
                    }
                    warn!(watch = %self.name, resume = ?self.resume.as_ref().map(|v| v.as_str()), "listing version expired before any event; backing off before relisting");
                }
                EpochEnd::Failed(e) if e.is_fatal() => {
                    error!(watch = %self.name, error = %e, "unrecoverable source error; stopping watch loop");
                    return Err(WatchError::Fatal(e));
                }
                EpochEnd::Failed(e) => warn!(watch = %self.name, error = %e, "watch epoch failed"),
            }

            let delay = self.backoff.next_delay();
            counter!("phasewatch_reconnects_total", 1);
            debug!(watch = %self.name, attempt = self.backoff.attempt(), delay_ms = delay.as_millis() as u64, "backing off before reconnect");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(watch = %self.name, stats = ?self.stats, "watch loop stopped");
        Ok(())
    }

    async fn stream_epoch(&mut self, cancel: &CancellationToken) -> EpochEnd {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return EpochEnd::Cancelled,
            r = self.source.open_stream(self.resume.as_ref()) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => return EpochEnd::Failed(e),
        };
        self.stats.epochs += 1;
        info!(watch = %self.name, resume = ?self.resume.as_ref().map(|v| v.as_str()), "watch stream opened");

        // `stream` is dropped on every return below, which stops the server-side watch.
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return EpochEnd::Cancelled,
                n = stream.next() => n,
            };
            match next {
                None => return EpochEnd::Closed,
                Some(Ok(ev)) => {
                    self.backoff.reset();
                    self.fresh_snapshot = false;
                    self.apply(ev).await;
                }
                Some(Err(SourceError::Malformed(reason))) => {
                    self.backoff.reset();
                    self.fresh_snapshot = false;
                    self.stats.malformed += 1;
                    counter!("phasewatch_malformed_events_total", 1);
                    warn!(watch = %self.name, reason = %reason, "skipping malformed event");
                }
                Some(Err(e)) => return EpochEnd::Failed(e),
            }
        }
    }

    async fn apply(&mut self, ev: SourceEvent) {
        let raw = match ev {
            SourceEvent::Bookmark(v) => {
                self.resume = Some(v);
                return;
            }
            SourceEvent::Pod(raw) => raw,
        };
        self.resume = Some(raw.version.clone());
        match raw.kind {
            EventKind::Deleted => {
                if self.detector.forget(&raw.identity) {
                    debug!(watch = %self.name, pod = %raw.identity, "pod deleted; cache entry evicted");
                }
            }
            EventKind::Created if !self.observe_created => {
                self.detector.touch(&raw.identity, raw.version);
            }
            EventKind::Created | EventKind::Updated => {
                if let Some(t) = self.detector.observe(raw.identity, raw.phase, raw.version) {
                    self.emit(t).await;
                }
            }
        }
        gauge!("phasewatch_cache_entries", self.detector.cache().len() as f64);
    }

    async fn resync(&mut self, cancel: &CancellationToken) -> EpochEnd {
        info!(watch = %self.name, cached = self.detector.cache().len(), "listing current pods for full resync");
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return EpochEnd::Cancelled,
            r = self.source.list_current() => r,
        };
        let snap = match listed {
            Ok(s) => s,
            Err(e) => return EpochEnd::Failed(e),
        };
        let listed_items = snap.items.len();
        let rec = self.detector.reconcile(snap.items);
        self.stats.resyncs += 1;
        counter!("phasewatch_resyncs_total", 1);
        info!(
            watch = %self.name,
            listed = listed_items,
            transitions = rec.transitions.len(),
            evicted = rec.evicted.len(),
            version = %snap.version,
            "resync reconciled"
        );
        for id in &rec.evicted {
            debug!(watch = %self.name, pod = %id, "evicted during resync");
        }
        for t in rec.transitions {
            self.emit(t).await;
        }
        gauge!("phasewatch_cache_entries", self.detector.cache().len() as f64);
        self.resume = if snap.version.as_str().is_empty() { None } else { Some(snap.version) };
        self.needs_resync = false;
        self.fresh_snapshot = true;
        EpochEnd::Resynced
    }

    async fn emit(&mut self, t: TransitionEvent) {
        self.stats.transitions += 1;
        counter!("phasewatch_transitions_total", 1, "phase" => t.new_phase.as_str());
        debug!(watch = %self.name, pod = %t.identity, old = ?t.old_phase, new = %t.new_phase, "phase transition");
        if let Err(e) = self.notifier.notify(&t).await {
            self.stats.notify_failures += 1;
            counter!("phasewatch_notify_failures_total", 1);
            warn!(watch = %self.name, pod = %t.identity, error = %e, "notifier failed; transition dropped");
        }
    }
}

impl<S, N> WatchLoop<S, N>
where
    S: ResourceSource + 'static,
    N: Notifier + 'static,
{
    /// Run the loop on its own task; the handle yields the final stats.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<Result<LoopStats, WatchError>> {
        tokio::spawn(async move {
            self.run(cancel).await?;
            Ok(self.stats)
        })
    }
}
