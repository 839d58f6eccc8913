use std::sync::Arc;

use phasewatch_core::{NotifyError, Notifier, TransitionEvent};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Structured `tracing` record at info level.
    Human,
    /// One JSON object per line on stdout.
    Json,
}

/// Reports transitions as log lines.
#[derive(Debug, Clone, Copy)]
pub struct LogNotifier {
    format: LogFormat,
}

impl LogNotifier {
    pub fn new(format: LogFormat) -> Self { Self { format } }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        match self.format {
            LogFormat::Human => {
                let old = event.old_phase.map(|p| p.as_str()).unwrap_or("-");
                info!(pod = %event.identity, old, new = %event.new_phase, at = %event.observed_at, "{}", event.message());
            }
            LogFormat::Json => {
                let line = serde_json::to_string(event).map_err(|e| NotifyError(e.to_string()))?;
                println!("{}", line);
            }
        }
        Ok(())
    }
}

/// Delivers each transition to every inner notifier, in order.
///
/// All sinks are attempted; the first failure is returned after the rest ran.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Fanout {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize { self.sinks.len() }
    pub fn is_empty(&self) -> bool { self.sinks.is_empty() }
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout").field("sinks", &self.sinks.len()).finish()
    }
}

#[async_trait::async_trait]
impl Notifier for Fanout {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event).await {
                warn!(pod = %event.identity, error = %e, "fanout sink failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
