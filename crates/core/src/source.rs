//! Seams to the outside world: where events come from and where transitions go.

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::{Snapshot, SourceEvent, TransitionEvent, VersionToken};

/// Errors raised by a [`ResourceSource`], classified by how the watch loop reacts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Payload did not decode; the item is skipped and streaming continues.
    #[error("malformed event: {0}")]
    Malformed(String),
    /// Connection dropped, timeout, server hiccup; retried after backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The resume token fell out of the server's history window.
    #[error("resume token expired")]
    ResumeTokenExpired,
    #[error("auth: {0}")]
    Auth(String),
    #[error("config: {0}")]
    Config(String),
}

impl SourceError {
    /// Errors that cannot succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Auth(_) | SourceError::Config(_))
    }
}

pub type EventStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

/// Upstream list+watch feed.
///
/// Dropping the returned stream must release the server-side watch.
#[async_trait::async_trait]
pub trait ResourceSource: Send + Sync {
    /// Open a watch, resuming after `resume` when given.
    async fn open_stream(&self, resume: Option<&VersionToken>) -> Result<EventStream, SourceError>;

    /// List the full current state for resync.
    async fn list_current(&self) -> Result<Snapshot, SourceError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("notify failed: {0}")]
pub struct NotifyError(pub String);

/// Sink for detected transitions.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), NotifyError>;
}

#[async_trait::async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        (**self).notify(event).await
    }
}

#[async_trait::async_trait]
impl<T: ResourceSource + ?Sized> ResourceSource for Arc<T> {
    async fn open_stream(&self, resume: Option<&VersionToken>) -> Result<EventStream, SourceError> {
        (**self).open_stream(resume).await
    }

    async fn list_current(&self) -> Result<Snapshot, SourceError> {
        (**self).list_current().await
    }
}
