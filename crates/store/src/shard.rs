use std::sync::Arc;

use futures::StreamExt;
use phasewatch_core::{EventStream, ResourceSource, ShardPlanner, Snapshot, SourceError, SourceEvent, VersionToken};

/// View of a shared source restricted to the namespaces one shard owns.
///
/// Foreign Pod events are turned into bookmarks so the shard's resume token
/// keeps moving even when none of its own Pods change.
pub struct ShardedSource<S> {
    inner: S,
    planner: Arc<dyn ShardPlanner>,
    shard: u16,
}

impl<S> ShardedSource<S> {
    pub fn new(inner: S, planner: Arc<dyn ShardPlanner>, shard: u16) -> Self {
        Self { inner, planner, shard }
    }

    pub fn shard(&self) -> u16 { self.shard }
}

#[async_trait::async_trait]
impl<S: ResourceSource> ResourceSource for ShardedSource<S> {
    async fn open_stream(&self, resume: Option<&VersionToken>) -> Result<EventStream, SourceError> {
        let stream = self.inner.open_stream(resume).await?;
        let planner = Arc::clone(&self.planner);
        let shard = self.shard;
        Ok(stream
            .map(move |item| match item {
                Ok(SourceEvent::Pod(raw)) if planner.plan(&raw.identity.namespace) != shard => Ok(SourceEvent::Bookmark(raw.version)),
                other => other,
            })
            .boxed())
    }

    async fn list_current(&self) -> Result<Snapshot, SourceError> {
        let mut snap = self.inner.list_current().await?;
        snap.items.retain(|s| self.planner.plan(&s.identity.namespace) == self.shard);
        Ok(snap)
    }
}
