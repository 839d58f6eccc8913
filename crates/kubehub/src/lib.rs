//! Phasewatch kubehub: client construction, Pod list+watch source and the
//! Kubernetes Event recorder sink.

#![forbid(unsafe_code)]

use std::path::Path;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::ErrorResponse,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use metrics::counter;
use phasewatch_core::{
    EventKind, EventStream, NotifyError, Notifier, PodIdentity, PodPhase, PodState, RawEvent, ResourceSource, Snapshot,
    SourceError, SourceEvent, TransitionEvent, VersionToken,
};
use tracing::{debug, info, warn};

/// Longest server-side watch we ask for; the API server rejects anything >= 295s.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;
const LIST_PAGE_SIZE: u32 = 500;

/// Build a client from an explicit kubeconfig, or infer one (in-cluster first, then `~/.kube/config`).
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client, SourceError> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .map_err(|e| SourceError::Config(format!("reading kubeconfig {}: {}", path.display(), e)))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| SourceError::Config(format!("loading kubeconfig {}: {}", path.display(), e)))?;
            Client::try_from(cfg).map_err(|e| SourceError::Config(format!("creating client: {}", e)))
        }
        None => Client::try_default()
            .await
            .map_err(|e| SourceError::Config(format!("inferring kube config: {}", e))),
    }
}

/// Map an API status to the watch loop's error taxonomy.
pub fn classify_response(resp: &ErrorResponse) -> SourceError {
    match resp.code {
        410 => SourceError::ResumeTokenExpired,
        401 | 403 => SourceError::Auth(format!("{} {}: {}", resp.code, resp.reason, resp.message)),
        _ => SourceError::Transient(format!("{} {}: {}", resp.code, resp.reason, resp.message)),
    }
}

pub fn classify(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => classify_response(&resp),
        kube::Error::Auth(e) => SourceError::Auth(e.to_string()),
        kube::Error::InferConfig(e) => SourceError::Config(e.to_string()),
        other => SourceError::Transient(other.to_string()),
    }
}

fn malformed(what: &str, pod: &Pod) -> SourceError {
    let ns = pod.metadata.namespace.as_deref().unwrap_or("?");
    let name = pod.metadata.name.as_deref().unwrap_or("?");
    SourceError::Malformed(format!("{}/{}: {}", ns, name, what))
}

fn identity_of(pod: &Pod) -> Result<(PodIdentity, VersionToken), SourceError> {
    let name = pod.metadata.name.as_deref().ok_or_else(|| malformed("missing metadata.name", pod))?;
    let namespace = pod.metadata.namespace.as_deref().ok_or_else(|| malformed("missing metadata.namespace", pod))?;
    let version = pod
        .metadata
        .resource_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| malformed("missing metadata.resourceVersion", pod))?;
    Ok((PodIdentity::new(namespace, name), VersionToken::new(version)))
}

fn phase_of(pod: &Pod) -> Result<PodPhase, SourceError> {
    let raw = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .ok_or_else(|| malformed("missing status.phase", pod))?;
    raw.parse::<PodPhase>().map_err(|e| malformed(&e.to_string(), pod))
}

/// Decode a listed Pod.
pub fn decode_state(pod: &Pod) -> Result<PodState, SourceError> {
    let (identity, version) = identity_of(pod)?;
    let phase = phase_of(pod)?;
    Ok(PodState { identity, phase, version })
}

/// Decode a watched Pod. Deletions do not need a phase.
pub fn decode_event(kind: EventKind, pod: &Pod) -> Result<RawEvent, SourceError> {
    let (identity, version) = identity_of(pod)?;
    let phase = match (kind, phase_of(pod)) {
        (_, Ok(p)) => p,
        (EventKind::Deleted, Err(_)) => PodPhase::Unknown,
        (_, Err(e)) => return Err(e),
    };
    Ok(RawEvent { kind, identity, phase, version })
}

pub fn source_event(ev: WatchEvent<Pod>) -> Result<SourceEvent, SourceError> {
    match ev {
        WatchEvent::Added(p) => decode_event(EventKind::Created, &p).map(SourceEvent::Pod),
        WatchEvent::Modified(p) => decode_event(EventKind::Updated, &p).map(SourceEvent::Pod),
        WatchEvent::Deleted(p) => decode_event(EventKind::Deleted, &p).map(SourceEvent::Pod),
        WatchEvent::Bookmark(b) => Ok(SourceEvent::Bookmark(VersionToken::new(b.metadata.resource_version))),
        WatchEvent::Error(resp) => Err(classify_response(&resp)),
    }
}

/// List+watch over `v1/Pod`, cluster-wide or in one namespace.
#[derive(Clone)]
pub struct KubePodSource {
    api: Api<Pod>,
    scope: String,
    label_selector: Option<String>,
    watch_timeout_secs: u32,
}

impl KubePodSource {
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let watch_timeout_secs = std::env::var("PHASEWATCH_WATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(MAX_WATCH_TIMEOUT_SECS)
            .clamp(1, MAX_WATCH_TIMEOUT_SECS);
        Self { api, scope: namespace.unwrap_or("(all)").to_string(), label_selector: None, watch_timeout_secs }
    }

    pub fn with_label_selector(mut self, selector: Option<String>) -> Self {
        self.label_selector = selector.filter(|s| !s.is_empty());
        self
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, MAX_WATCH_TIMEOUT_SECS);
        self
    }

    fn watch_params(&self) -> WatchParams {
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        match &self.label_selector {
            Some(sel) => wp.labels(sel),
            None => wp,
        }
    }

    fn list_params(&self) -> ListParams {
        let lp = ListParams::default().limit(LIST_PAGE_SIZE);
        match &self.label_selector {
            Some(sel) => lp.labels(sel),
            None => lp,
        }
    }
}

impl std::fmt::Debug for KubePodSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePodSource")
            .field("scope", &self.scope)
            .field("label_selector", &self.label_selector)
            .field("watch_timeout_secs", &self.watch_timeout_secs)
            .finish()
    }
}

#[async_trait::async_trait]
impl ResourceSource for KubePodSource {
    async fn open_stream(&self, resume: Option<&VersionToken>) -> Result<EventStream, SourceError> {
        // "0" lets the server start from any recent state, replaying current pods as Added
        let version = resume.map(|v| v.as_str()).unwrap_or("0");
        debug!(scope = %self.scope, version, "opening pod watch");
        let stream = self.api.watch(&self.watch_params(), version).await.map_err(classify)?;
        Ok(stream
            .map(|item| match item {
                Ok(ev) => source_event(ev),
                Err(e) => Err(classify(e)),
            })
            .boxed())
    }

    async fn list_current(&self) -> Result<Snapshot, SourceError> {
        let mut lp = self.list_params();
        let mut items = Vec::new();
        let mut skipped = 0usize;
        let version = loop {
            let page = self.api.list(&lp).await.map_err(classify)?;
            for pod in &page.items {
                match decode_state(pod) {
                    Ok(s) => items.push(s),
                    Err(e) => {
                        skipped += 1;
                        warn!(scope = %self.scope, error = %e, "skipping malformed pod in listing");
                    }
                }
            }
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => lp = lp.continue_token(&token),
                None => break page.metadata.resource_version.unwrap_or_default(),
            }
        };
        info!(scope = %self.scope, pods = items.len(), skipped, version = %version, "listed pods");
        Ok(Snapshot { items, version: VersionToken::new(version) })
    }
}

/// Records each transition as a `Normal` Event on the Pod.
#[derive(Clone)]
pub struct EventRecorderNotifier {
    client: Client,
    reporter: Reporter,
}

impl EventRecorderNotifier {
    pub fn new(client: Client, controller: impl Into<String>, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: controller.into(), instance } }
    }
}

fn pod_reference(identity: &PodIdentity) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: Some(identity.name.clone()),
        namespace: Some(identity.namespace.clone()),
        ..Default::default()
    }
}

fn phase_event(t: &TransitionEvent) -> Event {
    Event {
        type_: EventType::Normal,
        reason: t.new_phase.to_string(),
        note: Some(t.message()),
        action: "PhaseChanged".to_string(),
        secondary: None,
    }
}

#[async_trait::async_trait]
impl Notifier for EventRecorderNotifier {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), pod_reference(&event.identity));
        recorder
            .publish(phase_event(event))
            .await
            .map_err(|e| NotifyError(format!("publishing event for {}: {}", event.identity, e)))?;
        counter!("phasewatch_events_published_total", 1);
        Ok(())
    }
}
