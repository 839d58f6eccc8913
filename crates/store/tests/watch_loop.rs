#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, StreamExt};
use phasewatch_core::{
    EventKind, EventStream, ModuloNsPlanner, NotifyError, Notifier, PodIdentity, PodPhase, PodState, RawEvent,
    ResourceSource, ShardPlanner, Snapshot, SourceError, SourceEvent, TransitionEvent, VersionToken,
};
use phasewatch_store::{ShardedSource, WatchConfig, WatchError, WatchLoop};
use tokio_util::sync::CancellationToken;

type Item = Result<SourceEvent, SourceError>;

enum Epoch {
    Open { items: Vec<Item>, hang: bool },
    OpenFails(SourceError),
}

struct Release(Arc<AtomicUsize>);

impl Drop for Release {
    fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

/// Scripted source. Once the script runs out it cancels `done` and fails the open,
/// which ends the loop from its backoff wait.
struct Script {
    epochs: Mutex<VecDeque<Epoch>>,
    lists: Mutex<VecDeque<Result<Snapshot, SourceError>>>,
    resumes: Mutex<Vec<Option<String>>>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
    done: CancellationToken,
}

impl Script {
    fn new(epochs: Vec<Epoch>) -> Arc<Self> {
        Self::with_lists(epochs, Vec::new())
    }

    fn with_lists(epochs: Vec<Epoch>, lists: Vec<Result<Snapshot, SourceError>>) -> Arc<Self> {
        Arc::new(Self {
            epochs: Mutex::new(epochs.into()),
            lists: Mutex::new(lists.into()),
            resumes: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            done: CancellationToken::new(),
        })
    }

    fn resumes(&self) -> Vec<Option<String>> { self.resumes.lock().unwrap().clone() }

    fn guarded(&self, items: Vec<Item>, hang: bool) -> EventStream {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let guard = Release(Arc::clone(&self.released));
        let tail = if hang { stream::pending::<Item>().boxed() } else { stream::empty::<Item>().boxed() };
        stream::iter(items)
            .chain(tail)
            .map(move |item| {
                let _keep = &guard;
                item
            })
            .boxed()
    }
}

#[async_trait::async_trait]
impl ResourceSource for Script {
    async fn open_stream(&self, resume: Option<&VersionToken>) -> Result<EventStream, SourceError> {
        self.resumes.lock().unwrap().push(resume.map(|v| v.as_str().to_string()));
        let next = self.epochs.lock().unwrap().pop_front();
        match next {
            Some(Epoch::Open { items, hang }) => Ok(self.guarded(items, hang)),
            Some(Epoch::OpenFails(e)) => Err(e),
            None => {
                self.done.cancel();
                Err(SourceError::Transient("script exhausted".into()))
            }
        }
    }

    async fn list_current(&self) -> Result<Snapshot, SourceError> {
        self.lists
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::Transient("no listing scripted".into())))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<TransitionEvent>>,
    fail: bool,
}

impl Recorder {
    fn seen(&self) -> Vec<(String, Option<PodPhase>, PodPhase)> {
        self.events.lock().unwrap().iter().map(|t| (t.identity.to_string(), t.old_phase, t.new_phase)).collect()
    }
}

#[async_trait::async_trait]
impl Notifier for Recorder {
    async fn notify(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail { Err(NotifyError("sink unavailable".into())) } else { Ok(()) }
    }
}

fn cfg() -> WatchConfig {
    WatchConfig {
        backoff_initial: Duration::from_millis(100),
        backoff_max: Duration::from_secs(1),
        backoff_jitter: 0.0,
        observe_created: false,
        cache_capacity: None,
    }
}

fn pod_event(kind: EventKind, pod: &str, phase: PodPhase, v: &str) -> Item {
    let (ns, name) = pod.split_once('/').unwrap();
    Ok(SourceEvent::Pod(RawEvent { kind, identity: PodIdentity::new(ns, name), phase, version: VersionToken::new(v) }))
}

fn upd(pod: &str, phase: PodPhase, v: &str) -> Item { pod_event(EventKind::Updated, pod, phase, v) }

fn open(items: Vec<Item>) -> Epoch { Epoch::Open { items, hang: false } }

fn snapshot(items: &[(&str, PodPhase)], version: &str) -> Snapshot {
    let items = items
        .iter()
        .map(|(pod, phase)| {
            let (ns, name) = pod.split_once('/').unwrap();
            PodState { identity: PodIdentity::new(ns, name), phase: *phase, version: VersionToken::new(version) }
        })
        .collect();
    Snapshot { items, version: VersionToken::new(version) }
}

fn s(v: &str) -> Option<String> { Some(v.to_string()) }

#[tokio::test(start_paused = true)]
async fn emits_one_transition_per_phase_change() {
    let src = Script::new(vec![open(vec![
        upd("ns1/p1", PodPhase::Pending, "1"),
        upd("ns1/p1", PodPhase::Pending, "2"),
        upd("ns1/p1", PodPhase::Running, "3"),
        upd("ns1/p1", PodPhase::Succeeded, "4"),
    ])]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen(), vec![
        ("ns1/p1".to_string(), None, PodPhase::Pending),
        ("ns1/p1".to_string(), Some(PodPhase::Pending), PodPhase::Running),
        ("ns1/p1".to_string(), Some(PodPhase::Running), PodPhase::Succeeded),
    ]);
    assert_eq!(lp.stats().transitions, 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_from_last_version_without_duplicates() {
    let src = Script::new(vec![
        open(vec![
            upd("ns/p1", PodPhase::Pending, "1"),
            upd("ns/p1", PodPhase::Running, "3"),
            upd("ns/p2", PodPhase::Pending, "5"),
        ]),
        // server replays part of the history after reconnect
        open(vec![
            upd("ns/p1", PodPhase::Running, "3"),
            upd("ns/p2", PodPhase::Pending, "5"),
            upd("ns/p1", PodPhase::Succeeded, "6"),
        ]),
    ]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(src.resumes(), vec![None, s("5"), s("6")]);
    assert_eq!(rec.seen(), vec![
        ("ns/p1".to_string(), None, PodPhase::Pending),
        ("ns/p1".to_string(), Some(PodPhase::Pending), PodPhase::Running),
        ("ns/p2".to_string(), None, PodPhase::Pending),
        ("ns/p1".to_string(), Some(PodPhase::Running), PodPhase::Succeeded),
    ]);
    assert_eq!(lp.resume_token(), Some(&VersionToken::new("6")));
}

#[tokio::test(start_paused = true)]
async fn bookmarks_advance_resume_token() {
    let src = Script::new(vec![open(vec![
        upd("ns/p", PodPhase::Running, "10"),
        Ok(SourceEvent::Bookmark(VersionToken::new("42"))),
    ])]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();
    assert_eq!(src.resumes(), vec![None, s("42")]);
    assert_eq!(rec.seen().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_resume_token_triggers_full_resync() {
    let src = Script::with_lists(
        vec![
            open(vec![
                upd("ns/A", PodPhase::Running, "1"),
                upd("ns/B", PodPhase::Pending, "2"),
                Err(SourceError::ResumeTokenExpired),
            ]),
            open(Vec::new()),
        ],
        vec![Ok(snapshot(&[("ns/A", PodPhase::Succeeded), ("ns/C", PodPhase::Pending)], "20"))],
    );
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen(), vec![
        ("ns/A".to_string(), None, PodPhase::Running),
        ("ns/B".to_string(), None, PodPhase::Pending),
        ("ns/A".to_string(), Some(PodPhase::Running), PodPhase::Succeeded),
        ("ns/C".to_string(), None, PodPhase::Pending),
    ]);
    let b = PodIdentity::new("ns", "B");
    assert_eq!(lp.cache().get(&b), None);
    assert_eq!(lp.cache().len(), 2);
    // streaming resumes from the listing's version
    assert_eq!(src.resumes(), vec![None, s("20"), s("20")]);
    assert_eq!(lp.stats().resyncs, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_on_open_resyncs_and_failed_list_is_retried() {
    let src = Script::with_lists(
        vec![
            open(vec![upd("ns/A", PodPhase::Running, "1")]),
            Epoch::OpenFails(SourceError::ResumeTokenExpired),
            open(Vec::new()),
        ],
        vec![
            Err(SourceError::Transient("list timed out".into())),
            Ok(snapshot(&[("ns/A", PodPhase::Running)], "30")),
        ],
    );
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen().len(), 1, "identical snapshot must not re-announce A");
    assert_eq!(lp.stats().resyncs, 1);
    assert_eq!(src.resumes(), vec![None, s("1"), s("30"), s("30")]);
}

#[tokio::test(start_paused = true)]
async fn listing_version_that_keeps_expiring_is_relisted_with_backoff() {
    let epochs = (0..5).map(|_| Epoch::OpenFails(SourceError::ResumeTokenExpired)).collect();
    let lists = (0..5).map(|i| Ok(snapshot(&[("ns/A", PodPhase::Running)], &format!("{}", 100 + i)))).collect();
    let src = Script::with_lists(epochs, lists);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());

    let t0 = tokio::time::Instant::now();
    lp.run(src.done.clone()).await.unwrap();
    let elapsed = t0.elapsed();

    assert_eq!(lp.stats().resyncs, 5);
    assert_eq!(src.resumes(), vec![None, s("100"), s("101"), s("102"), s("103"), s("104")]);
    // first expiry relists at once; each expired listing version then waits 100 + 200 + 400 + 800
    assert!(elapsed >= Duration::from_millis(1_500), "elapsed {:?}", elapsed);
    assert_eq!(rec.seen().len(), 1, "relisting the same state must stay silent");
}

#[tokio::test(start_paused = true)]
async fn mid_stream_failure_backs_off_and_resumes_from_last_version() {
    let src = Script::new(vec![
        open(vec![
            upd("ns/p", PodPhase::Pending, "1"),
            upd("ns/p", PodPhase::Running, "2"),
            Err(SourceError::Transient("connection reset".into())),
            upd("ns/p", PodPhase::Failed, "99"),
        ]),
        open(vec![upd("ns/p", PodPhase::Running, "2"), upd("ns/p", PodPhase::Succeeded, "3")]),
    ]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());

    let t0 = tokio::time::Instant::now();
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(src.resumes(), vec![None, s("2"), s("3")]);
    assert_eq!(rec.seen(), vec![
        ("ns/p".to_string(), None, PodPhase::Pending),
        ("ns/p".to_string(), Some(PodPhase::Pending), PodPhase::Running),
        ("ns/p".to_string(), Some(PodPhase::Running), PodPhase::Succeeded),
    ]);
    assert_eq!(lp.stats().epochs, 2);
    assert!(t0.elapsed() >= Duration::from_millis(100), "reconnect skipped backoff");
    assert_eq!(src.opened.load(Ordering::SeqCst), src.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn sharded_loop_advances_token_on_foreign_events_silently() {
    let planner: Arc<dyn ShardPlanner> = Arc::new(ModuloNsPlanner::new(2));
    let namespaces: Vec<String> = (0..64).map(|i| format!("ns-{i}")).collect();
    let mine = namespaces.iter().find(|ns| planner.plan(ns) == 0).unwrap().clone();
    let foreign = namespaces.iter().find(|ns| planner.plan(ns) == 1).unwrap().clone();

    let src = Script::new(vec![
        open(vec![
            upd(&format!("{mine}/p"), PodPhase::Running, "1"),
            upd(&format!("{foreign}/q"), PodPhase::Pending, "2"),
            upd(&format!("{foreign}/q"), PodPhase::Running, "3"),
        ]),
        open(Vec::new()),
    ]);
    let rec = Arc::new(Recorder::default());
    let sharded = ShardedSource::new(Arc::clone(&src), Arc::clone(&planner), 0);
    let mut lp = WatchLoop::new("t#0", sharded, Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen(), vec![(format!("{mine}/p"), None, PodPhase::Running)]);
    assert_eq!(lp.cache().len(), 1);
    assert_eq!(lp.cache().get(&PodIdentity::new(foreign.as_str(), "q")), None);
    assert_eq!(src.resumes(), vec![None, s("3"), s("3")]);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_and_keep_retrying() {
    let mut epochs: Vec<Epoch> = (0..5).map(|i| Epoch::OpenFails(SourceError::Transient(format!("refused #{i}")))).collect();
    epochs.push(open(vec![upd("ns/p", PodPhase::Running, "1")]));
    let src = Script::new(epochs);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());

    let t0 = tokio::time::Instant::now();
    lp.run(src.done.clone()).await.unwrap();
    let elapsed = t0.elapsed();

    assert_eq!(rec.seen().len(), 1);
    // 100 + 200 + 400 + 800 + 1000 (capped), then a reset delay after the good epoch
    assert!(elapsed >= Duration::from_millis(2_500), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn auth_error_is_fatal() {
    let src = Script::new(vec![
        open(vec![upd("ns/p", PodPhase::Running, "1"), Err(SourceError::Auth("401 Unauthorized".into()))]),
        open(vec![upd("ns/p", PodPhase::Succeeded, "2")]),
    ]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    let err = lp.run(src.done.clone()).await.unwrap_err();

    assert!(matches!(err, WatchError::Fatal(SourceError::Auth(_))), "{err}");
    assert_eq!(rec.seen().len(), 1);
    assert_eq!(src.opened.load(Ordering::SeqCst), src.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn config_error_on_open_is_fatal() {
    let src = Script::new(vec![Epoch::OpenFails(SourceError::Config("no cluster".into()))]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    assert!(matches!(lp.run(src.done.clone()).await, Err(WatchError::Fatal(SourceError::Config(_)))));
}

#[tokio::test(start_paused = true)]
async fn malformed_events_are_skipped() {
    let src = Script::new(vec![open(vec![
        upd("ns/p", PodPhase::Pending, "1"),
        Err(SourceError::Malformed("pod without status.phase".into())),
        upd("ns/p", PodPhase::Running, "3"),
    ])]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen().len(), 2);
    assert_eq!(lp.stats().malformed, 1);
    assert_eq!(lp.stats().epochs, 1, "a malformed item must not end the epoch");
}

#[tokio::test(start_paused = true)]
async fn delete_evicts_and_created_is_ignored_by_default() {
    let src = Script::new(vec![open(vec![
        pod_event(EventKind::Created, "ns/p", PodPhase::Pending, "1"),
        upd("ns/p", PodPhase::Running, "2"),
        pod_event(EventKind::Deleted, "ns/p", PodPhase::Running, "3"),
        upd("ns/p", PodPhase::Running, "4"),
    ])]);
    let rec = Arc::new(Recorder::default());
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen(), vec![
        ("ns/p".to_string(), None, PodPhase::Running),
        ("ns/p".to_string(), None, PodPhase::Running),
    ]);
}

#[tokio::test(start_paused = true)]
async fn created_counts_as_observation_when_enabled() {
    let src = Script::new(vec![open(vec![
        pod_event(EventKind::Created, "ns/p", PodPhase::Pending, "1"),
        upd("ns/p", PodPhase::Running, "2"),
    ])]);
    let rec = Arc::new(Recorder::default());
    let config = WatchConfig { observe_created: true, ..cfg() };
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &config);
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen(), vec![
        ("ns/p".to_string(), None, PodPhase::Pending),
        ("ns/p".to_string(), Some(PodPhase::Pending), PodPhase::Running),
    ]);
}

#[tokio::test(start_paused = true)]
async fn notifier_failures_are_counted_not_retried() {
    let src = Script::new(vec![open(vec![
        upd("ns/p", PodPhase::Pending, "1"),
        upd("ns/p", PodPhase::Running, "2"),
    ])]);
    let rec = Arc::new(Recorder { fail: true, ..Recorder::default() });
    let mut lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    lp.run(src.done.clone()).await.unwrap();

    assert_eq!(rec.seen().len(), 2);
    assert_eq!(lp.stats().notify_failures, 2);
    assert_eq!(lp.cache().get(&PodIdentity::new("ns", "p")), Some(PodPhase::Running));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_returns_promptly() {
    let src = Script::new(vec![open(Vec::new()), open(Vec::new())]);
    let rec = Arc::new(Recorder::default());
    let config = WatchConfig { backoff_initial: Duration::from_secs(3600), backoff_max: Duration::from_secs(7200), ..cfg() };
    let lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &config);
    let cancel = CancellationToken::new();
    let t0 = tokio::time::Instant::now();
    let handle = lp.spawn(cancel.clone());

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle).await.expect("loop did not stop").unwrap().unwrap();

    assert!(t0.elapsed() < Duration::from_secs(3600));
    assert_eq!(stats.epochs, 1);
    assert_eq!(src.resumes().len(), 1, "second epoch must not start after cancellation");
    assert_eq!(src.opened.load(Ordering::SeqCst), src.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn cancel_while_streaming_releases_stream() {
    let src = Script::new(vec![Epoch::Open { items: vec![upd("ns/p", PodPhase::Running, "1")], hang: true }]);
    let rec = Arc::new(Recorder::default());
    let lp = WatchLoop::new("t", Arc::clone(&src), Arc::clone(&rec), &cfg());
    let cancel = CancellationToken::new();
    let handle = lp.spawn(cancel.clone());

    while rec.seen().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle).await.expect("loop did not stop").unwrap().unwrap();

    assert_eq!(stats.transitions, 1);
    assert_eq!(src.opened.load(Ordering::SeqCst), 1);
    assert_eq!(src.released.load(Ordering::SeqCst), 1);
}
