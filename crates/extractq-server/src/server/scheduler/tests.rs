use super::*;
use crate::server::cache::ChunkCache;
use crate::server::gateway::{GatewayError, SlotStatus, UpstreamGateway};
use crate::server::notify::Notifier;
use crate::server::storage::StorageGuard;
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use extractq_core::{ChunkProgress, ChunkSpec, PlaceRequest, ServerMessage};
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use serde_json::{Value, json};
use std::collections::VecDeque;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeGateway {
    statuses: Mutex<VecDeque<Result<SlotStatus, GatewayError>>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeGateway {
    fn with_statuses(statuses: Vec<Result<SlotStatus, GatewayError>>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            ..Self::default()
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    fn status_calls_left(&self) -> usize {
        self.statuses.lock().len()
    }
}

#[async_trait]
impl UpstreamGateway for FakeGateway {
    async fn status(&self) -> Result<SlotStatus, GatewayError> {
        self.statuses.lock().pop_front().unwrap_or_else(|| {
            Ok(SlotStatus {
                rate_limit: 2,
                available: 2,
                slots: Vec::new(),
            })
        })
    }

    async fn fetch(&self, query: &str) -> Result<Bytes, GatewayError> {
        if query == "boom" {
            panic!("upstream parser exploded");
        }
        self.fetched.lock().push(query.to_string());
        Ok(Bytes::from(format!("<osm query={query:?}/>")))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, _body: &str) {
        self.subjects.lock().push(subject.to_string());
    }
}

#[derive(Default)]
struct CountingStorage {
    checks: AtomicUsize,
}

#[async_trait]
impl StorageGuard for CountingStorage {
    async fn check_free_space(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    cache: ChunkCache,
    gateway: Arc<FakeGateway>,
    notifier: Arc<RecordingNotifier>,
    storage: Arc<CountingStorage>,
    ctx: WorkerContext,
}

impl Harness {
    async fn new(gateway: FakeGateway) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).await.unwrap();
        let gateway = Arc::new(gateway);
        let notifier = Arc::new(RecordingNotifier::default());
        let storage = Arc::new(CountingStorage::default());
        let ctx = WorkerContext {
            gateway: gateway.clone(),
            cache: cache.clone(),
            notifier: notifier.clone(),
            storage: storage.clone(),
            max_wait: Duration::from_secs(60),
        };
        Self {
            _dir: dir,
            cache,
            gateway,
            notifier,
            storage,
            ctx,
        }
    }
}

fn addr() -> std::net::SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn place(area: f64) -> Value {
    json!({"name": format!("area {area}"), "area": area})
}

fn job(area: f64, chunks: Vec<ChunkSpec>) -> (Job, mpsc::UnboundedReceiver<JobEvent>) {
    let (output, rx) = output_channel();
    let request = PlaceRequest {
        place: place(area),
        chunks,
    };
    (Job::new(request, output, addr()), rx)
}

fn chunk(oql: &str, filename: &str) -> ChunkSpec {
    ChunkSpec::new(Some(oql.to_string()), filename)
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = event == JobEvent::Finished;
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn progress(num: usize, filename: &str, area: f64) -> ChunkProgress {
    ChunkProgress {
        num,
        filename: filename.to_string(),
        place: place(area),
    }
}

#[test]
fn queue_pops_smallest_area_first_then_fifo() {
    let queue = JobQueue::new();
    let mut ids = Vec::new();
    for area in [10.0, 2.0, 5.0, 2.0, 0.0] {
        let (job, _rx) = job(area, Vec::new());
        ids.push(queue.push(job).unwrap());
    }
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(queue.pending(), 5);

    let order: Vec<_> = std::iter::from_fn(|| queue.try_pop())
        .map(|job| (job.priority, job.id))
        .collect();
    assert_eq!(
        order,
        vec![(0.0, 4), (2.0, 1), (2.0, 3), (5.0, 2), (10.0, 0)]
    );
    assert_eq!(queue.pending(), 0);
}

#[test]
fn unparsable_area_sorts_as_zero() {
    let queue = JobQueue::new();
    let (output, _rx) = output_channel();
    let request = PlaceRequest {
        place: json!({"area": "huge"}),
        chunks: Vec::new(),
    };
    queue.push(Job::new(request, output, addr())).unwrap();
    let (small, _rx2) = job(0.5, Vec::new());
    queue.push(small).unwrap();

    assert_eq!(queue.try_pop().unwrap().priority, 0.0);
    assert_eq!(queue.try_pop().unwrap().priority, 0.5);
}

#[tokio::test]
async fn worker_processes_jobs_in_priority_order() {
    let h = Harness::new(FakeGateway::default()).await;
    let queue = Arc::new(JobQueue::new());

    let mut receivers = Vec::new();
    for (area, query) in [(10.0, "q10"), (2.0, "q2a"), (5.0, "q5"), (2.0, "q2b")] {
        let (job, rx) = job(area, vec![chunk(query, &format!("{query}.xml"))]);
        queue.push(job).unwrap();
        receivers.push(rx);
    }

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(worker_loop(queue.clone(), h.ctx.clone(), shutdown.clone()));
    for rx in &mut receivers {
        collect(rx).await;
    }
    shutdown.cancel();
    worker.await.unwrap();

    assert_eq!(h.gateway.fetched(), vec!["q2a", "q2b", "q5", "q10"]);
}

#[tokio::test]
async fn reports_every_chunk_then_finishes() {
    let h = Harness::new(FakeGateway::default()).await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (job, mut rx) = job(
        3.0,
        vec![chunk("a", "r1_0.xml"), chunk("b", "r1_1.xml"), chunk("c", "r1_2.xml")],
    );
    scheduler.submit(job);
    let events = collect(&mut rx).await;

    let mut expected = Vec::new();
    for (num, name) in ["r1_0.xml", "r1_1.xml", "r1_2.xml"].into_iter().enumerate() {
        expected.push(JobEvent::Message(ServerMessage::RunQuery(progress(num, name, 3.0))));
        expected.push(JobEvent::Message(ServerMessage::Chunk(progress(num, name, 3.0))));
    }
    expected.push(JobEvent::Finished);
    assert_eq!(events, expected);

    for name in ["r1_0.xml", "r1_1.xml", "r1_2.xml"] {
        assert!(h.cache.exists(name).await.unwrap());
    }
    // Before the wait and after the write, per fetched chunk.
    assert_eq!(h.storage.checks.load(Ordering::Relaxed), 6);

    shutdown.cancel();
    worker.await.unwrap();
    assert_eq!(scheduler.queued(), 0);
}

#[tokio::test]
async fn cached_chunks_are_not_fetched_again() {
    let h = Harness::new(FakeGateway::default()).await;
    h.cache
        .write("r7_0.xml", Bytes::from_static(b"<osm/>"))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (first, mut rx) = job(1.0, vec![chunk("a", "r7_0.xml"), chunk("b", "r7_1.xml")]);
    scheduler.submit(first);
    let events = collect(&mut rx).await;
    let run_queries = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Message(ServerMessage::RunQuery(_))))
        .count();
    assert_eq!(run_queries, 1);
    assert_eq!(h.gateway.fetched(), vec!["b"]);

    let (second, mut rx) = job(1.0, vec![chunk("a", "r7_0.xml"), chunk("b", "r7_1.xml")]);
    scheduler.submit(second);
    let events = collect(&mut rx).await;
    assert_eq!(
        events,
        vec![
            JobEvent::Message(ServerMessage::Chunk(progress(0, "r7_0.xml", 1.0))),
            JobEvent::Message(ServerMessage::Chunk(progress(1, "r7_1.xml", 1.0))),
            JobEvent::Finished,
        ]
    );
    assert_eq!(h.gateway.fetched(), vec!["b"]);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn chunks_without_query_are_reported_only() {
    let h = Harness::new(FakeGateway::default()).await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (job, mut rx) = job(
        4.0,
        vec![
            ChunkSpec::new(None, "r2_0.xml"),
            ChunkSpec::new(Some(String::new()), "r2_1.xml"),
        ],
    );
    scheduler.submit(job);
    let events = collect(&mut rx).await;

    assert_eq!(
        events,
        vec![
            JobEvent::Message(ServerMessage::Chunk(progress(0, "r2_0.xml", 4.0))),
            JobEvent::Message(ServerMessage::Chunk(progress(1, "r2_1.xml", 4.0))),
            JobEvent::Finished,
        ]
    );
    assert!(h.gateway.fetched().is_empty());
    assert!(!h.cache.exists("r2_0.xml").await.unwrap());

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn upstream_outage_fails_job_once_and_alerts() {
    let h = Harness::new(FakeGateway::with_statuses(vec![Err(
        GatewayError::Unavailable {
            url: "http://overpass.test/api/status".to_string(),
            status: 502,
            body: "bad gateway".to_string(),
        },
    )]))
    .await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (job, mut rx) = job(1.0, vec![chunk("a", "r3_0.xml"), chunk("b", "r3_1.xml")]);
    scheduler.submit(job);
    let events = collect(&mut rx).await;

    assert_eq!(
        events,
        vec![
            JobEvent::Message(ServerMessage::error("Can't access overpass API")),
            JobEvent::Finished,
        ]
    );
    assert!(!h.cache.exists("r3_0.xml").await.unwrap());
    assert!(!h.cache.exists("r3_1.xml").await.unwrap());
    assert!(h.gateway.fetched().is_empty());
    assert_eq!(*h.notifier.subjects.lock(), vec!["Overpass API unavailable"]);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn waits_and_rechecks_until_a_slot_frees() {
    let busy = |secs: Vec<u64>| {
        Ok(SlotStatus {
            rate_limit: 2,
            available: 0,
            slots: secs,
        })
    };
    let h = Harness::new(FakeGateway::with_statuses(vec![
        busy(vec![7, 31]),
        busy(vec![500]),
    ]))
    .await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let started = tokio::time::Instant::now();
    let (job, mut rx) = job(1.0, vec![chunk("a", "r4_0.xml")]);
    scheduler.submit(job);
    let events = collect(&mut rx).await;

    assert_eq!(
        events,
        vec![
            JobEvent::Message(ServerMessage::Status { wait: 7 }),
            // Clamped to max_wait.
            JobEvent::Message(ServerMessage::Status { wait: 60 }),
            JobEvent::Message(ServerMessage::RunQuery(progress(0, "r4_0.xml", 1.0))),
            JobEvent::Message(ServerMessage::Chunk(progress(0, "r4_0.xml", 1.0))),
            JobEvent::Finished,
        ]
    );
    assert!(started.elapsed() >= Duration::from_secs(67));
    assert_eq!(h.gateway.status_calls_left(), 0);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn panicking_job_does_not_stop_the_worker() {
    let h = Harness::new(FakeGateway::default()).await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (bad, mut bad_rx) = job(1.0, vec![chunk("boom", "r5_0.xml")]);
    let (good, mut good_rx) = job(2.0, vec![chunk("fine", "r6_0.xml")]);
    scheduler.submit(bad);
    scheduler.submit(good);

    let bad_events = collect(&mut bad_rx).await;
    assert_eq!(bad_events.len(), 3);
    assert!(matches!(
        &bad_events[0],
        JobEvent::Message(ServerMessage::RunQuery(_))
    ));
    assert_eq!(
        bad_events[1],
        JobEvent::Message(ServerMessage::error(
            "Internal error while processing request"
        ))
    );
    assert_eq!(bad_events[2], JobEvent::Finished);

    let good_events = collect(&mut good_rx).await;
    assert_eq!(good_events.last(), Some(&JobEvent::Finished));
    assert!(h.cache.exists("r6_0.xml").await.unwrap());
    assert_eq!(*h.notifier.subjects.lock(), vec!["Relay job panicked"]);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn invalid_cache_key_fails_only_that_job() {
    let h = Harness::new(FakeGateway::default()).await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (job, mut rx) = job(1.0, vec![chunk("a", "../escape.xml")]);
    scheduler.submit(job);
    let events = collect(&mut rx).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        JobEvent::Message(ServerMessage::Error { error }) if error.contains("../escape.xml")
    ));
    assert!(h.gateway.fetched().is_empty());
    assert!(h.notifier.subjects.lock().is_empty());

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn abandoned_job_still_fills_the_cache() {
    let h = Harness::new(FakeGateway::default()).await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());

    let (abandoned, rx) = job(1.0, vec![chunk("a", "r8_0.xml")]);
    assert!(!abandoned.output.is_abandoned());
    drop(rx);
    assert!(abandoned.output.is_abandoned());
    scheduler.submit(abandoned);

    let (marker, mut marker_rx) = job(2.0, Vec::new());
    scheduler.submit(marker);
    collect(&mut marker_rx).await;

    assert!(h.cache.exists("r8_0.xml").await.unwrap());

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn queued_jobs_are_failed_on_shutdown() {
    let h = Harness::new(FakeGateway::default()).await;
    let queue = Arc::new(JobQueue::new());
    let (job, mut rx) = job(1.0, vec![chunk("a", "r9_0.xml")]);
    queue.push(job).unwrap();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    worker_loop(queue.clone(), h.ctx.clone(), shutdown).await;

    assert_eq!(
        collect(&mut rx).await,
        vec![
            JobEvent::Message(ServerMessage::error("Server shutting down")),
            JobEvent::Finished,
        ]
    );
    assert_eq!(queue.pending(), 0);
    assert!(h.gateway.fetched().is_empty());
}

#[test]
fn closed_queue_hands_jobs_back() {
    let queue = JobQueue::new();
    let (queued, _rx) = job(3.0, Vec::new());
    queue.push(queued).unwrap();

    let remaining = queue.close();
    assert_eq!(remaining.len(), 1);
    assert_eq!(queue.pending(), 0);

    let (late, _rx2) = job(1.0, Vec::new());
    let late = queue.push(late).unwrap_err();
    assert_eq!(late.priority, 1.0);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn submit_after_worker_stopped_gets_terminal_event() {
    let h = Harness::new(FakeGateway::default()).await;
    let shutdown = CancellationToken::new();
    let (scheduler, worker) = Scheduler::spawn(h.ctx.clone(), shutdown.clone());
    shutdown.cancel();
    worker.await.unwrap();

    let (late, mut rx) = job(1.0, vec![chunk("a", "r10_0.xml")]);
    scheduler.submit(late);

    let events = tokio::time::timeout(Duration::from_secs(2), collect(&mut rx))
        .await
        .expect("late job must still be answered");
    assert_eq!(
        events,
        vec![
            JobEvent::Message(ServerMessage::error(SHUTTING_DOWN)),
            JobEvent::Finished,
        ]
    );
    assert_eq!(scheduler.queued(), 0);
    assert!(h.gateway.fetched().is_empty());
}
