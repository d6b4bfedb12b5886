use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tokio_test::assert_ok;

use dog_workqueue::prelude::*;
use dog_workqueue::{Counter, JobState, OutboxPublisher, QueueBackend};

fn fast_config() -> QueueConfig {
    let mut config = QueueConfig::default();
    config.worker.count = 2;
    config.worker.shutdown_timeout = Duration::from_secs(5);
    config.claim.timeout = Duration::from_millis(50);
    config.claim.poll_interval = Duration::from_millis(10);
    config.heartbeat.interval = Duration::from_millis(50);
    config.retry.backoff_base = Duration::from_millis(5);
    config.retry.backoff_max = Duration::from_millis(20);
    config.scheduler.interval = Duration::from_millis(20);
    config.outbox.interval = Duration::from_millis(20);
    config.reaper.interval = Duration::from_millis(50);
    config.reaper.page_delay = Duration::from_millis(1);
    config
}

fn engine(backend: &MemoryBackend, config: QueueConfig) -> QueueEngine {
    QueueEngine::new(Arc::new(backend.clone()), config).unwrap()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} did not happen within 5s", what);
}

/// Sends a notification for every job and stages it as an outbox entry
struct Notify {
    runs: AtomicU32,
}

#[async_trait]
impl JobHandler for Notify {
    async fn handle(&self, job: &Job, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(JobOutput::new(json!({"notified": job.id.to_string()}))
            .with_outbox_entry(OutboxEntry::new("email.sent", job.payload.clone()).with_aggregate_id(job.id.to_string())))
    }
}

struct AlwaysFlaky {
    runs: AtomicU32,
}

#[async_trait]
impl JobHandler for AlwaysFlaky {
    async fn handle(&self, _job: &Job, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(JobError::retryable("upstream timeout"))
    }
}

/// Never finishes on its own
struct Stuck {
    started: AtomicBool,
}

#[async_trait]
impl JobHandler for Stuck {
    async fn handle(&self, _job: &Job, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        self.started.store(true, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[derive(Default)]
struct Recording {
    published: Mutex<Vec<OutboxEntry>>,
}

#[async_trait]
impl OutboxPublisher for Recording {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), JobError> {
        self.published.lock().push(entry.clone());
        Ok(())
    }
}

#[tokio::test]
async fn pool_completes_jobs_and_publishes_their_outbox() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend, fast_config());
    let handler = Arc::new(Notify { runs: AtomicU32::new(0) });
    let publisher = Arc::new(Recording::default());

    let producer = engine.producer();
    for i in 0..4 {
        assert_ok!(
            producer
                .enqueue(NewJob::new("default", json!({"n": i})).with_idempotency_key(format!("order-{}", i)))
                .await
        );
    }
    let keyless = assert_ok!(producer.enqueue(NewJob::new("default", json!({"n": 99}))).await);

    let cancel = CancellationToken::new();
    let maintenance = engine.spawn_maintenance(cancel.clone(), Some(publisher.clone() as Arc<dyn OutboxPublisher>));
    let workers = engine.worker_pool(handler.clone()).spawn();

    let published = &publisher.published;
    eventually("outbox drained", || async move { published.lock().len() == 5 }).await;
    assert_ok!(workers.shutdown().await);
    cancel.cancel();
    for task in maintenance {
        assert_ok!(task.await);
    }

    assert_eq!(handler.runs.load(Ordering::SeqCst), 5);
    let published = publisher.published.lock().clone();
    let keys: Vec<&str> = published.iter().map(|e| e.idempotency_key.as_str()).collect();
    for i in 0..4 {
        assert!(keys.contains(&format!("order-{}", i).as_str()));
    }
    assert!(keys.contains(&format!("job:{}", keyless).as_str()));

    let stats = assert_ok!(backend.stats().await);
    assert_eq!(stats.ready_total(), 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.outbox_pending, 0);
    assert_eq!(stats.workers, 0);
    assert_eq!(engine.observability().metrics().get(Counter::Completed), 5);
}

#[tokio::test]
async fn retryable_failures_end_in_dead_letter() {
    let backend = MemoryBackend::new();
    let mut config = fast_config();
    config.retry.max_attempts = 2;
    let engine = engine(&backend, config);
    let handler = Arc::new(AlwaysFlaky { runs: AtomicU32::new(0) });

    let id = assert_ok!(engine.producer().enqueue(NewJob::new("default", json!({}))).await);
    let cancel = CancellationToken::new();
    let maintenance = engine.spawn_maintenance(cancel.clone(), None);
    let workers = engine.worker_pool(handler.clone()).spawn();

    let store = &backend;
    eventually("dead letter", || async move {
        store.stats().await.map(|s| s.dead_letter == 1).unwrap_or(false)
    })
    .await;
    assert_ok!(workers.shutdown().await);
    cancel.cancel();
    for task in maintenance {
        assert_ok!(task.await);
    }

    // initial run plus two retries
    assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
    let dead = assert_ok!(backend.dead_letters(0, 10).await);
    assert_eq!(dead[0].job.id, id);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(dead[0].reason, "upstream timeout");
}

#[tokio::test]
async fn shutdown_releases_in_flight_job_and_reservation() {
    let backend = MemoryBackend::new();
    let mut config = fast_config();
    config.worker.count = 1;
    let engine = engine(&backend, config);
    let handler = Arc::new(Stuck { started: AtomicBool::new(false) });

    let id = assert_ok!(
        engine
            .producer()
            .enqueue(NewJob::new("default", json!({})).with_priority(JobPriority::High).with_idempotency_key("stuck-1"))
            .await
    );
    let workers = engine.worker_pool(handler.clone()).spawn();
    let started = &handler.started;
    eventually("handler start", || async move { started.load(Ordering::SeqCst) }).await;

    assert_ok!(workers.shutdown().await);

    let record = assert_ok!(backend.job(&id).await).unwrap();
    assert_eq!(record.state, JobState::Ready);
    assert_eq!(record.job.attempts, 0);
    assert_eq!(backend.ready_jobs("default", JobPriority::High), vec![id]);
    assert!(assert_ok!(backend.idempotency_get("stuck-1", Utc::now()).await).is_none());
    assert_eq!(assert_ok!(backend.worker_count().await), 0);
}

#[tokio::test]
async fn reaped_job_is_abandoned_not_settled() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend, fast_config());
    let handler = Arc::new(Stuck { started: AtomicBool::new(false) });
    let worker_id = WorkerId::from("doomed");

    let id = assert_ok!(engine.producer().enqueue(NewJob::new("default", json!({}))).await);
    let mut worker = engine.worker(worker_id.clone(), handler.clone());
    let run = tokio::spawn(async move { worker.run_once().await });
    let started = &handler.started;
    eventually("handler start", || async move { started.load(Ordering::SeqCst) }).await;

    // the process stalls long enough for its heartbeat to lapse
    backend.expire_heartbeat(&worker_id);
    let report = assert_ok!(engine.reaper().sweep().await);
    assert_eq!(report.requeued, 1);

    let processed = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(assert_ok!(processed));

    let record = assert_ok!(backend.job(&id).await).unwrap();
    assert_eq!(record.state, JobState::Ready);
    assert_eq!(record.job.attempts, 1);
    assert!(engine.observability().metrics().get(Counter::OwnershipLost) >= 1);
}

#[tokio::test]
async fn scheduled_job_runs_only_after_due() {
    let backend = MemoryBackend::new();
    let engine = engine(&backend, fast_config());
    let handler = Arc::new(Notify { runs: AtomicU32::new(0) });

    let due_at = Utc::now() + chrono::Duration::milliseconds(500);
    assert_ok!(engine.producer().schedule(NewJob::new("default", json!({})), due_at).await);

    let cancel = CancellationToken::new();
    let maintenance = engine.spawn_maintenance(cancel.clone(), None);
    let workers = engine.worker_pool(handler.clone()).spawn();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.runs.load(Ordering::SeqCst), 0);

    let runs = &handler.runs;
    eventually("scheduled run", || async move { runs.load(Ordering::SeqCst) == 1 }).await;
    assert!(Utc::now() >= due_at);

    assert_ok!(workers.shutdown().await);
    cancel.cancel();
    for task in maintenance {
        assert_ok!(task.await);
    }
}
