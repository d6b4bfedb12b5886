//! Worker runtime: claim loop, heartbeat, handler execution and settlement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::{deadline, ClaimedJob, QueueBackend},
    backoff::Backoff,
    claim::Claimer,
    config::QueueConfig,
    error::JobError,
    heartbeat::{HeartbeatExit, HeartbeatManager},
    idempotency::IdempotencyManager,
    observability::{Counter, ObservabilityLayer},
    registry::WorkerRegistry,
    types::{EndOutcome, Failure, IdempotencyStatus, Job, JobState, OutboxEntry, QueueEvent, WorkerId},
    QueueError, QueueResult,
};

/// What a handler hands back on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    /// Stored under the job's idempotency key, if it has one
    pub result: serde_json::Value,
    /// Side effects committed together with the result
    pub outbox: Vec<OutboxEntry>,
}

impl JobOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            outbox: Vec::new(),
        }
    }

    pub fn with_outbox_entry(mut self, entry: OutboxEntry) -> Self {
        self.outbox.push(entry);
        self
    }
}

/// Per-execution context passed to handlers
#[derive(Debug, Clone)]
pub struct JobContext {
    pub worker_id: WorkerId,
    /// Attempts already consumed before this run
    pub attempt: u32,
    cancellation: CancellationToken,
}

impl JobContext {
    /// Set when the worker shuts down or loses the job
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }
}

/// User code run for every claimed job
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<JobOutput, JobError>;
}

/// How the in-flight run ended
enum Verdict {
    Finished(Result<JobOutput, JobError>),
    Lost,
    Shutdown,
}

/// Idempotency gate decided before the handler runs
enum Gate {
    Run { key: Option<String> },
    /// Already finished under this key; complete without running
    Skip,
    /// Another job holds the reservation; retry once it settles
    Held { key: String, owner: Option<String> },
    /// Ledger unreachable; retry the job later
    Unknown(QueueError),
}

pub struct Worker {
    id: WorkerId,
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    handler: Arc<dyn JobHandler>,
    claimer: Claimer,
    heartbeats: HeartbeatManager,
    idempotency: IdempotencyManager,
    registry: WorkerRegistry,
    backoff: Backoff,
    error_pause: Duration,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        config: &QueueConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            claimer: Claimer::new(backend.clone(), observability.clone(), id.clone(), config),
            heartbeats: HeartbeatManager::new(
                backend.clone(),
                observability.clone(),
                config.heartbeat.clone(),
            ),
            idempotency: IdempotencyManager::new(
                backend.clone(),
                observability.clone(),
                config.idempotency.clone(),
            ),
            registry: WorkerRegistry::new(backend.clone()),
            backoff: Backoff::from_config(&config.retry),
            error_pause: config.claim.poll_interval.max(Duration::from_millis(100)),
            id,
            backend,
            observability,
            handler,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claim and process until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) -> QueueResult<()> {
        self.registry.register(&self.id).await?;
        info!(worker_id = %self.id, "Worker started");

        while !shutdown.is_cancelled() {
            match self.claimer.claim_blocking(&shutdown).await {
                Ok(Some(claimed)) => {
                    if let Err(e) = self.process(claimed, &shutdown).await {
                        warn!(worker_id = %self.id, error = %e, "Settling job failed");
                    }
                }
                Ok(None) => {}
                Err(QueueError::WorkerShutdown) => break,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.error_pause) => {}
                    }
                }
            }
        }

        if let Err(e) = self.registry.deregister(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Deregistration failed, leaving entry to the reaper");
        }
        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    /// One non-blocking claim; returns whether a job was processed
    pub async fn run_once(&mut self) -> QueueResult<bool> {
        match self.claimer.claim().await? {
            Some(claimed) => {
                self.process(claimed, &CancellationToken::new()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip_all, fields(worker_id = %self.id, job_id = %claimed.job.id))]
    async fn process(&self, claimed: ClaimedJob, shutdown: &CancellationToken) -> QueueResult<()> {
        let job = claimed.job;
        let heartbeat = self.heartbeats.start(claimed.token);
        let lost = heartbeat.lost_signal();

        let key = match self.gate(&job).await {
            Gate::Run { key } => key,
            Gate::Skip => {
                heartbeat.stop().await;
                info!(key = ?job.idempotency_key, "Duplicate job, completing without running");
                return self.complete(&job).await;
            }
            Gate::Held { key, owner } => {
                heartbeat.stop().await;
                debug!(key, owner = ?owner, "Idempotency key held by another job");
                let holder = owner.as_deref().unwrap_or("another caller");
                let reason = format!("idempotency key {} held by {}", key, holder);
                return self.fail(&job, JobError::retryable(reason)).await;
            }
            Gate::Unknown(e) => {
                heartbeat.stop().await;
                return self.fail(&job, JobError::retryable(e.to_string())).await;
            }
        };

        let cancellation = shutdown.child_token();
        let ctx = JobContext {
            worker_id: self.id.clone(),
            attempt: job.attempts,
            cancellation: cancellation.clone(),
        };
        let verdict = tokio::select! {
            outcome = self.handler.handle(&job, &ctx) => Verdict::Finished(outcome),
            _ = lost.cancelled() => Verdict::Lost,
            _ = shutdown.cancelled() => Verdict::Shutdown,
        };
        cancellation.cancel();
        let exit = heartbeat.stop().await;

        match verdict {
            Verdict::Finished(Ok(output)) => self.succeed(&job, key, output).await,
            Verdict::Finished(Err(e)) => {
                self.forget(key.as_deref()).await;
                self.fail(&job, e).await
            }
            Verdict::Lost => self.abandon(&job, exit).await,
            Verdict::Shutdown => {
                if self.forget(key.as_deref()).await {
                    self.release(&job).await
                } else {
                    self.fail(&job, JobError::retryable("worker shut down")).await
                }
            }
        }
    }

    async fn gate(&self, job: &Job) -> Gate {
        let Some(key) = job.idempotency_key.clone() else {
            return Gate::Run { key: None };
        };
        let owner = job.id.as_str();
        match self.idempotency.begin_as(&key, owner, None).await {
            Ok(outcome) if !outcome.duplicate => Gate::Run { key: Some(key) },
            Ok(_) => match self.idempotency.get(&key).await {
                Ok(Some(record)) if record.status == IdempotencyStatus::Done => Gate::Skip,
                // left behind by an earlier attempt of this same job
                Ok(Some(record)) if record.is_owned_by(owner) => Gate::Run { key: Some(key) },
                Ok(Some(record)) => Gate::Held { key, owner: record.owner },
                // expired between the two reads
                Ok(None) => Gate::Unknown(QueueError::IdempotencyUnknown {
                    key,
                    reason: "record vanished".to_string(),
                }),
                Err(e) => Gate::Unknown(e),
            },
            Err(e) => Gate::Unknown(e),
        }
    }

    /// Release an in-progress reservation; true when nothing is left behind
    async fn forget(&self, key: Option<&str>) -> bool {
        let Some(key) = key else {
            return true;
        };
        match self.idempotency.release(key).await {
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "Could not release idempotency reservation");
                false
            }
        }
    }

    async fn succeed(&self, job: &Job, key: Option<String>, output: JobOutput) -> QueueResult<()> {
        let key = match key {
            Some(key) => Some(key),
            None if !output.outbox.is_empty() => {
                let implicit = format!("job:{}", job.id);
                match self.idempotency.begin_as(&implicit, job.id.as_str(), None).await {
                    Ok(_) => Some(implicit),
                    Err(e) => return self.fail(job, JobError::retryable(e.to_string())).await,
                }
            }
            None => None,
        };

        if let Some(key) = key {
            let recorded = match self.idempotency.end(&key, &output.result, &output.outbox).await {
                Ok(EndOutcome::Missing) => {
                    // reservation expired mid-run; reserve again so the effects are staged
                    match self.idempotency.begin_as(&key, job.id.as_str(), None).await {
                        Ok(_) => self.idempotency.end(&key, &output.result, &output.outbox).await,
                        Err(e) => Err(e),
                    }
                }
                other => other,
            };
            if let Err(e) = recorded {
                // an attempt is consumed so the rerun re-checks the ledger
                return self.fail(job, JobError::retryable(e.to_string())).await;
            }
        }
        self.complete(job).await
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        match self.backend.complete(&self.id, &job.id).await {
            Ok(()) => {
                self.observability.incr(Counter::Completed);
                self.observability.emit(QueueEvent::Completed {
                    job_id: job.id.clone(),
                    worker_id: self.id.clone(),
                    at: Utc::now(),
                });
                debug!(job_id = %job.id, "Job completed");
                Ok(())
            }
            Err(e) => self.ownership(job, e),
        }
    }

    async fn fail(&self, job: &Job, err: JobError) -> QueueResult<()> {
        let now = Utc::now();
        let mut failure = Failure::new(err.message(), now);
        if err.is_retryable() {
            let delay = self.backoff.delay(job.attempts + 1);
            failure = failure.retry_at(Some(deadline(now, delay)?));
        } else {
            failure = failure.permanent();
        }

        match self.backend.fail(&self.id, &job.id, failure).await {
            Ok(JobState::DeadLetter { reason, failed_at }) => {
                self.observability.incr(Counter::DeadLettered);
                self.observability.emit(QueueEvent::DeadLettered {
                    job_id: job.id.clone(),
                    reason: reason.clone(),
                    at: failed_at,
                });
                error!(job_id = %job.id, attempts = job.attempts + 1, %reason, "Job dead-lettered");
                Ok(())
            }
            Ok(_) => {
                self.observability.incr(Counter::Retried);
                self.observability.emit(QueueEvent::Retrying {
                    job_id: job.id.clone(),
                    attempts: job.attempts + 1,
                    error: err.message().to_string(),
                    at: now,
                });
                warn!(job_id = %job.id, attempts = job.attempts + 1, error = %err, "Job failed, will retry");
                Ok(())
            }
            Err(e) => self.ownership(job, e),
        }
    }

    async fn release(&self, job: &Job) -> QueueResult<()> {
        match self.backend.release(&self.id, &job.id).await {
            Ok(()) => {
                self.observability.incr(Counter::Released);
                self.observability.emit(QueueEvent::Released {
                    job_id: job.id.clone(),
                    worker_id: self.id.clone(),
                    at: Utc::now(),
                });
                info!(job_id = %job.id, "Released job on shutdown");
                Ok(())
            }
            Err(e) => self.ownership(job, e),
        }
    }

    /// The heartbeat is gone. On lost ownership the reaper's decision
    /// stands; on store trouble we try to hand the job back ourselves.
    async fn abandon(&self, job: &Job, exit: HeartbeatExit) -> QueueResult<()> {
        match exit {
            HeartbeatExit::Failed => self.release(job).await,
            _ => {
                warn!(job_id = %job.id, "Abandoned job after losing its heartbeat");
                Ok(())
            }
        }
    }

    fn ownership(&self, job: &Job, err: QueueError) -> QueueResult<()> {
        if err.is_ownership_lost() {
            self.observability.incr(Counter::OwnershipLost);
            warn!(job_id = %job.id, "Job was reaped before it could be settled");
            return Ok(());
        }
        Err(err)
    }
}

/// A set of workers sharing one handler
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    pub fn new(workers: Vec<Worker>, shutdown_timeout: Duration) -> Self {
        Self {
            workers,
            shutdown_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let tasks = self
            .workers
            .into_iter()
            .map(|worker| {
                let id = worker.id().clone();
                let token = shutdown.clone();
                (id, tokio::spawn(worker.run(token)))
            })
            .collect();

        WorkerHandle {
            shutdown,
            tasks,
            timeout: self.shutdown_timeout,
        }
    }
}

/// Running pool; dropping it without `shutdown` leaves workers running
pub struct WorkerHandle {
    shutdown: CancellationToken,
    tasks: Vec<(WorkerId, JoinHandle<QueueResult<()>>)>,
    timeout: Duration,
}

impl WorkerHandle {
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.tasks.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Stop claiming, release in-flight jobs and wait for every loop
    pub async fn shutdown(self) -> QueueResult<()> {
        self.shutdown.cancel();
        let (ids, tasks): (Vec<WorkerId>, Vec<JoinHandle<QueueResult<()>>>) =
            self.tasks.into_iter().unzip();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let joined = match tokio::time::timeout(self.timeout, join_all(tasks)).await {
            Ok(joined) => joined,
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                return Err(QueueError::Internal(format!(
                    "workers did not stop within {:?}",
                    self.timeout
                )));
            }
        };

        let mut first_error = None;
        for (id, result) in ids.iter().zip(joined) {
            let outcome = result
                .map_err(|e| QueueError::Internal(format!("Worker join error: {}", e)))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!(worker_id = %id, error = %e, "Worker exited with error");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::types::{JobPriority, NewJob};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        runs: AtomicU32,
        fail: Option<JobError>,
    }

    impl Counting {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                fail: None,
            })
        }

        fn failing(err: JobError) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                fail: Some(err),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, job: &Job, _ctx: &JobContext) -> Result<JobOutput, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match &self.fail {
                Some(e) => Err(e.clone()),
                None => Ok(JobOutput::new(job.payload.clone())),
            }
        }
    }

    fn config() -> QueueConfig {
        let mut config = QueueConfig::default();
        config.retry.backoff_base = Duration::from_millis(1);
        config.retry.backoff_max = Duration::from_millis(1);
        config
    }

    fn worker(backend: &MemoryBackend, handler: Arc<dyn JobHandler>) -> Worker {
        Worker::new(
            WorkerId::from("w1"),
            Arc::new(backend.clone()),
            ObservabilityLayer::new(),
            &config(),
            handler,
        )
    }

    async fn enqueue(backend: &MemoryBackend, new_job: NewJob) -> Job {
        let job = new_job.into_job(3, 1024, Utc::now()).unwrap();
        backend.enqueue(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn completes_and_records_idempotent_result() {
        let backend = MemoryBackend::new();
        let handler = Counting::ok();
        let mut worker = worker(&backend, handler.clone());
        let job = enqueue(
            &backend,
            NewJob::new("default", json!({"n": 7})).with_idempotency_key("k-7"),
        )
        .await;

        assert!(worker.run_once().await.unwrap());
        assert!(backend.job(&job.id).await.unwrap().is_none());
        let record = backend.idempotency_get("k-7", Utc::now()).await.unwrap().unwrap();
        assert_eq!(record.result, Some(json!({"n": 7})));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_key_skips_handler() {
        let backend = MemoryBackend::new();
        let handler = Counting::ok();
        let mut worker = worker(&backend, handler.clone());
        enqueue(&backend, NewJob::new("default", json!(1)).with_idempotency_key("same")).await;
        enqueue(&backend, NewJob::new("default", json!(2)).with_idempotency_key("same")).await;

        assert!(worker.run_once().await.unwrap());
        assert!(worker.run_once().await.unwrap());
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stats().await.unwrap().ready_total(), 0);
    }

    async fn enqueue_retry(backend: &MemoryBackend, key: &str) -> Job {
        let mut job = NewJob::new("default", json!({}))
            .with_idempotency_key(key)
            .into_job(3, 1024, Utc::now())
            .unwrap();
        job.attempts = 1;
        backend.enqueue(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn retry_waits_while_another_job_holds_the_key() {
        let backend = MemoryBackend::new();
        let handler = Counting::ok();
        let mut worker = worker(&backend, handler.clone());
        let ttl = Duration::from_secs(60);
        assert!(!backend.idempotency_begin("shared", Some("job-a"), ttl, Utc::now()).await.unwrap());
        let job = enqueue_retry(&backend, "shared").await;

        assert!(worker.run_once().await.unwrap());

        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        let record = backend.job(&job.id).await.unwrap().unwrap();
        assert!(matches!(record.state, JobState::Scheduled { .. }));
        assert_eq!(record.job.attempts, 2);
        let reservation = backend.idempotency_get("shared", Utc::now()).await.unwrap().unwrap();
        assert!(reservation.is_owned_by("job-a"));
        assert!(!reservation.is_done());
    }

    #[tokio::test]
    async fn own_stuck_reservation_is_rerun() {
        let backend = MemoryBackend::new();
        let handler = Counting::ok();
        let mut worker = worker(&backend, handler.clone());
        let job = enqueue_retry(&backend, "mine").await;
        let ttl = Duration::from_secs(60);
        assert!(!backend.idempotency_begin("mine", Some(job.id.as_str()), ttl, Utc::now()).await.unwrap());

        assert!(worker.run_once().await.unwrap());

        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert!(backend.job(&job.id).await.unwrap().is_none());
        let reservation = backend.idempotency_get("mine", Utc::now()).await.unwrap().unwrap();
        assert!(reservation.is_done());
    }

    #[tokio::test]
    async fn permanent_error_dead_letters_immediately() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend, Counting::failing(JobError::permanent("bad input")));
        let job = enqueue(&backend, NewJob::new("default", json!({}))).await;

        worker.run_once().await.unwrap();
        let record = backend.job(&job.id).await.unwrap().unwrap();
        assert!(matches!(record.state, JobState::DeadLetter { .. }));
        assert_eq!(record.job.attempts, 1);
    }

    #[tokio::test]
    async fn failed_run_releases_reservation() {
        let backend = MemoryBackend::new();
        let mut worker = worker(&backend, Counting::failing(JobError::retryable("flaky")));
        let job = enqueue(
            &backend,
            NewJob::new("default", json!({})).with_idempotency_key("retry-me"),
        )
        .await;

        worker.run_once().await.unwrap();
        assert!(backend.idempotency_get("retry-me", Utc::now()).await.unwrap().is_none());
        let record = backend.job(&job.id).await.unwrap().unwrap();
        assert!(matches!(record.state, JobState::Scheduled { .. }));
    }

    #[tokio::test]
    async fn pool_shutdown_deregisters_workers() {
        let backend = MemoryBackend::new();
        let workers = (0..3)
            .map(|i| {
                Worker::new(
                    WorkerId::from(format!("pool-{}", i)),
                    Arc::new(backend.clone()),
                    ObservabilityLayer::new(),
                    &config(),
                    Counting::ok(),
                )
            })
            .collect();
        let handle = WorkerPool::new(workers, Duration::from_secs(5)).spawn();
        enqueue(&backend, NewJob::new("default", json!({})).with_priority(JobPriority::High)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.worker_ids().len(), 3);
        handle.shutdown().await.unwrap();

        assert_eq!(backend.worker_count().await.unwrap(), 0);
        assert_eq!(backend.stats().await.unwrap().ready_total(), 0);
    }
}
