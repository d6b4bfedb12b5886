pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    backoff::Backoff,
    keys::KeySchema,
    types::{
        Container, DeadLetterEntry, EndOutcome, Failure, HeartbeatToken, IdempotencyRecord, Job,
        JobId, JobPriority, JobRecord, JobState, OutboxEntry, WorkerId,
    },
    QueueError, QueueResult,
};

/// One ready list a claim may draw from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadySource {
    pub queue: String,
    pub priority: JobPriority,
}

impl ReadySource {
    pub fn new(queue: impl Into<String>, priority: JobPriority) -> Self {
        Self {
            queue: queue.into(),
            priority,
        }
    }
}

/// A job now owned by a worker, with the heartbeat written by the claim
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: HeartbeatToken,
}

/// How the reaper settles an orphaned job
#[derive(Debug, Clone, PartialEq)]
pub struct ReapPolicy {
    pub reason: String,
    /// Requeue through the scheduled set with this curve instead of
    /// pushing straight onto the ready list
    pub backoff: Option<Backoff>,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            reason: "heartbeat expired".to_string(),
            backoff: None,
        }
    }
}

impl ReapPolicy {
    pub(crate) fn failure_for(&self, job: &Job, now: DateTime<Utc>) -> QueueResult<Failure> {
        let retry_at = match &self.backoff {
            Some(backoff) => Some(deadline(now, backoff.ceiling(job.attempts + 1))?),
            None => None,
        };
        Ok(Failure::new(self.reason.clone(), now).retry_at(retry_at))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Heartbeat was present; nothing was touched
    pub alive: bool,
    pub requeued: Vec<JobId>,
    pub dead_lettered: Vec<JobId>,
}

/// Point-in-time depths for observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: Vec<ReadyDepth>,
    pub scheduled: usize,
    pub processing: usize,
    pub dead_letter: usize,
    pub workers: usize,
    pub outbox_pending: usize,
}

impl QueueStats {
    pub fn ready_total(&self) -> usize {
        self.ready.iter().map(|d| d.depth).sum()
    }

    pub fn ready_depth(&self, queue: &str, priority: JobPriority) -> usize {
        self.ready
            .iter()
            .find(|d| d.queue == queue && d.priority == priority)
            .map(|d| d.depth)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyDepth {
    pub queue: String,
    pub priority: JobPriority,
    pub depth: usize,
}

/// Store primitives of the reliability engine.
///
/// Every method is one atomic unit against the store: an observer never
/// sees a job in two containers or in none while it is alive.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn keys(&self) -> &KeySchema;

    /// Append a validated job to the tail of its ready list
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Park a validated job in the scheduled set until `due_at`
    async fn schedule(&self, job: &Job, due_at: DateTime<Utc>) -> QueueResult<()>;

    /// Pop the head of the first non-empty source into `worker`'s processing
    /// list, write its heartbeat and refresh its registry entry.
    /// A worker holds at most one job at a time.
    async fn claim(
        &self,
        worker: &WorkerId,
        sources: &[ReadySource],
        heartbeat_ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<ClaimedJob>>;

    /// Owner-checked removal of a finished job; drops the heartbeat if it
    /// still carries this job's token.
    async fn complete(&self, worker: &WorkerId, job_id: &JobId) -> QueueResult<()>;

    /// Owner-checked failure: consume an attempt and requeue, schedule or
    /// dead-letter. Returns the job's new state.
    async fn fail(&self, worker: &WorkerId, job_id: &JobId, failure: Failure) -> QueueResult<JobState>;

    /// Owner-checked move back to the head of the ready list, attempt kept
    async fn release(&self, worker: &WorkerId, job_id: &JobId) -> QueueResult<()>;

    /// Extend the heartbeat only if it still holds `token`
    async fn renew_heartbeat(&self, token: &HeartbeatToken, ttl: Duration) -> QueueResult<bool>;

    async fn heartbeat(&self, worker: &WorkerId) -> QueueResult<Option<HeartbeatToken>>;

    /// Move up to `limit` entries with `due_at <= now` onto their ready lists
    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize>;

    async fn register_worker(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<()>;

    /// Registry page ordered by last-seen time
    async fn list_workers(&self, offset: usize, limit: usize) -> QueueResult<Vec<WorkerId>>;

    async fn worker_count(&self) -> QueueResult<usize>;

    /// Graceful exit: drops the registry entry unless jobs are still held
    async fn deregister_worker(&self, worker: &WorkerId) -> QueueResult<bool>;

    /// If `worker`'s heartbeat is absent, settle every job in its
    /// processing list and drop its registry entry. Re-checks liveness
    /// inside the atomic step.
    async fn reap_worker(
        &self,
        worker: &WorkerId,
        policy: &ReapPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<ReapOutcome>;

    /// Returns `true` when a live record already existed. `owner` is stored
    /// on a new reservation and left untouched on an existing one.
    async fn idempotency_begin(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Finalize an in-progress record and stage `outbox` in the same step
    async fn idempotency_end(
        &self,
        key: &str,
        result: &serde_json::Value,
        outbox: &[OutboxEntry],
        now: DateTime<Utc>,
    ) -> QueueResult<EndOutcome>;

    async fn idempotency_get(&self, key: &str, now: DateTime<Utc>) -> QueueResult<Option<IdempotencyRecord>>;

    /// Drop an in-progress reservation; finalized records are kept
    async fn idempotency_release(&self, key: &str) -> QueueResult<bool>;

    /// Remove up to `limit` expired records
    async fn idempotency_cleanup(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize>;

    /// Move up to `limit` pending entries into `reconciler`'s in-flight list
    async fn outbox_claim(&self, reconciler: &str, limit: usize) -> QueueResult<Vec<OutboxEntry>>;

    /// Published: forget the entry
    async fn outbox_ack(&self, reconciler: &str, entry_id: &str) -> QueueResult<()>;

    /// Not published: store the updated entry and return it to pending, or
    /// park it in the failed list
    async fn outbox_retry(&self, reconciler: &str, entry: &OutboxEntry, park: bool) -> QueueResult<()>;

    /// Return entries left in `reconciler`'s in-flight list by a crash
    async fn outbox_recover(&self, reconciler: &str) -> QueueResult<usize>;

    async fn job(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Every container holding `job_id`; at most one while the store is healthy
    async fn locate(&self, job_id: &JobId, queue: &str) -> QueueResult<Vec<Container>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Newest first
    async fn dead_letters(&self, offset: usize, limit: usize) -> QueueResult<Vec<DeadLetterEntry>>;

    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<()>;

    async fn purge_dead_letters(&self) -> QueueResult<usize>;

    /// Drop every job and container in the namespace. Returns jobs removed.
    async fn purge_all(&self) -> QueueResult<usize>;
}

pub(crate) fn deadline(now: DateTime<Utc>, after: Duration) -> QueueResult<DateTime<Utc>> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| QueueError::Validation(format!("duration {:?} out of range", after)))
}
