//! Redis backend.
//!
//! Every operation that touches more than one key runs as a Lua script,
//! so each trait call stays one atomic unit on the server. Scripts rebuild
//! job and ready-list keys from the namespace, which ties this backend to a
//! single Redis instance (no cluster slot routing).
//!
//! Layout (see [`KeySchema`]):
//! - job records are hashes; timestamps are stored as epoch milliseconds
//! - ready lists are popped from the left and appended on the right;
//!   a released job is pushed back on the left
//! - the dead-letter list is pushed on the left, so it reads newest first

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::{
    backend::{ClaimedJob, QueueBackend, QueueStats, ReadyDepth, ReadySource, ReapOutcome, ReapPolicy},
    keys::KeySchema,
    types::{
        Container, DeadLetterEntry, EndOutcome, Failure, HeartbeatToken, IdempotencyRecord,
        IdempotencyStatus, Job, JobId, JobPriority, JobRecord, JobState, OutboxEntry, WorkerId,
    },
    QueueError, QueueResult,
};

const COMMON_LUA: &str = include_str!("lua/common.lua");

/// Keys per SCAN round trip in `purge_all`
const SCAN_COUNT: usize = 500;

struct Scripts {
    enqueue: Script,
    schedule: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    release: Script,
    renew: Script,
    promote: Script,
    reap: Script,
    deregister: Script,
    idempotency_begin: Script,
    idempotency_end: Script,
    idempotency_release: Script,
    idempotency_cleanup: Script,
    outbox_claim: Script,
    outbox_settle: Script,
    outbox_recover: Script,
    requeue_dead_letter: Script,
    purge_dead_letters: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(include_str!("lua/enqueue.lua")),
            schedule: Script::new(include_str!("lua/schedule.lua")),
            claim: with_common(include_str!("lua/claim.lua")),
            complete: with_common(include_str!("lua/complete.lua")),
            fail: with_common(include_str!("lua/fail.lua")),
            release: with_common(include_str!("lua/release.lua")),
            renew: Script::new(include_str!("lua/renew.lua")),
            promote: with_common(include_str!("lua/promote.lua")),
            reap: with_common(include_str!("lua/reap.lua")),
            deregister: Script::new(include_str!("lua/deregister.lua")),
            idempotency_begin: Script::new(include_str!("lua/idempotency_begin.lua")),
            idempotency_end: Script::new(include_str!("lua/idempotency_end.lua")),
            idempotency_release: Script::new(include_str!("lua/idempotency_release.lua")),
            idempotency_cleanup: Script::new(include_str!("lua/idempotency_cleanup.lua")),
            outbox_claim: Script::new(include_str!("lua/outbox_claim.lua")),
            outbox_settle: Script::new(include_str!("lua/outbox_settle.lua")),
            outbox_recover: Script::new(include_str!("lua/outbox_recover.lua")),
            requeue_dead_letter: with_common(include_str!("lua/requeue_dead_letter.lua")),
            purge_dead_letters: with_common(include_str!("lua/purge_dead_letters.lua")),
        }
    }
}

fn with_common(body: &str) -> Script {
    Script::new(&format!("{}\n{}", COMMON_LUA, body))
}

/// Redis-backed store shared by every producer, worker and maintenance loop
#[derive(Clone)]
pub struct RedisBackend {
    keys: KeySchema,
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisBackend {
    /// Connect with a reconnecting connection manager
    pub async fn connect(url: &str, namespace: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let backend = Self::from_connection(conn, KeySchema::new(namespace));
        info!(namespace = backend.keys.namespace(), "Connected to Redis");
        Ok(backend)
    }

    /// Share an existing connection manager across components
    pub fn from_connection(conn: ConnectionManager, keys: KeySchema) -> Self {
        Self {
            keys,
            conn,
            scripts: Arc::new(Scripts::load()),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn ns(&self) -> &str {
        self.keys.namespace()
    }

    async fn record(&self, conn: &mut ConnectionManager, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(&fields).map(Some)
    }

    async fn insert(&self, job: &Job, due_at: Option<DateTime<Utc>>) -> QueueResult<()> {
        let mut conn = self.conn();
        let fields = job_fields(job)?;

        let inserted: i64 = match due_at {
            None => {
                let mut invocation = self.scripts.enqueue.prepare_invoke();
                invocation
                    .key(self.keys.job(&job.id))
                    .key(self.keys.ready(&job.origin_queue, job.priority))
                    .key(self.keys.queues())
                    .arg(job.id.as_str())
                    .arg(&job.origin_queue);
                for (field, value) in &fields {
                    invocation.arg(*field).arg(value);
                }
                invocation.invoke_async(&mut conn).await?
            }
            Some(due_at) => {
                let mut invocation = self.scripts.schedule.prepare_invoke();
                invocation
                    .key(self.keys.job(&job.id))
                    .key(self.keys.scheduled())
                    .key(self.keys.queues())
                    .arg(job.id.as_str())
                    .arg(&job.origin_queue)
                    .arg(millis(due_at));
                for (field, value) in &fields {
                    invocation.arg(*field).arg(value);
                }
                invocation.invoke_async(&mut conn).await?
            }
        };

        if inserted == 0 {
            return Err(QueueError::Validation(format!("job {} already exists", job.id)));
        }
        Ok(())
    }

    async fn settle_outbox(
        &self,
        reconciler: &str,
        entry_id: &str,
        mode: &str,
        entry: Option<&OutboxEntry>,
    ) -> QueueResult<()> {
        let mut conn = self.conn();
        let body = match entry {
            Some(entry) => serde_json::to_string(entry)?,
            None => String::new(),
        };
        let _: i64 = self
            .scripts
            .outbox_settle
            .key(self.keys.outbox_inflight(reconciler))
            .key(self.keys.outbox_entries())
            .key(self.keys.outbox_pending())
            .key(self.keys.outbox_failed())
            .arg(entry_id)
            .arg(mode)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Workers whose processing lists may hold jobs: the registry plus
    /// owners recorded on job hashes
    async fn registered_workers(&self, conn: &mut ConnectionManager) -> QueueResult<Vec<WorkerId>> {
        let workers: Vec<String> = conn.zrange(self.keys.registry(), 0, -1).await?;
        Ok(workers.into_iter().map(WorkerId::from).collect())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn keys(&self) -> &KeySchema {
        &self.keys
    }

    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.insert(job, None).await
    }

    async fn schedule(&self, job: &Job, due_at: DateTime<Utc>) -> QueueResult<()> {
        self.insert(job, Some(due_at)).await
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        sources: &[ReadySource],
        heartbeat_ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<ClaimedJob>> {
        let mut conn = self.conn();
        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(self.keys.processing(worker))
            .key(self.keys.heartbeat(worker))
            .key(self.keys.registry());
        for source in sources {
            invocation.key(self.keys.ready(&source.queue, source.priority));
        }
        invocation
            .arg(self.ns())
            .arg(worker.as_str())
            .arg(ttl_millis(heartbeat_ttl))
            .arg(millis(now));

        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.first().map(String::as_str) {
            Some("claimed") => {
                let record = record_from_fields(&pairs(&reply[1..]))?;
                let token = HeartbeatToken::new(worker, &record.job.id);
                debug!(worker_id = %worker, job_id = %record.job.id, "Claimed job");
                Ok(Some(ClaimedJob {
                    job: record.job,
                    token,
                }))
            }
            Some("empty") => Ok(None),
            Some("holding") => Err(QueueError::Validation(format!("worker {} already holds a job", worker))),
            other => Err(unexpected("claim", other)),
        }
    }

    async fn complete(&self, worker: &WorkerId, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn();
        let reply: String = self
            .scripts
            .complete
            .key(self.keys.processing(worker))
            .key(self.keys.heartbeat(worker))
            .arg(self.ns())
            .arg(worker.as_str())
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "lost" => Err(QueueError::ownership_lost(worker, job_id)),
            other => Err(unexpected("complete", Some(other))),
        }
    }

    async fn fail(&self, worker: &WorkerId, job_id: &JobId, failure: Failure) -> QueueResult<JobState> {
        let mut conn = self.conn();
        let retry_at = failure.retry_at.map(|at| millis(at).to_string()).unwrap_or_default();
        let reply: String = self
            .scripts
            .fail
            .key(self.keys.processing(worker))
            .key(self.keys.heartbeat(worker))
            .arg(self.ns())
            .arg(worker.as_str())
            .arg(job_id.as_str())
            .arg(&failure.reason)
            .arg(millis(failure.at))
            .arg(retry_at)
            .arg(if failure.permanent { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            "ready" => Ok(JobState::Ready),
            "scheduled" => match failure.retry_at {
                Some(due_at) => Ok(JobState::Scheduled { due_at }),
                None => Err(unexpected("fail", Some("scheduled without retry time"))),
            },
            "dead_letter" => Ok(JobState::DeadLetter {
                reason: failure.reason,
                failed_at: failure.at,
            }),
            "lost" => Err(QueueError::ownership_lost(worker, job_id)),
            "missing" => Err(QueueError::Internal(format!("job {} vanished on failure", job_id))),
            other => Err(unexpected("fail", Some(other))),
        }
    }

    async fn release(&self, worker: &WorkerId, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn();
        let reply: String = self
            .scripts
            .release
            .key(self.keys.processing(worker))
            .key(self.keys.heartbeat(worker))
            .arg(self.ns())
            .arg(worker.as_str())
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "lost" => Err(QueueError::ownership_lost(worker, job_id)),
            "missing" => Err(QueueError::Internal(format!("job {} vanished on release", job_id))),
            other => Err(unexpected("release", Some(other))),
        }
    }

    async fn renew_heartbeat(&self, token: &HeartbeatToken, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.conn();
        let renewed: i64 = self
            .scripts
            .renew
            .key(self.keys.heartbeat(&token.worker()))
            .arg(token.as_str())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn heartbeat(&self, worker: &WorkerId) -> QueueResult<Option<HeartbeatToken>> {
        let mut conn = self.conn();
        let token: Option<String> = conn.get(self.keys.heartbeat(worker)).await?;
        Ok(token.map(HeartbeatToken))
    }

    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.conn();
        let moved: usize = self
            .scripts
            .promote
            .key(self.keys.scheduled())
            .arg(self.ns())
            .arg(millis(now))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn register_worker(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(self.keys.registry(), worker.as_str(), millis(now)).await?;
        Ok(())
    }

    async fn list_workers(&self, offset: usize, limit: usize) -> QueueResult<Vec<WorkerId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let stop = offset.saturating_add(limit - 1);
        let workers: Vec<String> = conn
            .zrange(self.keys.registry(), offset as isize, stop as isize)
            .await?;
        Ok(workers.into_iter().map(WorkerId::from).collect())
    }

    async fn worker_count(&self) -> QueueResult<usize> {
        let mut conn = self.conn();
        Ok(conn.zcard(self.keys.registry()).await?)
    }

    async fn deregister_worker(&self, worker: &WorkerId) -> QueueResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .scripts
            .deregister
            .key(self.keys.processing(worker))
            .key(self.keys.heartbeat(worker))
            .key(self.keys.registry())
            .arg(worker.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn reap_worker(
        &self,
        worker: &WorkerId,
        policy: &ReapPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<ReapOutcome> {
        let mut conn = self.conn();
        let (base, max) = match &policy.backoff {
            Some(backoff) => (
                ttl_millis(backoff.base()).to_string(),
                ttl_millis(backoff.max()).to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let reply: Vec<String> = self
            .scripts
            .reap
            .key(self.keys.heartbeat(worker))
            .key(self.keys.processing(worker))
            .key(self.keys.registry())
            .arg(self.ns())
            .arg(worker.as_str())
            .arg(&policy.reason)
            .arg(millis(now))
            .arg(base)
            .arg(max)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("alive") => Ok(ReapOutcome {
                alive: true,
                ..Default::default()
            }),
            Some("reaped") => {
                let requeued: usize = reply
                    .get(1)
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| unexpected("reap", reply.get(1).map(String::as_str)))?;
                let ids: Vec<JobId> = reply[2..].iter().map(|id| JobId::from(id.as_str())).collect();
                let split = requeued.min(ids.len());
                Ok(ReapOutcome {
                    alive: false,
                    requeued: ids[..split].to_vec(),
                    dead_lettered: ids[split..].to_vec(),
                })
            }
            other => Err(unexpected("reap", other)),
        }
    }

    async fn idempotency_begin(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut conn = self.conn();
        let existed: i64 = self
            .scripts
            .idempotency_begin
            .key(self.keys.idempotency(key))
            .key(self.keys.idempotency_index())
            .arg(key)
            .arg(millis(now))
            .arg(ttl_millis(ttl))
            .arg(owner.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(existed == 1)
    }

    async fn idempotency_end(
        &self,
        key: &str,
        result: &serde_json::Value,
        outbox: &[OutboxEntry],
        now: DateTime<Utc>,
    ) -> QueueResult<EndOutcome> {
        let mut conn = self.conn();
        let mut invocation = self.scripts.idempotency_end.prepare_invoke();
        invocation
            .key(self.keys.idempotency(key))
            .key(self.keys.outbox_entries())
            .key(self.keys.outbox_pending())
            .arg(millis(now))
            .arg(serde_json::to_string(result)?);
        for entry in outbox {
            let mut entry = entry.clone();
            entry.idempotency_key = key.to_string();
            invocation.arg(&entry.id).arg(serde_json::to_string(&entry)?);
        }

        let reply: String = invocation.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "recorded" => Ok(EndOutcome::Recorded),
            "already_done" => Ok(EndOutcome::AlreadyDone),
            "missing" => Ok(EndOutcome::Missing),
            other => Err(unexpected("idempotency end", Some(other))),
        }
    }

    async fn idempotency_get(&self, key: &str, now: DateTime<Utc>) -> QueueResult<Option<IdempotencyRecord>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.idempotency(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let record = idempotency_from_fields(key, &fields)?;
        Ok(Some(record).filter(|r| r.expires_at > now))
    }

    async fn idempotency_release(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .scripts
            .idempotency_release
            .key(self.keys.idempotency(key))
            .key(self.keys.idempotency_index())
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn idempotency_cleanup(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.conn();
        let removed: usize = self
            .scripts
            .idempotency_cleanup
            .key(self.keys.idempotency_index())
            .arg(self.keys.idempotency(""))
            .arg(millis(now))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn outbox_claim(&self, reconciler: &str, limit: usize) -> QueueResult<Vec<OutboxEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let claimed: Vec<String> = self
            .scripts
            .outbox_claim
            .key(self.keys.outbox_pending())
            .key(self.keys.outbox_inflight(reconciler))
            .key(self.keys.outbox_entries())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        claimed
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(QueueError::from))
            .collect()
    }

    async fn outbox_ack(&self, reconciler: &str, entry_id: &str) -> QueueResult<()> {
        self.settle_outbox(reconciler, entry_id, "ack", None).await
    }

    async fn outbox_retry(&self, reconciler: &str, entry: &OutboxEntry, park: bool) -> QueueResult<()> {
        let mode = if park { "park" } else { "retry" };
        self.settle_outbox(reconciler, &entry.id, mode, Some(entry)).await
    }

    async fn outbox_recover(&self, reconciler: &str) -> QueueResult<usize> {
        let mut conn = self.conn();
        let recovered: usize = self
            .scripts
            .outbox_recover
            .key(self.keys.outbox_inflight(reconciler))
            .key(self.keys.outbox_pending())
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered)
    }

    async fn job(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn();
        self.record(&mut conn, job_id).await
    }

    async fn locate(&self, job_id: &JobId, queue: &str) -> QueueResult<Vec<Container>> {
        let mut conn = self.conn();
        let mut found = Vec::new();

        for priority in JobPriority::all() {
            let pos: Option<usize> = redis::cmd("LPOS")
                .arg(self.keys.ready(queue, *priority))
                .arg(job_id.as_str())
                .query_async(&mut conn)
                .await?;
            if pos.is_some() {
                found.push(Container::Ready {
                    queue: queue.to_string(),
                    priority: *priority,
                });
            }
        }

        let mut workers: BTreeSet<WorkerId> = self.registered_workers(&mut conn).await?.into_iter().collect();
        let owner: Option<String> = conn.hget(self.keys.job(job_id), "owner").await?;
        workers.extend(owner.map(WorkerId::from));
        for worker in workers {
            let pos: Option<usize> = redis::cmd("LPOS")
                .arg(self.keys.processing(&worker))
                .arg(job_id.as_str())
                .query_async(&mut conn)
                .await?;
            if pos.is_some() {
                found.push(Container::Processing { worker });
            }
        }

        let score: Option<f64> = conn.zscore(self.keys.scheduled(), job_id.as_str()).await?;
        if score.is_some() {
            found.push(Container::Scheduled);
        }

        let pos: Option<usize> = redis::cmd("LPOS")
            .arg(self.keys.dead_letter())
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        if pos.is_some() {
            found.push(Container::DeadLetter);
        }
        Ok(found)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn();
        let queues: BTreeSet<String> = conn.smembers(self.keys.queues()).await?;
        let slots: Vec<(String, JobPriority)> = queues
            .iter()
            .flat_map(|queue| JobPriority::all().iter().map(move |p| (queue.clone(), *p)))
            .collect();

        let mut pipe = redis::pipe();
        for (queue, priority) in &slots {
            pipe.llen(self.keys.ready(queue, *priority));
        }
        let depths: Vec<usize> = if slots.is_empty() {
            Vec::new()
        } else {
            pipe.query_async(&mut conn).await?
        };
        let ready = slots
            .into_iter()
            .zip(depths)
            .map(|((queue, priority), depth)| ReadyDepth { queue, priority, depth })
            .collect();

        let workers = self.registered_workers(&mut conn).await?;
        let mut processing = 0;
        for worker in &workers {
            let held: usize = conn.llen(self.keys.processing(worker)).await?;
            processing += held;
        }

        Ok(QueueStats {
            ready,
            scheduled: conn.zcard(self.keys.scheduled()).await?,
            processing,
            dead_letter: conn.llen(self.keys.dead_letter()).await?,
            workers: workers.len(),
            outbox_pending: conn.llen(self.keys.outbox_pending()).await?,
        })
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let stop = offset.saturating_add(limit - 1);
        let ids: Vec<String> = conn
            .lrange(self.keys.dead_letter(), offset as isize, stop as isize)
            .await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self
                .record(&mut conn, &JobId::from(id))
                .await?
                .and_then(DeadLetterEntry::from_record)
            {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn();
        let moved: i64 = self
            .scripts
            .requeue_dead_letter
            .key(self.keys.dead_letter())
            .arg(self.ns())
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn purge_dead_letters(&self) -> QueueResult<usize> {
        let mut conn = self.conn();
        let removed: usize = self
            .scripts
            .purge_dead_letters
            .key(self.keys.dead_letter())
            .arg(self.ns())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn purge_all(&self) -> QueueResult<usize> {
        let mut conn = self.conn();
        let pattern = format!("{}:*", self.ns());
        let job_prefix = self.keys.job(&JobId::from(""));

        let mut cursor: u64 = 0;
        let mut jobs = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            if !batch.is_empty() {
                jobs += batch.iter().filter(|k| k.starts_with(&job_prefix)).count();
                let _: () = conn.del(&batch).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(jobs)
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// `PX` and `PEXPIRE` reject zero
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn unexpected(operation: &str, reply: Option<&str>) -> QueueError {
    QueueError::Store(format!(
        "unexpected {} reply: {}",
        operation,
        reply.unwrap_or("<empty>")
    ))
}

/// Flat `HGETALL`-style reply into a map
fn pairs(flat: &[String]) -> HashMap<String, String> {
    flat.chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn job_fields(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("queue", job.queue.clone()),
        ("origin_queue", job.origin_queue.clone()),
        ("priority", job.priority.name().to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("enqueued_at", millis(job.enqueued_at).to_string()),
    ];
    if let Some(key) = &job.idempotency_key {
        fields.push(("idempotency_key", key.clone()));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone()));
    }
    Ok(fields)
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> QueueResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Serialization(format!("record is missing field {}", name)))
}

fn number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> QueueResult<T> {
    let raw = field(fields, name)?;
    raw.parse()
        .map_err(|_| QueueError::Serialization(format!("field {} is not a number: {}", name, raw)))
}

fn timestamp(fields: &HashMap<String, String>, name: &str) -> QueueResult<DateTime<Utc>> {
    let ms: i64 = number(fields, name)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Serialization(format!("field {} is out of range: {}", name, ms)))
}

fn record_from_fields(fields: &HashMap<String, String>) -> QueueResult<JobRecord> {
    let priority = field(fields, "priority")?
        .parse::<JobPriority>()
        .map_err(|e| QueueError::Serialization(e.to_string()))?;

    let job = Job {
        id: JobId::from(field(fields, "id")?),
        queue: field(fields, "queue")?.to_string(),
        priority,
        payload: serde_json::from_str(field(fields, "payload")?)?,
        attempts: number(fields, "attempts")?,
        max_attempts: number(fields, "max_attempts")?,
        origin_queue: field(fields, "origin_queue")?.to_string(),
        enqueued_at: timestamp(fields, "enqueued_at")?,
        idempotency_key: fields.get("idempotency_key").cloned(),
        last_error: fields.get("last_error").cloned(),
    };

    let state = match field(fields, "state")? {
        "ready" => JobState::Ready,
        "processing" => JobState::Processing {
            owner: WorkerId::from(field(fields, "owner")?),
        },
        "scheduled" => JobState::Scheduled {
            due_at: timestamp(fields, "due_at")?,
        },
        "dead_letter" => JobState::DeadLetter {
            reason: field(fields, "dl_reason")?.to_string(),
            failed_at: timestamp(fields, "failed_at")?,
        },
        other => {
            return Err(QueueError::Serialization(format!("unknown job state: {}", other)));
        }
    };
    Ok(JobRecord { job, state })
}

fn idempotency_from_fields(key: &str, fields: &HashMap<String, String>) -> QueueResult<IdempotencyRecord> {
    let status = field(fields, "status")?
        .parse::<IdempotencyStatus>()
        .map_err(QueueError::Serialization)?;
    let result = match fields.get("result") {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };
    Ok(IdempotencyRecord {
        key: key.to_string(),
        status,
        result,
        owner: fields.get("owner").filter(|o| !o.is_empty()).cloned(),
        created_at: timestamp(fields, "created_at")?,
        expires_at: timestamp(fields, "expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewJob;
    use serde_json::json;

    fn to_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn job_hash_reads_back_with_its_state() {
        let job = NewJob::new("emails", json!({"to": "a@b.c"}))
            .with_priority(JobPriority::High)
            .with_idempotency_key("welcome-1")
            .into_job(3, 1024, Utc::now())
            .unwrap();

        let mut fields = to_map(job_fields(&job).unwrap());
        fields.insert("state".into(), "processing".into());
        fields.insert("owner".into(), "w1".into());

        let record = record_from_fields(&fields).unwrap();
        assert_eq!(record.job.id, job.id);
        assert_eq!(record.job.priority, JobPriority::High);
        assert_eq!(record.job.payload, json!({"to": "a@b.c"}));
        assert_eq!(record.job.idempotency_key.as_deref(), Some("welcome-1"));
        assert_eq!(record.job.enqueued_at.timestamp_millis(), job.enqueued_at.timestamp_millis());
        assert_eq!(record.state, JobState::Processing { owner: WorkerId::from("w1") });
    }

    #[test]
    fn dead_letter_hash_carries_reason() {
        let job = NewJob::new("q", json!({})).into_job(3, 1024, Utc::now()).unwrap();
        let mut fields = to_map(job_fields(&job).unwrap());
        fields.insert("state".into(), "dead_letter".into());
        fields.insert("dl_reason".into(), "boom".into());
        fields.insert("failed_at".into(), "1700000000000".into());

        let entry = DeadLetterEntry::from_record(record_from_fields(&fields).unwrap()).unwrap();
        assert_eq!(entry.reason, "boom");
        assert_eq!(entry.failed_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn malformed_hash_is_a_serialization_error() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "j1".to_string());
        let err = record_from_fields(&fields).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn reservation_hash_keeps_its_owner() {
        let mut fields = to_map(vec![
            ("status", "in_progress".to_string()),
            ("created_at", "1700000000000".to_string()),
            ("expires_at", "1700000060000".to_string()),
            ("owner", "job-a".to_string()),
        ]);
        let record = idempotency_from_fields("order-42", &fields).unwrap();
        assert!(record.is_owned_by("job-a"));
        assert!(!record.is_owned_by("job-b"));

        fields.remove("owner");
        let record = idempotency_from_fields("order-42", &fields).unwrap();
        assert_eq!(record.owner, None);
    }

    #[test]
    fn flat_replies_pair_up() {
        let flat = vec!["a".to_string(), "1".to_string(), "b".to_string(), "2".to_string()];
        let map = pairs(&flat);
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn zero_ttl_rounds_up() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
