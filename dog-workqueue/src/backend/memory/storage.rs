use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::ledger::OutboxLists;
use crate::{
    backend::{ClaimedJob, QueueBackend, QueueStats, ReadyDepth, ReadySource, ReapOutcome, ReapPolicy},
    keys::KeySchema,
    types::{
        Container, DeadLetterEntry, EndOutcome, Failure, HeartbeatToken, IdempotencyRecord, Job,
        JobId, JobPriority, JobRecord, JobState, Next, OutboxEntry, Transition, WorkerId,
    },
    QueueError, QueueResult,
};

type ReadyKey = (String, JobPriority);

struct Lease {
    token: HeartbeatToken,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Whole store state; every backend call holds the lock for its full
/// duration, which makes each call one atomic unit.
#[derive(Default)]
pub(super) struct Keyspace {
    jobs: HashMap<JobId, JobRecord>,
    ready: HashMap<ReadyKey, VecDeque<JobId>>,
    queues: BTreeSet<String>,
    scheduled: BTreeSet<(DateTime<Utc>, JobId)>,
    processing: HashMap<WorkerId, VecDeque<JobId>>,
    heartbeats: HashMap<WorkerId, Lease>,
    registry: HashMap<WorkerId, DateTime<Utc>>,
    dead_letter: VecDeque<JobId>,
    pub(super) idempotency: HashMap<String, IdempotencyRecord>,
    pub(super) outbox: OutboxLists,
}

impl Keyspace {
    fn heartbeat_alive(&self, worker: &WorkerId) -> bool {
        self.heartbeats.get(worker).map_or(false, Lease::is_live)
    }

    fn holds(&self, worker: &WorkerId, id: &JobId) -> bool {
        self.processing
            .get(worker)
            .map_or(false, |list| list.contains(id))
    }

    fn insert_job(&mut self, job: &Job, state: JobState) -> QueueResult<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(QueueError::Validation(format!("job {} already exists", job.id)));
        }
        self.queues.insert(job.origin_queue.clone());
        self.jobs.insert(
            job.id.clone(),
            JobRecord {
                job: job.clone(),
                state: state.clone(),
            },
        );
        self.place(&job.id, &state, false);
        Ok(())
    }

    /// Put `id` into the container matching `state`
    fn place(&mut self, id: &JobId, state: &JobState, at_head: bool) {
        match state {
            JobState::Ready => {
                let Some(key) = self
                    .jobs
                    .get(id)
                    .map(|r| (r.job.origin_queue.clone(), r.job.priority))
                else {
                    return;
                };
                let list = self.ready.entry(key).or_default();
                if at_head {
                    list.push_front(id.clone());
                } else {
                    list.push_back(id.clone());
                }
            }
            JobState::Processing { owner } => {
                self.processing
                    .entry(owner.clone())
                    .or_default()
                    .push_back(id.clone());
            }
            JobState::Scheduled { due_at } => {
                self.scheduled.insert((*due_at, id.clone()));
            }
            JobState::DeadLetter { .. } => self.dead_letter.push_front(id.clone()),
        }
    }

    fn unhold(&mut self, worker: &WorkerId, id: &JobId) {
        if let Some(list) = self.processing.get_mut(worker) {
            list.retain(|held| held != id);
            if list.is_empty() {
                self.processing.remove(worker);
            }
        }
    }

    fn drop_heartbeat_if_owned(&mut self, worker: &WorkerId, id: &JobId) {
        let token = HeartbeatToken::new(worker, id);
        if self.heartbeats.get(worker).map_or(false, |l| l.token == token) {
            self.heartbeats.remove(worker);
        }
    }

    fn transition(
        &mut self,
        id: &JobId,
        transition: Transition,
        worker: Option<&WorkerId>,
    ) -> QueueResult<Next> {
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        let mut job = record.job.clone();
        let next = record
            .state
            .apply(&mut job, transition)
            .map_err(|e| e.into_queue_error(worker, &record.job))?;
        record.job = job;
        if let Next::Move(state) = &next {
            record.state = state.clone();
        }
        Ok(next)
    }

    fn claim(
        &mut self,
        worker: &WorkerId,
        sources: &[ReadySource],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<ClaimedJob>> {
        if self.processing.get(worker).map_or(false, |l| !l.is_empty()) {
            return Err(QueueError::Validation(format!("worker {} already holds a job", worker)));
        }

        for source in sources {
            let key = (source.queue.clone(), source.priority);
            let Some(id) = self.ready.get_mut(&key).and_then(VecDeque::pop_front) else {
                continue;
            };
            if !self.jobs.contains_key(&id) {
                warn!(job_id = %id, queue = %source.queue, "Dropping dangling ready entry");
                continue;
            }

            let claim = Transition::Claim { worker: worker.clone() };
            match self.transition(&id, claim, Some(worker)) {
                Ok(Next::Move(state)) => self.place(&id, &state, false),
                Ok(Next::Remove) => continue,
                Err(e) => {
                    if let Some(list) = self.ready.get_mut(&key) {
                        list.push_front(id);
                    }
                    return Err(e);
                }
            }

            let token = HeartbeatToken::new(worker, &id);
            self.heartbeats.insert(
                worker.clone(),
                Lease {
                    token: token.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
            self.registry.insert(worker.clone(), now);

            let job = self.jobs.get(&id).map(|r| r.job.clone());
            return Ok(job.map(|job| ClaimedJob { job, token }));
        }
        Ok(None)
    }

    fn complete(&mut self, worker: &WorkerId, id: &JobId) -> QueueResult<()> {
        if !self.holds(worker, id) {
            return Err(QueueError::ownership_lost(worker, id));
        }
        self.transition(id, Transition::Complete { worker: worker.clone() }, Some(worker))?;
        self.unhold(worker, id);
        self.jobs.remove(id);
        self.drop_heartbeat_if_owned(worker, id);
        Ok(())
    }

    fn fail(&mut self, worker: &WorkerId, id: &JobId, failure: Failure) -> QueueResult<JobState> {
        if !self.holds(worker, id) {
            return Err(QueueError::ownership_lost(worker, id));
        }
        let fail = Transition::Fail {
            worker: worker.clone(),
            failure,
        };
        let Next::Move(state) = self.transition(id, fail, Some(worker))? else {
            return Err(QueueError::Internal(format!("job {} vanished on failure", id)));
        };
        self.unhold(worker, id);
        self.place(id, &state, false);
        self.drop_heartbeat_if_owned(worker, id);
        Ok(state)
    }

    fn release(&mut self, worker: &WorkerId, id: &JobId) -> QueueResult<()> {
        if !self.holds(worker, id) {
            return Err(QueueError::ownership_lost(worker, id));
        }
        self.transition(id, Transition::Release { worker: worker.clone() }, Some(worker))?;
        self.unhold(worker, id);
        self.place(id, &JobState::Ready, true);
        self.drop_heartbeat_if_owned(worker, id);
        Ok(())
    }

    fn renew_heartbeat(&mut self, token: &HeartbeatToken, ttl: Duration) -> bool {
        let worker = token.worker();
        match self.heartbeats.get_mut(&worker) {
            Some(lease) if lease.is_live() && lease.token == *token => {
                lease.expires_at = Instant::now() + ttl;
                true
            }
            Some(lease) if !lease.is_live() => {
                self.heartbeats.remove(&worker);
                false
            }
            _ => false,
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>, limit: usize) -> usize {
        let due: Vec<(DateTime<Utc>, JobId)> = self
            .scheduled
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .cloned()
            .collect();

        let mut moved = 0;
        for entry in due {
            self.scheduled.remove(&entry);
            let id = entry.1;
            match self.transition(&id, Transition::Promote { now }, None) {
                Ok(Next::Move(state)) => {
                    self.place(&id, &state, false);
                    moved += 1;
                }
                Ok(Next::Remove) => {}
                Err(e) => self.restore(&id, e),
            }
        }
        moved
    }

    /// A scheduled entry that disagrees with its record is dropped; the
    /// record is put back where its state says it lives if it is missing there
    fn restore(&mut self, id: &JobId, err: QueueError) {
        let Some(state) = self.jobs.get(id).map(|r| r.state.clone()) else {
            warn!(job_id = %id, error = %err, "Dropping dangling scheduled entry");
            return;
        };
        if self.container_holds(id, &state) {
            warn!(job_id = %id, error = %err, "Dropping stale scheduled entry");
        } else {
            warn!(job_id = %id, error = %err, state = state.name(), "Restoring job to its recorded container");
            self.place(id, &state, false);
        }
    }

    fn container_holds(&self, id: &JobId, state: &JobState) -> bool {
        match state {
            JobState::Ready => self.jobs.get(id).map_or(false, |r| {
                self.ready
                    .get(&(r.job.origin_queue.clone(), r.job.priority))
                    .map_or(false, |list| list.contains(id))
            }),
            JobState::Processing { owner } => self
                .processing
                .get(owner)
                .map_or(false, |list| list.contains(id)),
            JobState::Scheduled { due_at } => self.scheduled.contains(&(*due_at, id.clone())),
            JobState::DeadLetter { .. } => self.dead_letter.contains(id),
        }
    }

    fn list_workers(&self, offset: usize, limit: usize) -> Vec<WorkerId> {
        let mut workers: Vec<(&DateTime<Utc>, &WorkerId)> =
            self.registry.iter().map(|(w, seen)| (seen, w)).collect();
        workers.sort();
        workers
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, w)| w.clone())
            .collect()
    }

    fn reap_worker(
        &mut self,
        worker: &WorkerId,
        policy: &ReapPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<ReapOutcome> {
        if self.heartbeat_alive(worker) {
            return Ok(ReapOutcome {
                alive: true,
                ..Default::default()
            });
        }

        // Plan every move first so a bad record leaves the worker untouched
        let held: Vec<JobId> = self
            .processing
            .get(worker)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();
        let mut plan = Vec::with_capacity(held.len());
        for id in &held {
            let Some(record) = self.jobs.get(id) else {
                warn!(job_id = %id, worker_id = %worker, "Dropping dangling processing entry");
                continue;
            };
            let mut job = record.job.clone();
            let reap = Transition::Reap {
                worker: worker.clone(),
                failure: policy.failure_for(&job, now)?,
            };
            match record.state.apply(&mut job, reap) {
                Ok(Next::Move(state)) => plan.push((job, state)),
                Ok(Next::Remove) => {}
                Err(e) => return Err(e.into_queue_error(Some(worker), &record.job)),
            }
        }

        let mut outcome = ReapOutcome::default();
        self.processing.remove(worker);
        self.heartbeats.remove(worker);
        self.registry.remove(worker);
        for (job, state) in plan {
            let id = job.id.clone();
            if matches!(state, JobState::DeadLetter { .. }) {
                outcome.dead_lettered.push(id.clone());
            } else {
                outcome.requeued.push(id.clone());
            }
            if let Some(record) = self.jobs.get_mut(&id) {
                record.job = job;
                record.state = state.clone();
            }
            self.place(&id, &state, false);
        }
        Ok(outcome)
    }

    fn locate(&self, id: &JobId) -> Vec<Container> {
        let mut found = Vec::new();
        for ((queue, priority), list) in &self.ready {
            if list.contains(id) {
                found.push(Container::Ready {
                    queue: queue.clone(),
                    priority: *priority,
                });
            }
        }
        for (worker, list) in &self.processing {
            if list.contains(id) {
                found.push(Container::Processing {
                    worker: worker.clone(),
                });
            }
        }
        if self.scheduled.iter().any(|(_, s)| s == id) {
            found.push(Container::Scheduled);
        }
        if self.dead_letter.contains(id) {
            found.push(Container::DeadLetter);
        }
        found
    }

    fn stats(&self) -> QueueStats {
        let ready = self
            .queues
            .iter()
            .flat_map(|queue| {
                JobPriority::all().iter().map(move |priority| ReadyDepth {
                    queue: queue.clone(),
                    priority: *priority,
                    depth: self
                        .ready
                        .get(&(queue.clone(), *priority))
                        .map_or(0, VecDeque::len),
                })
            })
            .collect();

        QueueStats {
            ready,
            scheduled: self.scheduled.len(),
            processing: self.processing.values().map(VecDeque::len).sum(),
            dead_letter: self.dead_letter.len(),
            workers: self.registry.len(),
            outbox_pending: self.outbox.pending_len(),
        }
    }

    fn requeue_dead_letter(&mut self, id: &JobId) -> QueueResult<()> {
        let Some(pos) = self.dead_letter.iter().position(|d| d == id) else {
            return Err(QueueError::JobNotFound(id.to_string()));
        };
        self.transition(id, Transition::Revive, None)?;
        self.dead_letter.remove(pos);
        self.place(id, &JobState::Ready, false);
        Ok(())
    }

    fn purge_dead_letters(&mut self) -> usize {
        let ids: Vec<JobId> = self.dead_letter.drain(..).collect();
        for id in &ids {
            self.jobs.remove(id);
        }
        ids.len()
    }
}

/// In-memory backend for tests and single-process embedding
#[derive(Clone, Default)]
pub struct MemoryBackend {
    keys: KeySchema,
    state: Arc<Mutex<Keyspace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            keys: KeySchema::new(namespace),
            state: Arc::default(),
        }
    }

    /// Force a worker's heartbeat to expire (test helper)
    pub fn expire_heartbeat(&self, worker: &WorkerId) {
        self.state.lock().heartbeats.remove(worker);
    }

    /// Job ids currently held by `worker`
    pub fn processing_jobs(&self, worker: &WorkerId) -> Vec<JobId> {
        self.state
            .lock()
            .processing
            .get(worker)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Job ids of a ready list, head first
    pub fn ready_jobs(&self, queue: &str, priority: JobPriority) -> Vec<JobId> {
        self.state
            .lock()
            .ready
            .get(&(queue.to_string(), priority))
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn keys(&self) -> &KeySchema {
        &self.keys
    }

    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.state.lock().insert_job(job, JobState::Ready)
    }

    async fn schedule(&self, job: &Job, due_at: DateTime<Utc>) -> QueueResult<()> {
        self.state
            .lock()
            .insert_job(job, JobState::Scheduled { due_at })
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        sources: &[ReadySource],
        heartbeat_ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<ClaimedJob>> {
        self.state.lock().claim(worker, sources, heartbeat_ttl, now)
    }

    async fn complete(&self, worker: &WorkerId, job_id: &JobId) -> QueueResult<()> {
        self.state.lock().complete(worker, job_id)
    }

    async fn fail(&self, worker: &WorkerId, job_id: &JobId, failure: Failure) -> QueueResult<JobState> {
        self.state.lock().fail(worker, job_id, failure)
    }

    async fn release(&self, worker: &WorkerId, job_id: &JobId) -> QueueResult<()> {
        self.state.lock().release(worker, job_id)
    }

    async fn renew_heartbeat(&self, token: &HeartbeatToken, ttl: Duration) -> QueueResult<bool> {
        Ok(self.state.lock().renew_heartbeat(token, ttl))
    }

    async fn heartbeat(&self, worker: &WorkerId) -> QueueResult<Option<HeartbeatToken>> {
        let state = self.state.lock();
        Ok(state
            .heartbeats
            .get(worker)
            .filter(|l| l.is_live())
            .map(|l| l.token.clone()))
    }

    async fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize> {
        Ok(self.state.lock().promote_due(now, limit))
    }

    async fn register_worker(&self, worker: &WorkerId, now: DateTime<Utc>) -> QueueResult<()> {
        self.state.lock().registry.insert(worker.clone(), now);
        Ok(())
    }

    async fn list_workers(&self, offset: usize, limit: usize) -> QueueResult<Vec<WorkerId>> {
        Ok(self.state.lock().list_workers(offset, limit))
    }

    async fn worker_count(&self) -> QueueResult<usize> {
        Ok(self.state.lock().registry.len())
    }

    async fn deregister_worker(&self, worker: &WorkerId) -> QueueResult<bool> {
        let mut state = self.state.lock();
        if state.processing.get(worker).map_or(false, |l| !l.is_empty()) {
            return Ok(false);
        }
        state.heartbeats.remove(worker);
        Ok(state.registry.remove(worker).is_some())
    }

    async fn reap_worker(
        &self,
        worker: &WorkerId,
        policy: &ReapPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<ReapOutcome> {
        self.state.lock().reap_worker(worker, policy, now)
    }

    async fn idempotency_begin(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        self.state.lock().idempotency_begin(key, owner, ttl, now)
    }

    async fn idempotency_end(
        &self,
        key: &str,
        result: &serde_json::Value,
        outbox: &[OutboxEntry],
        now: DateTime<Utc>,
    ) -> QueueResult<EndOutcome> {
        Ok(self.state.lock().idempotency_end(key, result, outbox, now))
    }

    async fn idempotency_get(&self, key: &str, now: DateTime<Utc>) -> QueueResult<Option<IdempotencyRecord>> {
        Ok(self.state.lock().idempotency_get(key, now))
    }

    async fn idempotency_release(&self, key: &str) -> QueueResult<bool> {
        Ok(self.state.lock().idempotency_release(key))
    }

    async fn idempotency_cleanup(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<usize> {
        Ok(self.state.lock().idempotency_cleanup(now, limit))
    }

    async fn outbox_claim(&self, reconciler: &str, limit: usize) -> QueueResult<Vec<OutboxEntry>> {
        Ok(self.state.lock().outbox.claim(reconciler, limit))
    }

    async fn outbox_ack(&self, reconciler: &str, entry_id: &str) -> QueueResult<()> {
        self.state.lock().outbox.ack(reconciler, entry_id);
        Ok(())
    }

    async fn outbox_retry(&self, reconciler: &str, entry: &OutboxEntry, park: bool) -> QueueResult<()> {
        self.state.lock().outbox.retry(reconciler, entry, park);
        Ok(())
    }

    async fn outbox_recover(&self, reconciler: &str) -> QueueResult<usize> {
        Ok(self.state.lock().outbox.recover(reconciler))
    }

    async fn job(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn locate(&self, job_id: &JobId, _queue: &str) -> QueueResult<Vec<Container>> {
        Ok(self.state.lock().locate(job_id))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.state.lock().stats())
    }

    async fn dead_letters(&self, offset: usize, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        let state = self.state.lock();
        Ok(state
            .dead_letter
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .filter_map(DeadLetterEntry::from_record)
            .collect())
    }

    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<()> {
        self.state.lock().requeue_dead_letter(job_id)
    }

    async fn purge_dead_letters(&self) -> QueueResult<usize> {
        Ok(self.state.lock().purge_dead_letters())
    }

    async fn purge_all(&self) -> QueueResult<usize> {
        let mut state = self.state.lock();
        let removed = state.jobs.len();
        *state = Keyspace::default();
        Ok(removed)
    }
}
