//! Claim protocol: weighted round-robin over priority tiers on top of the
//! backend's atomic ready-to-processing move.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    backend::{ClaimedJob, QueueBackend, ReadySource},
    backoff::Jitter,
    config::QueueConfig,
    observability::{Counter, ObservabilityLayer},
    types::{JobPriority, PriorityWeights, QueueEvent, WorkerId},
    QueueError, QueueResult,
};

/// Per-tier token buckets.
///
/// A draw from a tier spends one of its tokens. Tiers that still hold
/// tokens are tried first, most urgent first; exhausted tiers follow so
/// a claim never idles while any tier has work. Buckets refill to their
/// weights once every bucket is spent, or when a draw lands on a tier
/// whose bucket is already empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedRoundRobin {
    weights: PriorityWeights,
    tokens: [u32; 3],
}

impl WeightedRoundRobin {
    pub fn new(weights: PriorityWeights) -> Self {
        let mut wrr = Self {
            weights,
            tokens: [0; 3],
        };
        wrr.refill();
        wrr
    }

    pub fn refill(&mut self) {
        for tier in JobPriority::all() {
            self.tokens[tier.index()] = self.weights.weight(*tier);
        }
    }

    pub fn tokens(&self, tier: JobPriority) -> u32 {
        self.tokens[tier.index()]
    }

    /// Tiers in the order the next claim should try them
    pub fn order(&self) -> Vec<JobPriority> {
        let (funded, spent): (Vec<JobPriority>, Vec<JobPriority>) = JobPriority::all()
            .iter()
            .copied()
            .partition(|tier| self.tokens(*tier) > 0);
        funded.into_iter().chain(spent).collect()
    }

    /// Account for a successful draw from `tier`
    pub fn record(&mut self, tier: JobPriority) {
        let slot = tier.index();
        if self.tokens[slot] == 0 {
            self.refill();
        }
        self.tokens[slot] = self.tokens[slot].saturating_sub(1);
        if self.tokens.iter().all(|t| *t == 0) {
            self.refill();
        }
    }
}

/// Claim loop state of one worker
pub struct Claimer {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    worker: WorkerId,
    queues: Vec<String>,
    wrr: WeightedRoundRobin,
    heartbeat_ttl: Duration,
    timeout: Duration,
    poll_interval: Duration,
    poll_jitter: Jitter,
}

impl Claimer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        worker: WorkerId,
        config: &QueueConfig,
    ) -> Self {
        Self {
            backend,
            observability,
            worker,
            queues: config.claim.queues.clone(),
            wrr: WeightedRoundRobin::new(config.claim.weights),
            heartbeat_ttl: config.heartbeat.ttl,
            timeout: config.claim.timeout,
            poll_interval: config.claim.poll_interval,
            poll_jitter: Jitter::Relative(config.claim.poll_jitter),
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn round_robin(&self) -> &WeightedRoundRobin {
        &self.wrr
    }

    /// Candidate ready lists for the next attempt, in preference order
    pub fn sources(&self) -> Vec<ReadySource> {
        self.wrr
            .order()
            .into_iter()
            .flat_map(|tier| {
                self.queues
                    .iter()
                    .map(move |queue| ReadySource::new(queue.clone(), tier))
            })
            .collect()
    }

    /// One atomic claim attempt. A store error means nothing moved.
    #[instrument(skip(self), fields(worker_id = %self.worker))]
    pub async fn claim(&mut self) -> QueueResult<Option<ClaimedJob>> {
        let sources = self.sources();
        let now = Utc::now();
        let claimed = self
            .backend
            .claim(&self.worker, &sources, self.heartbeat_ttl, now)
            .await?;

        if let Some(claimed) = &claimed {
            let priority = claimed.job.priority;
            self.wrr.record(priority);
            self.observability.incr(Counter::Claims);
            self.observability.emit(QueueEvent::Claimed {
                job_id: claimed.job.id.clone(),
                worker_id: self.worker.clone(),
                priority,
                at: now,
            });
            debug!(job_id = %claimed.job.id, %priority, queue = %claimed.job.queue, "Claimed job");
        }
        Ok(claimed)
    }

    /// Poll until a job is claimed or the claim timeout passes.
    ///
    /// Returns [`QueueError::WorkerShutdown`] once `cancel` fires; nothing is
    /// claimed after that.
    pub async fn claim_blocking(
        &mut self,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<ClaimedJob>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::WorkerShutdown);
            }
            if let Some(claimed) = self.claim().await? {
                return Ok(Some(claimed));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let pause = self.poll_jitter.apply(self.poll_interval).min(deadline - now);

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::WorkerShutdown),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
