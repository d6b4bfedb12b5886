//! Recovery of jobs held by workers whose heartbeat expired.
//!
//! Workers are discovered only through the registry, one page at a time.
//! Liveness is re-checked inside the backend's atomic reap step, so a
//! stale page never causes a live worker to lose its job.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{QueueBackend, ReapPolicy},
    backoff::{Backoff, Jitter},
    config::{ReaperConfig, RetryConfig},
    observability::{Counter, ObservabilityLayer},
    types::QueueEvent,
    QueueResult,
};

/// Totals of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub workers_scanned: usize,
    /// Dead workers whose registry entry was removed
    pub workers_reaped: usize,
    /// Workers whose reap failed; retried next sweep
    pub failed_workers: usize,
    /// Sweep stopped early on the page budget
    pub truncated: bool,
}

#[derive(Clone)]
pub struct Reaper {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    config: ReaperConfig,
    policy: ReapPolicy,
}

impl Reaper {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        config: ReaperConfig,
        retry: &RetryConfig,
    ) -> Self {
        let policy = ReapPolicy {
            backoff: config
                .requeue_with_backoff
                .then(|| Backoff::from_config(retry)),
            ..ReapPolicy::default()
        };
        Self {
            backend,
            observability,
            config,
            policy,
        }
    }

    pub fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    /// One pass over the registry. Idempotent: re-sweeping an already
    /// reaped worker finds nothing to do.
    pub async fn sweep(&self) -> QueueResult<SweepReport> {
        let page_size = self.config.page_size.max(1);
        let pause = Jitter::Relative(self.config.page_jitter);
        let mut report = SweepReport::default();
        let mut offset = 0;

        loop {
            let page = self.backend.list_workers(offset, page_size).await?;
            if page.is_empty() {
                break;
            }

            let page_started = Instant::now();
            let mut removed = 0;
            for worker in &page {
                if page_started.elapsed() >= self.config.page_budget {
                    warn!(
                        scanned = report.workers_scanned,
                        budget = ?self.config.page_budget,
                        "Reaper page over budget, deferring rest to next sweep"
                    );
                    report.truncated = true;
                    break;
                }
                report.workers_scanned += 1;

                match self.backend.reap_worker(worker, &self.policy, Utc::now()).await {
                    Ok(outcome) if outcome.alive => {}
                    Ok(outcome) => {
                        removed += 1;
                        report.workers_reaped += 1;
                        report.requeued += outcome.requeued.len();
                        report.dead_lettered += outcome.dead_lettered.len();

                        self.observability.incr(Counter::WorkersPruned);
                        self.observability
                            .add(Counter::ReaperRequeued, outcome.requeued.len() as u64);
                        self.observability
                            .add(Counter::ReaperDeadLettered, outcome.dead_lettered.len() as u64);

                        let now = Utc::now();
                        for job_id in &outcome.dead_lettered {
                            self.observability.emit(QueueEvent::DeadLettered {
                                job_id: job_id.clone(),
                                reason: self.policy.reason.clone(),
                                at: now,
                            });
                        }
                        self.observability.emit(QueueEvent::WorkerReaped {
                            worker_id: worker.clone(),
                            requeued: outcome.requeued.len(),
                            dead_lettered: outcome.dead_lettered.len(),
                            at: now,
                        });

                        if outcome.requeued.is_empty() && outcome.dead_lettered.is_empty() {
                            debug!(worker_id = %worker, "Pruned idle worker");
                        } else {
                            info!(
                                worker_id = %worker,
                                requeued = ?outcome.requeued,
                                dead_lettered = ?outcome.dead_lettered,
                                "Recovered jobs of dead worker"
                            );
                        }
                    }
                    Err(e) => {
                        report.failed_workers += 1;
                        warn!(worker_id = %worker, error = %e, "Reap failed, retrying next sweep");
                    }
                }
            }

            if report.truncated || page.len() < page_size {
                break;
            }
            // reaped workers left the registry, so the next page shifts back
            offset += page.len() - removed;
            tokio::time::sleep(pause.apply(self.config.page_delay)).await;
        }

        if report.workers_reaped > 0 || report.failed_workers > 0 {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                workers_reaped = report.workers_reaped,
                failed_workers = report.failed_workers,
                "Reaper sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.config.interval, "Reaper started");
        let jitter = Jitter::Relative(self.config.page_jitter);
        loop {
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "Reaper sweep failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jitter.apply(self.config.interval)) => {}
            }
        }
        info!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{memory::MemoryBackend, ReadySource};
    use crate::types::{JobPriority, JobState, NewJob, WorkerId};
    use serde_json::json;
    use std::time::Duration;

    fn reaper(backend: &MemoryBackend, config: ReaperConfig) -> Reaper {
        Reaper::new(
            Arc::new(backend.clone()),
            ObservabilityLayer::new(),
            config,
            &RetryConfig::default(),
        )
    }

    async fn claim_one(backend: &MemoryBackend, worker: &WorkerId, max_attempts: u32) {
        let job = NewJob::new("default", json!({}))
            .with_priority(JobPriority::High)
            .with_max_attempts(max_attempts)
            .into_job(3, 1024, Utc::now())
            .unwrap();
        backend.enqueue(&job).await.unwrap();
        backend
            .claim(
                worker,
                &[ReadySource::new("default", JobPriority::High)],
                Duration::from_secs(30),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn requeues_and_dead_letters_orphans() {
        let backend = MemoryBackend::new();
        let a = WorkerId::from("a");
        let b = WorkerId::from("b");
        claim_one(&backend, &a, 3).await;
        claim_one(&backend, &b, 1).await;
        // b's job has already used its budget once
        let held = backend.processing_jobs(&b)[0].clone();
        backend
            .fail(&b, &held, crate::types::Failure::new("boom", Utc::now()))
            .await
            .unwrap();
        backend
            .claim(
                &b,
                &[ReadySource::new("default", JobPriority::High)],
                Duration::from_secs(30),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();

        backend.expire_heartbeat(&a);
        backend.expire_heartbeat(&b);

        let report = reaper(&backend, ReaperConfig::default()).sweep().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.workers_reaped, 2);
        assert_eq!(backend.worker_count().await.unwrap(), 0);

        let record = backend.job(&held).await.unwrap().unwrap();
        assert!(matches!(record.state, JobState::DeadLetter { .. }));
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let backend = MemoryBackend::new();
        let a = WorkerId::from("a");
        claim_one(&backend, &a, 3).await;
        backend.expire_heartbeat(&a);

        let reaper = reaper(&backend, ReaperConfig::default());
        assert_eq!(reaper.sweep().await.unwrap().requeued, 1);
        let again = reaper.sweep().await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn pages_through_registry_while_pruning() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        for i in 0..7 {
            let worker = WorkerId::from(format!("idle-{}", i));
            backend
                .register_worker(&worker, now + chrono::Duration::milliseconds(i))
                .await
                .unwrap();
        }
        let live = WorkerId::from("live");
        claim_one(&backend, &live, 3).await;

        let config = ReaperConfig {
            page_size: 3,
            page_delay: Duration::from_millis(1),
            ..ReaperConfig::default()
        };
        let report = reaper(&backend, config).sweep().await.unwrap();
        assert_eq!(report.workers_reaped, 7);
        assert_eq!(report.workers_scanned, 8);
        assert_eq!(
            backend.list_workers(0, 10).await.unwrap(),
            vec![live.clone()]
        );
        assert_eq!(backend.processing_jobs(&live).len(), 1);
    }

    #[tokio::test]
    async fn backoff_policy_requeues_through_scheduled_set() {
        let backend = MemoryBackend::new();
        let a = WorkerId::from("a");
        claim_one(&backend, &a, 3).await;
        backend.expire_heartbeat(&a);

        let config = ReaperConfig {
            requeue_with_backoff: true,
            ..ReaperConfig::default()
        };
        let report = reaper(&backend, config).sweep().await.unwrap();
        assert_eq!(report.requeued, 1);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.ready_total(), 0);
    }
}
