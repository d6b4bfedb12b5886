//! Per-job heartbeat renewal.
//!
//! The claim writes the heartbeat; this module keeps it alive with an
//! owner-checked extend every `interval` (jittered) until the handle is
//! stopped or ownership is lost. Stopping awaits the renewal task, so no
//! renewal can land after the job's terminal transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backend::QueueBackend,
    backoff::Jitter,
    config::HeartbeatConfig,
    observability::{Counter, ObservabilityLayer},
    types::HeartbeatToken,
};

/// Why a renewal task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    Stopped,
    /// The heartbeat no longer carries our token; the reaper owns the job now
    OwnershipLost,
    /// Too many consecutive store errors
    Failed,
    /// The task panicked or was aborted
    Aborted,
}

#[derive(Clone)]
pub struct HeartbeatManager {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    config: HeartbeatConfig,
}

impl HeartbeatManager {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            backend,
            observability,
            config,
        }
    }

    /// Spawn the renewal task for a freshly claimed job
    pub fn start(&self, token: HeartbeatToken) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();

        let renewal = Renewal {
            backend: self.backend.clone(),
            observability: self.observability.clone(),
            token: token.clone(),
            ttl: self.config.ttl,
            interval: self.config.interval,
            jitter: Jitter::Relative(self.config.jitter),
            max_failures: self.config.max_failures.max(1),
        };
        let task = tokio::spawn(renewal.run(stop.clone(), lost.clone()));

        HeartbeatHandle {
            token,
            stop,
            lost,
            task: Some(task),
        }
    }
}

struct Renewal {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    token: HeartbeatToken,
    ttl: Duration,
    interval: Duration,
    jitter: Jitter,
    max_failures: u32,
}

impl Renewal {
    async fn run(self, stop: CancellationToken, lost: CancellationToken) -> HeartbeatExit {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return HeartbeatExit::Stopped,
                _ = tokio::time::sleep(self.jitter.apply(self.interval)) => {}
            }

            match self.backend.renew_heartbeat(&self.token, self.ttl).await {
                Ok(true) => {
                    failures = 0;
                    self.observability.incr(Counter::HeartbeatRenewals);
                    debug!(token = %self.token, "Renewed heartbeat");
                }
                Ok(false) => {
                    self.observability.incr(Counter::OwnershipLost);
                    warn!(
                        worker_id = %self.token.worker(),
                        job_id = ?self.token.job(),
                        "Heartbeat no longer owned, abandoning job"
                    );
                    lost.cancel();
                    return HeartbeatExit::OwnershipLost;
                }
                Err(e) => {
                    failures += 1;
                    self.observability.incr(Counter::HeartbeatFailures);
                    warn!(
                        worker_id = %self.token.worker(),
                        job_id = ?self.token.job(),
                        failures,
                        error = %e,
                        "Heartbeat renewal failed"
                    );
                    if failures >= self.max_failures {
                        lost.cancel();
                        return HeartbeatExit::Failed;
                    }
                }
            }
        }
    }
}

/// Running renewal task of one in-flight job
pub struct HeartbeatHandle {
    token: HeartbeatToken,
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<HeartbeatExit>>,
}

impl HeartbeatHandle {
    pub fn token(&self) -> &HeartbeatToken {
        &self.token
    }

    /// Fires once the job must be treated as lost
    pub fn lost_signal(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Cancel renewal and wait for the task to finish
    pub async fn stop(mut self) -> HeartbeatExit {
        self.stop.cancel();
        let Some(task) = self.task.take() else {
            return HeartbeatExit::Stopped;
        };
        match task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(token = %self.token, error = %e, "Heartbeat task did not exit cleanly");
                HeartbeatExit::Aborted
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
