//! Scheduled-set mover: promotes due jobs onto their ready lists.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::QueueBackend,
    backoff::Jitter,
    config::SchedulerConfig,
    observability::{Counter, ObservabilityLayer},
    types::QueueEvent,
    QueueResult,
};

#[derive(Clone)]
pub struct SchedulerMover {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    config: SchedulerConfig,
}

impl SchedulerMover {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            backend,
            observability,
            config,
        }
    }

    /// Atomically move up to `limit` jobs with `due_at <= now` to the tail
    /// of their ready lists. Safe to run from any number of processes.
    pub async fn promote_due(&self, limit: usize, now: DateTime<Utc>) -> QueueResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let moved = self.backend.promote_due(now, limit).await?;
        if moved > 0 {
            self.observability.add(Counter::Promoted, moved as u64);
            self.observability.emit(QueueEvent::Promoted { count: moved, at: now });
            debug!(moved, "Promoted due jobs");
        }
        Ok(moved)
    }

    /// Drain due jobs in batches until a short batch, `max_batches` or the
    /// time budget, whichever comes first
    pub async fn tick(&self) -> QueueResult<usize> {
        let started = Instant::now();
        let mut total = 0;
        for _ in 0..self.config.max_batches.max(1) {
            let moved = self.promote_due(self.config.batch_size, Utc::now()).await?;
            total += moved;
            if moved < self.config.batch_size || started.elapsed() >= self.config.budget {
                break;
            }
        }
        Ok(total)
    }

    /// Run `tick` every jittered interval until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.config.interval, "Scheduler mover started");
        let jitter = Jitter::Relative(self.config.jitter);
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Scheduler tick failed");
            }

            let pause: Duration = jitter.apply(self.config.interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Scheduler mover stopped");
    }
}
