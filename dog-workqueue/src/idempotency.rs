//! Idempotency ledger and outbox reconciliation.
//!
//! `begin` reserves a key, `end` finalizes it and stages outbox entries in
//! the same atomic step. The reconciler later publishes staged entries;
//! a crash between publish and ack republishes the entry with the same
//! id, so publishers deduplicate on [`OutboxEntry::id`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::QueueBackend,
    config::{IdempotencyConfig, OutboxConfig},
    error::JobError,
    observability::{Counter, ObservabilityLayer},
    types::{BeginOutcome, EndOutcome, IdempotencyRecord, OutboxEntry},
    QueueError, QueueResult,
};

/// Result of [`IdempotencyManager::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The operation ran and its outcome was recorded
    Completed { result: serde_json::Value },
    /// Another caller holds or finished the key; nothing ran
    Duplicate { record: Option<IdempotencyRecord> },
    /// The operation failed and the reservation was released
    Failed(JobError),
}

#[derive(Clone)]
pub struct IdempotencyManager {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    config: IdempotencyConfig,
}

impl IdempotencyManager {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            backend,
            observability,
            config,
        }
    }

    /// Reserve `key`. `ttl` falls back to the configured default.
    pub async fn begin(&self, key: &str, ttl: Option<Duration>) -> QueueResult<BeginOutcome> {
        self.reserve(key, None, ttl).await
    }

    /// Reserve `key` on behalf of `owner`, readable later through
    /// [`IdempotencyRecord::owner`]
    pub async fn begin_as(&self, key: &str, owner: &str, ttl: Option<Duration>) -> QueueResult<BeginOutcome> {
        self.reserve(key, Some(owner), ttl).await
    }

    #[instrument(skip(self))]
    async fn reserve(&self, key: &str, owner: Option<&str>, ttl: Option<Duration>) -> QueueResult<BeginOutcome> {
        check_key(key)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let duplicate = self
            .backend
            .idempotency_begin(key, owner, ttl, Utc::now())
            .await
            .map_err(|e| unknown(key, e))?;

        if duplicate {
            self.observability.incr(Counter::IdempotencyHits);
            debug!(key, "Duplicate idempotency key");
        } else {
            self.observability.incr(Counter::IdempotencyMisses);
        }
        Ok(BeginOutcome { duplicate })
    }

    /// Finalize `key` with `result` and stage `outbox` atomically
    #[instrument(skip(self, result, outbox), fields(outbox = outbox.len()))]
    pub async fn end(
        &self,
        key: &str,
        result: &serde_json::Value,
        outbox: &[OutboxEntry],
    ) -> QueueResult<EndOutcome> {
        check_key(key)?;
        let outcome = self
            .backend
            .idempotency_end(key, result, outbox, Utc::now())
            .await
            .map_err(|e| unknown(key, e))?;

        match outcome {
            EndOutcome::Recorded => debug!(key, "Recorded idempotent result"),
            EndOutcome::AlreadyDone => debug!(key, "Idempotency key already finalized"),
            EndOutcome::Missing => warn!(key, "No reservation to finalize, record expired or was released"),
        }
        Ok(outcome)
    }

    pub async fn get(&self, key: &str) -> QueueResult<Option<IdempotencyRecord>> {
        check_key(key)?;
        self.backend
            .idempotency_get(key, Utc::now())
            .await
            .map_err(|e| unknown(key, e))
    }

    /// Drop an in-progress reservation so a later attempt may run
    pub async fn release(&self, key: &str) -> QueueResult<bool> {
        check_key(key)?;
        self.backend
            .idempotency_release(key)
            .await
            .map_err(|e| unknown(key, e))
    }

    /// Remove up to `limit` expired records
    pub async fn cleanup(&self, limit: usize) -> QueueResult<usize> {
        let removed = self.backend.idempotency_cleanup(Utc::now(), limit).await?;
        if removed > 0 {
            debug!(removed, "Removed expired idempotency records");
        }
        Ok(removed)
    }

    /// Run `op` at most once per key.
    ///
    /// A failed run releases the reservation; a store error at any step is
    /// returned as [`QueueError::IdempotencyUnknown`] and the caller retries
    /// the whole call.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        op: F,
    ) -> QueueResult<Execution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(serde_json::Value, Vec<OutboxEntry>), JobError>>,
    {
        if self.begin(key, ttl).await?.duplicate {
            let record = self.get(key).await?;
            return Ok(Execution::Duplicate { record });
        }

        match op().await {
            Ok((result, outbox)) => {
                self.end(key, &result, &outbox).await?;
                Ok(Execution::Completed { result })
            }
            Err(e) => {
                self.release(key).await?;
                Ok(Execution::Failed(e))
            }
        }
    }

    pub async fn run_cleanup(self, cancel: CancellationToken) {
        info!(interval = ?self.config.cleanup_interval, "Idempotency cleanup started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.cleanup_interval) => {}
            }
            loop {
                match self.cleanup(self.config.cleanup_batch).await {
                    Ok(removed) if removed >= self.config.cleanup_batch => continue,
                    Ok(_) => break,
                    Err(e) => {
                        warn!(error = %e, "Idempotency cleanup failed");
                        break;
                    }
                }
            }
        }
        info!("Idempotency cleanup stopped");
    }
}

fn check_key(key: &str) -> QueueResult<()> {
    if key.trim().is_empty() {
        return Err(QueueError::Validation(
            "idempotency key must not be blank".to_string(),
        ));
    }
    Ok(())
}

fn unknown(key: &str, err: QueueError) -> QueueError {
    match err {
        QueueError::Store(reason) => QueueError::IdempotencyUnknown {
            key: key.to_string(),
            reason,
        },
        other => other,
    }
}

/// Delivers staged side effects to their destination
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// A `Permanent` error parks the entry at once; `Retryable` consumes
    /// one publish attempt.
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), JobError>;
}

/// Totals of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub published: usize,
    pub retried: usize,
    pub parked: usize,
}

#[derive(Clone)]
pub struct OutboxReconciler {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    publisher: Arc<dyn OutboxPublisher>,
    config: OutboxConfig,
}

impl OutboxReconciler {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        publisher: Arc<dyn OutboxPublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            backend,
            observability,
            publisher,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.reconciler_id
    }

    /// Return entries this reconciler claimed before a crash
    pub async fn recover(&self) -> QueueResult<usize> {
        let recovered = self.backend.outbox_recover(self.id()).await?;
        if recovered > 0 {
            info!(reconciler = self.id(), recovered, "Recovered in-flight outbox entries");
        }
        Ok(recovered)
    }

    /// Publish one batch of pending entries
    #[instrument(skip(self), fields(reconciler = %self.config.reconciler_id))]
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        let entries = self
            .backend
            .outbox_claim(self.id(), self.config.batch_size)
            .await?;
        let mut report = DrainReport::default();

        for entry in entries {
            match self.publisher.publish(&entry).await {
                Ok(()) => {
                    self.backend.outbox_ack(self.id(), &entry.id).await?;
                    self.observability.incr(Counter::OutboxPublished);
                    report.published += 1;
                }
                Err(e) => {
                    let mut entry = entry;
                    entry.attempts += 1;
                    entry.last_error = Some(e.message().to_string());
                    let park = !e.is_retryable() || entry.attempts >= self.config.max_attempts;
                    self.backend.outbox_retry(self.id(), &entry, park).await?;
                    self.observability.incr(Counter::OutboxFailed);

                    if park {
                        report.parked += 1;
                        warn!(
                            entry_id = %entry.id,
                            key = %entry.idempotency_key,
                            attempts = entry.attempts,
                            error = %e,
                            "Outbox entry parked"
                        );
                    } else {
                        report.retried += 1;
                        debug!(entry_id = %entry.id, attempts = entry.attempts, error = %e, "Outbox publish failed");
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(reconciler = self.id(), "Outbox reconciler started");
        if let Err(e) = self.recover().await {
            warn!(error = %e, "Outbox recovery failed, retrying on next tick");
        }

        loop {
            match self.drain().await {
                // a full batch usually means more is waiting
                Ok(report) if report.published + report.retried + report.parked >= self.config.batch_size => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Outbox drain failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!(reconciler = self.id(), "Outbox reconciler stopped");
    }
}
