//! Operator actions. Destructive calls fail closed: they need an exact
//! confirmation phrase and a reason, and every one leaves an audit line.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    backend::{QueueBackend, QueueStats},
    observability::ObservabilityLayer,
    types::{DeadLetterEntry, JobId, QueueEvent},
    QueueError, QueueResult,
};

pub const PURGE_DLQ_PHRASE: &str = "CONFIRM_DELETE";
pub const PURGE_ALL_PHRASE: &str = "CONFIRM_DELETE_ALL";

const MIN_REASON: usize = 3;
const MIN_PURGE_ALL_REASON: usize = 10;

#[derive(Clone)]
pub struct Admin {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
}

impl Admin {
    pub fn new(backend: Arc<dyn QueueBackend>, observability: ObservabilityLayer) -> Self {
        Self {
            backend,
            observability,
        }
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.backend.stats().await
    }

    /// Newest dead letters first
    pub async fn peek_dead_letters(&self, offset: usize, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.backend.dead_letters(offset, limit).await
    }

    /// Reset a dead-lettered job's attempts and put it back on its ready list
    pub async fn requeue_dead_letter(&self, job_id: &JobId, reason: &str) -> QueueResult<()> {
        check_reason(reason, MIN_REASON)?;
        self.backend.requeue_dead_letter(job_id).await?;

        if let Some(record) = self.backend.job(job_id).await? {
            self.observability.emit(QueueEvent::Enqueued {
                job_id: job_id.clone(),
                queue: record.job.origin_queue.clone(),
                priority: record.job.priority,
                at: Utc::now(),
            });
        }
        info!(audit = true, action = "requeue_dead_letter", %job_id, reason, "Requeued dead letter");
        Ok(())
    }

    pub async fn purge_dead_letters(&self, confirmation: &str, reason: &str) -> QueueResult<usize> {
        if confirmation != PURGE_DLQ_PHRASE {
            return Err(QueueError::ConfirmationRequired(format!(
                "type {} to purge the dead-letter queue",
                PURGE_DLQ_PHRASE
            )));
        }
        check_reason(reason, MIN_REASON)?;

        let removed = self.backend.purge_dead_letters().await?;
        warn!(audit = true, action = "purge_dead_letters", removed, reason, "Purged dead-letter queue");
        Ok(removed)
    }

    /// Drop every job, list and record in the namespace
    pub async fn purge_all(&self, confirm: bool, confirmation: &str, reason: &str) -> QueueResult<usize> {
        if !confirm || confirmation != PURGE_ALL_PHRASE {
            return Err(QueueError::ConfirmationRequired(format!(
                "set confirm and type {} to purge all queue data",
                PURGE_ALL_PHRASE
            )));
        }
        check_reason(reason, MIN_PURGE_ALL_REASON)?;

        let removed = self.backend.purge_all().await?;
        warn!(
            audit = true,
            action = "purge_all",
            namespace = self.backend.keys().namespace(),
            removed,
            reason,
            "Purged all queue data"
        );
        Ok(removed)
    }
}

fn check_reason(reason: &str, min: usize) -> QueueResult<()> {
    if reason.trim().chars().count() < min {
        return Err(QueueError::ReasonRequired { min });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{memory::MemoryBackend, ReadySource};
    use crate::types::{Failure, JobPriority, NewJob, WorkerId};
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn admin(backend: &MemoryBackend) -> Admin {
        Admin::new(Arc::new(backend.clone()), ObservabilityLayer::new())
    }

    async fn dead_letter(backend: &MemoryBackend) -> JobId {
        let job = NewJob::new("default", json!({}))
            .with_max_attempts(1)
            .into_job(3, 1024, Utc::now())
            .unwrap();
        backend.enqueue(&job).await.unwrap();
        let worker = WorkerId::from("w");
        backend
            .claim(
                &worker,
                &[ReadySource::new("default", JobPriority::Medium)],
                Duration::from_secs(30),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        backend
            .fail(&worker, &job.id, Failure::new("boom", Utc::now()).permanent())
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn purge_requires_phrase_and_reason() {
        let backend = MemoryBackend::new();
        dead_letter(&backend).await;
        let admin = admin(&backend);

        let err = admin.purge_dead_letters("yes", "cleanup").await.unwrap_err();
        assert!(matches!(err, QueueError::ConfirmationRequired(_)));
        let err = admin.purge_dead_letters(PURGE_DLQ_PHRASE, "  ").await.unwrap_err();
        assert!(matches!(err, QueueError::ReasonRequired { min: 3 }));
        assert_eq!(backend.stats().await.unwrap().dead_letter, 1);

        assert_eq!(admin.purge_dead_letters(PURGE_DLQ_PHRASE, "cleanup").await.unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().dead_letter, 0);
    }

    #[tokio::test]
    async fn purge_all_needs_every_guard() {
        let backend = MemoryBackend::new();
        dead_letter(&backend).await;
        let admin = admin(&backend);

        assert!(admin.purge_all(false, PURGE_ALL_PHRASE, "staging reset").await.is_err());
        assert!(admin.purge_all(true, PURGE_DLQ_PHRASE, "staging reset").await.is_err());
        let err = admin.purge_all(true, PURGE_ALL_PHRASE, "reset").await.unwrap_err();
        assert!(matches!(err, QueueError::ReasonRequired { min: 10 }));

        assert_eq!(admin.purge_all(true, PURGE_ALL_PHRASE, "staging reset").await.unwrap(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn requeue_resets_attempts_and_audits() {
        let backend = MemoryBackend::new();
        let id = dead_letter(&backend).await;

        admin(&backend).requeue_dead_letter(&id, "fixed upstream").await.unwrap();

        let record = backend.job(&id).await.unwrap().unwrap();
        assert_eq!(record.job.attempts, 0);
        assert_eq!(backend.ready_jobs("default", JobPriority::Medium), vec![id]);
        assert!(logs_contain("Requeued dead letter"));
    }
}
