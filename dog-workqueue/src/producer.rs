use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::{
    backend::QueueBackend,
    observability::{Counter, ObservabilityLayer},
    types::{Job, JobId, NewJob, QueueEvent},
    QueueResult,
};

/// Validates jobs and places them in ready lists or the scheduled set
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    default_max_attempts: u32,
    max_payload_bytes: usize,
}

impl Producer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        default_max_attempts: u32,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            backend,
            observability,
            default_max_attempts,
            max_payload_bytes,
        }
    }

    fn prepare(&self, new_job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        new_job.into_job(self.default_max_attempts, self.max_payload_bytes, now)
    }

    /// Append a job to the tail of its ready list
    #[instrument(skip(self, new_job), fields(queue = %new_job.queue, priority = %new_job.priority))]
    pub async fn enqueue(&self, new_job: NewJob) -> QueueResult<JobId> {
        let now = Utc::now();
        let job = self.prepare(new_job, now)?;
        self.backend.enqueue(&job).await?;

        self.observability.incr(Counter::Enqueued);
        self.observability.emit(QueueEvent::Enqueued {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            priority: job.priority,
            at: now,
        });
        info!(job_id = %job.id, "Enqueued job");
        Ok(job.id)
    }

    /// Park a job until `due_at`; a past `due_at` is promoted on the next tick
    #[instrument(skip(self, new_job), fields(queue = %new_job.queue, %due_at))]
    pub async fn schedule(&self, new_job: NewJob, due_at: DateTime<Utc>) -> QueueResult<JobId> {
        let now = Utc::now();
        let job = self.prepare(new_job, now)?;
        self.backend.schedule(&job, due_at).await?;

        self.observability.incr(Counter::Scheduled);
        self.observability.emit(QueueEvent::Scheduled {
            job_id: job.id.clone(),
            due_at,
            at: now,
        });
        info!(job_id = %job.id, "Scheduled job");
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::types::JobPriority;
    use crate::QueueError;
    use serde_json::json;

    fn producer(backend: &MemoryBackend) -> Producer {
        Producer::new(Arc::new(backend.clone()), ObservabilityLayer::new(), 3, 64)
    }

    #[tokio::test]
    async fn stamps_origin_queue_and_default_budget() {
        let backend = MemoryBackend::new();
        let id = producer(&backend)
            .enqueue(NewJob::new("emails", json!({"to": "a@b.c"})).with_priority(JobPriority::High))
            .await
            .unwrap();

        let record = backend.job(&id).await.unwrap().unwrap();
        assert_eq!(record.job.origin_queue, "emails");
        assert_eq!(record.job.max_attempts, 3);
        assert_eq!(backend.ready_jobs("emails", JobPriority::High), vec![id]);
    }

    #[tokio::test]
    async fn rejects_invalid_jobs_without_writing() {
        let backend = MemoryBackend::new();
        let producer = producer(&backend);

        let err = producer.enqueue(NewJob::new("", json!({}))).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let big = json!({"blob": "x".repeat(100)});
        let err = producer.enqueue(NewJob::new("q", big)).await.unwrap_err();
        assert!(matches!(err, QueueError::PayloadTooLarge { max: 64, .. }));

        let err = producer
            .enqueue(NewJob::new("q", json!({})).with_max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        assert_eq!(backend.stats().await.unwrap().ready_total(), 0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let backend = MemoryBackend::new();
        let producer = producer(&backend);
        producer.enqueue(NewJob::new("q", json!({})).with_id("fixed")).await.unwrap();
        let err = producer
            .schedule(NewJob::new("q", json!({})).with_id("fixed"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }
}
