use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobPriority, JobState};
use crate::{QueueError, QueueResult};

/// Largest queue name accepted at enqueue
pub const MAX_QUEUE_NAME_LEN: usize = 128;

/// A unit of work as persisted in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    /// Failed or reaped executions so far
    pub attempts: u32,
    /// Retries allowed before dead-lettering
    pub max_attempts: u32,
    /// Set once at enqueue; the reaper requeues into this queue
    pub origin_queue: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Failures that can still be absorbed by a requeue
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Producer-side description of a job, validated into a [`Job`] at enqueue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
    pub id: Option<JobId>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            priority: JobPriority::default(),
            payload,
            max_attempts: None,
            idempotency_key: None,
            id: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Use a caller-chosen id instead of a fresh uuid
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Validate and stamp the job. Nothing is defaulted silently except the
    /// retry budget, which falls back to the configured maximum.
    pub fn into_job(
        self,
        default_max_attempts: u32,
        max_payload_bytes: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        validate_queue_name(&self.queue)?;

        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let size = serde_json::to_vec(&self.payload)?.len();
        if size > max_payload_bytes {
            return Err(QueueError::PayloadTooLarge {
                size,
                max: max_payload_bytes,
            });
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(QueueError::Validation(
                    "idempotency key must not be blank".to_string(),
                ));
            }
        }

        let id = self.id.unwrap_or_default();
        if id.as_str().is_empty() || id.as_str().contains('|') {
            return Err(QueueError::Validation(format!("invalid job id: {:?}", id.as_str())));
        }

        Ok(Job {
            id,
            origin_queue: self.queue.clone(),
            queue: self.queue,
            priority: self.priority,
            payload: self.payload,
            attempts: 0,
            max_attempts,
            enqueued_at: now,
            idempotency_key: self.idempotency_key,
            last_error: None,
        })
    }
}

pub fn validate_queue_name(name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::Validation("queue name must not be empty".to_string()));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::Validation(format!(
            "queue name longer than {} bytes",
            MAX_QUEUE_NAME_LEN
        )));
    }
    if name.chars().any(|c| c == ':' || c == '|' || c.is_whitespace()) {
        return Err(QueueError::Validation(format!(
            "queue name {:?} contains a reserved character",
            name
        )));
    }
    Ok(())
}

/// A job together with the container it currently sits in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub state: JobState,
}

/// Terminal view of a dead-lettered job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl DeadLetterEntry {
    pub fn from_record(record: JobRecord) -> Option<Self> {
        match record.state {
            JobState::DeadLetter { reason, failed_at } => Some(Self {
                retry_count: record.job.attempts,
                job: record.job,
                reason,
                failed_at,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn into_job_stamps_origin_queue() {
        let now = Utc::now();
        let job = NewJob::new("emails", json!({"to": "a@b.c"}))
            .with_priority(JobPriority::High)
            .into_job(3, 1024, now)
            .unwrap();

        assert_eq!(job.origin_queue, "emails");
        assert_eq!(job.queue, "emails");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.enqueued_at, now);
        assert_eq!(job.remaining_attempts(), 3);
    }

    #[test]
    fn rejects_malformed_jobs() {
        let now = Utc::now();
        let bad_queue = NewJob::new("a:b", json!(null)).into_job(3, 1024, now);
        assert!(matches!(bad_queue, Err(QueueError::Validation(_))));

        let empty = NewJob::new("", json!(null)).into_job(3, 1024, now);
        assert!(matches!(empty, Err(QueueError::Validation(_))));

        let zero = NewJob::new("q", json!(null))
            .with_max_attempts(0)
            .into_job(3, 1024, now);
        assert!(matches!(zero, Err(QueueError::Validation(_))));

        let big = NewJob::new("q", json!("x".repeat(64))).into_job(3, 16, now);
        assert!(matches!(big, Err(QueueError::PayloadTooLarge { max: 16, .. })));

        let blank_key = NewJob::new("q", json!(1))
            .with_idempotency_key("  ")
            .into_job(3, 1024, now);
        assert!(matches!(blank_key, Err(QueueError::Validation(_))));
    }
}
