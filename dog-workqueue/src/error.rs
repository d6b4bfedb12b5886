use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Network, timeout or script failure against the backing store.
    /// Nothing was mutated; the caller retries with backoff.
    #[error("Store error: {0}")]
    Store(String),

    /// The job is no longer owned by this worker (already reaped or released)
    #[error("Ownership lost: job {job} is not owned by worker {worker}")]
    OwnershipLost { worker: String, job: String },

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Begin/End could not be confirmed; the outcome must be treated as unknown
    #[error("Idempotency state unknown for key {key}: {reason}")]
    IdempotencyUnknown { key: String, reason: String },

    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("Audit reason required (min {min} characters)")]
    ReasonRequired { min: usize },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Transient errors are retried at the call site
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Ownership conflicts are fatal to the local task
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, Self::OwnershipLost { .. })
    }

    pub(crate) fn ownership_lost(worker: impl ToString, job: impl ToString) -> Self {
        Self::OwnershipLost {
            worker: worker.to_string(),
            job: job.to_string(),
        }
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - dead-letter immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_taxonomy() {
        assert!(QueueError::Store("timeout".into()).is_transient());
        assert!(!QueueError::Validation("empty queue".into()).is_transient());

        let lost = QueueError::ownership_lost("w-1", "job-1");
        assert!(lost.is_ownership_lost());
        assert_eq!(
            lost.to_string(),
            "Ownership lost: job job-1 is not owned by worker w-1"
        );
    }

    #[test]
    fn job_error_helpers() {
        let err = JobError::retryable("connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.message(), "connection reset");
        assert!(!JobError::permanent("bad input").is_retryable());
    }
}
