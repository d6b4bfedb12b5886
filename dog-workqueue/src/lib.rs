//! # dog-workqueue: Distributed Priority Work Queue
//!
//! **Reliability engine for at-least-once (optionally exactly-once) job delivery**
//!
//! dog-workqueue moves jobs between store-side containers using only atomic
//! store primitives. No distributed locks are involved.
//!
//! ## Guarantees
//!
//! - **Atomic claims**: a job moves from a ready list into exactly one worker's
//!   processing list, and the worker's heartbeat is written in the same step
//! - **Weighted round-robin**: High/Medium/Low tiers are drawn 8:2:1 by default,
//!   and no tier starves
//! - **Owner-checked heartbeats**: only the current owner can extend a heartbeat,
//!   so a reaped job is never "un-reaped"
//! - **Registry-driven reaper**: orphaned jobs are requeued or dead-lettered,
//!   page by page, without ever scanning the keyspace
//! - **Scheduled jobs**: due jobs are promoted atomically, exactly once
//! - **Idempotency + outbox**: results and side effects commit together, and a
//!   reconciler drains staged effects after a crash
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_workqueue::prelude::*;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn handle(&self, job: &Job, _ctx: &JobContext) -> Result<JobOutput, JobError> {
//!         let to = job.payload["to"].as_str().ok_or_else(|| JobError::permanent("missing to"))?;
//!         Ok(JobOutput::new(serde_json::json!({ "sent_to": to })))
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let engine = QueueEngine::new(Arc::new(MemoryBackend::new()), QueueConfig::default())?;
//!
//! engine
//!     .producer()
//!     .enqueue(
//!         NewJob::new("default", serde_json::json!({ "to": "ops@example.com" }))
//!             .with_priority(JobPriority::High)
//!             .with_idempotency_key("welcome-42"),
//!     )
//!     .await?;
//!
//! let cancel = CancellationToken::new();
//! let maintenance = engine.spawn_maintenance(cancel.clone(), None);
//! let workers = engine.worker_pool(Arc::new(SendEmail)).spawn();
//!
//! // ... later
//! workers.shutdown().await?;
//! cancel.cancel();
//! for task in maintenance {
//!     let _ = task.await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod backoff;
pub mod claim;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod idempotency;
pub mod keys;
pub mod observability;
pub mod producer;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use admin::{Admin, PURGE_ALL_PHRASE, PURGE_DLQ_PHRASE};
pub use backend::{ClaimedJob, QueueBackend, QueueStats, ReadySource, ReapOutcome, ReapPolicy};
pub use backend::memory::MemoryBackend;
pub use backoff::{Backoff, Jitter};
pub use claim::{Claimer, WeightedRoundRobin};
pub use config::QueueConfig;
pub use engine::QueueEngine;
pub use error::{JobError, QueueError, QueueResult};
pub use heartbeat::{HeartbeatExit, HeartbeatHandle, HeartbeatManager};
pub use idempotency::{DrainReport, Execution, IdempotencyManager, OutboxPublisher, OutboxReconciler};
pub use keys::KeySchema;
pub use observability::{Counter, MetricsSnapshot, ObservabilityLayer, QueueMetrics};
pub use producer::Producer;
pub use reaper::{Reaper, SweepReport};
pub use registry::WorkerRegistry;
pub use scheduler::SchedulerMover;
pub use types::{
    Container, DeadLetterEntry, EndOutcome, Failure, HeartbeatToken, IdempotencyRecord,
    IdempotencyStatus, Job, JobId, JobPriority, JobRecord, JobState, NewJob, OutboxEntry,
    PriorityWeights, QueueEvent, WorkerId,
};
pub use worker::{JobContext, JobHandler, JobOutput, Worker, WorkerHandle, WorkerPool};

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to produce jobs and run workers
pub mod prelude {
    pub use crate::{
        JobContext, JobError, JobHandler, JobOutput, QueueEngine, QueueError, QueueResult,
    };

    pub use crate::{Job, JobId, JobPriority, NewJob, OutboxEntry, QueueConfig, WorkerId};

    pub use crate::{MemoryBackend, QueueBackend};

    #[cfg(feature = "redis")]
    pub use crate::RedisBackend;

    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
