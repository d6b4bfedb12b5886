use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobPriority, WorkerId};

/// Lifecycle events broadcast for observers (dashboards, exporters)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueEvent {
    Enqueued {
        job_id: JobId,
        queue: String,
        priority: JobPriority,
        at: DateTime<Utc>,
    },

    Scheduled {
        job_id: JobId,
        due_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    Claimed {
        job_id: JobId,
        worker_id: WorkerId,
        priority: JobPriority,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },

    Released {
        job_id: JobId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },

    /// Worker-reported failure that will be retried
    Retrying {
        job_id: JobId,
        attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },

    DeadLettered {
        job_id: JobId,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Due jobs moved from the scheduled set into ready lists
    Promoted { count: usize, at: DateTime<Utc> },

    /// A dead worker's registry entry and in-flight jobs were recovered
    WorkerReaped {
        worker_id: WorkerId,
        requeued: usize,
        dead_lettered: usize,
        at: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Scheduled { .. } => "scheduled",
            Self::Claimed { .. } => "claimed",
            Self::Completed { .. } => "completed",
            Self::Released { .. } => "released",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Promoted { .. } => "promoted",
            Self::WorkerReaped { .. } => "worker_reaped",
        }
    }

    /// Job the event is about, if it concerns a single job
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Scheduled { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Released { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::DeadLettered { job_id, .. } => Some(job_id),
            Self::Promoted { .. } | Self::WorkerReaped { .. } => None,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Scheduled { at, .. }
            | Self::Claimed { at, .. }
            | Self::Completed { at, .. }
            | Self::Released { at, .. }
            | Self::Retrying { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Promoted { at, .. }
            | Self::WorkerReaped { at, .. } => at,
        }
    }
}
