use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters exported to whatever metrics transport the host wires up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Enqueued,
    Scheduled,
    Claims,
    Completed,
    Released,
    Retried,
    DeadLettered,
    HeartbeatRenewals,
    HeartbeatFailures,
    OwnershipLost,
    ReaperRequeued,
    ReaperDeadLettered,
    WorkersPruned,
    Promoted,
    IdempotencyHits,
    IdempotencyMisses,
    OutboxPublished,
    OutboxFailed,
}

impl Counter {
    pub const ALL: [Counter; 18] = [
        Self::Enqueued,
        Self::Scheduled,
        Self::Claims,
        Self::Completed,
        Self::Released,
        Self::Retried,
        Self::DeadLettered,
        Self::HeartbeatRenewals,
        Self::HeartbeatFailures,
        Self::OwnershipLost,
        Self::ReaperRequeued,
        Self::ReaperDeadLettered,
        Self::WorkersPruned,
        Self::Promoted,
        Self::IdempotencyHits,
        Self::IdempotencyMisses,
        Self::OutboxPublished,
        Self::OutboxFailed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Enqueued => "jobs_enqueued",
            Self::Scheduled => "jobs_scheduled",
            Self::Claims => "claims",
            Self::Completed => "jobs_completed",
            Self::Released => "jobs_released",
            Self::Retried => "jobs_retried",
            Self::DeadLettered => "jobs_dead_lettered",
            Self::HeartbeatRenewals => "heartbeat_renewals",
            Self::HeartbeatFailures => "heartbeat_renewal_failures",
            Self::OwnershipLost => "ownership_lost",
            Self::ReaperRequeued => "reaper_requeued",
            Self::ReaperDeadLettered => "reaper_dead_lettered",
            Self::WorkersPruned => "workers_pruned",
            Self::Promoted => "scheduled_promoted",
            Self::IdempotencyHits => "idempotency_hits",
            Self::IdempotencyMisses => "idempotency_misses",
            Self::OutboxPublished => "outbox_published",
            Self::OutboxFailed => "outbox_failed",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Live counters for queue operations
#[derive(Debug, Default)]
pub struct QueueMetrics {
    counters: [AtomicU64; 18],
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n > 0 {
            self.counters[counter.slot()].fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.slot()].load(Ordering::Relaxed)
    }

    /// Share of `Begin` calls that found an existing record
    pub fn idempotency_hit_rate(&self) -> f64 {
        let hits = self.get(Counter::IdempotencyHits);
        let total = hits + self.get(Counter::IdempotencyMisses);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counter::ALL
                .iter()
                .map(|c| (c.name(), self.get(*c)))
                .collect(),
            idempotency_hit_rate: self.idempotency_hit_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(&'static str, u64)>,
    pub idempotency_hit_rate: f64,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}
