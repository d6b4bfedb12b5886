//! Key layout shared by every process touching the store.
//!
//! The Lua scripts of the Redis backend rebuild ready-list and job keys
//! from the namespace with the same formats, so any change here must be
//! mirrored in `backend/redis/lua/`.

use crate::types::{JobId, JobPriority, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    namespace: String,
}

impl Default for KeySchema {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAMESPACE)
    }
}

impl KeySchema {
    pub const DEFAULT_NAMESPACE: &'static str = "jobqueue";

    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// FIFO list of job ids for one queue and tier
    pub fn ready(&self, queue: &str, priority: JobPriority) -> String {
        format!("{}:queue:{}:{}_priority", self.namespace, queue, priority.name())
    }

    /// Sorted set of job ids scored by due time in epoch milliseconds
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    pub fn processing(&self, worker: &WorkerId) -> String {
        format!("{}:worker:{}:processing", self.namespace, worker)
    }

    pub fn heartbeat(&self, worker: &WorkerId) -> String {
        format!("{}:processing:worker:{}", self.namespace, worker)
    }

    /// Sorted set of worker ids scored by last-seen epoch milliseconds
    pub fn registry(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    /// Hash holding the job fields
    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}:dead_letter", self.namespace)
    }

    /// Set of queue names that ever received a job
    pub fn queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idempotency:key:{}", self.namespace, key)
    }

    /// Sorted set of idempotency keys scored by expiry, drives cleanup
    pub fn idempotency_index(&self) -> String {
        format!("{}:idempotency:index", self.namespace)
    }

    pub fn outbox_entries(&self) -> String {
        format!("{}:outbox:entries", self.namespace)
    }

    pub fn outbox_pending(&self) -> String {
        format!("{}:outbox:pending", self.namespace)
    }

    pub fn outbox_inflight(&self, reconciler: &str) -> String {
        format!("{}:outbox:inflight:{}", self.namespace, reconciler)
    }

    pub fn outbox_failed(&self) -> String {
        format!("{}:outbox:failed", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let keys = KeySchema::default();
        let worker = WorkerId::from("host-1-2-ab");
        let job = JobId::from("j-1");

        assert_eq!(keys.ready("emails", JobPriority::High), "jobqueue:queue:emails:high_priority");
        assert_eq!(keys.ready("emails", JobPriority::Low), "jobqueue:queue:emails:low_priority");
        assert_eq!(keys.scheduled(), "jobqueue:scheduled");
        assert_eq!(keys.processing(&worker), "jobqueue:worker:host-1-2-ab:processing");
        assert_eq!(keys.heartbeat(&worker), "jobqueue:processing:worker:host-1-2-ab");
        assert_eq!(keys.registry(), "jobqueue:workers");
        assert_eq!(keys.job(&job), "jobqueue:job:j-1");
        assert_eq!(keys.dead_letter(), "jobqueue:dead_letter");
        assert_eq!(keys.idempotency("order-42"), "jobqueue:idempotency:key:order-42");
        assert_eq!(keys.outbox_inflight("r1"), "jobqueue:outbox:inflight:r1");
    }

    #[test]
    fn namespaces_do_not_collide() {
        let a = KeySchema::new("tenant-a");
        let b = KeySchema::new("tenant-b");
        assert_ne!(a.scheduled(), b.scheduled());
        assert!(a.registry().starts_with("tenant-a:"));
    }
}
