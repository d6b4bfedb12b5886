//! Store-backed worker registry.
//!
//! The store is the only source of truth. The local snapshot returned by
//! [`WorkerRegistry::cached_list`] is advisory: it may be stale for up to
//! its TTL and is never consulted before a destructive decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{backend::QueueBackend, types::WorkerId, QueueResult};

const LIST_PAGE: usize = 500;

struct Snapshot {
    workers: Vec<WorkerId>,
    taken_at: Instant,
}

#[derive(Clone)]
pub struct WorkerRegistry {
    backend: Arc<dyn QueueBackend>,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<Snapshot>>>,
}

impl WorkerRegistry {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self::with_cache_ttl(backend, Duration::from_secs(1))
    }

    pub fn with_cache_ttl(backend: Arc<dyn QueueBackend>, cache_ttl: Duration) -> Self {
        Self {
            backend,
            cache_ttl,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Add or refresh `worker`'s entry
    pub async fn register(&self, worker: &WorkerId) -> QueueResult<()> {
        self.backend.register_worker(worker, Utc::now()).await?;
        self.invalidate();
        info!(worker_id = %worker, "Worker registered");
        Ok(())
    }

    /// Remove the entry on graceful exit. Returns false when the worker
    /// still holds jobs; the reaper settles those once its heartbeat lapses.
    pub async fn deregister(&self, worker: &WorkerId) -> QueueResult<bool> {
        let removed = self.backend.deregister_worker(worker).await?;
        self.invalidate();
        if removed {
            info!(worker_id = %worker, "Worker deregistered");
        } else {
            debug!(worker_id = %worker, "Worker left registry entry for the reaper");
        }
        Ok(removed)
    }

    /// Every registered worker, read from the store in pages
    pub async fn list(&self) -> QueueResult<Vec<WorkerId>> {
        let mut workers = Vec::new();
        loop {
            let page = self.backend.list_workers(workers.len(), LIST_PAGE).await?;
            let done = page.len() < LIST_PAGE;
            workers.extend(page);
            if done {
                break;
            }
        }
        *self.cache.write() = Some(Snapshot {
            workers: workers.clone(),
            taken_at: Instant::now(),
        });
        Ok(workers)
    }

    pub async fn page(&self, offset: usize, limit: usize) -> QueueResult<Vec<WorkerId>> {
        self.backend.list_workers(offset, limit).await
    }

    pub async fn count(&self) -> QueueResult<usize> {
        self.backend.worker_count().await
    }

    /// Advisory view for dashboards; refetched once older than the TTL
    pub async fn cached_list(&self) -> QueueResult<Vec<WorkerId>> {
        let fresh = self
            .cache
            .read()
            .as_ref()
            .filter(|s| s.taken_at.elapsed() < self.cache_ttl)
            .map(|s| s.workers.clone());
        match fresh {
            Some(workers) => Ok(workers),
            None => self.list().await,
        }
    }

    fn invalidate(&self) {
        *self.cache.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn register_list_deregister() {
        let backend = MemoryBackend::new();
        let registry = WorkerRegistry::new(Arc::new(backend));
        let a = WorkerId::from("a");
        let b = WorkerId::from("b");

        registry.register(&a).await.unwrap();
        registry.register(&b).await.unwrap();
        registry.register(&a).await.unwrap();
        assert_eq!(registry.count().await.unwrap(), 2);
        let mut listed = registry.list().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec![a.clone(), b.clone()]);

        assert!(registry.deregister(&a).await.unwrap());
        assert_eq!(registry.list().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn cached_list_is_advisory() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = WorkerRegistry::with_cache_ttl(backend.clone(), Duration::from_secs(60));
        registry.register(&WorkerId::from("a")).await.unwrap();
        assert_eq!(registry.cached_list().await.unwrap().len(), 1);

        // a write behind the registry's back is not seen until the TTL lapses
        backend
            .register_worker(&WorkerId::from("b"), Utc::now())
            .await
            .unwrap();
        assert_eq!(registry.cached_list().await.unwrap().len(), 1);
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lists_past_one_page() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        for i in 0..(LIST_PAGE + 3) {
            backend
                .register_worker(&WorkerId::from(format!("w-{}", i)), now)
                .await
                .unwrap();
        }
        let registry = WorkerRegistry::new(backend);
        assert_eq!(registry.list().await.unwrap().len(), LIST_PAGE + 3);
    }
}
