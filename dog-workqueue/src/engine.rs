use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    admin::Admin,
    backend::QueueBackend,
    claim::Claimer,
    config::QueueConfig,
    heartbeat::HeartbeatManager,
    idempotency::{IdempotencyManager, OutboxPublisher, OutboxReconciler},
    observability::ObservabilityLayer,
    producer::Producer,
    reaper::Reaper,
    registry::WorkerRegistry,
    scheduler::SchedulerMover,
    types::WorkerId,
    worker::{JobHandler, Worker, WorkerPool},
    QueueError, QueueResult,
};

/// Wires one backend, one configuration and one observability layer into
/// every component of the queue
#[derive(Clone)]
pub struct QueueEngine {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    observability: ObservabilityLayer,
}

impl QueueEngine {
    /// Validates `config` before anything touches the store
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        if backend.keys().namespace() != config.namespace {
            return Err(QueueError::Config(format!(
                "backend namespace {} does not match configured namespace {}",
                backend.keys().namespace(),
                config.namespace
            )));
        }
        Ok(Self {
            backend,
            config,
            observability: ObservabilityLayer::new(),
        })
    }

    /// Share an observability layer with other engines
    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            self.backend.clone(),
            self.observability.clone(),
            self.config.retry.max_attempts,
            self.config.max_payload_bytes,
        )
    }

    pub fn claimer(&self, worker: WorkerId) -> Claimer {
        Claimer::new(
            self.backend.clone(),
            self.observability.clone(),
            worker,
            &self.config,
        )
    }

    pub fn heartbeats(&self) -> HeartbeatManager {
        HeartbeatManager::new(
            self.backend.clone(),
            self.observability.clone(),
            self.config.heartbeat.clone(),
        )
    }

    pub fn idempotency(&self) -> IdempotencyManager {
        IdempotencyManager::new(
            self.backend.clone(),
            self.observability.clone(),
            self.config.idempotency.clone(),
        )
    }

    pub fn outbox_reconciler(&self, publisher: Arc<dyn OutboxPublisher>) -> OutboxReconciler {
        OutboxReconciler::new(
            self.backend.clone(),
            self.observability.clone(),
            publisher,
            self.config.outbox.clone(),
        )
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.backend.clone(),
            self.observability.clone(),
            self.config.reaper.clone(),
            &self.config.retry,
        )
    }

    pub fn scheduler(&self) -> SchedulerMover {
        SchedulerMover::new(
            self.backend.clone(),
            self.observability.clone(),
            self.config.scheduler.clone(),
        )
    }

    pub fn registry(&self) -> WorkerRegistry {
        WorkerRegistry::new(self.backend.clone())
    }

    pub fn admin(&self) -> Admin {
        Admin::new(self.backend.clone(), self.observability.clone())
    }

    pub fn worker(&self, id: WorkerId, handler: Arc<dyn JobHandler>) -> Worker {
        Worker::new(
            id,
            self.backend.clone(),
            self.observability.clone(),
            &self.config,
            handler,
        )
    }

    /// `worker.count` workers named after one generated process id
    pub fn worker_pool(&self, handler: Arc<dyn JobHandler>) -> WorkerPool {
        let base = WorkerId::generate();
        let workers = (0..self.config.worker.count)
            .map(|i| self.worker(base.child(i), handler.clone()))
            .collect();
        WorkerPool::new(workers, self.config.worker.shutdown_timeout)
    }

    /// Start the reaper, the scheduler mover and idempotency cleanup, plus
    /// the outbox reconciler when a publisher is given. Every loop exits
    /// once `cancel` fires.
    pub fn spawn_maintenance(
        &self,
        cancel: CancellationToken,
        publisher: Option<Arc<dyn OutboxPublisher>>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.reaper().run(cancel.clone())),
            tokio::spawn(self.scheduler().run(cancel.clone())),
            tokio::spawn(self.idempotency().run_cleanup(cancel.clone())),
        ];
        if let Some(publisher) = publisher {
            handles.push(tokio::spawn(self.outbox_reconciler(publisher).run(cancel)));
        }
        info!(loops = handles.len(), namespace = self.backend.keys().namespace(), "Maintenance loops started");
        handles
    }
}
