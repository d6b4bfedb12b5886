use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::metrics::{Counter, QueueMetrics};
use crate::types::QueueEvent;

/// Counters plus the lifecycle event bus, shared by every component
#[derive(Debug, Clone)]
pub struct ObservabilityLayer {
    metrics: Arc<QueueMetrics>,
    events: broadcast::Sender<QueueEvent>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            metrics: Arc::new(QueueMetrics::new()),
            events,
        }
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn incr(&self, counter: Counter) {
        self.metrics.incr(counter);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.metrics.add(counter, n);
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<QueueEvent> {
        BroadcastStream::new(self.events.subscribe())
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
