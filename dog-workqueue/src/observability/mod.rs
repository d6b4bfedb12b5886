pub mod metrics;
pub mod tracing;
pub mod analytics;

pub use metrics::{Counter, MetricsSnapshot, QueueMetrics};
pub use analytics::ObservabilityLayer;

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
