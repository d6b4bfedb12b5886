//! Subscriber setup for binaries embedding the queue.

#[cfg(feature = "tracing-basic")]
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(feature = "tracing-basic")]
use crate::{QueueError, QueueResult};

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(default_filter: &str, json: bool) -> QueueResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| QueueError::Config(format!("invalid log filter: {}", e)))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| QueueError::Internal(format!("tracing already initialised: {}", e)))
}
