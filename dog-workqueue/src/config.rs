use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::KeySchema;
use crate::types::{validate_queue_name, PriorityWeights};
use crate::{QueueError, QueueResult};

/// Lower bound on the heartbeat TTL; shorter TTLs reap healthy workers
/// on ordinary scheduling hiccups.
pub const MIN_HEARTBEAT_TTL: Duration = Duration::from_secs(5);

/// Configuration for the queue engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix of every key written to the store
    pub namespace: String,
    /// Largest accepted serialized payload
    pub max_payload_bytes: usize,
    pub claim: ClaimConfig,
    pub heartbeat: HeartbeatConfig,
    pub reaper: ReaperConfig,
    pub scheduler: SchedulerConfig,
    pub idempotency: IdempotencyConfig,
    pub outbox: OutboxConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: KeySchema::DEFAULT_NAMESPACE.to_string(),
            max_payload_bytes: 1024 * 1024,
            claim: ClaimConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reaper: ReaperConfig::default(),
            scheduler: SchedulerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            outbox: OutboxConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Token-bucket refill per tier
    pub weights: PriorityWeights,
    /// Queues a worker claims from, in preference order within a tier
    pub queues: Vec<String>,
    /// How long one claim attempt waits for work before returning empty
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Sleep between empty polls inside `timeout`
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Relative jitter applied to each empty-poll sleep
    pub poll_jitter: f64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            queues: vec!["default".to_string()],
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            poll_jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Renewal period, roughly a third of the TTL
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Relative jitter applied to each renewal sleep
    pub jitter: f64,
    /// Consecutive store errors after which the job is treated as lost
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            jitter: 0.1,
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Workers examined per registry page
    pub page_size: usize,
    /// A page taking longer than this ends the sweep early
    #[serde(with = "humantime_serde")]
    pub page_budget: Duration,
    #[serde(with = "humantime_serde")]
    pub page_delay: Duration,
    pub page_jitter: f64,
    /// Requeue through the scheduled set with retry backoff instead of
    /// straight onto the ready list
    pub requeue_with_backoff: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            page_size: 100,
            page_budget: Duration::from_secs(2),
            page_delay: Duration::from_millis(50),
            page_jitter: 0.5,
            requeue_with_backoff: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Entries promoted per atomic batch
    pub batch_size: usize,
    /// Batches per tick before yielding
    pub max_batches: usize,
    #[serde(with = "humantime_serde")]
    pub budget: Duration,
    pub jitter: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            max_batches: 10,
            budget: Duration::from_millis(500),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    pub cleanup_batch: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            cleanup_batch: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub batch_size: usize,
    /// Publish attempts before an entry is parked in the failed list
    pub max_attempts: u32,
    /// Names this reconciler's in-flight list; keep it stable across restarts
    pub reconciler_id: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            max_attempts: 3,
            reconciler_id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries before dead-lettering, for jobs that do not set their own
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Claim loops per process
    pub count: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(raw: &str) -> QueueResult<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `PREFIX_SECTION_KEY` environment variables,
    /// e.g. `WORKQUEUE_HEARTBEAT_TTL=45s`.
    pub fn from_env(prefix: &str) -> QueueResult<Self> {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(prefix: &str, lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverlay { prefix, lookup };
        let mut c = Self::default();

        env.string("NAMESPACE", &mut c.namespace);
        env.parse("MAX_PAYLOAD_BYTES", &mut c.max_payload_bytes)?;

        env.parse("CLAIM_WEIGHT_HIGH", &mut c.claim.weights.high)?;
        env.parse("CLAIM_WEIGHT_MEDIUM", &mut c.claim.weights.medium)?;
        env.parse("CLAIM_WEIGHT_LOW", &mut c.claim.weights.low)?;
        env.list("CLAIM_QUEUES", &mut c.claim.queues);
        env.duration("CLAIM_TIMEOUT", &mut c.claim.timeout)?;
        env.duration("CLAIM_POLL_INTERVAL", &mut c.claim.poll_interval)?;
        env.parse("CLAIM_POLL_JITTER", &mut c.claim.poll_jitter)?;

        env.duration("HEARTBEAT_TTL", &mut c.heartbeat.ttl)?;
        env.duration("HEARTBEAT_INTERVAL", &mut c.heartbeat.interval)?;
        env.parse("HEARTBEAT_JITTER", &mut c.heartbeat.jitter)?;
        env.parse("HEARTBEAT_MAX_FAILURES", &mut c.heartbeat.max_failures)?;

        env.duration("REAPER_INTERVAL", &mut c.reaper.interval)?;
        env.parse("REAPER_PAGE_SIZE", &mut c.reaper.page_size)?;
        env.duration("REAPER_PAGE_BUDGET", &mut c.reaper.page_budget)?;
        env.duration("REAPER_PAGE_DELAY", &mut c.reaper.page_delay)?;
        env.parse("REAPER_PAGE_JITTER", &mut c.reaper.page_jitter)?;
        env.parse("REAPER_REQUEUE_WITH_BACKOFF", &mut c.reaper.requeue_with_backoff)?;

        env.duration("SCHEDULER_INTERVAL", &mut c.scheduler.interval)?;
        env.parse("SCHEDULER_BATCH_SIZE", &mut c.scheduler.batch_size)?;
        env.parse("SCHEDULER_MAX_BATCHES", &mut c.scheduler.max_batches)?;
        env.duration("SCHEDULER_BUDGET", &mut c.scheduler.budget)?;
        env.parse("SCHEDULER_JITTER", &mut c.scheduler.jitter)?;

        env.duration("IDEMPOTENCY_DEFAULT_TTL", &mut c.idempotency.default_ttl)?;
        env.duration("IDEMPOTENCY_CLEANUP_INTERVAL", &mut c.idempotency.cleanup_interval)?;
        env.parse("IDEMPOTENCY_CLEANUP_BATCH", &mut c.idempotency.cleanup_batch)?;

        env.duration("OUTBOX_INTERVAL", &mut c.outbox.interval)?;
        env.parse("OUTBOX_BATCH_SIZE", &mut c.outbox.batch_size)?;
        env.parse("OUTBOX_MAX_ATTEMPTS", &mut c.outbox.max_attempts)?;
        env.string("OUTBOX_RECONCILER_ID", &mut c.outbox.reconciler_id);

        env.parse("RETRY_MAX_ATTEMPTS", &mut c.retry.max_attempts)?;
        env.duration("RETRY_BACKOFF_BASE", &mut c.retry.backoff_base)?;
        env.duration("RETRY_BACKOFF_MAX", &mut c.retry.backoff_max)?;
        env.parse("RETRY_JITTER", &mut c.retry.jitter)?;

        env.parse("WORKER_COUNT", &mut c.worker.count)?;
        env.duration("WORKER_SHUTDOWN_TIMEOUT", &mut c.worker.shutdown_timeout)?;

        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
            return Err(QueueError::Config("namespace must be a non-empty token".into()));
        }
        if self.claim.weights.total() == 0 {
            return Err(QueueError::Config("at least one priority weight must be positive".into()));
        }
        if self.claim.queues.is_empty() {
            return Err(QueueError::Config("claim.queues must name at least one queue".into()));
        }
        for queue in &self.claim.queues {
            validate_queue_name(queue).map_err(|e| QueueError::Config(e.to_string()))?;
        }

        let ttl = self.heartbeat.ttl;
        if ttl < MIN_HEARTBEAT_TTL {
            return Err(QueueError::Config(format!(
                "heartbeat.ttl must be at least {:?}",
                MIN_HEARTBEAT_TTL
            )));
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.interval >= ttl / 2 {
            return Err(QueueError::Config(
                "heartbeat.interval must be positive and below half the ttl".into(),
            ));
        }
        if self.claim.timeout.is_zero() || self.claim.timeout > ttl / 2 {
            return Err(QueueError::Config(
                "claim.timeout must be positive and at most half the heartbeat ttl".into(),
            ));
        }
        for (name, jitter) in [
            ("claim.poll_jitter", self.claim.poll_jitter),
            ("heartbeat.jitter", self.heartbeat.jitter),
            ("reaper.page_jitter", self.reaper.page_jitter),
            ("scheduler.jitter", self.scheduler.jitter),
            ("retry.jitter", self.retry.jitter),
        ] {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(QueueError::Config(format!("{} must be within 0.0..=1.0", name)));
            }
        }

        if self.reaper.page_size == 0 {
            return Err(QueueError::Config("reaper.page_size must be positive".into()));
        }
        if self.scheduler.batch_size == 0 || self.scheduler.max_batches == 0 {
            return Err(QueueError::Config("scheduler batch limits must be positive".into()));
        }
        if self.idempotency.cleanup_batch == 0 || self.outbox.batch_size == 0 {
            return Err(QueueError::Config("cleanup and outbox batch sizes must be positive".into()));
        }
        if self.idempotency.default_ttl.is_zero() {
            return Err(QueueError::Config("idempotency.default_ttl must be positive".into()));
        }
        if self.retry.max_attempts == 0 || self.outbox.max_attempts == 0 {
            return Err(QueueError::Config("max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_base > self.retry.backoff_max {
            return Err(QueueError::Config("retry.backoff_base exceeds retry.backoff_max".into()));
        }
        if self.worker.count == 0 {
            return Err(QueueError::Config("worker.count must be positive".into()));
        }
        if self.outbox.reconciler_id.is_empty() {
            return Err(QueueError::Config("outbox.reconciler_id must not be empty".into()));
        }
        Ok(())
    }

    pub fn keys(&self) -> KeySchema {
        KeySchema::new(self.namespace.clone())
    }
}

struct EnvOverlay<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<'a, F> EnvOverlay<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<(String, String)> {
        let name = format!("{}_{}", self.prefix, key);
        (self.lookup)(&name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (name, v))
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some((_, value)) = self.get(key) {
            *slot = value;
        }
    }

    fn list(&self, key: &str, slot: &mut Vec<String>) {
        if let Some((_, value)) = self.get(key) {
            *slot = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    fn parse<T>(&self, key: &str, slot: &mut T) -> QueueResult<()>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some((name, value)) = self.get(key) {
            *slot = value
                .parse()
                .map_err(|e| QueueError::Config(format!("{}={:?}: {}", name, value, e)))?;
        }
        Ok(())
    }

    fn duration(&self, key: &str, slot: &mut Duration) -> QueueResult<()> {
        if let Some((name, value)) = self.get(key) {
            *slot = humantime_serde::re::humantime::parse_duration(&value)
                .map_err(|e| QueueError::Config(format!("{}={:?}: {}", name, value, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        config.validate().unwrap();
        assert_eq!(config.claim.weights, PriorityWeights::new(8, 2, 1));
        assert_eq!(config.heartbeat.ttl, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.keys().namespace(), "jobqueue");
    }

    #[test]
    fn env_overlay_parses_durations_and_lists() {
        let config = QueueConfig::from_lookup(
            "WQ",
            lookup(&[
                ("WQ_HEARTBEAT_TTL", "45s"),
                ("WQ_HEARTBEAT_INTERVAL", "15s"),
                ("WQ_CLAIM_QUEUES", "emails, reports"),
                ("WQ_CLAIM_WEIGHT_LOW", "3"),
                ("WQ_REAPER_PAGE_SIZE", "25"),
                ("WQ_CLAIM_POLL_JITTER", "0.5"),
                ("WQ_IDEMPOTENCY_DEFAULT_TTL", "1h 30m"),
            ]),
        )
        .unwrap();

        assert_eq!(config.heartbeat.ttl, Duration::from_secs(45));
        assert_eq!(config.claim.queues, vec!["emails", "reports"]);
        assert_eq!(config.claim.weights.low, 3);
        assert_eq!(config.reaper.page_size, 25);
        assert_eq!(config.claim.poll_jitter, 0.5);
        assert_eq!(config.idempotency.default_ttl, Duration::from_secs(5400));
    }

    #[test]
    fn env_overlay_reports_bad_values() {
        let err = QueueConfig::from_lookup("WQ", lookup(&[("WQ_REAPER_PAGE_SIZE", "many")]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Config(msg) if msg.contains("WQ_REAPER_PAGE_SIZE")));
    }

    #[test]
    fn rejects_unsafe_timings() {
        let mut short_ttl = QueueConfig::default();
        short_ttl.heartbeat.ttl = Duration::from_secs(2);
        assert!(short_ttl.validate().is_err());

        let mut slow_renewal = QueueConfig::default();
        slow_renewal.heartbeat.interval = Duration::from_secs(20);
        assert!(slow_renewal.validate().is_err());

        let mut long_claim = QueueConfig::default();
        long_claim.claim.timeout = Duration::from_secs(16);
        assert!(long_claim.validate().is_err());

        let mut no_weights = QueueConfig::default();
        no_weights.claim.weights = PriorityWeights::new(0, 0, 0);
        assert!(no_weights.validate().is_err());

        let mut wild_poll = QueueConfig::default();
        wild_poll.claim.poll_jitter = 1.5;
        assert!(wild_poll.validate().is_err());
    }

    #[test]
    fn json_uses_human_durations() {
        let config = QueueConfig::from_json_str(
            r#"{"namespace":"jq","heartbeat":{"ttl":"1m","interval":"20s"},"claim":{"queues":["a"]}}"#,
        )
        .unwrap();
        assert_eq!(config.namespace, "jq");
        assert_eq!(config.heartbeat.ttl, Duration::from_secs(60));
        assert_eq!(config.claim.timeout, Duration::from_secs(1));
    }
}
