use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identity of one claim loop. A process running N workers holds N ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// `hostname-pid-nanos-rand`, unique across restarts of the same host
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let salt: u32 = rand::thread_rng().gen();
        Self(format!("{}-{}-{}-{:08x}", host, std::process::id(), nanos, salt))
    }

    /// Derive the id of the `index`-th worker of a pool
    pub fn child(&self, index: usize) -> Self {
        Self(format!("{}-{}", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Value stored in a worker's heartbeat key. Binds the liveness record
/// to one worker/job ownership pair so renewals can be owner-checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeartbeatToken(pub String);

impl HeartbeatToken {
    pub const SEPARATOR: char = '|';

    pub fn new(worker: &WorkerId, job: &JobId) -> Self {
        Self(format!("{}{}{}", worker, Self::SEPARATOR, job))
    }

    /// Worker half of the pair
    pub fn worker(&self) -> WorkerId {
        match self.0.rsplit_once(Self::SEPARATOR) {
            Some((worker, _)) => WorkerId::from(worker),
            None => WorkerId::from(self.0.as_str()),
        }
    }

    /// Job half of the pair
    pub fn job(&self) -> Option<JobId> {
        self.0
            .rsplit_once(Self::SEPARATOR)
            .map(|(_, job)| JobId::from(job))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HeartbeatToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
