use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Done,
}

impl IdempotencyStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

impl std::str::FromStr for IdempotencyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown idempotency status: {}", other)),
        }
    }
}

/// Ledger entry for one idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Job (or caller) holding the reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_done(&self) -> bool {
        self.status == IdempotencyStatus::Done
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }
}

/// Outcome of `Begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginOutcome {
    /// A record already existed; the caller must not re-run side effects
    pub duplicate: bool,
}

/// Outcome of `End`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// Record moved to `done`, result and outbox entries committed
    Recorded,
    /// Record was already `done`; nothing was written
    AlreadyDone,
    /// No record (never begun or expired); nothing was written
    Missing,
}
