//! Job lifecycle as one transition function.
//!
//! Every container move (claim, release, complete, fail, reap, promote,
//! revive) goes through [`JobState::apply`]. Backends persist the result;
//! they never decide the next state on their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Job, JobPriority, WorkerId};
use crate::QueueError;

/// The single container a job belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Ready,
    Processing { owner: WorkerId },
    Scheduled { due_at: DateTime<Utc> },
    DeadLetter { reason: String, failed_at: DateTime<Utc> },
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Processing { .. } => "processing",
            Self::Scheduled { .. } => "scheduled",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }

    pub fn owner(&self) -> Option<&WorkerId> {
        match self {
            Self::Processing { owner } => Some(owner),
            _ => None,
        }
    }

    /// Apply `transition` to a job currently in `self`.
    ///
    /// Failure transitions mutate `job.attempts` and `job.last_error`.
    pub fn apply(&self, job: &mut Job, transition: Transition) -> Result<Next, TransitionError> {
        match (self, transition) {
            (Self::Ready, Transition::Claim { worker }) => {
                Ok(Next::Move(Self::Processing { owner: worker }))
            }

            (Self::Processing { owner }, Transition::Release { worker }) => {
                check_owner(owner, &worker)?;
                Ok(Next::Move(Self::Ready))
            }

            (Self::Processing { owner }, Transition::Complete { worker }) => {
                check_owner(owner, &worker)?;
                Ok(Next::Remove)
            }

            (Self::Processing { owner }, Transition::Fail { worker, failure }) => {
                check_owner(owner, &worker)?;
                Ok(Next::Move(failure.settle(job)))
            }

            (Self::Processing { owner }, Transition::Reap { worker, failure }) => {
                check_owner(owner, &worker)?;
                Ok(Next::Move(failure.settle(job)))
            }

            (Self::Scheduled { due_at }, Transition::Promote { now }) => {
                if *due_at <= now {
                    Ok(Next::Move(Self::Ready))
                } else {
                    Err(TransitionError::NotDue { due_at: *due_at })
                }
            }

            (Self::DeadLetter { .. }, Transition::Revive) => {
                job.attempts = 0;
                Ok(Next::Move(Self::Ready))
            }

            (from, transition) => Err(TransitionError::Illegal {
                from: from.name(),
                transition: transition.name(),
            }),
        }
    }
}

fn check_owner(owner: &WorkerId, worker: &WorkerId) -> Result<(), TransitionError> {
    if owner == worker {
        Ok(())
    } else {
        Err(TransitionError::NotOwner {
            owner: owner.clone(),
            caller: worker.clone(),
        })
    }
}

/// Outcome of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Move(JobState),
    /// Job finished and leaves every container
    Remove,
}

/// Inputs of a failed execution (worker-reported or reaped)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    pub at: DateTime<Utc>,
    /// Delay the retry through the scheduled set
    pub retry_at: Option<DateTime<Utc>>,
    /// Skip the retry budget and dead-letter now
    pub permanent: bool,
}

impl Failure {
    pub fn new(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            reason: reason.into(),
            at,
            retry_at: None,
            permanent: false,
        }
    }

    pub fn retry_at(mut self, retry_at: Option<DateTime<Utc>>) -> Self {
        self.retry_at = retry_at;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Consume one attempt and pick the next container
    pub fn settle(self, job: &mut Job) -> JobState {
        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(self.reason.clone());

        if self.permanent || job.attempts > job.max_attempts {
            return JobState::DeadLetter {
                reason: self.reason,
                failed_at: self.at,
            };
        }

        match self.retry_at {
            Some(due_at) if due_at > self.at => JobState::Scheduled { due_at },
            _ => JobState::Ready,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Claim { worker: WorkerId },
    Release { worker: WorkerId },
    Complete { worker: WorkerId },
    Fail { worker: WorkerId, failure: Failure },
    /// Recovery of a job held by a worker whose heartbeat expired
    Reap { worker: WorkerId, failure: Failure },
    Promote { now: DateTime<Utc> },
    /// Manual requeue out of the dead-letter queue
    Revive,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::Release { .. } => "release",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Reap { .. } => "reap",
            Self::Promote { .. } => "promote",
            Self::Revive => "revive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {transition} a job that is {from}")]
    Illegal {
        from: &'static str,
        transition: &'static str,
    },

    #[error("job is owned by {owner}, not {caller}")]
    NotOwner { owner: WorkerId, caller: WorkerId },

    #[error("job is not due until {due_at}")]
    NotDue { due_at: DateTime<Utc> },
}

impl TransitionError {
    pub(crate) fn into_queue_error(self, worker: Option<&WorkerId>, job: &Job) -> QueueError {
        match self {
            Self::NotOwner { caller, .. } => QueueError::ownership_lost(caller, &job.id),
            Self::Illegal { .. } if worker.is_some() => {
                QueueError::ownership_lost(worker.map(|w| w.as_str()).unwrap_or_default(), &job.id)
            }
            other => QueueError::Internal(format!("job {}: {}", job.id, other)),
        }
    }
}

/// Where a job was observed; used to verify the single-container invariant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "container", rename_all = "snake_case")]
pub enum Container {
    Ready { queue: String, priority: JobPriority },
    Processing { worker: WorkerId },
    Scheduled,
    DeadLetter,
}
