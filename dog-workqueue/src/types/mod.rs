pub mod ids;
pub mod priority;
pub mod job;
pub mod state;
pub mod events;
pub mod idempotency;
pub mod outbox;

pub use ids::{JobId, WorkerId, HeartbeatToken};
pub use priority::{JobPriority, PriorityWeights};
pub use job::{Job, NewJob, JobRecord, DeadLetterEntry, validate_queue_name};
pub use state::{JobState, Transition, TransitionError, Failure, Next, Container};
pub use events::QueueEvent;
pub use idempotency::{IdempotencyRecord, IdempotencyStatus, BeginOutcome, EndOutcome};
pub use outbox::OutboxEntry;
