//! Domain model (IDs, task rows, state machine, retry policy, errors).

pub mod attempt;
pub mod counts;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod state;
pub mod task;
pub mod task_type;

pub use attempt::{AttemptOutcome, AttemptRecord};
pub use counts::QueueCounts;
pub use errors::{BrokerError, ErrorKind, HandlerError, ShuttleError, StoreError};
pub use ids::{DeliveryId, LeaseId, ParseIdError, TaskId};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::TaskState;
pub use task::{Expected, TaskRecord, TransitionFields};
pub use task_type::TaskType;
