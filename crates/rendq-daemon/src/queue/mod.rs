//! Render job queue.
//!
//! Holds the job collection, resolves eligibility, dispatches render sessions
//! and persists its state.

mod persist;
mod scheduler;
mod selection;
mod types;

pub use persist::QueueStore;
pub use scheduler::{QueueScheduler, SchedulerConfig};
pub use selection::{is_eligible, promote_due, select_next, validate_dependency};
pub use types::{Job, JobSpec, JobStatus, JobUpdate, QueueError, QueueEvent};
