pub mod config;
pub mod job;
pub mod record;

pub use config::{load_config, CoordinatorConfig};
pub use job::JobSpec;
pub use record::{FailureReason, JobFilter, JobRecord, JobState, LogTail, TransitionFields};
