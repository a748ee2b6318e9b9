pub mod cli;
pub mod coordinator;
pub mod errors;
pub mod models;
pub mod runner;
pub mod storage;

pub use coordinator::{EventBus, JobEvent, JobObserver, Subscription, TranscodeCoordinator};
pub use errors::{Result, TranscodeError};
pub use models::{CoordinatorConfig, FailureReason, JobFilter, JobRecord, JobSpec, JobState};
