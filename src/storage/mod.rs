pub mod json;
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{JobFilter, JobRecord, JobSpec, JobState, TransitionFields};

pub use json::JsonRegistry;
pub use memory::MemoryRegistry;

/// Owner of all job records. Every mutation is a single atomic step.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a `Queued` record unless another active job writes the same
    /// output path (`OutputBusy`).
    async fn reserve(&self, spec: JobSpec) -> Result<JobRecord>;

    /// Move a record forward (`InvalidTransition` otherwise).
    async fn transition(
        &self,
        id: Uuid,
        state: JobState,
        fields: TransitionFields,
    ) -> Result<JobRecord>;

    /// Count one output line and append it to the log tail.
    async fn append_output(&self, id: Uuid, line: &str) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<JobRecord>;

    /// Snapshot of matching records in insertion order.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Remove a terminal record (`StillActive` otherwise).
    async fn purge(&self, id: Uuid) -> Result<()>;
}
