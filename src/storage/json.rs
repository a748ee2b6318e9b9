use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{FailureReason, JobFilter, JobRecord, JobSpec, JobState, TransitionFields};
use crate::runner::ABNORMAL_EXIT_CODE;
use crate::storage::memory::RecordTable;
use crate::storage::JobRegistry;

/// Registry that mirrors its records to `<data_dir>/jobs.json`.
///
/// The in-memory table is authoritative. Write failures are logged and do
/// not fail the operation, so a full disk never strands a job in `Running`.
/// Output lines are kept in memory and reach disk with the next state
/// change.
pub struct JsonRegistry {
    file_path: PathBuf,
    table: RwLock<RecordTable>,
}

impl JsonRegistry {
    /// Open the registry, loading existing records from disk if present.
    ///
    /// If `jobs.json` is corrupted, a backup is written to `jobs.json.bak`
    /// and the registry starts empty. Records still `Queued` or `Running`
    /// belonged to a process that is gone; they are marked `Failed`.
    pub async fn new(
        data_dir: PathBuf,
        log_tail_bytes: usize,
        retention_limit: usize,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .context("Failed to create data directory")?;

        let file_path = data_dir.join("jobs.json");

        let mut records = if file_path.exists() {
            let content = tokio::fs::read_to_string(&file_path)
                .await
                .context("Failed to read jobs.json")?;
            match serde_json::from_str::<Vec<JobRecord>>(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        "jobs.json is corrupted ({}), creating backup and starting empty",
                        e
                    );
                    let backup_path = data_dir.join("jobs.json.bak");
                    if let Err(backup_err) = tokio::fs::copy(&file_path, &backup_path).await {
                        tracing::error!(
                            "Failed to create backup of corrupted jobs.json: {}",
                            backup_err
                        );
                    }
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut interrupted = 0;
        for record in records.iter_mut().filter(|r| r.state.is_active()) {
            record.state = JobState::Failed;
            record.exit_code = Some(ABNORMAL_EXIT_CODE);
            record.failure = Some(FailureReason::RuntimeFailure);
            record.ended_at = Some(chrono::Utc::now());
            record
                .log_tail
                .push("interrupted: coordinator stopped before the job finished");
            interrupted += 1;
        }
        if interrupted > 0 {
            tracing::warn!("Marked {} interrupted job(s) as failed", interrupted);
        }

        let registry = Self {
            file_path,
            table: RwLock::new(RecordTable::with_records(
                records,
                log_tail_bytes,
                retention_limit,
            )),
        };
        {
            let table = registry.table.read().await;
            registry.persist(table.records()).await?;
        }
        Ok(registry)
    }

    /// Atomically write the records to disk.
    /// Writes to a .tmp file first, then renames to the actual file.
    async fn persist(&self, records: &[JobRecord]) -> anyhow::Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(records).context("Failed to serialize jobs")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary jobs file")?;

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary jobs file")?;

        Ok(())
    }

    async fn persist_logged(&self, table: &RecordTable) {
        if let Err(e) = self.persist(table.records()).await {
            tracing::error!("Failed to persist job registry: {:#}", e);
        }
    }
}

#[async_trait]
impl JobRegistry for JsonRegistry {
    async fn reserve(&self, spec: JobSpec) -> Result<JobRecord> {
        let mut table = self.table.write().await;
        let record = table.reserve(spec)?;
        self.persist_logged(&table).await;
        Ok(record)
    }

    async fn transition(
        &self,
        id: Uuid,
        state: JobState,
        fields: TransitionFields,
    ) -> Result<JobRecord> {
        let mut table = self.table.write().await;
        let record = table.transition(id, state, fields)?;
        self.persist_logged(&table).await;
        Ok(record)
    }

    async fn append_output(&self, id: Uuid, line: &str) -> Result<()> {
        self.table.write().await.append_output(id, line)
    }

    async fn get(&self, id: Uuid) -> Result<JobRecord> {
        self.table.read().await.get(id)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        Ok(self.table.read().await.list(filter))
    }

    async fn purge(&self, id: Uuid) -> Result<()> {
        let mut table = self.table.write().await;
        table.purge(id)?;
        self.persist_logged(&table).await;
        Ok(())
    }
}
