use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{Result, TranscodeError};
use crate::models::{JobFilter, JobRecord, JobSpec, JobState, TransitionFields};
use crate::storage::JobRegistry;

/// Ordered record list with the registry rules applied. Callers provide
/// the locking.
#[derive(Debug, Default)]
pub(crate) struct RecordTable {
    records: Vec<JobRecord>,
    log_tail_bytes: usize,
    retention_limit: usize,
}

impl RecordTable {
    pub(crate) fn new(log_tail_bytes: usize, retention_limit: usize) -> Self {
        Self {
            records: Vec::new(),
            log_tail_bytes,
            retention_limit,
        }
    }

    pub(crate) fn with_records(
        records: Vec<JobRecord>,
        log_tail_bytes: usize,
        retention_limit: usize,
    ) -> Self {
        let mut table = Self {
            records,
            log_tail_bytes,
            retention_limit,
        };
        table.enforce_retention();
        table
    }

    pub(crate) fn records(&self) -> &[JobRecord] {
        &self.records
    }

    fn find_mut(&mut self, id: Uuid) -> Result<&mut JobRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| TranscodeError::NotFound(format!("job {}", id)))
    }

    pub(crate) fn reserve(&mut self, spec: JobSpec) -> Result<JobRecord> {
        if let Some(active) = self
            .records
            .iter()
            .find(|r| r.state.is_active() && r.spec.output_path() == spec.output_path())
        {
            return Err(TranscodeError::OutputBusy(format!(
                "'{}' is being written by job {}",
                spec.output_path().display(),
                active.id()
            )));
        }

        if self.records.iter().any(|r| r.id() == spec.id()) {
            return Err(TranscodeError::InvalidSpec(format!(
                "job {} was already submitted",
                spec.id()
            )));
        }

        let record = JobRecord::queued(spec, self.log_tail_bytes);
        self.records.push(record.clone());
        self.enforce_retention();
        Ok(record)
    }

    pub(crate) fn transition(
        &mut self,
        id: Uuid,
        state: JobState,
        fields: TransitionFields,
    ) -> Result<JobRecord> {
        let record = self.find_mut(id)?;
        if !record.state.can_transition_to(state) {
            return Err(TranscodeError::InvalidTransition {
                from: record.state,
                to: state,
            });
        }

        let now = Utc::now();
        record.state = state;
        if fields.pid.is_some() {
            record.pid = fields.pid;
        }
        if state == JobState::Running {
            record.started_at = Some(now);
        } else {
            record.ended_at = Some(now);
            record.exit_code = fields.exit_code;
            record.failure = fields.failure;
            record.output_bytes = fields.output_bytes;
        }
        Ok(record.clone())
    }

    pub(crate) fn append_output(&mut self, id: Uuid, line: &str) -> Result<()> {
        let record = self.find_mut(id)?;
        record.output_lines += 1;
        record.log_tail.push(line);
        Ok(())
    }

    pub(crate) fn get(&self, id: Uuid) -> Result<JobRecord> {
        self.records
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or_else(|| TranscodeError::NotFound(format!("job {}", id)))
    }

    pub(crate) fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub(crate) fn purge(&mut self, id: Uuid) -> Result<()> {
        let idx = self
            .records
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| TranscodeError::NotFound(format!("job {}", id)))?;
        if self.records[idx].state.is_active() {
            return Err(TranscodeError::StillActive(id));
        }
        self.records.remove(idx);
        Ok(())
    }

    /// Drop the oldest terminal records beyond the retention limit. Active
    /// records are never evicted.
    fn enforce_retention(&mut self) {
        if self.retention_limit == 0 {
            return;
        }
        while self.records.len() > self.retention_limit {
            match self.records.iter().position(|r| r.state.is_terminal()) {
                Some(idx) => {
                    let evicted = self.records.remove(idx);
                    tracing::debug!("Evicted job {} (retention limit)", evicted.id());
                }
                None => break,
            }
        }
    }
}

/// Registry kept entirely in memory.
pub struct MemoryRegistry {
    table: RwLock<RecordTable>,
}

impl MemoryRegistry {
    pub fn new(log_tail_bytes: usize, retention_limit: usize) -> Self {
        Self {
            table: RwLock::new(RecordTable::new(log_tail_bytes, retention_limit)),
        }
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn reserve(&self, spec: JobSpec) -> Result<JobRecord> {
        self.table.write().await.reserve(spec)
    }

    async fn transition(
        &self,
        id: Uuid,
        state: JobState,
        fields: TransitionFields,
    ) -> Result<JobRecord> {
        self.table.write().await.transition(id, state, fields)
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
        self.table.write().await.purge(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureReason;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, output: &str) -> JobSpec {
        let input = dir.path().join("a.raw");
        if !input.exists() {
            std::fs::write(&input, b"raw").expect("write input");
        }
        JobSpec::new(&input, dir.path().join(output), vec!["-y".to_string()]).expect("spec")
    }

    fn finish(state: JobState) -> TransitionFields {
        TransitionFields {
            exit_code: Some(if state == JobState::Succeeded { 0 } else { 1 }),
            failure: (state == JobState::Failed).then_some(FailureReason::RuntimeFailure),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reserve_inserts_queued_record() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 0);
        let record = registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve");
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(registry.get(record.id()).await.expect("get"), record);
    }

    #[tokio::test]
    async fn test_reserve_same_output_busy_until_terminal() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 0);
        let first = registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve");

        let err = registry.reserve(spec(&dir, "out.mp4")).await.unwrap_err();
        assert!(matches!(err, TranscodeError::OutputBusy(_)));

        // Different output is fine
        registry.reserve(spec(&dir, "other.mp4")).await.expect("reserve other");

        registry
            .transition(first.id(), JobState::Running, TransitionFields::default())
            .await
            .expect("running");
        assert!(registry.reserve(spec(&dir, "out.mp4")).await.is_err());

        registry
            .transition(first.id(), JobState::Failed, finish(JobState::Failed))
            .await
            .expect("failed");
        registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve again");
    }

    #[tokio::test]
    async fn test_concurrent_reserve_only_one_wins() {
        let dir = TempDir::new().expect("tempdir");
        let registry = Arc::new(MemoryRegistry::new(1024, 0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let spec = spec(&dir, "race.mp4");
            handles.push(tokio::spawn(async move { registry.reserve(spec).await.is_ok() }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.expect("join") {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_transition_records_fields() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 0);
        let id = registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve").id();

        let running = registry
            .transition(
                id,
                JobState::Running,
                TransitionFields {
                    pid: Some(42),
                    ..Default::default()
                },
            )
            .await
            .expect("running");
        assert_eq!(running.pid, Some(42));
        assert!(running.started_at.is_some());
        assert!(running.ended_at.is_none());

        let done = registry
            .transition(
                id,
                JobState::Succeeded,
                TransitionFields {
                    exit_code: Some(0),
                    output_bytes: Some(2048),
                    ..Default::default()
                },
            )
            .await
            .expect("succeeded");
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.output_bytes, Some(2048));
        assert_eq!(done.pid, Some(42));
        assert!(done.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_transition_out_of_terminal_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 0);
        let id = registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve").id();
        registry
            .transition(id, JobState::Cancelled, TransitionFields::default())
            .await
            .expect("cancelled");

        let err = registry
            .transition(id, JobState::Running, TransitionFields::default())
            .await
            .unwrap_err();
        match err {
            TranscodeError::InvalidTransition { from, to } => {
                assert_eq!(from, JobState::Cancelled);
                assert_eq!(to, JobState::Running);
            }
            other => panic!("Expected InvalidTransition, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let registry = MemoryRegistry::new(1024, 0);
        let id = Uuid::now_v7();
        assert!(matches!(
            registry.get(id).await,
            Err(TranscodeError::NotFound(_))
        ));
        assert!(matches!(
            registry.purge(id).await,
            Err(TranscodeError::NotFound(_))
        ));
        assert!(matches!(
            registry.append_output(id, "x").await,
            Err(TranscodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_output_updates_tail() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(12, 0);
        let id = registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve").id();
        for line in ["frame=1", "frame=2", "frame=3"] {
            registry.append_output(id, line).await.expect("append");
        }
        let record = registry.get(id).await.expect("get");
        assert_eq!(record.output_lines, 3);
        assert_eq!(record.log_tail.to_string(), "frame=3");
    }

    #[tokio::test]
    async fn test_purge_requires_terminal() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 0);
        let id = registry.reserve(spec(&dir, "out.mp4")).await.expect("reserve").id();

        assert!(matches!(
            registry.purge(id).await,
            Err(TranscodeError::StillActive(_))
        ));

        registry
            .transition(id, JobState::Succeeded, finish(JobState::Succeeded))
            .await
            .expect("succeeded");
        registry.purge(id).await.expect("purge");
        assert!(registry.get(id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_insertion_order_and_filter() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 0);
        let a = registry.reserve(spec(&dir, "a.mp4")).await.expect("a").id();
        let b = registry.reserve(spec(&dir, "b.mp4")).await.expect("b").id();
        let c = registry.reserve(spec(&dir, "c.mp4")).await.expect("c").id();
        registry
            .transition(b, JobState::Failed, finish(JobState::Failed))
            .await
            .expect("failed");

        let all: Vec<Uuid> = registry
            .list(&JobFilter::default())
            .await
            .expect("list")
            .iter()
            .map(JobRecord::id)
            .collect();
        assert_eq!(all, vec![a, b, c]);

        let active: Vec<Uuid> = registry
            .list(&JobFilter::active())
            .await
            .expect("list")
            .iter()
            .map(JobRecord::id)
            .collect();
        assert_eq!(active, vec![a, c]);

        let failed = registry
            .list(&JobFilter::with_states(vec![JobState::Failed]))
            .await
            .expect("list");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].spec.output_path(), dir.path().join("b.mp4").as_path());
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_terminal_only() {
        let dir = TempDir::new().expect("tempdir");
        let registry = MemoryRegistry::new(1024, 2);
        let a = registry.reserve(spec(&dir, "a.mp4")).await.expect("a").id();
        let b = registry.reserve(spec(&dir, "b.mp4")).await.expect("b").id();
        registry
            .transition(b, JobState::Succeeded, finish(JobState::Succeeded))
            .await
            .expect("b done");

        // a is active, so b is the one evicted
        let c = registry.reserve(spec(&dir, "c.mp4")).await.expect("c").id();
        assert!(registry.get(a).await.is_ok());
        assert!(registry.get(b).await.is_err());
        assert!(registry.get(c).await.is_ok());

        // everything active: the limit is exceeded rather than evicting
        let d = registry.reserve(spec(&dir, "d.mp4")).await.expect("d").id();
        assert_eq!(registry.list(&JobFilter::default()).await.expect("list").len(), 3);
        assert!(registry.get(d).await.is_ok());
    }

    #[test]
    fn test_output_path_compared_after_normalization() {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("a.raw");
        std::fs::write(&input, b"raw").expect("write input");
        let plain = JobSpec::new(&input, dir.path().join("out.mp4"), vec!["-y".into()])
            .expect("spec");
        let dotted = JobSpec::new(
            &input,
            dir.path().join(".").join("out.mp4"),
            vec!["-y".into()],
        )
        .expect("spec");

        let mut table = RecordTable::new(1024, 0);
        table.reserve(plain).expect("reserve");
        assert!(matches!(
            table.reserve(dotted),
            Err(TranscodeError::OutputBusy(_))
        ));
    }
}
