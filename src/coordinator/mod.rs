// Coordinator module: accepts jobs, drives one runner per job and turns
// runner events into registry transitions and published JobEvents.

pub mod events;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    CoordinatorConfig, FailureReason, JobFilter, JobRecord, JobSpec, JobState, TransitionFields,
};
use crate::runner::{
    Invocation, ProcessRunner, ProcessSpawner, RunnerEvent, TokioSpawner, ABNORMAL_EXIT_CODE,
    CANCELLED_EXIT_CODE, LAUNCH_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use crate::storage::{JobRegistry, JsonRegistry, MemoryRegistry};

pub use events::{EventBus, JobEvent, JobObserver, Subscription, SubscriptionHandle};

/// Extra time `shutdown` allows a worker beyond the kill grace period.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
enum CancelCause {
    Requested,
    TimedOut,
}

/// Coordinator-side handle to a job that has not finished yet.
struct ActiveJob {
    cancel_tx: Option<oneshot::Sender<()>>,
    cause: Option<CancelCause>,
    worker: Option<JoinHandle<()>>,
}

type ActiveJobs = Arc<RwLock<HashMap<Uuid, ActiveJob>>>;

/// Fire the cancel signal for `id` once. Later calls are no-ops.
async fn signal_cancel(active: &RwLock<HashMap<Uuid, ActiveJob>>, id: Uuid, cause: CancelCause) {
    let mut active = active.write().await;
    if let Some(job) = active.get_mut(&id) {
        if let Some(cancel_tx) = job.cancel_tx.take() {
            job.cause = Some(cause);
            let _ = cancel_tx.send(());
            tracing::info!("Cancellation requested for job {} ({:?})", id, cause);
        }
    }
}

/// Public entry point: submit, cancel, observe and query transcode jobs.
pub struct TranscodeCoordinator {
    registry: Arc<dyn JobRegistry>,
    runner: Arc<ProcessRunner>,
    bus: EventBus,
    config: Arc<CoordinatorConfig>,
    active: ActiveJobs,
}

impl TranscodeCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<dyn JobRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            registry,
            runner: Arc::new(ProcessRunner::new(spawner, Arc::clone(&config))),
            bus: EventBus::new(config.event_capacity),
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build a coordinator that launches real processes. Records are
    /// persisted when `config.data_dir` is set.
    pub async fn from_config(config: CoordinatorConfig) -> anyhow::Result<Self> {
        let registry: Arc<dyn JobRegistry> = match config.data_dir {
            Some(ref data_dir) => Arc::new(
                JsonRegistry::new(
                    data_dir.clone(),
                    config.log_tail_bytes,
                    config.retention_limit,
                )
                .await?,
            ),
            None => Arc::new(MemoryRegistry::new(
                config.log_tail_bytes,
                config.retention_limit,
            )),
        };
        Ok(Self::new(config, registry, Arc::new(TokioSpawner)))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Reserve the output path and start the job in the background.
    ///
    /// Returns as soon as the job is queued. Everything that happens after
    /// launch is reported through events only.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()?;
        let id = spec.id();

        // Holding the map across reserve+insert keeps cancel from seeing a
        // reserved job without its cancel handle.
        let mut active = self.active.write().await;
        let record = self.registry.reserve(spec).await?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = JobWorker {
            registry: Arc::clone(&self.registry),
            runner: Arc::clone(&self.runner),
            bus: self.bus.clone(),
            config: Arc::clone(&self.config),
            active: Arc::clone(&self.active),
        };
        let handle = tokio::spawn(worker.run(record.spec.clone(), cancel_rx));
        active.insert(
            id,
            ActiveJob {
                cancel_tx: Some(cancel_tx),
                cause: None,
                worker: Some(handle),
            },
        );

        tracing::info!(
            "Job {} submitted: {} -> {}",
            id,
            record.spec.input_path().display(),
            record.spec.output_path().display()
        );
        Ok(id)
    }

    /// Request cancellation. Idempotent; a finished job is left as is.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let record = self.registry.get(id).await?;
        if record.state.is_terminal() {
            return Ok(());
        }
        signal_cancel(&self.active, id, CancelCause::Requested).await;
        Ok(())
    }

    pub async fn get_status(&self, id: Uuid) -> Result<JobRecord> {
        self.registry.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.registry.list(filter).await
    }

    pub async fn purge(&self, id: Uuid) -> Result<()> {
        self.registry.purge(id).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn subscribe_observer(&self, observer: Arc<dyn JobObserver>) -> SubscriptionHandle {
        self.bus.subscribe_observer(observer)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    /// Number of jobs that have not reached a terminal state.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Cancel every active job and wait for the workers to finish.
    pub async fn shutdown(&self) {
        let workers: Vec<(Uuid, JoinHandle<()>)> = {
            let mut active = self.active.write().await;
            active
                .iter_mut()
                .filter_map(|(id, job)| {
                    if let Some(cancel_tx) = job.cancel_tx.take() {
                        job.cause = Some(CancelCause::Requested);
                        let _ = cancel_tx.send(());
                    }
                    job.worker.take().map(|worker| (*id, worker))
                })
                .collect()
        };

        if workers.is_empty() {
            return;
        }
        tracing::info!("Shutting down, cancelling {} job(s)", workers.len());

        let wait = self.config.grace_period() + SHUTDOWN_MARGIN;
        for (id, worker) in workers {
            match tokio::time::timeout(wait, worker).await {
                Ok(Ok(())) => tracing::debug!("Job {} shut down", id),
                Ok(Err(e)) => tracing::warn!("Job {} worker failed during shutdown: {}", id, e),
                Err(_) => tracing::warn!("Job {} did not finish within {:?}", id, wait),
            }
        }
    }
}

/// Per-job task body.
struct JobWorker {
    registry: Arc<dyn JobRegistry>,
    runner: Arc<ProcessRunner>,
    bus: EventBus,
    config: Arc<CoordinatorConfig>,
    active: ActiveJobs,
}

impl JobWorker {
    async fn run(self, spec: JobSpec, mut cancel_rx: oneshot::Receiver<()>) {
        let id = spec.id();
        // A job cancelled while queued must leave the old output alone
        if cancel_rx.try_recv().is_ok() {
            tracing::debug!("Job {} cancelled before launch", id);
            self.finish(&spec, Some(CANCELLED_EXIT_CODE)).await;
            return;
        }
        self.prepare_output(spec.output_path()).await;

        let invocation = Invocation::new(
            self.config.tool.clone(),
            spec.command_arguments(self.config.insert_input_arg, self.config.append_output_path),
        );
        let (event_tx, mut event_rx) = mpsc::channel(self.config.runner_channel_capacity.max(1));
        let runner = Arc::clone(&self.runner);
        let run_task =
            tokio::spawn(async move { runner.run(invocation, cancel_rx, event_tx).await });

        let job_timeout = self.config.job_timeout();
        let deadline = async move {
            match job_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let mut deadline_armed = job_timeout.is_some();

        let exit_code = loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(RunnerEvent::Started { pid }) => self.on_started(id, pid).await,
                    Some(RunnerEvent::OutputLine { text }) => self.on_output(id, text).await,
                    Some(RunnerEvent::Exited { code }) => break Some(code),
                    None => break None,
                },
                _ = &mut deadline, if deadline_armed => {
                    deadline_armed = false;
                    tracing::warn!("Job {} exceeded its deadline of {:?}", id, job_timeout);
                    signal_cancel(&self.active, id, CancelCause::TimedOut).await;
                }
            }
        };

        if let Err(e) = run_task.await {
            tracing::error!("Runner task for job {} failed: {}", id, e);
        }

        self.finish(&spec, exit_code).await;
    }

    async fn prepare_output(&self, output: &Path) {
        if let Some(parent) = output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!("Failed to create {}: {}", parent.display(), e);
            }
        }

        if !self.config.remove_stale_output {
            return;
        }
        match tokio::fs::remove_file(output).await {
            Ok(()) => tracing::info!("Removed stale output {}", output.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove stale output {}: {}", output.display(), e),
        }
    }

    async fn on_started(&self, id: Uuid, pid: Option<u32>) {
        let fields = TransitionFields {
            pid,
            ..Default::default()
        };
        if let Err(e) = self.registry.transition(id, JobState::Running, fields).await {
            tracing::error!("Failed to mark job {} running: {}", id, e);
        }
        tracing::info!("Job {} started (pid {:?})", id, pid);
        self.bus.publish(JobEvent::Started {
            job_id: id,
            pid,
            timestamp: Utc::now(),
        });
    }

    async fn on_output(&self, id: Uuid, line: Arc<str>) {
        if let Err(e) = self.registry.append_output(id, &line).await {
            tracing::error!("Failed to record output for job {}: {}", id, e);
        }
        tracing::debug!("[{}] {}", id, line);
        self.bus.publish(JobEvent::Progress {
            job_id: id,
            line,
            timestamp: Utc::now(),
        });
    }

    /// Apply the single terminal transition and publish its event.
    async fn finish(&self, spec: &JobSpec, exit_code: Option<i32>) {
        let id = spec.id();
        let cause = self
            .active
            .write()
            .await
            .remove(&id)
            .and_then(|job| job.cause);

        let (state, fields) = match exit_code {
            Some(0) => match verify_output(spec.output_path()).await {
                Ok(bytes) => (
                    JobState::Succeeded,
                    TransitionFields {
                        exit_code: Some(0),
                        output_bytes: Some(bytes),
                        ..Default::default()
                    },
                ),
                Err(problem) => {
                    tracing::warn!("Job {} exited 0 but {}", id, problem);
                    if let Err(e) = self.registry.append_output(id, &problem).await {
                        tracing::error!("Failed to record output for job {}: {}", id, e);
                    }
                    failed(0, FailureReason::PostconditionViolation)
                }
            },
            Some(CANCELLED_EXIT_CODE) if cause == Some(CancelCause::TimedOut) => {
                failed(TIMEOUT_EXIT_CODE, FailureReason::TimedOut)
            }
            Some(CANCELLED_EXIT_CODE) => (
                JobState::Cancelled,
                TransitionFields {
                    exit_code: Some(CANCELLED_EXIT_CODE),
                    ..Default::default()
                },
            ),
            Some(LAUNCH_ERROR_EXIT_CODE) => {
                failed(LAUNCH_ERROR_EXIT_CODE, FailureReason::LaunchFailure)
            }
            Some(code) => failed(code, FailureReason::RuntimeFailure),
            None => {
                tracing::error!("Runner for job {} stopped without an exit", id);
                failed(ABNORMAL_EXIT_CODE, FailureReason::RuntimeFailure)
            }
        };

        let event = match state {
            JobState::Succeeded => JobEvent::Succeeded {
                job_id: id,
                exit_code: 0,
                output_bytes: fields.output_bytes.unwrap_or_default(),
                timestamp: Utc::now(),
            },
            JobState::Cancelled => JobEvent::Cancelled {
                job_id: id,
                timestamp: Utc::now(),
            },
            _ => JobEvent::Failed {
                job_id: id,
                exit_code: fields.exit_code.unwrap_or(ABNORMAL_EXIT_CODE),
                reason: fields.failure.unwrap_or(FailureReason::RuntimeFailure),
                timestamp: Utc::now(),
            },
        };

        if let Err(e) = self.registry.transition(id, state, fields).await {
            tracing::error!("Failed to record outcome of job {}: {}", id, e);
        }

        match event {
            JobEvent::Succeeded { output_bytes, .. } => {
                tracing::info!("Job {} succeeded ({} bytes written)", id, output_bytes)
            }
            JobEvent::Failed {
                exit_code, reason, ..
            } => tracing::warn!("Job {} failed: {} (exit code {})", id, reason, exit_code),
            _ => tracing::info!("Job {} cancelled", id),
        }
        self.bus.publish(event);
    }
}

fn failed(exit_code: i32, reason: FailureReason) -> (JobState, TransitionFields) {
    (
        JobState::Failed,
        TransitionFields {
            exit_code: Some(exit_code),
            failure: Some(reason),
            ..Default::default()
        },
    )
}

/// Size of the output file, or a description of why it is unusable.
async fn verify_output(output: &Path) -> std::result::Result<u64, String> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if !meta.is_file() => Err(format!("{} is not a file", output.display())),
        Ok(meta) if meta.len() == 0 => Err(format!("{} is empty", output.display())),
        Ok(meta) => Ok(meta.len()),
        Err(e) => Err(format!("{} is missing: {}", output.display(), e)),
    }
}
