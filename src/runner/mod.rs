// Runner module: launches one external command and reports its lifecycle
// as a stream of RunnerEvents ending in exactly one Exited.

pub mod process;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::models::CoordinatorConfig;

pub use process::{
    ChildProcess, Invocation, MockProcessConfig, MockSpawner, OutputStream, ProcessSpawner,
    TokioSpawner,
};

/// Exit code reported when the command could not be launched.
pub const LAUNCH_ERROR_EXIT_CODE: i32 = -1000;
/// Exit code reported when the run was cancelled.
pub const CANCELLED_EXIT_CODE: i32 = -1001;
/// Exit code reported when the process ended without a code of its own
/// (killed by a signal, or waiting on it failed).
pub const ABNORMAL_EXIT_CODE: i32 = -1002;
/// Exit code recorded for a job stopped because it ran past its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -1003;

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Started { pid: Option<u32> },
    OutputLine { text: Arc<str> },
    Exited { code: i32 },
}

/// Drives a single process from launch to exit.
pub struct ProcessRunner {
    spawner: Arc<dyn ProcessSpawner>,
    config: Arc<CoordinatorConfig>,
}

impl ProcessRunner {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: Arc<CoordinatorConfig>) -> Self {
        Self { spawner, config }
    }

    /// Run `invocation` to completion, sending its events on `events`.
    ///
    /// Always ends with exactly one `Exited`, including when the launch
    /// fails or `cancel_rx` fires. A dropped cancel sender is not treated
    /// as a cancellation.
    pub async fn run(
        &self,
        invocation: Invocation,
        mut cancel_rx: oneshot::Receiver<()>,
        events: mpsc::Sender<RunnerEvent>,
    ) {
        if cancel_rx.try_recv().is_ok() {
            tracing::debug!("Cancelled before launch: {}", invocation.program);
            let _ = events
                .send(RunnerEvent::Exited {
                    code: CANCELLED_EXIT_CODE,
                })
                .await;
            return;
        }

        let mut child = match self.spawner.spawn(&invocation) {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to launch '{}': {:#}", invocation.program, e);
                tracing::warn!("{}", message);
                let _ = events
                    .send(RunnerEvent::OutputLine {
                        text: Arc::from(message.as_str()),
                    })
                    .await;
                let _ = events
                    .send(RunnerEvent::Exited {
                        code: LAUNCH_ERROR_EXIT_CODE,
                    })
                    .await;
                return;
            }
        };

        let pid = child.id();
        tracing::debug!("Launched '{}' (pid {:?})", invocation.program, pid);
        let _ = events.send(RunnerEvent::Started { pid }).await;

        let max_line_bytes = self.config.max_line_bytes;
        let readers: Vec<JoinHandle<()>> = child
            .take_output()
            .into_iter()
            .map(|stream| tokio::spawn(forward_lines(stream, events.clone(), max_line_bytes)))
            .collect();

        let cancelled = async move {
            if cancel_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(Some(code)) => code,
                Ok(None) => {
                    tracing::warn!("Process {:?} ended without an exit code", pid);
                    ABNORMAL_EXIT_CODE
                }
                Err(e) => {
                    tracing::warn!("Waiting on process {:?} failed: {}", pid, e);
                    ABNORMAL_EXIT_CODE
                }
            },
            _ = cancelled => {
                self.stop(child.as_mut(), pid).await;
                CANCELLED_EXIT_CODE
            }
        };

        // Output must be fully forwarded before Exited.
        let grace = self.config.grace_period();
        for mut reader in readers {
            if tokio::time::timeout(grace, &mut reader).await.is_err() {
                tracing::debug!("Output reader for pid {:?} still open, aborting", pid);
                reader.abort();
            }
        }

        let _ = events.send(RunnerEvent::Exited { code }).await;
    }

    /// Ask the process to stop, then force-kill it once the grace period runs out.
    async fn stop(&self, child: &mut dyn ChildProcess, pid: Option<u32>) {
        if let Err(e) = child.terminate() {
            tracing::debug!("Terminate signal to {:?} failed: {}", pid, e);
        }

        let grace = self.config.grace_period();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => tracing::debug!("Process {:?} stopped within grace period", pid),
            Err(_) => {
                tracing::warn!(
                    "Process {:?} did not stop within {:?}, killing",
                    pid,
                    grace
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill process {:?}: {}", pid, e);
                }
                let _ = child.wait().await;
            }
        }
    }
}

/// Forward every line of `stream` as an OutputLine. Lines longer than
/// `max_line_bytes` are truncated; empty lines are skipped.
async fn forward_lines(stream: OutputStream, events: mpsc::Sender<RunnerEvent>, max_line_bytes: usize) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match read_bounded_line(&mut reader, &mut line, max_line_bytes).await {
            Ok(false) => break,
            Ok(true) => {
                if line.is_empty() {
                    continue;
                }
                let text = String::from_utf8_lossy(&line);
                if events
                    .send(RunnerEvent::OutputLine {
                        text: Arc::from(text.as_ref()),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Output read error (may be expected at exit): {}", e);
                break;
            }
        }
    }
}

/// Read up to the next `\n` or `\r` into `line`, keeping at most `max`
/// bytes and discarding the rest of the line. Progress-style tools rewrite
/// a status line with `\r`, so both count as terminators.
///
/// Returns `false` at end of input when nothing was read.
async fn read_bounded_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any);
        }
        read_any = true;

        let room = max.saturating_sub(line.len());
        match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            Some(pos) => {
                line.extend_from_slice(&available[..pos.min(room)]);
                reader.consume(pos + 1);
                return Ok(true);
            }
            None => {
                let n = available.len();
                line.extend_from_slice(&available[..n.min(room)]);
                reader.consume(n);
            }
        }
    }
}
