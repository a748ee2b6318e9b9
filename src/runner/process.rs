// Process abstraction with a tokio-backed implementation and a scripted mock.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::Notify;

/// One readable output pipe of a child process.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Program and arguments for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Trait for launching external processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> anyhow::Result<Box<dyn ChildProcess>>;
}

/// Trait for controlling a launched process.
#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Hand out the output pipes. Subsequent calls return nothing.
    fn take_output(&mut self) -> Vec<OutputStream>;
    /// Ask the process to stop (SIGTERM on Unix).
    fn terminate(&mut self) -> io::Result<()>;
    /// Force the process to stop.
    async fn kill(&mut self) -> io::Result<()>;
    /// Wait for exit. `None` means the process ended without an exit code.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

// --- Real implementation using tokio::process ---

pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, invocation: &Invocation) -> anyhow::Result<Box<dyn ChildProcess>> {
        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Box::new(TokioChild { child }))
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Vec<OutputStream> {
        let mut streams: Vec<OutputStream> = Vec::new();
        if let Some(stdout) = self.child.stdout.take() {
            streams.push(Box::new(stdout));
        }
        if let Some(stderr) = self.child.stderr.take() {
            streams.push(Box::new(stderr));
        }
        streams
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // id() is None once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

// --- Mock implementations for testing ---

/// Script for processes produced by [`MockSpawner`].
#[derive(Clone, Default)]
pub struct MockProcessConfig {
    /// Lines written to the output pipe
    pub output: Vec<String>,
    pub exit_code: i32,
    /// Whether spawn should fail with this error
    pub spawn_error: Option<String>,
    /// How long the process runs before exiting
    pub run_duration_ms: u64,
    /// Bytes written to the last argument (the destination) on normal exit
    pub output_bytes: Option<usize>,
    /// Keep running after terminate(); only kill() stops the process
    pub ignore_terminate: bool,
}

/// Mock spawner for testing.
pub struct MockSpawner {
    config: Arc<Mutex<MockProcessConfig>>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
    next_pid: AtomicU32,
}

impl MockSpawner {
    pub fn new(config: MockProcessConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            invocations: Arc::new(Mutex::new(Vec::new())),
            next_pid: AtomicU32::new(4000),
        }
    }

    /// Produce the given output lines and exit with the given code.
    pub fn with_output_and_exit(output: Vec<&str>, exit_code: i32) -> Self {
        Self::new(MockProcessConfig {
            output: output.into_iter().map(String::from).collect(),
            exit_code,
            ..Default::default()
        })
    }

    /// Write `bytes` bytes to the destination, then exit with the given code.
    pub fn writing_output(bytes: usize, exit_code: i32) -> Self {
        Self::new(MockProcessConfig {
            output_bytes: Some(bytes),
            exit_code,
            ..Default::default()
        })
    }

    /// Run for `run_duration_ms` before exiting.
    pub fn with_slow_run(run_duration_ms: u64, exit_code: i32) -> Self {
        Self::new(MockProcessConfig {
            exit_code,
            run_duration_ms,
            ..Default::default()
        })
    }

    /// Fail every spawn with the given error.
    pub fn with_spawn_error(error: &str) -> Self {
        Self::new(MockProcessConfig {
            spawn_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// Replace the script for processes spawned from now on.
    pub fn set_config(&self, config: MockProcessConfig) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Every invocation passed to spawn, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, invocation: &Invocation) -> anyhow::Result<Box<dyn ChildProcess>> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());
        let config = self
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        if let Some(error) = config.spawn_error {
            return Err(anyhow::anyhow!(error));
        }

        let mut output = Vec::new();
        for line in &config.output {
            output.extend_from_slice(line.as_bytes());
            output.push(b'\n');
        }

        Ok(Box::new(MockChild {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            output: Some(output),
            destination: invocation.args.last().map(PathBuf::from),
            config,
            stop: Arc::new(Notify::new()),
            exit: None,
        }))
    }
}

/// Mock process for testing.
pub struct MockChild {
    pid: u32,
    output: Option<Vec<u8>>,
    destination: Option<PathBuf>,
    config: MockProcessConfig,
    stop: Arc<Notify>,
    exit: Option<Option<i32>>,
}

#[async_trait]
impl ChildProcess for MockChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_output(&mut self) -> Vec<OutputStream> {
        match self.output.take() {
            Some(bytes) => vec![Box::new(io::Cursor::new(bytes)) as OutputStream],
            None => Vec::new(),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.config.ignore_terminate {
            self.stop.notify_one();
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.stop.notify_one();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let stop = Arc::clone(&self.stop);
        let run = tokio::time::sleep(Duration::from_millis(self.config.run_duration_ms));
        let exit = tokio::select! {
            _ = run => {
                if let (Some(bytes), Some(path)) = (self.config.output_bytes, &self.destination) {
                    tokio::fs::write(path, vec![0u8; bytes]).await?;
                }
                Some(self.config.exit_code)
            }
            _ = stop.notified() => None,
        };
        self.exit = Some(exit);
        Ok(exit)
    }
}
