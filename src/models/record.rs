use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::JobSpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Running => 1,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => 2,
        }
    }

    /// States only move forward: Queued, then Running, then one terminal
    /// state. Skipping Running is allowed.
    pub fn can_transition_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    /// The tool could not be started (missing binary, permissions).
    LaunchFailure,
    /// The tool ran and exited non-zero, or died without an exit code.
    RuntimeFailure,
    /// The tool exited 0 but left no usable output file.
    PostconditionViolation,
    /// The job exceeded its configured deadline.
    TimedOut,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::LaunchFailure => "launch failure",
            FailureReason::RuntimeFailure => "runtime failure",
            FailureReason::PostconditionViolation => "output missing or empty",
            FailureReason::TimedOut => "timed out",
        };
        f.write_str(text)
    }
}

/// Most recent output lines of a job, bounded by total byte size.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogTail {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl LogTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Append a line, evicting the oldest lines to stay within budget.
    pub fn push(&mut self, line: &str) {
        if self.max_bytes == 0 {
            return;
        }
        let line = truncate_utf8(line, self.max_bytes);
        while self.bytes + line.len() > self.max_bytes {
            match self.lines.pop_front() {
                Some(old) => self.bytes -= old.len(),
                None => break,
            }
        }
        self.bytes += line.len();
        self.lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }
}

impl fmt::Display for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Registry-owned state of one job. Values handed out by the registry are
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub pid: Option<u32>,
    pub output_lines: u64,
    pub log_tail: LogTail,
    /// Size of the verified output file, set on success.
    pub output_bytes: Option<u64>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn queued(spec: JobSpec, log_tail_bytes: usize) -> Self {
        Self {
            spec,
            state: JobState::Queued,
            exit_code: None,
            failure: None,
            pid: None,
            output_lines: 0,
            log_tail: LogTail::new(log_tail_bytes),
            output_bytes: None,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.spec.id()
    }
}

/// Extra fields recorded alongside a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub output_bytes: Option<u64>,
}

/// Selection applied by `JobRegistry::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Option<Vec<JobState>>,
    pub active_only: bool,
}

impl JobFilter {
    pub fn active() -> Self {
        Self {
            states: None,
            active_only: true,
        }
    }

    pub fn with_states(states: Vec<JobState>) -> Self {
        Self {
            states: Some(states),
            active_only: false,
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if self.active_only && !record.state.is_active() {
            return false;
        }
        match self.states {
            Some(ref states) => states.contains(&record.state),
            None => true,
        }
    }
}
