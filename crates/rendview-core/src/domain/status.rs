//! ExecStatus - sub-task の実行結果
//!
//! sub-task を実行した worker が埋め、task source まで運ばれる
//! （LDR なら `TaskDone` パケットにシリアライズされる）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of how a sub-task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitKind {
    /// The sub-task has not been run (yet).
    NotRun,

    /// Exited with status 0.
    Success,

    /// Exited with a nonzero status.
    Failed(i32),

    /// Terminated by a signal it did not ask for.
    Signalled(i32),

    /// Killed because it exceeded its timeout.
    Timeout,

    /// Killed on request (quit or recovery).
    Killed,

    /// Could not be started at all.
    LaunchFailed,
}

impl ExitKind {
    pub fn is_success(self) -> bool {
        matches!(self, ExitKind::Success)
    }

    /// Wire code for the `TaskDone` status block.
    pub fn wire_code(self) -> (u16, i32) {
        match self {
            ExitKind::NotRun => (0, 0),
            ExitKind::Success => (1, 0),
            ExitKind::Failed(code) => (2, code),
            ExitKind::Signalled(sig) => (3, sig),
            ExitKind::Timeout => (4, 0),
            ExitKind::Killed => (5, 0),
            ExitKind::LaunchFailed => (6, 0),
        }
    }

    pub fn from_wire_code(kind: u16, code: i32) -> Option<Self> {
        Some(match kind {
            0 => ExitKind::NotRun,
            1 => ExitKind::Success,
            2 => ExitKind::Failed(code),
            3 => ExitKind::Signalled(code),
            4 => ExitKind::Timeout,
            5 => ExitKind::Killed,
            6 => ExitKind::LaunchFailed,
            _ => return None,
        })
    }
}

/// CPU time consumed by a worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub user: Duration,
    pub system: Duration,
}

/// One record per sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecStatus {
    pub exit: ExitKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub usage: ResourceUsage,

    /// Free-form reason, e.g. the launch error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExecStatus {
    pub fn not_run() -> Self {
        Self {
            exit: ExitKind::NotRun,
            started_at: None,
            ended_at: None,
            usage: ResourceUsage::default(),
            reason: None,
        }
    }

    pub fn finished(
        exit: ExitKind,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        usage: ResourceUsage,
    ) -> Self {
        Self {
            exit,
            started_at: Some(started_at),
            ended_at: Some(ended_at),
            usage,
            reason: None,
        }
    }

    /// Synthesized status for a worker that never ran.
    pub fn launch_failed(at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            exit: ExitKind::LaunchFailed,
            started_at: Some(at),
            ended_at: Some(at),
            usage: ResourceUsage::default(),
            reason: Some(reason.into()),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit.is_success()
    }

    /// Wall-clock run time, when both timestamps are known.
    pub fn elapsed(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        (end - start).to_std().ok()
    }
}

impl Default for ExecStatus {
    fn default() -> Self {
        Self::not_run()
    }
}
