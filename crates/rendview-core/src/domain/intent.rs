//! GlobalIntent - task manager 全体の意図

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the manager is trying to do overall.
///
/// Severity increases in declaration order and is never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalIntent {
    /// Keep fetching and running tasks.
    #[default]
    Normal,
    /// Start nothing new, let running workers finish, report back, quit.
    Drain,
    /// Terminate running workers, report back, quit.
    KillAndQuit,
    /// Kill workers and leave without talking to the source.
    AbortNow,
}

impl GlobalIntent {
    /// Raise to `to` if that is more severe. Returns whether it changed.
    pub fn escalate(&mut self, to: GlobalIntent) -> bool {
        if to > *self {
            *self = to;
            true
        } else {
            false
        }
    }

    pub fn is_quitting(self) -> bool {
        self >= GlobalIntent::Drain
    }

    pub fn allows_launch(self) -> bool {
        self == GlobalIntent::Normal
    }

    pub fn exit_status(self) -> ExitStatus {
        match self {
            GlobalIntent::Normal | GlobalIntent::Drain => ExitStatus::Success,
            GlobalIntent::KillAndQuit => ExitStatus::Killed,
            GlobalIntent::AbortNow => ExitStatus::Aborted,
        }
    }
}

impl fmt::Display for GlobalIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GlobalIntent::Normal => "normal",
            GlobalIntent::Drain => "drain-and-quit",
            GlobalIntent::KillAndQuit => "kill-and-quit",
            GlobalIntent::AbortNow => "abort-now",
        };
        f.write_str(s)
    }
}

/// Final process outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Killed,
    Aborted,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Killed => 1,
            ExitStatus::Aborted => 2,
        }
    }
}
