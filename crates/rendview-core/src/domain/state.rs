//! State - タスクの状態機械

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of sub-task a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskKind {
    Render,
    Filter,
}

impl fmt::Display for SubTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubTaskKind::Render => f.write_str("render"),
            SubTaskKind::Filter => f.write_str("filter"),
        }
    }
}

/// TaskState はタスクの状態を表現
///
/// # 状態遷移（前進のみ）
/// - ToBeRendered → Done（render のみ）
/// - ToBeFiltered → Done（filter のみ）
/// - ToBeRendered → ToBeFiltered → Done（render + filter）
///
/// step が失敗しても状態は変わらず、レコードはそのまま done キューへ行く。
/// 宣言順がパイプライン順なので、`Ord` で後退を弾ける。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for (or running) the render step.
    ToBeRendered,

    /// Waiting for (or running) the filter step.
    ToBeFiltered,

    /// All steps completed.
    Done,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done)
    }

    /// The kind of worker needed to advance from this state.
    pub fn pending_kind(self) -> Option<SubTaskKind> {
        match self {
            TaskState::ToBeRendered => Some(SubTaskKind::Render),
            TaskState::ToBeFiltered => Some(SubTaskKind::Filter),
            TaskState::Done => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::ToBeRendered => "to-be-rendered",
            TaskState::ToBeFiltered => "to-be-filtered",
            TaskState::Done => "done",
        };
        f.write_str(s)
    }
}
