//! Errors - サブシステム共通のエラー分類

use thiserror::Error;

use super::ids::TaskId;
use super::state::{SubTaskKind, TaskState};

/// Operational classification of a failure.
///
/// Decides how far an error may travel: transient errors are retried,
/// protocol and semantic errors stay inside one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry makes sense (e.g. connect failed).
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// Malformed or out-of-sequence traffic from a peer.
    Protocol,
    /// Well-formed request naming something we do not know.
    Semantic,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {0} has neither a render nor a filter step")]
    NoSubTask(TaskId),

    #[error("task {task} is {state}, cannot complete a {kind} step")]
    WrongStep {
        task: TaskId,
        state: TaskState,
        kind: SubTaskKind,
    },
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NoSubTask(_) => ErrorKind::Semantic,
            TaskError::WrongStep { .. } => ErrorKind::Permanent,
        }
    }
}
