//! WorkerLauncher port
//!
//! manager は解決済みの [`WorkerJob`] を launcher に渡し、worker がどう
//! 終わっても exit チャネルでちょうど 1 つの [`WorkerExit`] を受け取る。

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::domain::{ExecStatus, SubTaskKind, TaskId};

/// One sub-task ready to run: every handle already resolved to a path.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub task_id: TaskId,
    pub frame_no: u32,
    pub kind: SubTaskKind,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub input: PathBuf,
    pub output: PathBuf,
    pub add_files: Vec<PathBuf>,
    /// Render only.
    pub geometry: Option<(u16, u16)>,
    /// Render only: output format name.
    pub format: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct WorkerExit {
    pub task_id: TaskId,
    pub kind: SubTaskKind,
    pub status: ExecStatus,
}

pub type ExitSender = mpsc::UnboundedSender<WorkerExit>;
pub type ExitReceiver = mpsc::UnboundedReceiver<WorkerExit>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KillMode {
    /// Polite request (SIGTERM); escalates after the grace period.
    Terminate,
    /// Immediate SIGKILL.
    Kill,
}

pub type KillReceiver = watch::Receiver<Option<KillMode>>;

/// Manager-side handle on a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    kill_tx: watch::Sender<Option<KillMode>>,
}

impl WorkerHandle {
    pub fn channel() -> (Self, KillReceiver) {
        let (kill_tx, rx) = watch::channel(None);
        (Self { kill_tx }, rx)
    }

    /// Ask the worker to stop. Never downgrades an earlier request.
    pub fn kill(&self, mode: KillMode) {
        self.kill_tx.send_if_modified(|cur| match *cur {
            Some(prev) if prev >= mode => false,
            _ => {
                *cur = Some(mode);
                true
            }
        });
    }

    pub fn kill_requested(&self) -> Option<KillMode> {
        *self.kill_tx.borrow()
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("cannot start {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("task {0} has no {1} step")]
    NoSuchStep(TaskId, SubTaskKind),

    #[error("file handle for task {0} is no longer registered")]
    MissingFile(TaskId),
}

/// Starts worker processes.
pub trait WorkerLauncher: Send {
    fn launch(&mut self, job: WorkerJob, exits: ExitSender) -> Result<WorkerHandle, LaunchError>;
}
