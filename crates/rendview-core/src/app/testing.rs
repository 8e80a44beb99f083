//! テスト用ダブル: scripted な task source と記録する launcher

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::domain::task::fixtures::{filter_step, render_step};
use crate::domain::{ExecStatus, ExitKind, TaskId, TaskRecord};
use crate::files::{Creator, DeletePolicy, FileAttrs, FileKind, FileRegistry, IoRole};
use crate::ports::{
    ConnectOutcome, DisconnectOutcome, DoneOutcome, ExitSender, GetTaskOutcome, LaunchError,
    NoticeSender, Rejected, SourceCallError, SourceKind, SourceNotice, SourceOp, TaskSource,
    WorkerExit, WorkerHandle, WorkerJob, WorkerLauncher,
};

/// What the scripted source saw.
#[derive(Debug, Default)]
pub struct SourceLog {
    pub calls: Vec<SourceOp>,
    pub done: Vec<TaskRecord>,
    pub handed_out: usize,
    pub notices: Option<NoticeSender>,
}

/// Source that answers every call at once from a fixed task list.
///
/// The active variant only answers get-task as a recovery acknowledgement;
/// tests push offers through the notice sender kept in the log.
pub struct ScriptedSource {
    kind: SourceKind,
    tasks: VecDeque<TaskRecord>,
    connect_failures: u32,
    retry_connect: bool,
    log: Arc<Mutex<SourceLog>>,
    notices: Option<NoticeSender>,
}

impl ScriptedSource {
    pub fn passive(tasks: Vec<TaskRecord>) -> Self {
        Self {
            kind: SourceKind::Passive,
            tasks: tasks.into(),
            connect_failures: 0,
            retry_connect: true,
            log: Arc::default(),
            notices: None,
        }
    }

    pub fn active() -> Self {
        Self {
            kind: SourceKind::Active,
            ..Self::passive(Vec::new())
        }
    }

    /// Fail the first `n` connects.
    pub fn failing_connects(mut self, n: u32, retry: bool) -> Self {
        self.connect_failures = n;
        self.retry_connect = retry;
        self
    }

    pub fn log(&self) -> Arc<Mutex<SourceLog>> {
        Arc::clone(&self.log)
    }

    fn notify(&self, notice: SourceNotice) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice);
        }
    }
}

impl TaskSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn attach(&mut self, notices: NoticeSender) {
        self.log.lock().notices = Some(notices.clone());
        self.notices = Some(notices);
    }

    fn connect_retry_makes_sense(&self) -> bool {
        self.retry_connect
    }

    fn connect(&mut self) -> Result<(), SourceCallError> {
        self.log.lock().calls.push(SourceOp::Connect);
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            self.notify(SourceNotice::Connect(ConnectOutcome::Failed("refused".into())));
        } else {
            self.notify(SourceNotice::Connect(ConnectOutcome::Connected));
        }
        Ok(())
    }

    fn get_task(&mut self) -> Result<(), SourceCallError> {
        self.log.lock().calls.push(SourceOp::GetTask);
        let outcome = match self.kind {
            SourceKind::Active => GetTaskOutcome::RecoveryAcknowledged,
            SourceKind::Passive => match self.tasks.pop_front() {
                Some(task) => {
                    self.log.lock().handed_out += 1;
                    GetTaskOutcome::Task(Box::new(task))
                }
                None => GetTaskOutcome::Exhausted,
            },
        };
        self.notify(SourceNotice::GetTask(outcome));
        Ok(())
    }

    fn done_task(&mut self, task: TaskRecord) -> Result<(), Rejected<TaskRecord>> {
        let id = task.id();
        {
            let mut log = self.log.lock();
            log.calls.push(SourceOp::DoneTask);
            log.done.push(task);
        }
        self.notify(SourceNotice::DoneTask(DoneOutcome::Reported(id)));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SourceCallError> {
        self.log.lock().calls.push(SourceOp::Disconnect);
        self.notify(SourceNotice::Disconnect(DisconnectOutcome::Disconnected));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Exit at once with the given classification.
    Exit(ExitKind),
    /// `launch` itself fails.
    RefuseLaunch,
    /// Run until a kill request arrives, then exit as killed.
    RunUntilKilled,
}

/// Launcher that records jobs and fakes their exits.
#[derive(Clone)]
pub struct RecordingLauncher {
    behavior: Behavior,
    jobs: Arc<Mutex<Vec<WorkerJob>>>,
}

impl RecordingLauncher {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            jobs: Arc::default(),
        }
    }

    pub fn launches(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn launch(&mut self, job: WorkerJob, exits: ExitSender) -> Result<WorkerHandle, LaunchError> {
        self.jobs.lock().push(job.clone());
        let (handle, mut kill_rx) = WorkerHandle::channel();
        let (task_id, kind) = (job.task_id, job.kind);
        match self.behavior {
            Behavior::RefuseLaunch => Err(LaunchError::Spawn {
                binary: job.binary,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
            }),
            Behavior::Exit(exit) => {
                let now = Utc::now();
                let _ = exits.send(WorkerExit {
                    task_id,
                    kind,
                    status: ExecStatus::finished(exit, now, now, Default::default()),
                });
                Ok(handle)
            }
            Behavior::RunUntilKilled => {
                let started = Utc::now();
                tokio::spawn(async move {
                    while kill_rx.borrow().is_none() {
                        if kill_rx.changed().await.is_err() {
                            return;
                        }
                    }
                    let _ = exits.send(WorkerExit {
                        task_id,
                        kind,
                        status: ExecStatus::finished(
                            ExitKind::Killed,
                            started,
                            Utc::now(),
                            Default::default(),
                        ),
                    });
                });
                Ok(handle)
            }
        }
    }
}

/// Task whose files are registered in `files` (so jobs can be built).
pub fn registered_task(files: &FileRegistry, n: u32, with_filter: bool) -> TaskRecord {
    let attrs = |kind, role| FileAttrs::new(kind, role, Creator::Local, DeletePolicy::Never);
    let dir = std::path::Path::new("/nonexistent/rendview");

    let mut render = render_step(n);
    render.input = files.acquire(
        dir.join(format!("f{n:04}.pov")),
        attrs(FileKind::FrameSource, IoRole::RenderInput),
    );
    render.output = files.acquire(
        dir.join(format!("f{n:04}.png")),
        attrs(FileKind::Image, IoRole::RenderOutput),
    );

    let filter = with_filter.then(|| {
        let mut f = filter_step(n);
        f.input = render.output;
        let _ = files.retain(render.output);
        f.output = files.acquire(
            dir.join(format!("f{n:04}-filtered.png")),
            attrs(FileKind::Image, IoRole::FilterOutput),
        );
        f
    });

    TaskRecord::new(TaskId::new(n), n, Some(render), filter).unwrap()
}

/// Poll `cond` until it holds; panic after about two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
