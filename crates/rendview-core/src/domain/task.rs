//! TaskRecord - 作業の単位

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::desc::{FilterDesc, ImageFormat, RenderDesc};
use super::errors::TaskError;
use super::ids::{FileHandle, TaskId};
use super::state::{SubTaskKind, TaskState};
use super::status::ExecStatus;

/// Render step description.
#[derive(Debug, Clone)]
pub struct RenderSubTask {
    pub desc: Arc<RenderDesc>,
    pub format: Arc<ImageFormat>,
    pub input: FileHandle,
    pub output: FileHandle,
    pub width: u16,
    pub height: u16,
    pub timeout: Option<Duration>,
    pub args: Vec<String>,
    pub add_files: Vec<FileHandle>,
}

/// Filter step description.
#[derive(Debug, Clone)]
pub struct FilterSubTask {
    pub desc: Arc<FilterDesc>,
    pub input: FileHandle,
    pub output: FileHandle,
    pub timeout: Option<Duration>,
    pub args: Vec<String>,
    pub add_files: Vec<FileHandle>,
}

/// A frame's render and/or filter work plus the execution history.
///
/// Design:
/// - Owned by exactly one queue at a time (pending, running or done); moving
///   the value is the handoff.
/// - All state transitions go through methods here.
#[derive(Debug)]
pub struct TaskRecord {
    id: TaskId,
    frame_no: u32,
    state: TaskState,
    render: Option<RenderSubTask>,
    filter: Option<FilterSubTask>,
    render_status: ExecStatus,
    filter_status: ExecStatus,

    /// Not launchable until the source has all input files in place.
    held: bool,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        frame_no: u32,
        render: Option<RenderSubTask>,
        filter: Option<FilterSubTask>,
    ) -> Result<Self, TaskError> {
        let state = match (&render, &filter) {
            (Some(_), _) => TaskState::ToBeRendered,
            (None, Some(_)) => TaskState::ToBeFiltered,
            (None, None) => return Err(TaskError::NoSubTask(id)),
        };
        let now = Instant::now();
        Ok(Self {
            id,
            frame_no,
            state,
            render,
            filter,
            render_status: ExecStatus::not_run(),
            filter_status: ExecStatus::not_run(),
            held: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn frame_no(&self) -> u32 {
        self.frame_no
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn render(&self) -> Option<&RenderSubTask> {
        self.render.as_ref()
    }

    pub fn filter(&self) -> Option<&FilterSubTask> {
        self.filter.as_ref()
    }

    pub fn status(&self, kind: SubTaskKind) -> &ExecStatus {
        match kind {
            SubTaskKind::Render => &self.render_status,
            SubTaskKind::Filter => &self.filter_status,
        }
    }

    fn status_mut(&mut self, kind: SubTaskKind) -> &mut ExecStatus {
        match kind {
            SubTaskKind::Render => &mut self.render_status,
            SubTaskKind::Filter => &mut self.filter_status,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn hold(&mut self) {
        self.held = true;
        self.updated_at = Instant::now();
    }

    pub fn release_hold(&mut self) {
        self.held = false;
        self.updated_at = Instant::now();
    }

    /// Did any step end unsuccessfully?
    pub fn has_failed(&self) -> bool {
        [&self.render_status, &self.filter_status]
            .iter()
            .any(|s| !matches!(s.exit, super::ExitKind::NotRun | super::ExitKind::Success))
    }

    /// Record the result of the step the task is waiting for.
    ///
    /// On success the state moves forward; on failure it stays put and the
    /// failure is only visible through the status.
    pub fn complete_step(
        &mut self,
        kind: SubTaskKind,
        status: ExecStatus,
    ) -> Result<TaskState, TaskError> {
        if self.state.pending_kind() != Some(kind) {
            return Err(TaskError::WrongStep {
                task: self.id,
                state: self.state,
                kind,
            });
        }
        let success = status.is_success();
        *self.status_mut(kind) = status;
        if success {
            self.state = match kind {
                SubTaskKind::Render if self.filter.is_some() => TaskState::ToBeFiltered,
                SubTaskKind::Render | SubTaskKind::Filter => TaskState::Done,
            };
        }
        self.updated_at = Instant::now();
        Ok(self.state)
    }

    /// Put the record back to its unprocessed initial state.
    ///
    /// Only used while handing tasks back during a recovery cycle.
    pub fn reset(&mut self) {
        self.state = if self.render.is_some() {
            TaskState::ToBeRendered
        } else {
            TaskState::ToBeFiltered
        };
        self.render_status = ExecStatus::not_run();
        self.filter_status = ExecStatus::not_run();
        self.updated_at = Instant::now();
    }

    /// The file holding the final result.
    pub fn final_output(&self) -> FileHandle {
        match (&self.filter, &self.render) {
            (Some(f), _) => f.output,
            (None, Some(r)) => r.output,
            // `new` guarantees at least one step.
            (None, None) => unreachable!("task without steps"),
        }
    }

    /// Every registry handle the record holds a reference on.
    pub fn file_handles(&self) -> Vec<FileHandle> {
        let mut out = Vec::new();
        if let Some(r) = &self.render {
            out.push(r.input);
            out.push(r.output);
            out.extend(&r.add_files);
        }
        if let Some(f) = &self.filter {
            out.push(f.input);
            out.push(f.output);
            out.extend(&f.add_files);
        }
        out
    }
}
