//! Transfer - 受け付けたリクエストを task record とダウンロード計画にする
//!
//! タスク固有のファイル（入力・出力）は work ディレクトリ直下に frame と
//! task id で名付ける。追加ファイルは `work_dir/add` 以下に相対パスのまま置き、
//! タスク間でパスごとに共有する。ダウンロードが完了済みのものは再取得しない。

use std::path::{Path, PathBuf};

use super::request::ValidRequest;
use super::wire::{FileCategory, FileRequest};
use crate::config::LdrConfig;
use crate::domain::{FileHandle, FilterSubTask, RenderSubTask, TaskError, TaskId, TaskRecord};
use crate::files::{Creator, DeletePolicy, FileAttrs, FileKind, FileRegistry, IoRole};

/// One file to fetch from the peer.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub category: FileCategory,
    pub index: u16,
    pub handle: FileHandle,
    pub path: PathBuf,
}

/// Ordered download plan for one task.
#[derive(Debug)]
pub struct Transfer {
    pub task_id: TaskId,
    pub peer_task: u32,
    pub frame_no: u32,
    files: Vec<PlannedFile>,
    next: usize,
}

impl Transfer {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn current(&self) -> Option<&PlannedFile> {
        self.files.get(self.next)
    }

    /// The request for the current file.
    pub fn request(&self) -> Option<FileRequest> {
        self.current().map(|f| FileRequest {
            task_id: self.peer_task,
            category: f.category,
            index: f.index,
        })
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

struct Planner<'a> {
    config: &'a LdrConfig,
    files: &'a FileRegistry,
    id: TaskId,
    frame_no: u32,
    plan: Vec<PlannedFile>,
}

impl Planner<'_> {
    fn task_policy(&self) -> DeletePolicy {
        if self.config.keep_files {
            DeletePolicy::OnExit
        } else {
            DeletePolicy::OnFrameDone
        }
    }

    fn task_file(&self, suffix: &str) -> PathBuf {
        self.config
            .work_dir
            .join(format!("f{:07}-{}{suffix}", self.frame_no, self.id.get()))
    }

    fn shared(&self, name: &Path) -> PathBuf {
        self.config
            .shared_dir
            .as_deref()
            .unwrap_or(&self.config.work_dir)
            .join(name)
    }

    /// Register a task input, planning its download unless transfers are off.
    fn input(&mut self, category: FileCategory, role: IoRole, kind: FileKind, ext: &str) -> FileHandle {
        if self.config.transfer_render_input {
            let path = self.task_file(&format!("-in.{ext}"));
            let attrs = FileAttrs::new(kind, role, Creator::Ldr, self.task_policy());
            let handle = self.files.acquire(&path, attrs);
            self.plan.push(PlannedFile {
                category,
                index: 0,
                handle,
                path,
            });
            handle
        } else {
            let path = self.shared(Path::new(&format!("f{:07}.{ext}", self.frame_no)));
            let attrs = FileAttrs::new(kind, role, Creator::Ldr, DeletePolicy::Never);
            self.files.acquire(path, attrs)
        }
    }

    fn output(&self, role: IoRole, suffix: &str) -> FileHandle {
        let attrs = FileAttrs::new(FileKind::Image, role, Creator::Ldr, self.task_policy());
        self.files.acquire(self.task_file(suffix), attrs)
    }

    fn additional(&mut self, category: FileCategory, names: &[PathBuf]) -> Vec<FileHandle> {
        let role = match category {
            FileCategory::AdditionalFilter => IoRole::FilterInput,
            _ => IoRole::RenderInput,
        };
        let mut handles = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            if !self.config.transfer_additional_files {
                let attrs = FileAttrs::new(FileKind::Additional, role, Creator::Ldr, DeletePolicy::Never);
                handles.push(self.files.acquire(self.shared(name), attrs));
                continue;
            }

            let path = self.config.work_dir.join("add").join(name);
            let policy = if self.config.keep_files {
                DeletePolicy::OnExit
            } else {
                DeletePolicy::OnRecoveryCycle
            };
            let handle = self.files.acquire(
                &path,
                FileAttrs::new(FileKind::Additional, role, Creator::Ldr, policy),
            );
            // An entry left behind by a refused or failed transfer is fetched again.
            let planned = self.plan.iter().any(|f| f.handle == handle);
            if !planned && !self.files.is_fetched(handle) {
                self.plan.push(PlannedFile {
                    category,
                    index: index as u16,
                    handle,
                    path,
                });
            }
            handles.push(handle);
        }
        handles
    }
}

/// Register every file of `valid` and build the task record.
///
/// The record holds one registry reference per handle it lists and starts
/// out held when anything has to be downloaded.
pub fn prepare(
    valid: ValidRequest,
    id: TaskId,
    config: &LdrConfig,
    files: &FileRegistry,
) -> Result<(TaskRecord, Transfer), TaskError> {
    let mut p = Planner {
        config,
        files,
        id,
        frame_no: valid.frame_no,
        plan: Vec::new(),
    };
    let ext = valid
        .format
        .as_ref()
        .map_or_else(|| "img".to_string(), |f| f.extension.clone());

    let render = valid.render.map(|r| {
        let input = p.input(FileCategory::RenderInput, IoRole::RenderInput, FileKind::FrameSource, "pov");
        let add_files = p.additional(FileCategory::AdditionalRender, &r.add_files);
        let output = p.output(IoRole::RenderOutput, &format!(".{ext}"));
        RenderSubTask {
            desc: r.desc,
            format: r.format,
            input,
            output,
            width: r.width,
            height: r.height,
            timeout: r.timeout,
            args: r.args,
            add_files,
        }
    });

    let filter = valid.filter.map(|f| {
        let input = match &render {
            Some(r) => {
                // Shared with the render step; one reference per step.
                let _ = files.retain(r.output);
                r.output
            }
            None => p.input(FileCategory::RenderOutput, IoRole::FilterInput, FileKind::Image, &ext),
        };
        let add_files = p.additional(FileCategory::AdditionalFilter, &f.add_files);
        let output = p.output(IoRole::FilterOutput, &format!("-filtered.{ext}"));
        FilterSubTask {
            desc: f.desc,
            input,
            output,
            timeout: f.timeout,
            args: f.args,
            add_files,
        }
    });

    // Category order on the wire: inputs first, then additional files.
    let mut plan = p.plan;
    plan.sort_by_key(|f| f.category);

    let transfer = Transfer {
        task_id: id,
        peer_task: valid.peer_task,
        frame_no: valid.frame_no,
        files: plan,
        next: 0,
    };
    let mut record = TaskRecord::new(id, valid.frame_no, render, filter)?;
    if !transfer.is_empty() {
        record.hold();
    }
    Ok((record, transfer))
}
