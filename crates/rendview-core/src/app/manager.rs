//! TaskManager - スケジューラ本体
//!
//! 単一のオーナータスクが pending / running / done の各キューを持ち、
//! worker exit・source notice・control の 3 チャネルを受信する。
//! イベントごとに [`TaskManager::tick`]（同期）を実行し、1 パスで起動する
//! worker は高々 1 つ。パスが何かを変えた間は yield して tick を繰り返す。
//!
//! # 不変条件
//! - source への呼び出し（connect / get-task / done-task / disconnect）は
//!   常に高々 1 つだけ outstanding
//! - GlobalIntent は上がるだけで下がらない

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::stats::ManagerStats;
use crate::config::ManagerConfig;
use crate::domain::{ExecStatus, ExitStatus, GlobalIntent, SubTaskKind, TaskId, TaskRecord};
use crate::files::FileRegistry;
use crate::ports::{
    Clock, ConnectOutcome, DisconnectOutcome, DoneOutcome, ExitReceiver, ExitSender,
    GetTaskOutcome, KillMode, LaunchError, NoticeReceiver, RejectReason, Rejected, SourceKind,
    SourceNotice, SourceOp, SystemClock, TaskOffer, TaskSource, WorkerExit, WorkerHandle,
    WorkerJob, WorkerLauncher,
};

/// Out-of-band requests, normally produced from OS signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// SIGINT: drain, then kill, then abort on repeats.
    Interrupt,
    /// SIGTERM: abort at once.
    Terminate,
    /// SIGTSTP: stop launching.
    Stop,
    /// SIGCONT: launch again.
    Continue,
}

#[derive(Debug, Clone)]
pub struct ManagerReport {
    pub exit: ExitStatus,
    pub stats: ManagerStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connected,
}

/// active な source が peer を失った後の recovery cycle
///
/// # フロー
/// 1. 実行中の worker をすべて kill し、exit を待つ
/// 2. 全タスクを done-task で source に返す
/// 3. get-task で recovery を acknowledge し、応答を待つ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    KillingWorkers,
    ReturningTasks,
    Acknowledging,
}

struct Running {
    task: TaskRecord,
    kind: SubTaskKind,
    handle: WorkerHandle,
}

enum Event {
    Exit(WorkerExit),
    Notice(SourceNotice),
    Control(Control),
    Timer,
    Closed,
}

/// TaskManager はタスクを取得し、worker を起動し、結果を返す
///
/// # フロー
/// 1. [`TaskManager::new`] で source と launcher を受け取る
/// 2. [`TaskManager::control`] でシグナル用の sender を取り出す
/// 3. [`TaskManager::run`] が quiescent になるまで回り、[`ManagerReport`] を返す
pub struct TaskManager {
    config: ManagerConfig,
    retry: RetryPolicy,
    source: Box<dyn TaskSource>,
    launcher: Box<dyn WorkerLauncher>,
    files: FileRegistry,
    clock: Arc<dyn Clock>,

    pending: VecDeque<TaskRecord>,
    running: HashMap<TaskId, Running>,
    done: VecDeque<TaskRecord>,
    running_render: usize,
    running_filter: usize,

    intent: GlobalIntent,
    interrupts: u32,
    paused: bool,
    failures_in_row: u32,
    completed: u64,
    failed: u64,
    reported: u64,

    link: Link,
    outstanding: Option<SourceOp>,
    refilling: bool,
    prefer_done: bool,
    exhausted: bool,
    connect_attempts: u32,
    connect_retry_at: Option<Instant>,
    refetch_at: Option<Instant>,
    recovery: Option<Recovery>,

    exits_tx: ExitSender,
    exits_rx: ExitReceiver,
    notices_rx: NoticeReceiver,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl TaskManager {
    pub fn new(
        config: ManagerConfig,
        mut source: Box<dyn TaskSource>,
        launcher: Box<dyn WorkerLauncher>,
        files: FileRegistry,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        source.attach(notices_tx);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let retry = config.connect_retry.policy();

        Self {
            config,
            retry,
            source,
            launcher,
            files,
            clock: Arc::new(SystemClock),
            pending: VecDeque::new(),
            running: HashMap::new(),
            done: VecDeque::new(),
            running_render: 0,
            running_filter: 0,
            intent: GlobalIntent::Normal,
            interrupts: 0,
            paused: false,
            failures_in_row: 0,
            completed: 0,
            failed: 0,
            reported: 0,
            link: Link::Disconnected,
            outstanding: None,
            refilling: false,
            prefer_done: false,
            exhausted: false,
            connect_attempts: 0,
            connect_retry_at: None,
            refetch_at: None,
            recovery: None,
            exits_tx,
            exits_rx,
            notices_rx,
            control_tx,
            control_rx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sender for signals and other out-of-band requests.
    pub fn control(&self) -> mpsc::UnboundedSender<Control> {
        self.control_tx.clone()
    }

    pub fn intent(&self) -> GlobalIntent {
        self.intent
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            pending: self.pending.len(),
            held: self.pending.iter().filter(|t| t.is_held()).count(),
            running_render: self.running_render,
            running_filter: self.running_filter,
            done: self.done.len(),
            completed: self.completed,
            failed: self.failed,
            reported: self.reported,
            failures_in_row: self.failures_in_row,
            intent: self.intent,
        }
    }

    /// Run until quiescent (or aborted) and report the final status.
    pub async fn run(mut self) -> ManagerReport {
        info!(
            source = self.source.name(),
            max_jobs = self.config.max_jobs,
            "task manager started"
        );
        loop {
            while self.tick() {
                tokio::task::yield_now().await;
            }
            if self.is_quiescent() {
                break;
            }
            match self.next_event().await {
                Event::Exit(exit) => self.on_worker_exit(exit),
                Event::Notice(notice) => self.on_notice(notice),
                Event::Control(control) => self.on_control(control),
                Event::Timer => {}
                Event::Closed => {
                    error!("all manager channels closed");
                    self.escalate(GlobalIntent::AbortNow);
                }
            }
        }
        if self.intent == GlobalIntent::AbortNow {
            self.reap_workers().await;
        }
        self.finish()
    }

    /// Kill every running worker and wait up to the kill grace for the exits.
    async fn reap_workers(&mut self) {
        if self.running.is_empty() {
            return;
        }
        for r in self.running.values() {
            r.handle.kill(KillMode::Kill);
        }
        let grace = self.config.kill_grace();
        let reaped = tokio::time::timeout(grace, async {
            while !self.running.is_empty() {
                let Some(exit) = self.exits_rx.recv().await else {
                    break;
                };
                if let Some(r) = self.running.remove(&exit.task_id) {
                    match r.kind {
                        SubTaskKind::Render => self.running_render -= 1,
                        SubTaskKind::Filter => self.running_filter -= 1,
                    }
                    debug!(task_id = %exit.task_id, "worker reaped");
                }
            }
        })
        .await;
        if reaped.is_err() {
            warn!(left = self.running.len(), "workers still running after abort");
        }
    }

    async fn next_event(&mut self) -> Event {
        let wake = [self.connect_retry_at, self.refetch_at]
            .into_iter()
            .flatten()
            .min();
        let timer = async move {
            match wake {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            Some(control) = self.control_rx.recv() => Event::Control(control),
            Some(exit) = self.exits_rx.recv() => Event::Exit(exit),
            Some(notice) = self.notices_rx.recv() => Event::Notice(notice),
            () = timer => Event::Timer,
            else => Event::Closed,
        }
    }

    fn finish(self) -> ManagerReport {
        let stats = self.stats();
        if self.intent == GlobalIntent::AbortNow {
            if !self.running.is_empty() || !self.pending.is_empty() || !self.done.is_empty() {
                warn!(
                    running = self.running.len(),
                    pending = self.pending.len(),
                    done = self.done.len(),
                    "aborting without returning tasks"
                );
            }
        } else if !self.pending.is_empty() || !self.done.is_empty() {
            warn!(
                pending = self.pending.len(),
                done = self.done.len(),
                "source gone with tasks left"
            );
        }
        info!(
            completed = stats.completed,
            failed = stats.failed,
            reported = stats.reported,
            intent = %stats.intent,
            "task manager finished"
        );
        ManagerReport {
            exit: self.intent.exit_status(),
            stats,
        }
    }

    fn is_quiescent(&self) -> bool {
        match self.intent {
            GlobalIntent::Normal => false,
            GlobalIntent::AbortNow => true,
            GlobalIntent::Drain | GlobalIntent::KillAndQuit => {
                self.running.is_empty()
                    && self.outstanding.is_none()
                    && self.link == Link::Disconnected
            }
        }
    }

    /// One scheduling pass. Returns whether anything changed.
    fn tick(&mut self) -> bool {
        if self.intent == GlobalIntent::AbortNow {
            return false;
        }
        let mut changed = self.advance_recovery();

        if self.recovery.is_none() {
            if self.intent.is_quitting() {
                changed |= self.flush_pending();
            } else if self.exhausted && self.pending.is_empty() && self.running.is_empty() {
                info!("source exhausted; draining");
                self.escalate(GlobalIntent::Drain);
                changed = true;
            }
        }

        self.contact_source();
        changed | self.launch_one()
    }

    // ---- source contact -------------------------------------------------

    fn contact_source(&mut self) {
        if self.outstanding.is_some() {
            return;
        }
        match self.link {
            Link::Disconnected => self.maybe_connect(),
            Link::Connected => {
                if let Some(phase) = self.recovery {
                    self.contact_during_recovery(phase);
                    return;
                }
                let quitting = self.intent.is_quitting();
                if quitting
                    && self.pending.is_empty()
                    && self.running.is_empty()
                    && self.done.is_empty()
                {
                    self.call(SourceOp::Disconnect);
                    return;
                }

                let wants_fetch = self.wants_fetch();
                let wants_done = !self.done.is_empty()
                    && (quitting
                        || self.refilling
                        || self.pending.len() < self.config.todo_low_thresh
                        || self.source.kind() == SourceKind::Active);
                let report = match (wants_done, wants_fetch) {
                    (true, true) => quitting || self.prefer_done,
                    (report, _) => report,
                };
                if report {
                    self.prefer_done = false;
                    self.report_one();
                } else if wants_fetch {
                    self.prefer_done = true;
                    self.fetch();
                }
            }
        }
    }

    fn contact_during_recovery(&mut self, phase: Recovery) {
        if phase != Recovery::ReturningTasks {
            return;
        }
        if !self.done.is_empty() {
            self.report_one();
            return;
        }
        self.call(SourceOp::GetTask);
        if self.outstanding == Some(SourceOp::GetTask) {
            debug!("acknowledging recovery");
            self.recovery = Some(Recovery::Acknowledging);
        }
    }

    fn maybe_connect(&mut self) {
        if self.intent.is_quitting() {
            return;
        }
        if let Some(at) = self.connect_retry_at {
            if at > Instant::now() {
                return;
            }
            self.connect_retry_at = None;
        }
        self.call(SourceOp::Connect);
    }

    fn wants_fetch(&mut self) -> bool {
        if self.intent.is_quitting()
            || self.exhausted
            || self.source.kind() != SourceKind::Passive
        {
            return false;
        }
        if let Some(at) = self.refetch_at {
            if at > Instant::now() {
                return false;
            }
            self.refetch_at = None;
        }
        let depth = self.pending.len();
        if depth < self.config.todo_low_thresh {
            self.refilling = true;
        }
        if depth >= self.config.todo_high_thresh {
            self.refilling = false;
        }
        self.refilling
    }

    fn fetch(&mut self) {
        debug_assert!(self.pending.len() < self.config.todo_high_thresh);
        self.call(SourceOp::GetTask);
    }

    fn report_one(&mut self) {
        let Some(task) = self.done.pop_front() else {
            return;
        };
        let id = task.id();
        match self.source.done_task(task) {
            Ok(()) => {
                debug!(task_id = %id, "reporting task");
                self.outstanding = Some(SourceOp::DoneTask);
            }
            Err(Rejected { error, item }) => {
                warn!(task_id = %id, %error, "source refused done-task");
                self.done.push_front(item);
            }
        }
    }

    fn call(&mut self, op: SourceOp) {
        let res = match op {
            SourceOp::Connect => self.source.connect(),
            SourceOp::GetTask => self.source.get_task(),
            SourceOp::Disconnect => self.source.disconnect(),
            SourceOp::DoneTask => {
                self.report_one();
                return;
            }
        };
        match res {
            Ok(()) => {
                debug!(%op, "source call issued");
                self.outstanding = Some(op);
            }
            Err(e) => warn!(%op, error = %e, "source refused call"),
        }
    }

    // ---- notices --------------------------------------------------------

    fn on_notice(&mut self, notice: SourceNotice) {
        if let Some(op) = notice.answers() {
            if self.outstanding != Some(op) {
                warn!(%op, outstanding = ?self.outstanding, "unexpected source completion");
            }
            self.outstanding = None;
        }

        match notice {
            SourceNotice::Connect(ConnectOutcome::Connected) => {
                info!(source = self.source.name(), "connected to task source");
                self.link = Link::Connected;
                self.connect_attempts = 0;
            }
            SourceNotice::Connect(ConnectOutcome::Failed(reason)) => self.on_connect_failed(reason),
            SourceNotice::GetTask(outcome) => self.on_get_task(outcome),
            SourceNotice::DoneTask(DoneOutcome::Reported(id)) => {
                debug!(task_id = %id, "task reported");
                self.reported += 1;
            }
            SourceNotice::DoneTask(DoneOutcome::Discarded(id)) => {
                info!(task_id = %id, "task discarded by source");
            }
            SourceNotice::DoneTask(DoneOutcome::Failed { task, reason }) => {
                warn!(task_id = %task, %reason, "reporting task failed");
            }
            SourceNotice::Disconnect(outcome) => {
                if let DisconnectOutcome::Failed(reason) = outcome {
                    warn!(%reason, "disconnect failed");
                } else {
                    info!("disconnected from task source");
                }
                self.link = Link::Disconnected;
            }
            SourceNotice::Offer(offer) => self.on_offer(offer),
            SourceNotice::TaskReady(id) => {
                match self.pending.iter_mut().find(|t| t.id() == id) {
                    Some(t) => {
                        debug!(task_id = %id, frame = t.frame_no(), "task inputs ready");
                        t.release_hold();
                    }
                    None => debug!(task_id = %id, "ready notice for task not pending"),
                }
            }
            SourceNotice::TaskWithdrawn(id) => {
                let removed =
                    remove_by_id(&mut self.pending, id).or_else(|| remove_by_id(&mut self.done, id));
                if let Some(task) = removed {
                    info!(task_id = %id, frame = task.frame_no(), "task withdrawn by source");
                    self.files.release_all(task.file_handles());
                }
            }
            SourceNotice::Recovering => self.begin_recovery(),
            SourceNotice::QuitRequested => {
                info!("source requested quit");
                self.escalate(GlobalIntent::Drain);
            }
        }
    }

    fn on_get_task(&mut self, outcome: GetTaskOutcome) {
        match outcome {
            GetTaskOutcome::Task(task) => self.take_task(*task),
            GetTaskOutcome::NoTaskYet => {
                self.refilling = false;
                self.refetch_at = Some(Instant::now() + self.retry.base_delay);
            }
            GetTaskOutcome::Exhausted => {
                info!("task source has no more tasks");
                self.exhausted = true;
            }
            GetTaskOutcome::RecoveryAcknowledged => self.finish_recovery(),
            GetTaskOutcome::Failed(reason) => {
                warn!(%reason, "get-task failed");
                self.refilling = false;
                self.refetch_at = Some(Instant::now() + self.retry.base_delay);
            }
        }
    }

    fn take_task(&mut self, task: TaskRecord) {
        debug!(task_id = %task.id(), frame = task.frame_no(), "task received");
        if self.intent.is_quitting() {
            self.done.push_back(task);
        } else {
            self.pending.push_back(task);
        }
    }

    fn on_offer(&mut self, offer: TaskOffer) {
        let reason = if self.recovery.is_some() {
            Some(RejectReason::Recovering)
        } else if self.intent.is_quitting() {
            Some(RejectReason::Quitting)
        } else if self.pending.len() >= self.config.todo_high_thresh {
            Some(RejectReason::TooManyTasks)
        } else {
            None
        };

        match reason {
            None => {
                let task = offer.accept();
                info!(
                    task_id = %task.id(),
                    frame = task.frame_no(),
                    held = task.is_held(),
                    "task accepted"
                );
                self.pending.push_back(task);
            }
            Some(reason) => {
                debug!(task_id = %offer.task().id(), ?reason, "task offer rejected");
                if let Some(task) = offer.reject(reason) {
                    self.files.release_all(task.file_handles());
                }
            }
        }
    }

    fn on_connect_failed(&mut self, reason: String) {
        if self.source.connect_retry_makes_sense() && !self.intent.is_quitting() {
            self.connect_attempts += 1;
            let delay = self.retry.next_delay(self.connect_attempts);
            warn!(
                %reason,
                attempt = self.connect_attempts,
                delay_ms = delay.as_millis() as u64,
                "connect failed; retrying"
            );
            self.connect_retry_at = Some(Instant::now() + delay);
        } else {
            error!(%reason, "connect failed permanently");
            self.escalate(GlobalIntent::KillAndQuit);
        }
    }

    // ---- recovery -------------------------------------------------------

    fn begin_recovery(&mut self) {
        warn!(
            running = self.running.len(),
            pending = self.pending.len(),
            "task source lost its peer; recovering"
        );
        for r in self.running.values() {
            r.handle.kill(KillMode::Kill);
        }
        self.recovery = Some(Recovery::KillingWorkers);
    }

    fn advance_recovery(&mut self) -> bool {
        if self.recovery != Some(Recovery::KillingWorkers) || !self.running.is_empty() {
            return false;
        }
        let returned = self.pending.len();
        for mut task in self.pending.drain(..) {
            task.reset();
            self.done.push_back(task);
        }
        debug!(returned, "handing tasks back for recovery");
        self.recovery = Some(Recovery::ReturningTasks);
        true
    }

    fn finish_recovery(&mut self) {
        if self.recovery != Some(Recovery::Acknowledging) {
            warn!(phase = ?self.recovery, "unexpected recovery acknowledgement");
        }
        self.recovery = None;
        let swept = self.files.sweep_recovery();
        info!(swept, "recovery complete");
    }

    // ---- workers --------------------------------------------------------

    fn on_worker_exit(&mut self, exit: WorkerExit) {
        let Some(Running { mut task, kind, .. }) = self.running.remove(&exit.task_id) else {
            warn!(task_id = %exit.task_id, "exit from unknown worker");
            return;
        };
        match kind {
            SubTaskKind::Render => self.running_render -= 1,
            SubTaskKind::Filter => self.running_filter -= 1,
        }

        if self.recovery.is_some() {
            task.reset();
            debug!(task_id = %task.id(), "worker stopped for recovery");
            self.pending.push_back(task);
            return;
        }

        let success = exit.status.is_success();
        let exit_kind = exit.status.exit;
        match task.complete_step(kind, exit.status) {
            Ok(state) if success => {
                self.failures_in_row = 0;
                if state.is_terminal() {
                    info!(task_id = %task.id(), frame = task.frame_no(), "task done");
                    self.completed += 1;
                    self.done.push_back(task);
                } else {
                    debug!(task_id = %task.id(), %kind, "step done");
                    self.pending.push_back(task);
                }
            }
            Ok(_) => {
                warn!(
                    task_id = %task.id(),
                    frame = task.frame_no(),
                    %kind,
                    exit = ?exit_kind,
                    "worker failed"
                );
                self.record_failure(task);
            }
            Err(e) => {
                error!(error = %e, "worker exit does not match task state");
                self.done.push_back(task);
            }
        }
    }

    fn record_failure(&mut self, task: TaskRecord) {
        self.failed += 1;
        self.failures_in_row += 1;
        self.done.push_back(task);

        let max = self.config.max_failed_in_sequence;
        if max > 0 && self.failures_in_row >= max {
            warn!(failures = self.failures_in_row, "too many failures in a row");
            self.escalate(GlobalIntent::Drain);
        }
    }

    fn has_slot(&self, kind: SubTaskKind) -> bool {
        match kind {
            SubTaskKind::Render => self.running_render < self.config.max_render_jobs,
            SubTaskKind::Filter => self.running_filter < self.config.max_filter_jobs,
        }
    }

    /// Start at most one worker. Returns whether a task left the pending queue.
    fn launch_one(&mut self) -> bool {
        if !self.intent.allows_launch() || self.paused || self.recovery.is_some() {
            return false;
        }
        if self.running.len() >= self.config.max_jobs {
            return false;
        }
        let Some(idx) = self.pending.iter().position(|t| {
            !t.is_held() && t.state().pending_kind().is_some_and(|k| self.has_slot(k))
        }) else {
            return false;
        };
        let Some(mut task) = self.pending.remove(idx) else {
            return false;
        };
        let Some(kind) = task.state().pending_kind() else {
            self.done.push_back(task);
            return true;
        };

        let launched = match self.build_job(&task, kind) {
            Ok(job) => self.launcher.launch(job, self.exits_tx.clone()),
            Err(e) => Err(e),
        };
        match launched {
            Ok(handle) => {
                info!(task_id = %task.id(), frame = task.frame_no(), %kind, "worker launched");
                match kind {
                    SubTaskKind::Render => self.running_render += 1,
                    SubTaskKind::Filter => self.running_filter += 1,
                }
                self.running.insert(task.id(), Running { task, kind, handle });
            }
            Err(e) => {
                warn!(task_id = %task.id(), frame = task.frame_no(), %kind, error = %e, "launch failed");
                let status = ExecStatus::launch_failed(self.clock.now(), e.to_string());
                if let Err(err) = task.complete_step(kind, status) {
                    error!(error = %err, "cannot record launch failure");
                }
                self.record_failure(task);
            }
        }
        true
    }

    fn build_job(&self, task: &TaskRecord, kind: SubTaskKind) -> Result<WorkerJob, LaunchError> {
        let path = |h| {
            self.files
                .path(h)
                .ok_or(LaunchError::MissingFile(task.id()))
        };
        let job = match kind {
            SubTaskKind::Render => {
                let r = task.render().ok_or(LaunchError::NoSuchStep(task.id(), kind))?;
                let mut args = r.desc.required_args.clone();
                args.extend(r.args.iter().cloned());
                WorkerJob {
                    task_id: task.id(),
                    frame_no: task.frame_no(),
                    kind,
                    binary: r.desc.binary.clone(),
                    args,
                    input: path(r.input)?,
                    output: path(r.output)?,
                    add_files: r.add_files.iter().map(|&h| path(h)).collect::<Result<_, _>>()?,
                    geometry: Some((r.width, r.height)),
                    format: Some(r.format.name.clone()),
                    timeout: r.timeout,
                }
            }
            SubTaskKind::Filter => {
                let f = task.filter().ok_or(LaunchError::NoSuchStep(task.id(), kind))?;
                let mut args = f.desc.required_args.clone();
                args.extend(f.args.iter().cloned());
                WorkerJob {
                    task_id: task.id(),
                    frame_no: task.frame_no(),
                    kind,
                    binary: f.desc.binary.clone(),
                    args,
                    input: path(f.input)?,
                    output: path(f.output)?,
                    add_files: f.add_files.iter().map(|&h| path(h)).collect::<Result<_, _>>()?,
                    geometry: None,
                    format: None,
                    timeout: f.timeout,
                }
            }
        };
        Ok(job)
    }

    // ---- intent ---------------------------------------------------------

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Interrupt => {
                self.interrupts += 1;
                let to = match self.interrupts {
                    1 => GlobalIntent::Drain,
                    2 => GlobalIntent::KillAndQuit,
                    _ => GlobalIntent::AbortNow,
                };
                info!(count = self.interrupts, "interrupt");
                self.escalate(to);
            }
            Control::Terminate => self.escalate(GlobalIntent::AbortNow),
            Control::Stop => {
                info!("launching paused");
                self.paused = true;
            }
            Control::Continue => {
                if self.paused {
                    info!("launching resumed");
                }
                self.paused = false;
            }
        }
    }

    fn escalate(&mut self, to: GlobalIntent) {
        if !self.intent.escalate(to) {
            return;
        }
        info!(intent = %self.intent, "global intent raised");
        let mode = match self.intent {
            GlobalIntent::KillAndQuit => Some(KillMode::Terminate),
            GlobalIntent::AbortNow => Some(KillMode::Kill),
            GlobalIntent::Normal | GlobalIntent::Drain => None,
        };
        if let Some(mode) = mode {
            for r in self.running.values() {
                r.handle.kill(mode);
            }
        }
    }

    /// Move every pending task to the done queue unprocessed.
    fn flush_pending(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        debug!(count = self.pending.len(), "returning unprocessed tasks");
        self.done.extend(self.pending.drain(..));
        true
    }
}

fn remove_by_id(queue: &mut VecDeque<TaskRecord>, id: TaskId) -> Option<TaskRecord> {
    let idx = queue.iter().position(|t| t.id() == id)?;
    queue.remove(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{
        Behavior, RecordingLauncher, ScriptedSource, eventually, registered_task,
    };
    use crate::config::RetryConfig;
    use crate::domain::{ExitKind, TaskState};
    use rstest::rstest;
    use std::time::Duration;

    fn config() -> ManagerConfig {
        ManagerConfig {
            max_jobs: 1,
            max_render_jobs: 1,
            max_filter_jobs: 1,
            todo_low_thresh: 2,
            todo_high_thresh: 4,
            max_failed_in_sequence: 0,
            connect_retry: RetryConfig {
                base_delay_ms: 1,
                multiplier: 1.0,
                max_delay_ms: 1,
            },
            kill_grace_ms: 10,
        }
    }

    fn manager(
        config: ManagerConfig,
        source: ScriptedSource,
        behavior: Behavior,
    ) -> (TaskManager, RecordingLauncher) {
        let launcher = RecordingLauncher::new(behavior);
        let m = TaskManager::new(
            config,
            Box::new(source),
            Box::new(launcher.clone()),
            FileRegistry::new(),
        );
        (m, launcher)
    }

    async fn run(m: TaskManager) -> ManagerReport {
        tokio::time::timeout(Duration::from_secs(10), m.run())
            .await
            .expect("manager did not finish")
    }

    #[tokio::test]
    async fn every_task_is_processed_and_reported() {
        let files = FileRegistry::new();
        let tasks = (1..=3).map(|n| registered_task(&files, n, true)).collect();
        let source = ScriptedSource::passive(tasks);
        let log = source.log();
        let launcher = RecordingLauncher::new(Behavior::Exit(ExitKind::Success));
        let m = TaskManager::new(config(), Box::new(source), Box::new(launcher.clone()), files);

        let report = run(m).await;

        assert_eq!(report.exit, ExitStatus::Success);
        assert_eq!(report.stats.completed, 3);
        assert_eq!(report.stats.reported, 3);
        assert_eq!(launcher.launches(), 6);
        let log = log.lock();
        assert_eq!(log.done.len(), 3);
        assert!(log.done.iter().all(|t| t.state() == TaskState::Done));
        assert_eq!(log.calls.last(), Some(&SourceOp::Disconnect));
    }

    #[tokio::test]
    async fn launch_failure_is_stamped_with_the_manager_clock() {
        let files = FileRegistry::new();
        let source = ScriptedSource::passive(vec![registered_task(&files, 1, false)]);
        let log = source.log();
        let launcher = RecordingLauncher::new(Behavior::RefuseLaunch);
        let at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let m = TaskManager::new(config(), Box::new(source), Box::new(launcher), files)
            .with_clock(Arc::new(crate::ports::FixedClock::new(at)));

        run(m).await;

        let log = log.lock();
        let status = log.done[0].status(SubTaskKind::Render);
        assert_eq!(status.exit, ExitKind::LaunchFailed);
        assert_eq!((status.started_at, status.ended_at), (Some(at), Some(at)));
    }

    #[rstest]
    #[case::launch_refused(Behavior::RefuseLaunch)]
    #[case::worker_failed(Behavior::Exit(ExitKind::Failed(1)))]
    #[tokio::test]
    async fn failure_streak_stops_launching(#[case] behavior: Behavior) {
        let files = FileRegistry::new();
        let tasks = (1..=6).map(|n| registered_task(&files, n, false)).collect();
        let source = ScriptedSource::passive(tasks);
        let log = source.log();
        let launcher = RecordingLauncher::new(behavior);
        let cfg = ManagerConfig {
            max_failed_in_sequence: 3,
            ..config()
        };
        let m = TaskManager::new(cfg, Box::new(source), Box::new(launcher.clone()), files);

        let report = run(m).await;

        assert_eq!(launcher.launches(), 3);
        assert_eq!(report.stats.failed, 3);
        assert_eq!(report.stats.intent, GlobalIntent::Drain);
        assert_eq!(report.exit, ExitStatus::Success);
        let log = log.lock();
        assert_eq!(log.done.len(), log.handed_out);
        assert_eq!(log.done.iter().filter(|t| t.has_failed()).count(), 3);
    }

    #[tokio::test]
    async fn fetching_stops_at_high_threshold() {
        let files = FileRegistry::new();
        let tasks = (1..=20).map(|n| registered_task(&files, n, false)).collect();
        let source = ScriptedSource::passive(tasks);
        let log = source.log();
        let launcher = RecordingLauncher::new(Behavior::RunUntilKilled);
        let m = TaskManager::new(config(), Box::new(source), Box::new(launcher.clone()), files);
        let control = m.control();

        let handle = tokio::spawn(run(m));
        eventually(|| launcher.launches() == 1 && log.lock().handed_out == 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().handed_out, 5);

        control.send(Control::Interrupt).unwrap();
        control.send(Control::Interrupt).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.exit, ExitStatus::Killed);
        assert_eq!(launcher.launches(), 1);
        let log = log.lock();
        assert_eq!(log.done.len(), 5);
        assert_eq!(log.done.iter().filter(|t| t.has_failed()).count(), 1);
    }

    #[tokio::test]
    async fn only_one_source_call_is_outstanding() {
        let source = ScriptedSource::passive(Vec::new());
        let log = source.log();
        let (mut m, _) = manager(config(), source, Behavior::RunUntilKilled);

        m.contact_source();
        m.contact_source();
        m.tick();

        assert_eq!(log.lock().calls, vec![SourceOp::Connect]);
    }

    #[tokio::test]
    async fn transient_connect_failures_are_retried() {
        let source = ScriptedSource::passive(Vec::new()).failing_connects(2, true);
        let log = source.log();
        let (m, _) = manager(config(), source, Behavior::RunUntilKilled);

        let report = run(m).await;

        assert_eq!(report.exit, ExitStatus::Success);
        let connects = log
            .lock()
            .calls
            .iter()
            .filter(|op| **op == SourceOp::Connect)
            .count();
        assert_eq!(connects, 3);
    }

    #[tokio::test]
    async fn permanent_connect_failure_exits_with_kill_status() {
        let source = ScriptedSource::passive(Vec::new()).failing_connects(1, false);
        let (m, _) = manager(config(), source, Behavior::RunUntilKilled);

        let report = run(m).await;

        assert_eq!(report.exit, ExitStatus::Killed);
        assert_eq!(report.exit.code(), 1);
    }

    #[rstest]
    #[case(1, GlobalIntent::Drain)]
    #[case(2, GlobalIntent::KillAndQuit)]
    #[case(3, GlobalIntent::AbortNow)]
    #[tokio::test]
    async fn interrupts_escalate_one_step_each(#[case] count: usize, #[case] expected: GlobalIntent) {
        let (mut m, _) = manager(config(), ScriptedSource::passive(Vec::new()), Behavior::RunUntilKilled);
        for _ in 0..count {
            m.on_control(Control::Interrupt);
        }
        assert_eq!(m.intent(), expected);
    }

    #[tokio::test]
    async fn terminate_aborts_without_returning_tasks() {
        let files = FileRegistry::new();
        let tasks = (1..=3).map(|n| registered_task(&files, n, false)).collect();
        let source = ScriptedSource::passive(tasks);
        let log = source.log();
        let launcher = RecordingLauncher::new(Behavior::RunUntilKilled);
        let cfg = ManagerConfig {
            kill_grace_ms: 2000,
            ..config()
        };
        let m = TaskManager::new(cfg, Box::new(source), Box::new(launcher.clone()), files);
        let control = m.control();

        let handle = tokio::spawn(run(m));
        eventually(|| launcher.launches() == 1).await;
        control.send(Control::Terminate).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.exit, ExitStatus::Aborted);
        assert!(log.lock().done.is_empty());
        // The killed worker's exit was collected before returning.
        assert_eq!(report.stats.running_render, 0);
    }

    #[tokio::test]
    async fn stop_pauses_launching_until_continue() {
        let files = FileRegistry::new();
        let task = registered_task(&files, 1, false);
        let launcher = RecordingLauncher::new(Behavior::RunUntilKilled);
        let mut m = TaskManager::new(
            config(),
            Box::new(ScriptedSource::passive(Vec::new())),
            Box::new(launcher.clone()),
            files,
        );
        m.take_task(task);

        m.on_control(Control::Stop);
        assert!(!m.launch_one());
        assert_eq!(m.stats().pending, 1);

        m.on_control(Control::Continue);
        assert!(m.launch_one());
        assert_eq!(m.stats().running(), 1);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn held_task_waits_for_ready_notice() {
        let files = FileRegistry::new();
        let mut task = registered_task(&files, 1, false);
        task.hold();
        let id = task.id();
        let launcher = RecordingLauncher::new(Behavior::RunUntilKilled);
        let mut m = TaskManager::new(
            config(),
            Box::new(ScriptedSource::active()),
            Box::new(launcher.clone()),
            files,
        );
        m.take_task(task);

        assert!(!m.launch_one());
        assert_eq!(m.stats().held, 1);

        m.on_notice(SourceNotice::TaskReady(id));
        assert!(m.launch_one());
    }

    #[tokio::test]
    async fn offers_beyond_high_threshold_are_rejected() {
        let files = FileRegistry::new();
        let (mut m, _) = manager(config(), ScriptedSource::active(), Behavior::RunUntilKilled);
        m.on_control(Control::Stop);

        for n in 1..=4 {
            let (offer, rx) = TaskOffer::new(registered_task(&files, n, false));
            m.on_offer(offer);
            assert!(matches!(rx.await.unwrap(), crate::ports::OfferReply::Taken));
        }
        let (offer, rx) = TaskOffer::new(registered_task(&files, 5, false));
        m.on_offer(offer);
        match rx.await.unwrap() {
            crate::ports::OfferReply::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::TooManyTasks)
            }
            crate::ports::OfferReply::Taken => panic!("fifth offer accepted"),
        }
        assert_eq!(m.stats().pending, 4);
    }

    #[tokio::test]
    async fn recovery_returns_running_task_exactly_once() {
        let files = FileRegistry::new();
        let source = ScriptedSource::active();
        let log = source.log();
        let launcher = RecordingLauncher::new(Behavior::RunUntilKilled);
        let task = registered_task(&files, 7, true);
        let id = task.id();
        let m = TaskManager::new(config(), Box::new(source), Box::new(launcher.clone()), files);
        let notices = log.lock().notices.clone().expect("source attached");

        let handle = tokio::spawn(run(m));
        eventually(|| log.lock().calls.contains(&SourceOp::Connect)).await;

        let (offer, reply) = TaskOffer::new(task);
        notices.send(SourceNotice::Offer(offer)).unwrap();
        assert!(matches!(reply.await.unwrap(), crate::ports::OfferReply::Taken));
        eventually(|| launcher.launches() == 1).await;

        notices.send(SourceNotice::Recovering).unwrap();
        eventually(|| log.lock().calls.contains(&SourceOp::GetTask)).await;
        {
            let log = log.lock();
            assert_eq!(log.done.len(), 1);
            let returned = &log.done[0];
            assert_eq!(returned.id(), id);
            assert_eq!(returned.state(), TaskState::ToBeRendered);
            assert_eq!(returned.status(SubTaskKind::Render).exit, ExitKind::NotRun);
        }

        notices.send(SourceNotice::QuitRequested).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.exit, ExitStatus::Success);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(log.lock().done.len(), 1);
    }

    #[tokio::test]
    async fn offers_during_recovery_are_refused() {
        let files = FileRegistry::new();
        let (mut m, _) = manager(config(), ScriptedSource::active(), Behavior::RunUntilKilled);
        m.on_notice(SourceNotice::Recovering);

        let (offer, rx) = TaskOffer::new(registered_task(&files, 1, false));
        m.on_offer(offer);
        assert!(matches!(
            rx.await.unwrap(),
            crate::ports::OfferReply::Rejected {
                reason: RejectReason::Recovering,
                ..
            }
        ));
    }
}
