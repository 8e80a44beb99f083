//! ProcessLauncher - 設定されたバイナリを子プロセスとして実行する
//!
//! パスとジオメトリは環境変数で worker に渡す:
//!
//! | variable           | value                           |
//! |--------------------|---------------------------------|
//! | `RENDVIEW_INPUT`   | 入力ファイル                    |
//! | `RENDVIEW_OUTPUT`  | worker が書き出すファイル       |
//! | `RENDVIEW_FRAME`   | フレーム番号                    |
//! | `RENDVIEW_WIDTH`   | render のみ                     |
//! | `RENDVIEW_HEIGHT`  | render のみ                     |
//! | `RENDVIEW_FORMAT`  | render のみ: 出力フォーマット名 |
//!
//! 追加ファイルは渡さない。worker は入力からの相対パスで見つける。
//!
//! # 停止
//! 1. timeout か Terminate 要求で SIGTERM
//! 2. kill grace を過ぎても残っていれば SIGKILL

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::{ExecStatus, ExitKind, ResourceUsage};
use crate::ports::{
    ExitSender, KillMode, KillReceiver, LaunchError, WorkerExit, WorkerHandle, WorkerJob,
    WorkerLauncher,
};

pub struct ProcessLauncher {
    kill_grace: Duration,
}

impl ProcessLauncher {
    /// `kill_grace` is how long a terminated worker gets before SIGKILL.
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, job: WorkerJob, exits: ExitSender) -> Result<WorkerHandle, LaunchError> {
        let mut cmd = Command::new(&job.binary);
        cmd.args(&job.args)
            .env("RENDVIEW_INPUT", &job.input)
            .env("RENDVIEW_OUTPUT", &job.output)
            .env("RENDVIEW_FRAME", job.frame_no.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some((w, h)) = job.geometry {
            cmd.env("RENDVIEW_WIDTH", w.to_string())
                .env("RENDVIEW_HEIGHT", h.to_string());
        }
        if let Some(format) = &job.format {
            cmd.env("RENDVIEW_FORMAT", format);
        }

        let started = Utc::now();
        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            binary: job.binary.clone(),
            source,
        })?;
        info!(
            task_id = %job.task_id,
            frame = job.frame_no,
            kind = ?job.kind,
            pid = child.id(),
            binary = %job.binary.display(),
            "worker started"
        );

        let (handle, kill_rx) = WorkerHandle::channel();
        let grace = self.kill_grace;
        tokio::spawn(async move {
            let exit = supervise(child, job.timeout, kill_rx, grace).await;
            let ended = Utc::now();
            debug!(task_id = %job.task_id, kind = ?job.kind, ?exit, "worker exited");
            let status = ExecStatus::finished(exit, started, ended, ResourceUsage::default());
            if exits
                .send(WorkerExit {
                    task_id: job.task_id,
                    kind: job.kind,
                    status,
                })
                .is_err()
            {
                debug!(task_id = %job.task_id, "task manager gone; worker exit dropped");
            }
        });
        Ok(handle)
    }
}

/// Why we stopped the child, if we did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Timeout,
    Requested,
}

async fn supervise(
    mut child: Child,
    limit: Option<Duration>,
    mut kill_rx: KillReceiver,
    grace: Duration,
) -> ExitKind {
    let deadline = async move {
        match limit {
            Some(t) => sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut stop: Option<Stop> = None;
    let mut escalate_at: Option<tokio::time::Instant> = None;
    let mut kill_open = true;
    loop {
        let escalation = async move {
            match escalate_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = child.wait() => {
                return match res {
                    Ok(status) => classify(status, stop),
                    Err(e) => {
                        warn!(error = %e, "waiting for worker failed");
                        ExitKind::Failed(-1)
                    }
                };
            }
            () = &mut deadline, if stop.is_none() => {
                warn!(pid = child.id(), "worker timed out; terminating");
                stop = Some(Stop::Timeout);
                terminate(&child);
                escalate_at = Some(tokio::time::Instant::now() + grace);
            }
            changed = kill_rx.changed(), if kill_open => {
                if changed.is_err() {
                    // Handle dropped: nobody can ask us to stop any more.
                    kill_open = false;
                    continue;
                }
                let mode = *kill_rx.borrow_and_update();
                stop.get_or_insert(Stop::Requested);
                match mode {
                    Some(KillMode::Kill) => force_kill(&mut child),
                    Some(KillMode::Terminate) => {
                        terminate(&child);
                        escalate_at.get_or_insert(tokio::time::Instant::now() + grace);
                    }
                    None => {}
                }
            }
            () = escalation => {
                debug!(pid = child.id(), "grace period over; killing worker");
                escalate_at = None;
                force_kill(&mut child);
            }
        }
    }
}

fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range; cannot send SIGTERM");
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

fn force_kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "SIGKILL failed");
    }
}

fn classify(status: ExitStatus, stop: Option<Stop>) -> ExitKind {
    match (stop, status.code()) {
        (Some(Stop::Timeout), _) => ExitKind::Timeout,
        (Some(Stop::Requested), _) => ExitKind::Killed,
        (None, Some(0)) => ExitKind::Success,
        (None, Some(code)) => ExitKind::Failed(code),
        (None, None) => ExitKind::Signalled(status.signal().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SubTaskKind, TaskId};
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn job(script: &str, timeout: Option<Duration>) -> WorkerJob {
        WorkerJob {
            task_id: TaskId::new(1),
            frame_no: 12,
            kind: SubTaskKind::Render,
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            input: PathBuf::from("/tmp/in.pov"),
            output: PathBuf::from("/tmp/out.png"),
            add_files: Vec::new(),
            geometry: Some((64, 48)),
            format: Some("png".into()),
            timeout,
        }
    }

    async fn run(job: WorkerJob) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerExit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProcessLauncher::new(Duration::from_millis(200))
            .launch(job, tx)
            .unwrap();
        (handle, rx)
    }

    async fn exit_of(rx: &mut mpsc::UnboundedReceiver<WorkerExit>) -> WorkerExit {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[rstest::rstest]
    #[case("exit 0", ExitKind::Success)]
    #[case("exit 3", ExitKind::Failed(3))]
    #[case("kill -USR1 $$", ExitKind::Signalled(Signal::SIGUSR1 as i32))]
    #[tokio::test]
    async fn exit_is_classified(#[case] script: &str, #[case] expected: ExitKind) {
        let (_handle, mut rx) = run(job(script, None)).await;
        let exit = exit_of(&mut rx).await;
        assert_eq!(exit.status.exit, expected);
        assert!(exit.status.started_at <= exit.status.ended_at);
    }

    #[tokio::test]
    async fn environment_carries_paths_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!(
            "echo \"$RENDVIEW_INPUT $RENDVIEW_OUTPUT $RENDVIEW_FRAME $RENDVIEW_WIDTH $RENDVIEW_HEIGHT $RENDVIEW_FORMAT\" > {}",
            out.display()
        );
        let (_handle, mut rx) = run(job(&script, None)).await;
        assert_eq!(exit_of(&mut rx).await.status.exit, ExitKind::Success);

        let seen = std::fs::read_to_string(out).unwrap();
        assert_eq!(seen.trim(), "/tmp/in.pov /tmp/out.png 12 64 48 png");
    }

    #[tokio::test]
    async fn overrunning_worker_times_out() {
        let (_handle, mut rx) = run(job("sleep 10", Some(Duration::from_millis(100)))).await;
        assert_eq!(exit_of(&mut rx).await.status.exit, ExitKind::Timeout);
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let (handle, mut rx) = run(job("trap '' TERM; sleep 10", None)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.kill(KillMode::Terminate);
        assert_eq!(exit_of(&mut rx).await.status.exit, ExitKind::Killed);
    }

    #[tokio::test]
    async fn kill_request_is_reported_as_killed() {
        let (handle, mut rx) = run(job("sleep 10", None)).await;
        handle.kill(KillMode::Kill);
        assert_eq!(exit_of(&mut rx).await.status.exit, ExitKind::Killed);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_launch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut j = job("", None);
        j.binary = PathBuf::from("/nonexistent/renderer");
        let err = ProcessLauncher::new(Duration::from_millis(10))
            .launch(j, tx)
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
