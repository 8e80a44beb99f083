//! LdrSource - LDR の task source
//!
//! active な source。認証済みの peer を同時に 1 つだけ受け付け、正しい
//! `TaskRequest` を manager へ offer する。source ハンドル・accept loop・
//! connection の間で共有する状態は [`Shared`] にまとめ、可変部分は 1 つの
//! ロック（[`Hub`]）の下に置く。call gate と peer スロットと recovery フラグは
//! 必ず一緒に変わる。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use crate::config::LdrConfig;
use crate::domain::{Descriptors, TaskIdAllocator, TaskRecord};
use crate::files::FileRegistry;
use crate::ports::{
    CallGate, ConnectOutcome, DisconnectOutcome, DoneOutcome, GetTaskOutcome, NoticeSender,
    Rejected, SourceCallError, SourceKind, SourceNotice, SourceOp, TaskSource,
};

/// The authenticated peer.
pub(super) struct Peer {
    pub conn: u64,
    /// Finished records to send back as `TaskDone`.
    pub done_tx: mpsc::UnboundedSender<TaskRecord>,
}

#[derive(Default)]
pub(super) struct Hub {
    pub gate: CallGate,
    notices: Option<NoticeSender>,
    pub peer: Option<Peer>,
    /// Peer lost and the manager has not acknowledged yet.
    pub recovering: bool,
    local_addr: Option<SocketAddr>,
}

impl Hub {
    pub fn notify(&self, notice: SourceNotice) {
        match &self.notices {
            Some(tx) => {
                if tx.send(notice).is_err() {
                    debug!("task manager gone; notice dropped");
                }
            }
            None => debug!("no task manager attached; notice dropped"),
        }
    }

    /// Close the outstanding call and deliver its answer.
    pub fn complete(&mut self, notice: SourceNotice) {
        if let Some(op) = notice.answers()
            && !self.gate.finish(op)
        {
            warn!(%op, outstanding = ?self.gate.outstanding(), "completion without matching call");
        }
        self.notify(notice);
    }
}

pub(super) struct Shared {
    pub config: LdrConfig,
    pub descriptors: Arc<Descriptors>,
    pub files: FileRegistry,
    /// Advertised in `NowConnected`.
    pub workers: u16,
    pub started: DateTime<Utc>,
    pub ids: Mutex<TaskIdAllocator>,
    pub hub: Mutex<Hub>,
    /// `true` closes the accept gate until recovery is acknowledged.
    pub recovering_tx: watch::Sender<bool>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    /// Drop a finished record nobody can receive.
    pub fn discard(&self, task: TaskRecord) {
        let id = task.id();
        debug!(task_id = %id, frame = task.frame_no(), "discarding task result");
        self.files.release_all(task.file_handles());
        self.hub
            .lock()
            .complete(SourceNotice::DoneTask(DoneOutcome::Discarded(id)));
    }
}

pub struct LdrSource {
    shared: Arc<Shared>,
    listener: Option<JoinHandle<()>>,
}

impl LdrSource {
    pub fn new(
        config: LdrConfig,
        descriptors: Arc<Descriptors>,
        files: FileRegistry,
        workers: u16,
    ) -> Self {
        let (recovering_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                descriptors,
                files,
                workers,
                started: Utc::now(),
                ids: Mutex::new(TaskIdAllocator::new()),
                hub: Mutex::new(Hub::default()),
                recovering_tx,
                shutdown_tx,
            }),
            listener: None,
        }
    }

    /// Bound address, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.hub.lock().local_addr
    }
}

impl TaskSource for LdrSource {
    fn name(&self) -> &str {
        "ldr"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Active
    }

    fn attach(&mut self, notices: NoticeSender) {
        self.shared.hub.lock().notices = Some(notices);
    }

    fn connect_retry_makes_sense(&self) -> bool {
        true
    }

    fn connect(&mut self) -> Result<(), SourceCallError> {
        if self.listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(SourceCallError::Illegal(SourceOp::Connect));
        }
        self.shared.hub.lock().gate.begin(SourceOp::Connect)?;
        self.shared.shutdown_tx.send_replace(false);
        self.listener = Some(tokio::spawn(listen(Arc::clone(&self.shared))));
        Ok(())
    }

    /// Only legal while recovering: the call acknowledges the recovery.
    fn get_task(&mut self) -> Result<(), SourceCallError> {
        let mut hub = self.shared.hub.lock();
        if !hub.recovering {
            return Err(SourceCallError::Illegal(SourceOp::GetTask));
        }
        hub.gate.begin(SourceOp::GetTask)?;
        hub.recovering = false;
        self.shared.recovering_tx.send_replace(false);
        info!("recovery acknowledged; accepting connections again");
        hub.complete(SourceNotice::GetTask(GetTaskOutcome::RecoveryAcknowledged));
        Ok(())
    }

    fn done_task(&mut self, task: TaskRecord) -> Result<(), Rejected<TaskRecord>> {
        let mut hub = self.shared.hub.lock();
        if let Err(error) = hub.gate.begin(SourceOp::DoneTask) {
            return Err(Rejected { error, item: task });
        }
        let task = match &hub.peer {
            Some(peer) => match peer.done_tx.send(task) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };
        drop(hub);
        self.shared.discard(task);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SourceCallError> {
        if self.listener.is_none() {
            return Err(SourceCallError::Illegal(SourceOp::Disconnect));
        }
        self.shared.hub.lock().gate.begin(SourceOp::Disconnect)?;
        let Some(listener) = self.listener.take() else {
            return Err(SourceCallError::Illegal(SourceOp::Disconnect));
        };
        self.shared.shutdown_tx.send_replace(true);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            // A clean exit of the listener answers the call itself.
            if let Err(e) = listener.await {
                error!(error = %e, "ldr listener crashed");
                shared
                    .hub
                    .lock()
                    .complete(SourceNotice::Disconnect(DisconnectOutcome::Failed(e.to_string())));
            }
        });
        Ok(())
    }
}

async fn listen(shared: Arc<Shared>) {
    let addr = shared.config.listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, error = %e, "cannot listen for ldr peers");
            shared
                .hub
                .lock()
                .complete(SourceNotice::Connect(ConnectOutcome::Failed(format!(
                    "bind {addr}: {e}"
                ))));
            return;
        }
    };
    let local = listener.local_addr().ok();
    info!(addr = ?local, "listening for ldr peers");
    {
        let mut hub = shared.hub.lock();
        hub.local_addr = local;
        hub.complete(SourceNotice::Connect(ConnectOutcome::Connected));
    }

    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut recovering = shared.recovering_tx.subscribe();
    let mut conns = JoinSet::new();
    let mut next_conn = 0u64;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        // No accept until the manager acknowledged the last recovery.
        if *recovering.borrow_and_update() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = recovering.changed() => {}
                Some(res) = conns.join_next(), if !conns.is_empty() => log_join(res),
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => {}
            _ = recovering.changed() => {}
            Some(res) = conns.join_next(), if !conns.is_empty() => log_join(res),
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    next_conn += 1;
                    debug!(conn = next_conn, %peer, "connection accepted");
                    conns.spawn(Connection::new(next_conn, stream, peer, Arc::clone(&shared)).run());
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    while let Some(res) = conns.join_next().await {
        log_join(res);
    }
    let mut hub = shared.hub.lock();
    hub.local_addr = None;
    info!("ldr source disconnected");
    hub.complete(SourceNotice::Disconnect(DisconnectOutcome::Disconnected));
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!(error = %e, "ldr connection task failed");
    }
}
