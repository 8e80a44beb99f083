//! Connection - accept した LDR 接続 1 本
//!
//! まず認証（deadline 付きの場合あり）。認証後は peer スロットを持ち、
//! リクエストを 1 つずつ処理する。
//!
//! # 状態遷移
//! ```text
//! Idle --TaskRequest--> AwaitingOwnership --Taken--> Downloading --last file--> Idle
//!                               |                         |
//!                               +--Rejected--> Idle       +--write failed--> Idle
//! ```
//!
//! source がキューに入れた完了レコードは、request phase が Idle のときだけ
//! `TaskDone` として返す。接続が何で終わっても teardown が処理中のタスクを
//! 片付け、意図的な shutdown でなければ recovery cycle を始める。

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, trace, warn};

use super::auth;
use super::codec::{Frame, LdrCodec};
use super::error::{CloseReason, ProtocolError};
use super::request::{self, TaskRequest};
use super::source::{Peer, Shared};
use super::transfer::{self, Transfer};
use super::wire::{
    ChallengeRequest, FileCategory, FileDownload, LOAD_UNAVAILABLE, NO_TIMEOUT, NowConnected,
    PROTOCOL_VERSION, Packet, PacketType, ServerInfo, StatusBlock, TaskDone, TaskResponse,
    TaskResponseCode,
};
use crate::domain::{ErrorKind, FileHandle, SubTaskKind, TaskId, TaskRecord};
use crate::files::{FileRegistry, FileState};
use crate::ports::{DoneOutcome, OfferReply, RejectReason, SourceNotice, TaskOffer};

const SEND_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    Fresh,
    Challenged,
    Authenticated,
}

/// A download in progress.
struct Download {
    handle: FileHandle,
    /// `None` once writing failed; remaining bytes are read and dropped.
    file: Option<File>,
    left: u64,
}

enum RequestPhase {
    Idle,
    /// Offered to the manager; nothing is said to the peer until it answers.
    AwaitingOwnership(Transfer),
    /// Taken; fetching the planned files in order.
    Downloading {
        transfer: Transfer,
        download: Option<Download>,
    },
}

pub(super) struct Connection {
    id: u64,
    peer: SocketAddr,
    shared: Arc<Shared>,
    reader: FramedRead<OwnedReadHalf, LdrCodec>,
    writer: FramedWrite<OwnedWriteHalf, LdrCodec>,
    shutdown: watch::Receiver<bool>,
    auth: AuthPhase,
    phase: RequestPhase,
    offer: Option<oneshot::Receiver<OfferReply>>,
    done_rx: Option<mpsc::UnboundedReceiver<TaskRecord>>,
    /// Our task ids mapped to the ids the peer used.
    peer_ids: HashMap<TaskId, u32>,
    idle_deadline: Option<Instant>,
}

impl Connection {
    pub(super) fn new(id: u64, stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Self {
        let (r, w) = stream.into_split();
        Self {
            id,
            peer,
            shutdown: shared.shutdown_tx.subscribe(),
            shared,
            reader: FramedRead::new(r, LdrCodec::new()),
            writer: FramedWrite::new(w, LdrCodec::new()),
            auth: AuthPhase::Fresh,
            phase: RequestPhase::Idle,
            offer: None,
            done_rx: None,
            peer_ids: HashMap::new(),
            idle_deadline: None,
        }
    }

    pub(super) async fn run(mut self) {
        let reason = match self.authenticate_in_time().await {
            Ok(()) => self.serve().await,
            Err(reason) => reason,
        };
        self.teardown(reason).await;
    }

    // ---- authentication -------------------------------------------------

    async fn authenticate_in_time(&mut self) -> Result<(), CloseReason> {
        let mut shutdown = self.shutdown.clone();
        let limit = self.shared.config.auth_timeout();
        let auth = async {
            match limit {
                Some(t) => timeout(t, self.authenticate())
                    .await
                    .unwrap_or(Err(CloseReason::AuthTimeout)),
                None => self.authenticate().await,
            }
        };
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => Err(CloseReason::Shutdown),
            res = auth => res,
        }
    }

    async fn authenticate(&mut self) -> Result<(), CloseReason> {
        let challenge = auth::new_challenge();
        let idle_timeout_ms = self
            .shared
            .config
            .idle_timeout_ms
            .map_or(NO_TIMEOUT, |ms| ms.min(u64::from(NO_TIMEOUT - 1)) as u32);
        self.send(Packet::ChallengeRequest(ChallengeRequest {
            version: PROTOCOL_VERSION,
            idle_timeout_ms,
            challenge,
        }))
        .await
        .map_err(|e| self.auth_failed(e))?;
        self.auth = AuthPhase::Challenged;

        let answer = match self.reader.next().await {
            Some(Ok(Frame::Packet(Packet::ChallengeResponse(answer)))) => answer,
            Some(Ok(Frame::Packet(p))) => {
                return Err(self.auth_failed(ProtocolError::Unexpected {
                    got: p.packet_type(),
                    during: "authentication",
                }));
            }
            Some(Ok(Frame::Chunk(_))) => return Err(self.auth_failed(ProtocolError::UnexpectedData)),
            Some(Err(e)) => return Err(self.auth_failed(e)),
            None => return Err(CloseReason::PeerClosed),
        };
        if !auth::verify(&self.shared.config.password, &challenge, &answer.digest) {
            return Err(self.auth_failed(ProtocolError::AuthFailed));
        }

        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let refused = {
            let mut hub = self.shared.hub.lock();
            if hub.peer.is_some() || hub.recovering {
                true
            } else {
                hub.peer = Some(Peer {
                    conn: self.id,
                    done_tx,
                });
                false
            }
        };
        if refused {
            warn!(conn = self.id, peer = %self.peer, "another peer is connected; rejecting");
            let _ = self
                .send(Packet::NowConnected(NowConnected::AlreadyConnected))
                .await;
            return Err(CloseReason::AlreadyConnected);
        }
        self.done_rx = Some(done_rx);
        self.auth = AuthPhase::Authenticated;

        let info = ServerInfo {
            workers: self.shared.workers,
            started: self.shared.started.into(),
            load: load_average().await,
        };
        self.send(Packet::NowConnected(NowConnected::Success(info)))
            .await
            .map_err(|e| e.close_reason())?;
        info!(conn = self.id, peer = %self.peer, "peer authenticated");
        Ok(())
    }

    fn auth_failed(&self, e: ProtocolError) -> CloseReason {
        if e.kind() == ErrorKind::Transient {
            return e.close_reason();
        }
        warn!(conn = self.id, peer = %self.peer, phase = ?self.auth, error = %e, "authentication failed");
        CloseReason::AuthFailure
    }

    // ---- steady state ---------------------------------------------------

    async fn serve(&mut self) -> CloseReason {
        // Own receiver: the `Ref` from `wait_for` must not borrow `self`.
        let mut shutdown = self.shutdown.clone();
        self.touch();
        loop {
            let idle = self.idle_deadline;
            let step = tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return CloseReason::Shutdown,
                reply = offer_reply(&mut self.offer) => self.on_offer_reply(reply).await,
                frame = self.reader.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(e)) => Err(e),
                    None => Err(ProtocolError::PeerClosed),
                },
                Some(task) = recv_done(&mut self.done_rx), if matches!(self.phase, RequestPhase::Idle) => {
                    self.deliver(task).await
                }
                () = idle_expired(idle) => {
                    info!(conn = self.id, peer = %self.peer, "idle timeout");
                    return CloseReason::IdleTimeout;
                }
            };
            match step {
                Ok(()) => self.touch(),
                Err(e) => return self.failed(e),
            }
        }
    }

    fn touch(&mut self) {
        self.idle_deadline = self.shared.config.idle_timeout().map(|d| Instant::now() + d);
    }

    fn failed(&self, e: ProtocolError) -> CloseReason {
        let (frame, task_id) = match &self.phase {
            RequestPhase::Idle => (None, None),
            RequestPhase::AwaitingOwnership(t) | RequestPhase::Downloading { transfer: t, .. } => {
                (Some(t.frame_no), Some(t.peer_task))
            }
        };
        match e.kind() {
            ErrorKind::Transient => {
                debug!(conn = self.id, peer = %self.peer, ?frame, ?task_id, error = %e, "connection lost");
            }
            _ => {
                warn!(conn = self.id, peer = %self.peer, ?frame, ?task_id, error = %e, "protocol violation");
            }
        }
        e.close_reason()
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Packet(Packet::TaskRequest(req)) => self.on_task_request(req).await,
            Frame::Packet(Packet::FileDownload(d)) => self.on_download(d).await,
            Frame::Chunk(data) => self.on_chunk(data).await,
            Frame::Packet(Packet::QuitNow) => {
                info!(conn = self.id, peer = %self.peer, "peer asked the manager to quit");
                self.shared.hub.lock().notify(SourceNotice::QuitRequested);
                Ok(())
            }
            Frame::Packet(p) => Err(ProtocolError::Unexpected {
                got: p.packet_type(),
                during: "request processing",
            }),
        }
    }

    async fn on_task_request(&mut self, req: TaskRequest) -> Result<(), ProtocolError> {
        if !matches!(self.phase, RequestPhase::Idle) || self.offer.is_some() {
            return Err(ProtocolError::RequestInFlight);
        }
        let (frame, peer_task) = (req.frame_no, req.task_id);
        let valid = match request::validate(&req, &self.shared.descriptors) {
            Ok(valid) => valid,
            Err(code) => {
                warn!(peer = %self.peer, frame, task_id = peer_task, ?code, "task request rejected");
                return self.respond(peer_task, code).await;
            }
        };

        let id = self.shared.ids.lock().allocate();
        let (record, transfer) =
            match transfer::prepare(valid, id, &self.shared.config, &self.shared.files) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!(peer = %self.peer, frame, task_id = peer_task, error = %e, "task request rejected");
                    return self.respond(peer_task, TaskResponseCode::NoStep).await;
                }
            };
        debug!(
            peer = %self.peer,
            frame,
            task_id = peer_task,
            local_id = %id,
            files = transfer.len(),
            "offering task"
        );
        let (offer, reply) = TaskOffer::new(record);
        self.shared.hub.lock().notify(SourceNotice::Offer(offer));
        self.offer = Some(reply);
        self.phase = RequestPhase::AwaitingOwnership(transfer);
        Ok(())
    }

    async fn on_offer_reply(&mut self, reply: Option<OfferReply>) -> Result<(), ProtocolError> {
        let RequestPhase::AwaitingOwnership(transfer) =
            std::mem::replace(&mut self.phase, RequestPhase::Idle)
        else {
            return Ok(());
        };
        match reply {
            Some(OfferReply::Taken) => {
                self.peer_ids.insert(transfer.task_id, transfer.peer_task);
                self.request_file(transfer).await
            }
            Some(OfferReply::Rejected { task, reason }) => {
                self.shared.files.release_all(task.file_handles());
                let code = match reason {
                    RejectReason::TooManyTasks => TaskResponseCode::TooManyTasks,
                    RejectReason::Quitting | RejectReason::Recovering => TaskResponseCode::Refused,
                };
                info!(
                    peer = %self.peer,
                    frame = transfer.frame_no,
                    task_id = transfer.peer_task,
                    ?reason,
                    "task refused by manager"
                );
                self.respond(transfer.peer_task, code).await
            }
            None => {
                warn!(peer = %self.peer, frame = transfer.frame_no, "task manager gone; refusing task");
                self.respond(transfer.peer_task, TaskResponseCode::Refused).await
            }
        }
    }

    /// Ask for the current file of `transfer`, or finish it.
    async fn request_file(&mut self, transfer: Transfer) -> Result<(), ProtocolError> {
        let Some(req) = transfer.request() else {
            return self.finish_transfer(transfer, true).await;
        };
        self.phase = RequestPhase::Downloading {
            transfer,
            download: None,
        };
        self.send(Packet::FileRequest(req)).await
    }

    async fn on_download(&mut self, d: FileDownload) -> Result<(), ProtocolError> {
        let RequestPhase::Downloading { transfer, download } = &mut self.phase else {
            return Err(ProtocolError::Unexpected {
                got: PacketType::FileDownload,
                during: "no transfer",
            });
        };
        if download.is_some() {
            return Err(ProtocolError::Unexpected {
                got: PacketType::FileDownload,
                during: "download",
            });
        }
        let (Some(req), Some(planned)) = (transfer.request(), transfer.current()) else {
            return Err(ProtocolError::DownloadMismatch);
        };
        if !d.answers(&req) {
            return Err(ProtocolError::DownloadMismatch);
        }
        let (handle, path) = (planned.handle, planned.path.clone());

        let file = match create_target(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot create download target");
                None
            }
        };
        let pinned = FileState {
            size: d.size,
            mtime: SystemTime::now(),
        };
        if let Err(e) = self.shared.files.set_fixed_state(handle, pinned) {
            debug!(error = %e, "cannot pin file state");
        }
        trace!(path = %path.display(), size = d.size, "download started");
        *download = Some(Download {
            handle,
            file,
            left: d.size,
        });
        if d.size == 0 {
            return self.finish_file().await;
        }
        Ok(())
    }

    async fn on_chunk(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        let RequestPhase::Downloading {
            download: Some(dl), ..
        } = &mut self.phase
        else {
            return Err(ProtocolError::UnexpectedData);
        };
        if let Some(file) = &mut dl.file
            && let Err(e) = file.write_all(&data).await
        {
            warn!(error = %e, "writing download failed");
            dl.file = None;
        }
        dl.left = dl.left.saturating_sub(data.len() as u64);
        if dl.left == 0 {
            return self.finish_file().await;
        }
        Ok(())
    }

    async fn finish_file(&mut self) -> Result<(), ProtocolError> {
        let RequestPhase::Downloading {
            mut transfer,
            download: Some(dl),
        } = std::mem::replace(&mut self.phase, RequestPhase::Idle)
        else {
            return Ok(());
        };
        let mut ok = false;
        if let Some(mut file) = dl.file {
            match file.flush().await {
                Ok(()) => ok = true,
                Err(e) => warn!(error = %e, "flushing download failed"),
            }
        }
        let _ = self.shared.files.clear_fixed_state(dl.handle);
        if !ok {
            return self.finish_transfer(transfer, false).await;
        }
        if let Err(e) = self.shared.files.mark_fetched(dl.handle) {
            debug!(error = %e, "cannot mark download complete");
        }
        transfer.advance();
        self.request_file(transfer).await
    }

    async fn finish_transfer(&mut self, transfer: Transfer, ok: bool) -> Result<(), ProtocolError> {
        self.phase = RequestPhase::Idle;
        let code = if ok {
            info!(
                peer = %self.peer,
                frame = transfer.frame_no,
                task_id = transfer.peer_task,
                "task accepted"
            );
            self.shared
                .hub
                .lock()
                .notify(SourceNotice::TaskReady(transfer.task_id));
            TaskResponseCode::Accepted
        } else {
            warn!(
                peer = %self.peer,
                frame = transfer.frame_no,
                task_id = transfer.peer_task,
                "file transfer failed"
            );
            self.peer_ids.remove(&transfer.task_id);
            self.shared
                .hub
                .lock()
                .notify(SourceNotice::TaskWithdrawn(transfer.task_id));
            TaskResponseCode::TransferFailed
        };
        self.respond(transfer.peer_task, code).await
    }

    // ---- results --------------------------------------------------------

    /// Send one finished record back as `TaskDone` plus its output.
    async fn deliver(&mut self, task: TaskRecord) -> Result<(), ProtocolError> {
        let id = task.id();
        let peer_task = self.peer_ids.remove(&id).unwrap_or_else(|| {
            warn!(task_id = %id, "no peer task id for result");
            id.get()
        });
        let category = if task.filter().is_some() {
            FileCategory::FilterOutput
        } else {
            FileCategory::RenderOutput
        };
        let output = if task.state().is_terminal() && !task.has_failed() {
            open_output(&self.shared.files, task.final_output()).await
        } else {
            None
        };
        let done = TaskDone {
            task_id: peer_task,
            frame_no: task.frame_no(),
            render: StatusBlock::from(task.status(SubTaskKind::Render)),
            filter: StatusBlock::from(task.status(SubTaskKind::Filter)),
            category,
            size: output.as_ref().map_or(0, |(_, size)| *size),
        };

        let result = self.send_done(done, output).await;
        self.shared.files.release_all(task.file_handles());
        let outcome = match &result {
            Ok(()) => {
                info!(peer = %self.peer, frame = task.frame_no(), task_id = peer_task, "result sent");
                DoneOutcome::Reported(id)
            }
            Err(e) => DoneOutcome::Failed {
                task: id,
                reason: e.to_string(),
            },
        };
        self.shared
            .hub
            .lock()
            .complete(SourceNotice::DoneTask(outcome));
        result
    }

    async fn send_done(
        &mut self,
        done: TaskDone,
        output: Option<(File, u64)>,
    ) -> Result<(), ProtocolError> {
        self.send(Packet::TaskDone(done)).await?;
        let Some((file, size)) = output else {
            return Ok(());
        };
        let mut chunks = ReaderStream::with_capacity(file.take(size), SEND_CHUNK);
        let mut sent = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            sent += chunk.len() as u64;
            self.writer.send(chunk).await?;
        }
        if sent < size {
            // The peer expects exactly `size` bytes; the stream is unusable now.
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "task output shrank while sending",
            )));
        }
        Ok(())
    }

    // ---- plumbing -------------------------------------------------------

    async fn send(&mut self, packet: Packet) -> Result<(), ProtocolError> {
        trace!(conn = self.id, ptype = %packet.packet_type(), "send");
        self.writer.send(packet).await
    }

    async fn respond(&mut self, task_id: u32, code: TaskResponseCode) -> Result<(), ProtocolError> {
        self.send(Packet::TaskResponse(TaskResponse { task_id, code }))
            .await
    }

    async fn teardown(mut self, reason: CloseReason) {
        match std::mem::replace(&mut self.phase, RequestPhase::Idle) {
            RequestPhase::Idle => {}
            RequestPhase::AwaitingOwnership(transfer) => {
                // Settle the offer so the manager never keeps a task nobody tracks.
                let reply = match self.offer.take() {
                    Some(rx) => rx.await.ok(),
                    None => None,
                };
                match reply {
                    Some(OfferReply::Taken) => self.withdraw(transfer.task_id),
                    Some(OfferReply::Rejected { task, .. }) => {
                        self.shared.files.release_all(task.file_handles());
                    }
                    None => {}
                }
            }
            RequestPhase::Downloading { transfer, download } => {
                if let Some(dl) = download {
                    drop(dl.file);
                    let _ = self.shared.files.clear_fixed_state(dl.handle);
                }
                self.withdraw(transfer.task_id);
            }
        }

        if self.auth != AuthPhase::Authenticated {
            match reason {
                CloseReason::AuthFailure | CloseReason::AuthTimeout => {
                    warn!(conn = self.id, peer = %self.peer, %reason, "connection closed before authentication");
                }
                _ => debug!(conn = self.id, peer = %self.peer, %reason, "connection closed"),
            }
            return;
        }

        let recover = reason != CloseReason::Shutdown;
        let done_rx = self.done_rx.take();
        {
            let mut hub = self.shared.hub.lock();
            if hub.peer.as_ref().is_some_and(|p| p.conn == self.id) {
                hub.peer = None;
            }
            if recover {
                hub.recovering = true;
                self.shared.recovering_tx.send_replace(true);
            }
        }
        // No new results can be queued once the slot is empty.
        if let Some(mut rx) = done_rx {
            rx.close();
            while let Ok(task) = rx.try_recv() {
                self.shared.discard(task);
            }
        }

        if recover {
            warn!(conn = self.id, peer = %self.peer, %reason, "peer lost; recovering");
            self.shared.hub.lock().notify(SourceNotice::Recovering);
        } else {
            info!(conn = self.id, peer = %self.peer, %reason, "peer disconnected");
        }
    }

    fn withdraw(&mut self, id: TaskId) {
        self.peer_ids.remove(&id);
        debug!(task_id = %id, "withdrawing task");
        self.shared.hub.lock().notify(SourceNotice::TaskWithdrawn(id));
    }
}

async fn offer_reply(rx: &mut Option<oneshot::Receiver<OfferReply>>) -> Option<OfferReply> {
    let Some(pending) = rx.as_mut() else {
        return std::future::pending().await;
    };
    let reply = pending.await.ok();
    *rx = None;
    reply
}

async fn recv_done(rx: &mut Option<mpsc::UnboundedReceiver<TaskRecord>>) -> Option<TaskRecord> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn create_target(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    File::create(path).await
}

async fn open_output(files: &FileRegistry, h: FileHandle) -> Option<(File, u64)> {
    let path = files.path(h)?;
    // The worker rewrote the file since anything was cached.
    files.invalidate(h);
    let size = match files.stat(h) {
        Ok(state) => state.size,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat task output");
            return None;
        }
    };
    match File::open(&path).await {
        Ok(file) => Some((file, size)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open task output");
            None
        }
    }
}

/// 1-minute load average x100.
async fn load_average() -> u16 {
    match tokio::fs::read_to_string("/proc/loadavg").await {
        Ok(s) => parse_load(&s).unwrap_or(LOAD_UNAVAILABLE),
        Err(_) => LOAD_UNAVAILABLE,
    }
}

fn parse_load(s: &str) -> Option<u16> {
    let one: f64 = s.split_whitespace().next()?.parse().ok()?;
    if !one.is_finite() || one < 0.0 {
        return None;
    }
    Some((one * 100.0).round().min(f64::from(LOAD_UNAVAILABLE - 1)) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0.42 0.30 0.25 1/123 4567\n", Some(42))]
    #[case("3.00 2.00 1.00 2/200 1\n", Some(300))]
    #[case("9999.0 1 1 1/1 1", Some(LOAD_UNAVAILABLE - 1))]
    #[case("", None)]
    #[case("nan 0 0", None)]
    fn load_average_parsing(#[case] input: &str, #[case] expected: Option<u16>) {
        assert_eq!(parse_load(input), expected);
    }
}
