//! TaskSource port - タスクの入手元と結果の返却先
//!
//! source は 4 つの操作（connect, get-task, done-task, disconnect）を持つ。
//! 各呼び出しはその場でエラー（busy, illegal）を返すか、受理されて後から
//! [`TaskSource::attach`] で渡したチャネルにちょうど 1 つの [`SourceNotice`]
//! で応答される。
//!
//! active な source（LDR）は呼ばれなくても notice を送る: task offer、
//! 入力の準備完了、withdraw、recovery の合図。

use std::fmt;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{TaskId, TaskRecord};

/// Passive sources are polled; active ones decide when to hand over work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Passive,
    Active,
}

/// The four source operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOp {
    Connect,
    GetTask,
    DoneTask,
    Disconnect,
}

impl fmt::Display for SourceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceOp::Connect => "connect",
            SourceOp::GetTask => "get-task",
            SourceOp::DoneTask => "done-task",
            SourceOp::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceCallError {
    #[error("source busy: {pending} still outstanding")]
    Busy { pending: SourceOp },

    #[error("{0} is not valid for this source now")]
    Illegal(SourceOp),
}

/// A refused call that hands the moved-in value back.
#[derive(Debug)]
pub struct Rejected<T> {
    pub error: SourceCallError,
    pub item: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed(String),
}

#[derive(Debug)]
pub enum GetTaskOutcome {
    Task(Box<TaskRecord>),
    /// Nothing right now; ask again later.
    NoTaskYet,
    /// The source will never produce another task.
    Exhausted,
    /// Answer to the get-task call that closes a recovery cycle.
    RecoveryAcknowledged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneOutcome {
    /// Result handed to whoever is owed it.
    Reported(TaskId),
    /// Nobody to report to; the record was dropped.
    Discarded(TaskId),
    Failed { task: TaskId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected,
    Failed(String),
}

/// Why the manager turned down an offered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooManyTasks,
    Quitting,
    Recovering,
}

/// Reply to a [`TaskOffer`].
#[derive(Debug)]
pub enum OfferReply {
    Taken,
    Rejected {
        task: Box<TaskRecord>,
        reason: RejectReason,
    },
}

/// "Take this task" from an active source.
///
/// The offering side waits on the reply before telling its peer anything,
/// so ownership is settled before the task can be claimed again.
#[derive(Debug)]
pub struct TaskOffer {
    task: Box<TaskRecord>,
    reply: oneshot::Sender<OfferReply>,
}

impl TaskOffer {
    pub fn new(task: TaskRecord) -> (Self, oneshot::Receiver<OfferReply>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                task: Box::new(task),
                reply,
            },
            rx,
        )
    }

    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    /// Take ownership. The record is ours even if the offering side vanished.
    pub fn accept(self) -> TaskRecord {
        let _ = self.reply.send(OfferReply::Taken);
        *self.task
    }

    /// Hand the task back. Returns it if the offering side is gone.
    pub fn reject(self, reason: RejectReason) -> Option<TaskRecord> {
        match self.reply.send(OfferReply::Rejected {
            task: self.task,
            reason,
        }) {
            Ok(()) => None,
            Err(OfferReply::Rejected { task, .. }) => Some(*task),
            Err(OfferReply::Taken) => None,
        }
    }
}

/// Everything a source tells its consumer.
#[derive(Debug)]
pub enum SourceNotice {
    Connect(ConnectOutcome),
    GetTask(GetTaskOutcome),
    DoneTask(DoneOutcome),
    Disconnect(DisconnectOutcome),

    /// Unprompted task from an active source; same meaning as a get-task
    /// completion.
    Offer(TaskOffer),
    /// All inputs of a held task are in place.
    TaskReady(TaskId),
    /// A held task could not be completed by the source.
    TaskWithdrawn(TaskId),
    /// The active peer was lost; a recovery cycle must run.
    Recovering,
    /// The active peer asked us to finish and quit.
    QuitRequested,
}

impl SourceNotice {
    /// Which call this notice completes, if any.
    pub fn answers(&self) -> Option<SourceOp> {
        match self {
            SourceNotice::Connect(_) => Some(SourceOp::Connect),
            SourceNotice::GetTask(_) => Some(SourceOp::GetTask),
            SourceNotice::DoneTask(_) => Some(SourceOp::DoneTask),
            SourceNotice::Disconnect(_) => Some(SourceOp::Disconnect),
            SourceNotice::Offer(_)
            | SourceNotice::TaskReady(_)
            | SourceNotice::TaskWithdrawn(_)
            | SourceNotice::Recovering
            | SourceNotice::QuitRequested => None,
        }
    }
}

pub type NoticeSender = mpsc::UnboundedSender<SourceNotice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<SourceNotice>;

/// TaskSource は唯一の利用者（manager）から見た task source
///
/// 呼び出しは同期で、結果は notice チャネルで非同期に届く。
pub trait TaskSource: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Register the consumer. Called once, before any operation.
    fn attach(&mut self, notices: NoticeSender);

    /// Whether a failed connect is worth retrying after a backoff.
    fn connect_retry_makes_sense(&self) -> bool;

    fn connect(&mut self) -> Result<(), SourceCallError>;

    /// Fetch one task. For active sources only valid as recovery
    /// acknowledgement.
    fn get_task(&mut self) -> Result<(), SourceCallError>;

    fn done_task(&mut self, task: TaskRecord) -> Result<(), Rejected<TaskRecord>>;

    fn disconnect(&mut self) -> Result<(), SourceCallError>;
}

/// One-call-at-a-time bookkeeping shared by source implementations.
#[derive(Debug, Default)]
pub struct CallGate {
    outstanding: Option<SourceOp>,
}

impl CallGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, op: SourceOp) -> Result<(), SourceCallError> {
        match self.outstanding {
            Some(pending) => Err(SourceCallError::Busy { pending }),
            None => {
                self.outstanding = Some(op);
                Ok(())
            }
        }
    }

    /// Clear the slot; returns whether `op` was the one outstanding.
    pub fn finish(&mut self, op: SourceOp) -> bool {
        if self.outstanding == Some(op) {
            self.outstanding = None;
            true
        } else {
            false
        }
    }

    pub fn outstanding(&self) -> Option<SourceOp> {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::fixtures::render_task;

    #[test]
    fn gate_rejects_second_call_of_any_kind() {
        let mut gate = CallGate::new();
        gate.begin(SourceOp::Connect).unwrap();
        assert_eq!(
            gate.begin(SourceOp::DoneTask),
            Err(SourceCallError::Busy {
                pending: SourceOp::Connect
            })
        );
        assert!(!gate.finish(SourceOp::GetTask));
        assert!(gate.finish(SourceOp::Connect));
        assert!(gate.begin(SourceOp::GetTask).is_ok());
    }

    #[tokio::test]
    async fn accepted_offer_replies_taken() {
        let (offer, rx) = TaskOffer::new(render_task(1));
        let task = offer.accept();
        assert_eq!(task.frame_no(), 1);
        assert!(matches!(rx.await.unwrap(), OfferReply::Taken));
    }

    #[tokio::test]
    async fn rejected_offer_returns_task_to_offerer() {
        let (offer, rx) = TaskOffer::new(render_task(2));
        assert!(offer.reject(RejectReason::TooManyTasks).is_none());
        match rx.await.unwrap() {
            OfferReply::Rejected { task, reason } => {
                assert_eq!(task.frame_no(), 2);
                assert_eq!(reason, RejectReason::TooManyTasks);
            }
            OfferReply::Taken => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejecting_to_a_vanished_offerer_hands_task_back() {
        let (offer, rx) = TaskOffer::new(render_task(3));
        drop(rx);
        let back = offer.reject(RejectReason::Quitting).unwrap();
        assert_eq!(back.frame_no(), 3);
    }
}
