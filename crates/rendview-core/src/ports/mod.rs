//! Ports - スケジューラと外界の境界
//!
//! - `task_source`: タスクの入手元と結果の返却先
//! - `launcher`: sub-task を実行中の worker にする方法
//! - `clock`: 壁時計（テストで差し替え可能）

pub mod clock;
pub mod launcher;
pub mod task_source;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::launcher::{
    ExitReceiver, ExitSender, KillMode, KillReceiver, LaunchError, WorkerExit, WorkerHandle,
    WorkerJob, WorkerLauncher,
};
pub use self::task_source::{
    CallGate, ConnectOutcome, DisconnectOutcome, DoneOutcome, GetTaskOutcome, NoticeReceiver,
    NoticeSender, OfferReply, RejectReason, Rejected, SourceCallError, SourceKind, SourceNotice,
    SourceOp, TaskOffer, TaskSource,
};
