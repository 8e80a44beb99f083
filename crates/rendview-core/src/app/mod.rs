//! App レイヤー - TaskManager とそれを動かすもの
//!
//! - **manager**: スケジューラ actor
//! - **retry**: connect の backoff
//! - **signals**: OS シグナルを manager へ転送
//! - **stats**: カウンタのスナップショット

pub mod manager;
pub mod retry;
pub mod signals;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use self::manager::{Control, ManagerReport, TaskManager};
pub use self::retry::RetryPolicy;
pub use self::signals::forward_signals;
pub use self::stats::ManagerStats;
