//! Impls - port の実装
//!
//! - **process**: 子プロセスによる `WorkerLauncher`

pub mod process;

pub use self::process::ProcessLauncher;
