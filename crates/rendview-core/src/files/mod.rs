//! Files - タスクファイルのレジストリ
//!
//! dispatcher が触るファイル（シーン入力、レンダ画像、追加リソース）は
//! パスごとに一度だけ登録され、handle で共有される。削除は最後の release
//! のときだけ、しかも [`DeletePolicy`] が許す範囲でのみ行う。

mod registry;

pub use registry::FileRegistry;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::FileHandle;

/// Logical kind of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Scene/frame description fed to a renderer.
    FrameSource,
    /// A rendered or filtered image.
    Image,
    /// Any additional resource (textures, includes).
    Additional,
}

/// Which side of which step the file is used on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoRole {
    RenderInput,
    RenderOutput,
    FilterInput,
    FilterOutput,
}

/// Subsystem that created the registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Creator {
    Ldr,
    Local,
    Manager,
}

/// When a file may be deleted from disk.
///
/// Ordered from least to most destructive; when two users register the same
/// path with different policies the least destructive one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Never delete.
    Never,
    /// Delete at final teardown.
    OnExit,
    /// Delete when the next recovery cycle completes.
    OnRecoveryCycle,
    /// Delete as soon as the last reference is released.
    OnFrameDone,
}

/// Attributes fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttrs {
    pub kind: FileKind,
    pub role: IoRole,
    pub creator: Creator,
    pub policy: DeletePolicy,
}

impl FileAttrs {
    pub fn new(kind: FileKind, role: IoRole, creator: Creator, policy: DeletePolicy) -> Self {
        Self {
            kind,
            role,
            creator,
            policy,
        }
    }
}

/// Size and modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub size: u64,
    pub mtime: SystemTime,
}

/// What happened on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other references remain.
    StillReferenced(u32),
    /// Entry dropped, file left on disk.
    Forgotten,
    /// Entry dropped and file removed from disk.
    Deleted,
    /// Entry kept inert until a recovery cycle or exit.
    Deferred,
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("unknown file handle {0}")]
    UnknownHandle(FileHandle),

    #[error("file handle {0} has no references left")]
    NotReferenced(FileHandle),

    #[error("stat {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
