//! LDR - リモートレンダリングのプロトコルと、その上の task source
//!
//! - `wire` / `codec`: パケットレイアウトとストリームのフレーミング
//! - `auth`: challenge/response
//! - `request`: TaskRequest のデコードと検証
//! - `transfer`: 受け付けたリクエストのファイル計画
//! - `source` / `connection`: listener と唯一の peer

pub mod auth;
pub mod codec;
mod connection;
pub mod error;
pub mod request;
mod source;
pub mod transfer;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use self::codec::{Frame, LdrCodec};
pub use self::error::{CloseReason, ProtocolError};
pub use self::request::{TaskRequest, ValidRequest};
pub use self::source::LdrSource;
pub use self::wire::{Packet, PacketType, TaskResponseCode};
