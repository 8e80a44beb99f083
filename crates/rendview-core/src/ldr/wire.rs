//! Wire - LDR パケットレイアウト
//!
//! すべてのパケットは 6 バイトのヘッダで始まる: パケット全体（ヘッダ込み）の
//! `u32` 長と `u16` のパケット種別。整数はすべて big-endian。
//! `FileDownload` / `TaskDone` の後に続く生のファイルバイトはパケットに
//! 含まれず、長さにも数えない。

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};

use super::error::ProtocolError;
use super::request::TaskRequest;
use crate::domain::ExecStatus;

pub const HEADER_LEN: usize = 6;
pub const MAX_PACKET_LEN: usize = 65536;
pub const ID_STRING: &[u8] = b"RendView-LDR";
pub const ID_LEN: usize = 20;
pub const PROTOCOL_VERSION: u16 = 1;
pub const CHALLENGE_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;
/// Idle timeout / sub-task timeout "disabled".
pub const NO_TIMEOUT: u32 = 0xFFFF_FFFF;
pub const LOAD_UNAVAILABLE: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    ChallengeRequest = 1,
    ChallengeResponse = 2,
    NowConnected = 3,
    TaskRequest = 10,
    TaskResponse = 11,
    FileRequest = 12,
    FileDownload = 13,
    TaskDone = 14,
    QuitNow = 20,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => PacketType::ChallengeRequest,
            2 => PacketType::ChallengeResponse,
            3 => PacketType::NowConnected,
            10 => PacketType::TaskRequest,
            11 => PacketType::TaskResponse,
            12 => PacketType::FileRequest,
            13 => PacketType::FileDownload,
            14 => PacketType::TaskDone,
            20 => PacketType::QuitNow,
            _ => return None,
        })
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AuthResult {
    Success = 0,
    AlreadyConnected = 1,
}

/// Which slot of a task a transferred file fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum FileCategory {
    RenderInput = 1,
    /// Input image of a filter-only task.
    RenderOutput = 2,
    AdditionalRender = 3,
    AdditionalFilter = 4,
    /// Final image of a task with a filter step.
    FilterOutput = 5,
}

impl FileCategory {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => FileCategory::RenderInput,
            2 => FileCategory::RenderOutput,
            3 => FileCategory::AdditionalRender,
            4 => FileCategory::AdditionalFilter,
            5 => FileCategory::FilterOutput,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TaskResponseCode {
    Accepted = 0,
    TooManyTasks = 1,
    UnknownRender = 2,
    UnknownFilter = 3,
    UnknownOutputFormat = 4,
    NoStep = 5,
    IllegalFile = 6,
    TransferFailed = 7,
    /// Manager quitting or recovering.
    Refused = 8,
}

impl TaskResponseCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => TaskResponseCode::Accepted,
            1 => TaskResponseCode::TooManyTasks,
            2 => TaskResponseCode::UnknownRender,
            3 => TaskResponseCode::UnknownFilter,
            4 => TaskResponseCode::UnknownOutputFormat,
            5 => TaskResponseCode::NoStep,
            6 => TaskResponseCode::IllegalFile,
            7 => TaskResponseCode::TransferFailed,
            8 => TaskResponseCode::Refused,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub version: u16,
    /// Milliseconds, `NO_TIMEOUT` when disabled.
    pub idle_timeout_ms: u32,
    pub challenge: [u8; CHALLENGE_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub digest: [u8; DIGEST_LEN],
}

/// Seconds and microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTime {
    pub secs: u64,
    pub micros: u32,
}

impl From<DateTime<Utc>> for StartTime {
    fn from(t: DateTime<Utc>) -> Self {
        Self {
            secs: t.timestamp().max(0) as u64,
            micros: t.timestamp_subsec_micros(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub workers: u16,
    pub started: StartTime,
    /// Load average x100, `LOAD_UNAVAILABLE` if unknown.
    pub load: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NowConnected {
    Success(ServerInfo),
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequest {
    pub task_id: u32,
    pub category: FileCategory,
    pub index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDownload {
    pub task_id: u32,
    pub category: FileCategory,
    pub index: u16,
    pub size: u64,
}

impl FileDownload {
    pub fn answers(&self, req: &FileRequest) -> bool {
        self.task_id == req.task_id && self.category == req.category && self.index == req.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskResponse {
    pub task_id: u32,
    pub code: TaskResponseCode,
}

/// One sub-task's execution status as sent in `TaskDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusBlock {
    pub kind: u16,
    pub code: i32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub utime_ms: u64,
    pub stime_ms: u64,
}

const STATUS_BLOCK_LEN: usize = 2 + 4 + 8 * 4;

impl From<&ExecStatus> for StatusBlock {
    fn from(s: &ExecStatus) -> Self {
        let ms = |t: Option<DateTime<Utc>>| t.map_or(0, |t| t.timestamp_millis().max(0) as u64);
        let (kind, code) = s.exit.wire_code();
        Self {
            kind,
            code,
            start_ms: ms(s.started_at),
            end_ms: ms(s.ended_at),
            utime_ms: s.usage.user.as_millis() as u64,
            stime_ms: s.usage.system.as_millis() as u64,
        }
    }
}

impl StatusBlock {
    fn put(&self, dst: &mut BytesMut) {
        dst.put_u16(self.kind);
        dst.put_i32(self.code);
        dst.put_u64(self.start_ms);
        dst.put_u64(self.end_ms);
        dst.put_u64(self.utime_ms);
        dst.put_u64(self.stime_ms);
    }

    fn read(r: &mut BodyReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: r.u16()?,
            code: r.i32()?,
            start_ms: r.u64()?,
            end_ms: r.u64()?,
            utime_ms: r.u64()?,
            stime_ms: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDone {
    pub task_id: u32,
    pub frame_no: u32,
    pub render: StatusBlock,
    pub filter: StatusBlock,
    pub category: FileCategory,
    /// Raw bytes following the packet.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ChallengeRequest(ChallengeRequest),
    ChallengeResponse(ChallengeResponse),
    NowConnected(NowConnected),
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    FileRequest(FileRequest),
    FileDownload(FileDownload),
    TaskDone(TaskDone),
    QuitNow,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ChallengeRequest(_) => PacketType::ChallengeRequest,
            Packet::ChallengeResponse(_) => PacketType::ChallengeResponse,
            Packet::NowConnected(_) => PacketType::NowConnected,
            Packet::TaskRequest(_) => PacketType::TaskRequest,
            Packet::TaskResponse(_) => PacketType::TaskResponse,
            Packet::FileRequest(_) => PacketType::FileRequest,
            Packet::FileDownload(_) => PacketType::FileDownload,
            Packet::TaskDone(_) => PacketType::TaskDone,
            Packet::QuitNow => PacketType::QuitNow,
        }
    }

    /// Bytes of raw data that follow this packet on the wire.
    pub fn trailing_data(&self) -> u64 {
        match self {
            Packet::FileDownload(d) => d.size,
            Packet::TaskDone(d) => d.size,
            _ => 0,
        }
    }

    /// Decode a packet body (header already stripped).
    pub fn decode(ptype: PacketType, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = BodyReader::new(ptype, body);
        let packet = match ptype {
            PacketType::ChallengeRequest => {
                r.id_string()?;
                Packet::ChallengeRequest(ChallengeRequest {
                    version: r.u16()?,
                    idle_timeout_ms: r.u32()?,
                    challenge: r.array()?,
                })
            }
            PacketType::ChallengeResponse => {
                r.id_string()?;
                Packet::ChallengeResponse(ChallengeResponse { digest: r.array()? })
            }
            PacketType::NowConnected => match r.u16()? {
                0 => Packet::NowConnected(NowConnected::Success(ServerInfo {
                    workers: r.u16()?,
                    started: StartTime {
                        secs: r.u64()?,
                        micros: r.u32()?,
                    },
                    load: r.u16()?,
                })),
                1 => Packet::NowConnected(NowConnected::AlreadyConnected),
                _ => return Err(ProtocolError::Malformed(ptype, "unknown auth result")),
            },
            PacketType::TaskRequest => Packet::TaskRequest(TaskRequest::read(&mut r)?),
            PacketType::TaskResponse => {
                let task_id = r.u32()?;
                let code = TaskResponseCode::from_u16(r.u16()?)
                    .ok_or(ProtocolError::Malformed(ptype, "unknown response code"))?;
                Packet::TaskResponse(TaskResponse { task_id, code })
            }
            PacketType::FileRequest => Packet::FileRequest(FileRequest {
                task_id: r.u32()?,
                category: r.category()?,
                index: r.u16()?,
            }),
            PacketType::FileDownload => Packet::FileDownload(FileDownload {
                task_id: r.u32()?,
                category: r.category()?,
                index: r.u16()?,
                size: r.u64()?,
            }),
            PacketType::TaskDone => Packet::TaskDone(TaskDone {
                task_id: r.u32()?,
                frame_no: r.u32()?,
                render: StatusBlock::read(&mut r)?,
                filter: StatusBlock::read(&mut r)?,
                category: r.category()?,
                size: r.u64()?,
            }),
            PacketType::QuitNow => Packet::QuitNow,
        };
        r.finish()?;
        Ok(packet)
    }

    /// Append header and body to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = dst.len();
        dst.put_u32(0);
        dst.put_u16(self.packet_type() as u16);
        match self {
            Packet::ChallengeRequest(p) => {
                put_id_string(dst);
                dst.put_u16(p.version);
                dst.put_u32(p.idle_timeout_ms);
                dst.put_slice(&p.challenge);
            }
            Packet::ChallengeResponse(p) => {
                put_id_string(dst);
                dst.put_slice(&p.digest);
            }
            Packet::NowConnected(NowConnected::Success(info)) => {
                dst.put_u16(AuthResult::Success as u16);
                dst.put_u16(info.workers);
                dst.put_u64(info.started.secs);
                dst.put_u32(info.started.micros);
                dst.put_u16(info.load);
            }
            Packet::NowConnected(NowConnected::AlreadyConnected) => {
                dst.put_u16(AuthResult::AlreadyConnected as u16);
            }
            Packet::TaskRequest(p) => p.put(dst),
            Packet::TaskResponse(p) => {
                dst.put_u32(p.task_id);
                dst.put_u16(p.code as u16);
            }
            Packet::FileRequest(p) => {
                dst.put_u32(p.task_id);
                dst.put_u16(p.category as u16);
                dst.put_u16(p.index);
            }
            Packet::FileDownload(p) => {
                dst.put_u32(p.task_id);
                dst.put_u16(p.category as u16);
                dst.put_u16(p.index);
                dst.put_u64(p.size);
            }
            Packet::TaskDone(p) => {
                dst.put_u32(p.task_id);
                dst.put_u32(p.frame_no);
                p.render.put(dst);
                p.filter.put(dst);
                dst.put_u16(p.category as u16);
                dst.put_u64(p.size);
            }
            Packet::QuitNow => {}
        }
        let len = dst.len() - start;
        if len > MAX_PACKET_LEN {
            dst.truncate(start);
            return Err(ProtocolError::TooLong(self.packet_type(), len));
        }
        dst[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}

fn put_id_string(dst: &mut BytesMut) {
    let mut id = [0u8; ID_LEN];
    id[..ID_STRING.len()].copy_from_slice(ID_STRING);
    dst.put_slice(&id);
}

/// Bounds-checked big-endian reader over one packet body.
pub(crate) struct BodyReader<'a> {
    ptype: PacketType,
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(ptype: PacketType, buf: &'a [u8]) -> Self {
        Self { ptype, buf }
    }

    pub(crate) fn packet_type(&self) -> PacketType {
        self.ptype
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated(self.ptype))
        } else {
            Ok(())
        }
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn category(&mut self) -> Result<FileCategory, ProtocolError> {
        FileCategory::from_u16(self.u16()?)
            .ok_or(ProtocolError::Malformed(self.ptype, "unknown file category"))
    }

    fn id_string(&mut self) -> Result<(), ProtocolError> {
        let id = self.bytes(ID_LEN)?;
        let (name, pad) = id.split_at(ID_STRING.len());
        if name != ID_STRING || pad.iter().any(|&b| b != 0) {
            return Err(ProtocolError::Malformed(self.ptype, "bad id string"));
        }
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn finish(self) -> Result<(), ProtocolError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(ProtocolError::Trailing(self.ptype, n)),
        }
    }
}
