//! LdrCodec - LDR ストリームのフレーミング
//!
//! decoder はパケットを丸ごとしか返さない。後ろに生データが続くパケット
//! （`FileDownload`, `TaskDone`）の後は raw モードに切り替わり、`size`
//! バイトを [`Frame::Chunk`] として返してから次のヘッダを探す。

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;
use super::wire::{HEADER_LEN, MAX_PACKET_LEN, Packet, PacketType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    /// Raw bytes of the data announced by the previous packet.
    Chunk(Bytes),
}

#[derive(Debug, Default)]
pub struct LdrCodec {
    raw_left: u64,
}

impl LdrCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes still expected before the next packet header.
    pub fn raw_left(&self) -> u64 {
        self.raw_left
    }
}

impl Decoder for LdrCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if self.raw_left > 0 {
            if src.is_empty() {
                return Ok(None);
            }
            let n = src.len().min(usize::try_from(self.raw_left).unwrap_or(usize::MAX));
            self.raw_left -= n as u64;
            return Ok(Some(Frame::Chunk(src.split_to(n).freeze())));
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if (len as usize) < HEADER_LEN || len as usize > MAX_PACKET_LEN {
            return Err(ProtocolError::BadLength(len));
        }
        let raw_type = u16::from_be_bytes([src[4], src[5]]);
        let ptype = PacketType::from_u16(raw_type).ok_or(ProtocolError::UnknownType(raw_type))?;

        let len = len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut packet = src.split_to(len);
        packet.advance(HEADER_LEN);
        let packet = Packet::decode(ptype, &packet)?;
        self.raw_left = packet.trailing_data();
        Ok(Some(Frame::Packet(packet)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.raw_left == 0 => Ok(None),
            None => Err(ProtocolError::PeerClosed),
        }
    }
}

impl Encoder<Packet> for LdrCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.encode(dst)
    }
}

impl Encoder<Bytes> for LdrCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
