//! テスト用の最小 LDR クライアント（本物の listener を叩く）

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::auth;
use super::codec::{Frame, LdrCodec};
use super::wire::{
    CHALLENGE_LEN, ChallengeResponse, DIGEST_LEN, NowConnected, Packet, PROTOCOL_VERSION, TaskDone,
};

const WAIT: Duration = Duration::from_secs(2);

pub struct Client {
    io: Framed<TcpStream, LdrCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            io: Framed::new(stream, LdrCodec::new()),
        }
    }

    pub async fn frame(&mut self) -> Frame {
        timeout(WAIT, self.io.next())
            .await
            .expect("frame in time")
            .expect("connection open")
            .expect("well-formed frame")
    }

    pub async fn packet(&mut self) -> Packet {
        match self.frame().await {
            Frame::Packet(p) => p,
            Frame::Chunk(_) => panic!("raw data where a packet was expected"),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.io.send(packet).await.unwrap();
    }

    pub async fn send_raw(&mut self, data: Bytes) {
        self.io.send(data).await.unwrap();
    }

    pub async fn challenge(&mut self) -> [u8; CHALLENGE_LEN] {
        match self.packet().await {
            Packet::ChallengeRequest(req) => {
                assert_eq!(req.version, PROTOCOL_VERSION);
                req.challenge
            }
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    pub async fn answer(&mut self, digest: [u8; DIGEST_LEN]) {
        self.send(Packet::ChallengeResponse(ChallengeResponse { digest }))
            .await;
    }

    pub async fn authenticate(&mut self, password: &str) -> NowConnected {
        let challenge = self.challenge().await;
        self.answer(auth::digest(password, &challenge)).await;
        match self.packet().await {
            Packet::NowConnected(nc) => nc,
            other => panic!("expected now-connected, got {other:?}"),
        }
    }

    /// Read a `TaskDone` and the output bytes that follow it.
    pub async fn task_done(&mut self) -> (TaskDone, Bytes) {
        let done = match self.packet().await {
            Packet::TaskDone(done) => done,
            other => panic!("expected task-done, got {other:?}"),
        };
        let mut data = BytesMut::new();
        while (data.len() as u64) < done.size {
            match self.frame().await {
                Frame::Chunk(chunk) => data.extend_from_slice(&chunk),
                Frame::Packet(p) => panic!("packet inside output data: {p:?}"),
            }
        }
        (done, data.freeze())
    }

    /// Read until the server closes; returns the packets seen on the way.
    pub async fn drain(&mut self) -> Vec<Packet> {
        let mut seen = Vec::new();
        loop {
            match timeout(WAIT, self.io.next()).await.expect("server closes in time") {
                Some(Ok(Frame::Packet(p))) => seen.push(p),
                Some(Ok(Frame::Chunk(_))) => {}
                Some(Err(_)) | None => return seen,
            }
        }
    }
}
