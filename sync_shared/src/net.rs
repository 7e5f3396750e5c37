//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable (TCP) and unreliable (UDP) channel.
//! - Define every message exchanged between clients and the sync server.
//! - Keep serialization explicit and versionable.
//!
//! Reliable frames are a big-endian `u32` length followed by a JSON body.
//! Unreliable datagrams carry one JSON body each.

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::math::{Rect, Vec2};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest reliable frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies a player within one server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coded reason attached to every server-initiated disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KickReason {
    Kick = 0,
    ClientOutdated = 1,
    ServerOutdated = 2,
    Banned = 3,
    ServerClose = 4,
    RecentKick = 5,
    NameInUse = 6,
    IdInUse = 7,
    NameEmpty = 8,
    CustomClient = 9,
    Vote = 10,
    TypeMismatch = 11,
    Whitelist = 12,
    PlayerLimit = 13,
    IdentityCorrupted = 14,
    DuplicateHandshake = 15,
    MissingIdentity = 16,
    IncompatibleContent = 17,
    Malformed = 18,
}

impl KickReason {
    /// Human-readable message shown by clients.
    pub fn message(&self) -> &'static str {
        match self {
            KickReason::Kick => "You have been kicked from the server.",
            KickReason::ClientOutdated => "Outdated client. Update your game!",
            KickReason::ServerOutdated => "Outdated server. Ask the host to update!",
            KickReason::Banned => "You are banned on this server.",
            KickReason::ServerClose => "The server has closed.",
            KickReason::RecentKick => "You have been kicked recently. Wait before connecting again.",
            KickReason::NameInUse => "There is already someone with that name on this server.",
            KickReason::IdInUse => "You are already connected to this server.",
            KickReason::NameEmpty => "Your name must contain at least one visible character.",
            KickReason::CustomClient => "This server does not support custom builds.",
            KickReason::Vote => "You have been vote-kicked.",
            KickReason::TypeMismatch => "Client and server build types do not match.",
            KickReason::Whitelist => "You are not whitelisted here.",
            KickReason::PlayerLimit => "This server is full.",
            KickReason::IdentityCorrupted => "Your identity is corrupted. Reinstall or reset your client.",
            KickReason::DuplicateHandshake => "Handshake already in progress on this connection.",
            KickReason::MissingIdentity => "Your client did not send an identity.",
            KickReason::IncompatibleContent => "Installed content does not match the server.",
            KickReason::Malformed => "Your player data could not be serialized.",
        }
    }
}

/// Identity handshake sent once per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub uuid: Option<String>,
    pub usid: Option<String>,
    pub name: String,
    /// Optional content (mods) installed on the client.
    pub content: Vec<String>,
    /// Client build; `-1` marks a custom build.
    pub version: i32,
    pub version_type: Option<String>,
    pub mobile: bool,
    pub color: u32,
}

/// A build (`breaking == false`) or deconstruct request for one tile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRequest {
    pub x: i32,
    pub y: i32,
    pub breaking: bool,
    pub block: Option<u16>,
    pub rotation: u8,
    pub config: i32,
}

/// Boolean intent flags reported by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Intent {
    pub boosting: bool,
    pub shooting: bool,
    pub chatting: bool,
    pub building: bool,
}

/// Periodic client-reported player state. Unreliable; may arrive out of order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSnapshot {
    /// Routes UDP datagrams to their connection.
    pub connection: ConnectionId,
    pub sequence: u32,
    pub position: Vec2,
    pub pointer: Vec2,
    pub rotation: f32,
    pub base_rotation: f32,
    pub velocity: Vec2,
    pub mining: Option<(i32, i32)>,
    pub intent: Intent,
    pub requests: Vec<BuildRequest>,
    pub viewport: Rect,
}

/// Direct admin operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AdminAction {
    Wave,
    Ban,
    Kick,
    Trace,
}

/// Connection details returned by a trace request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceInfo {
    pub address: String,
    pub uuid: String,
    pub modified_client: bool,
    pub mobile: bool,
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Client -> server ───
    Handshake(Handshake),
    /// Client announces its UDP port for unreliable traffic.
    UdpHello {
        client_udp_port: u16,
    },
    /// Client finished loading world data.
    ConnectConfirm,
    ClientSnapshot(ClientSnapshot),
    /// Opaque remote operation, executed after permission checks.
    Invoke {
        kind: u16,
        payload: Vec<u8>,
    },
    AdminRequest {
        target: PlayerId,
        action: AdminAction,
    },
    Chat {
        message: String,
    },

    // ─── Server -> client ───
    Welcome {
        connection: ConnectionId,
    },
    Kick {
        reason: KickReason,
        detail: Option<String>,
    },
    InfoMessage {
        message: String,
    },
    WorldDataBegin,
    /// Full world snapshot, DEFLATE-compressed JSON.
    WorldData {
        data: Vec<u8>,
    },
    PositionSet {
        x: f32,
        y: f32,
    },
    RemoveQueueBlock {
        x: i32,
        y: i32,
        breaking: bool,
    },
    EntitySnapshot {
        group: u8,
        amount: u16,
        original_size: u16,
        data: Vec<u8>,
    },
    StateSnapshot {
        wave_countdown: f32,
        wave: u32,
        enemies: u32,
        core_data_size: u16,
        core_data: Vec<u8>,
    },
    BlockSnapshot {
        amount: u16,
        original_size: u16,
        data: Vec<u8>,
    },
    ChatMessage {
        message: String,
        sender: Option<String>,
    },
    TraceInfo {
        player: PlayerId,
        info: TraceInfo,
    },
    PlayerDisconnect {
        player: PlayerId,
    },
}

impl NetMsg {
    /// Messages that may be sent over the unreliable channel.
    pub fn is_unreliable(&self) -> bool {
        matches!(
            self,
            NetMsg::EntitySnapshot { .. } | NetMsg::StateSnapshot { .. } | NetMsg::BlockSnapshot { .. }
        )
    }

    pub fn system(message: impl Into<String>) -> Self {
        NetMsg::ChatMessage {
            message: message.into(),
            sender: None,
        }
    }
}

fn frame(msg: &NetMsg) -> anyhow::Result<BytesMut> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = frame(msg)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    /// Receives a frame within the given timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        match time::timeout(timeout, read_frame(&mut self.stream)).await {
            Ok(Ok(msg)) => Ok(Some(msg)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (FrameReader { read }, FrameWriter { write })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameReader {
    read: OwnedReadHalf,
}

impl FrameReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.read).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameWriter {
    write: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = frame(msg)?;
        self.write.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.write.shutdown().await.context("tcp shutdown")?;
        Ok(())
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_roundtrip_bytes() {
        let msg = NetMsg::Kick {
            reason: KickReason::RecentKick,
            detail: Some("12 second(s)".into()),
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let back = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn only_snapshots_are_unreliable() {
        assert!(NetMsg::BlockSnapshot {
            amount: 1,
            original_size: 4,
            data: vec![]
        }
        .is_unreliable());
        assert!(!NetMsg::PositionSet { x: 0.0, y: 0.0 }.is_unreliable());
        assert!(!NetMsg::system("hi").is_unreliable());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&(u32::MAX).to_be_bytes()).await?;
            Ok::<_, anyhow::Error>(stream)
        });
        let (mut conn, _) = listener.accept().await?;
        let _stream = client.await??;
        assert!(conn.recv().await.is_err());
        Ok(())
    }
}
