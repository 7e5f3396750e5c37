//! Helpers for driving a [`GameServer`] over real sockets.
//!
//! The server and the test clients share one task: [`TestClient::pump`]
//! alternates server steps with short client reads, so nothing needs to be
//! spawned and every test stays deterministic about ordering.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use base64::{engine::general_purpose, Engine as _};
use sync_server::GameServer;
use sync_shared::net::{
    ClientSnapshot, ConnectionId, Handshake, NetMsg, ReliableConn, UnreliableConn,
};

/// Per-step read window while pumping.
const READ_WINDOW: Duration = Duration::from_millis(5);

/// Installs a test-friendly subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A well-formed identity for `seed`, built the way clients build it.
pub fn client_identity(seed: u8) -> String {
    let id = [seed; 8];
    let mut raw = id.to_vec();
    raw.extend_from_slice(&u64::from(crc32fast::hash(&id)).to_be_bytes());
    general_purpose::STANDARD.encode(raw)
}

/// An identity whose checksum does not match its id.
pub fn corrupted_identity(seed: u8) -> String {
    let mut raw = general_purpose::STANDARD
        .decode(client_identity(seed))
        .unwrap_or_default();
    if let Some(last) = raw.last_mut() {
        *last ^= 0xff;
    }
    general_purpose::STANDARD.encode(raw)
}

pub fn handshake(name: &str, seed: u8) -> Handshake {
    Handshake {
        uuid: Some(client_identity(seed)),
        usid: Some(format!("usid-{seed}")),
        name: name.to_string(),
        content: Vec::new(),
        version: 104,
        version_type: Some("official".to_string()),
        mobile: false,
        color: 0x3366ffff,
    }
}

pub struct TestClient {
    pub conn: ReliableConn,
    pub udp: Option<UnreliableConn>,
    pub id: ConnectionId,
    /// Everything received so far, in order.
    pub received: Vec<NetMsg>,
}

impl TestClient {
    /// Connects and waits for the server's `Welcome`.
    pub async fn connect(server: &mut GameServer) -> anyhow::Result<Self> {
        let conn = ReliableConn::connect(server.local_addr()).await?;
        let mut client = Self {
            conn,
            udp: None,
            id: ConnectionId(0),
            received: Vec::new(),
        };
        let welcome = client
            .pump(server, 50, |m| matches!(m, NetMsg::Welcome { .. } | NetMsg::Kick { .. }))
            .await?;
        match welcome {
            NetMsg::Welcome { connection } => client.id = connection,
            other => bail!("expected Welcome, got {other:?}"),
        }
        Ok(client)
    }

    pub async fn send(&mut self, msg: NetMsg) -> anyhow::Result<()> {
        self.conn.send(&msg).await
    }

    /// Opens the client's UDP side and announces it.
    pub async fn open_udp(&mut self, server: SocketAddr) -> anyhow::Result<()> {
        let udp = UnreliableConn::connect("127.0.0.1:0".parse()?, server).await?;
        let port = udp.local_addr()?.port();
        self.udp = Some(udp);
        self.send(NetMsg::UdpHello { client_udp_port: port }).await
    }

    pub async fn send_snapshot(&self, snap: ClientSnapshot) -> anyhow::Result<()> {
        let udp = self.udp.as_ref().context("udp not open")?;
        udp.send(&NetMsg::ClientSnapshot(snap)).await
    }

    /// Steps the server until a message matching `pred` arrives on either
    /// channel, or `steps` run out.
    pub async fn pump(
        &mut self,
        server: &mut GameServer,
        steps: usize,
        pred: impl Fn(&NetMsg) -> bool,
    ) -> anyhow::Result<NetMsg> {
        for _ in 0..steps {
            server.step().await?;
            if let Some(udp) = &self.udp {
                if let Some(msg) = udp.recv_timeout(Duration::from_millis(1)).await? {
                    self.received.push(msg.clone());
                    if pred(&msg) {
                        return Ok(msg);
                    }
                }
            }
            match self.conn.recv_timeout(READ_WINDOW).await {
                Ok(Some(msg)) => {
                    self.received.push(msg.clone());
                    if pred(&msg) {
                        return Ok(msg);
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(e).context("connection ended while waiting"),
            }
        }
        bail!("no matching message after {steps} steps")
    }
}
