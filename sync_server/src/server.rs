//! Network transport around a [`Session`].
//!
//! A fixed-timestep loop owns the session. Every connection gets a reader
//! task feeding one inbound queue and a writer task draining its own
//! outbound queue, so the session itself only ever runs on the tick task.
//! Snapshots travel over UDP once the client announced a port; everything
//! else stays on the ordered TCP stream.
//!
//! Each step:
//! 1. Console lines
//! 2. Queued connection events and messages, in arrival order
//! 3. UDP client snapshots
//! 4. Session update (snapshot cadence)
//! 5. Lifecycle events to observers
//! 6. Outbox flush and timer commands

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sync_shared::{
    config::ServerConfig,
    net::{encode_to_bytes, ConnectionId, KickReason, NetMsg, ReliableConn, ReliableListener},
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    admin::Administration,
    events::SessionEvent,
    session::{Outgoing, Session, TimerCommand},
    world::World,
};

/// Something that happened off the tick task.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        conn: ConnectionId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<WriterCmd>,
    },
    Message {
        conn: ConnectionId,
        msg: NetMsg,
    },
    Closed {
        conn: ConnectionId,
    },
    VoteDeadline {
        session: u64,
    },
}

/// Instruction for a connection's writer task.
#[derive(Debug)]
pub enum WriterCmd {
    Send(NetMsg),
    /// Flush what is queued, then shut the stream down.
    Close,
}

/// Callback receiving every lifecycle event the session publishes.
pub type Observer = Box<dyn FnMut(&SessionEvent) + Send>;

pub struct GameServer {
    pub cfg: ServerConfig,
    session: Session,
    udp: UdpSocket,
    local_addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    writers: HashMap<ConnectionId, mpsc::UnboundedSender<WriterCmd>>,
    deadlines: HashMap<u64, AbortHandle>,
    observers: Vec<Observer>,
    accept_task: JoinHandle<()>,
    console_rx: Option<mpsc::Receiver<String>>,
    running: bool,
    tick: u64,
}

impl GameServer {
    /// Binds TCP and UDP on the configured address and starts accepting.
    pub async fn new(cfg: ServerConfig, admins: Administration, world: World) -> anyhow::Result<Self> {
        cfg.validate()?;
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        // Port 0 resolves on the TCP bind; UDP shares the resolved port.
        let local_addr = tcp.local_addr()?;
        let udp = UdpSocket::bind(local_addr)
            .await
            .with_context(|| format!("udp bind {local_addr}"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(tcp, events_tx.clone()));
        let session = Session::new(cfg.clone(), admins, world);

        Ok(Self {
            cfg,
            session,
            udp,
            local_addr,
            events_tx,
            events_rx,
            writers: HashMap::new(),
            deadlines: HashMap::new(),
            observers: Vec::new(),
            accept_task,
            console_rx: None,
            running: true,
            tick: 0,
        })
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn add_observer(&mut self, observer: impl FnMut(&SessionEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.cfg.tick_hz.max(1) as f32)
    }

    /// Runs until a `quit` console command.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let dt = self.tick_interval();
        let mut next = Instant::now();
        while self.running {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.tick_interval();
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one tick.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands();

        let now = Utc::now();
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_event(event, now);
        }
        self.recv_datagrams(now)?;
        self.session.update(now);
        self.dispatch_events();

        self.flush().await;
        self.run_timers();
        self.tick += 1;
        Ok(())
    }

    fn on_event(&mut self, event: ServerEvent, now: DateTime<Utc>) {
        match event {
            ServerEvent::Connected { conn, addr, outbound } => {
                debug!(conn = conn.0, %addr, "Connection opened");
                self.writers.insert(conn, outbound);
                self.session.on_connect(conn, addr.ip());
            }
            ServerEvent::Message { conn, msg } => self.session.handle_message(conn, msg, now),
            ServerEvent::Closed { conn } => {
                self.session.on_transport_closed(conn, "connection closed");
                self.writers.remove(&conn);
            }
            ServerEvent::VoteDeadline { session } => {
                self.deadlines.remove(&session);
                self.session.vote_deadline(session, now);
            }
        }
    }

    fn dispatch_events(&mut self) {
        for event in self.session.take_events() {
            debug!(?event, "Session event");
            for observer in &mut self.observers {
                observer(&event);
            }
        }
    }

    fn recv_datagrams(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => match serde_json::from_slice::<NetMsg>(&buf[..n]) {
                    Ok(NetMsg::ClientSnapshot(snap)) => {
                        let conn = snap.connection;
                        if !self.session.udp_source_matches(conn, from.ip()) {
                            debug!(conn = conn.0, %from, "Dropping datagram from foreign address");
                            continue;
                        }
                        if let Some(c) = self.session.roster.connection_mut(conn) {
                            c.udp_peer = Some(from);
                        }
                        self.session.handle_client_snapshot(conn, snap, now);
                    }
                    Ok(other) => debug!(%from, ?other, "Unexpected datagram"),
                    Err(e) => debug!(%from, error = %e, "Undecodable datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    async fn flush(&mut self) {
        for out in self.session.take_outbox() {
            match out {
                Outgoing::Send { to, msg } => {
                    let peer = msg
                        .is_unreliable()
                        .then(|| self.session.roster.connection(to).and_then(|c| c.udp_peer))
                        .flatten();
                    match peer {
                        Some(peer) => self.send_datagram(peer, &msg).await,
                        None => self.write(to, WriterCmd::Send(msg)),
                    }
                }
                Outgoing::Close { conn } => {
                    self.write(conn, WriterCmd::Close);
                    self.writers.remove(&conn);
                }
            }
        }
    }

    async fn send_datagram(&self, peer: SocketAddr, msg: &NetMsg) {
        let payload = match encode_to_bytes(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to encode datagram");
                return;
            }
        };
        if let Err(e) = self.udp.send_to(&payload, peer).await {
            debug!(%peer, error = %e, "udp send failed");
        }
    }

    fn write(&self, conn: ConnectionId, cmd: WriterCmd) {
        match self.writers.get(&conn) {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    debug!(conn = conn.0, "Writer already gone");
                }
            }
            None => debug!(conn = conn.0, "No writer for connection"),
        }
    }

    fn run_timers(&mut self) {
        for cmd in self.session.take_timers() {
            match cmd {
                TimerCommand::ArmVoteDeadline { session, after } => {
                    let tx = self.events_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(ServerEvent::VoteDeadline { session });
                    });
                    if let Some(old) = self.deadlines.insert(session, task.abort_handle()) {
                        old.abort();
                    }
                }
                TimerCommand::CancelVoteDeadline { session } => {
                    if let Some(handle) = self.deadlines.remove(&session) {
                        handle.abort();
                    }
                }
            }
        }
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = match self.console_rx.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => Vec::new(),
        };
        for line in lines {
            for reply in self.exec_console(&line) {
                info!("{reply}");
            }
        }
    }

    /// Executes a console command and returns its output lines.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = tokens.split_first() else {
            return Vec::new();
        };
        let arg = args.first().copied();

        match (command, arg) {
            ("status", _) => {
                let roster = self.session.roster();
                let mut out = vec![format!("Tick: {}", self.tick), format!("Players: {}", roster.player_count())];
                for p in roster.players() {
                    out.push(format!(
                        "  {} {} [{}] {}{}",
                        p.id,
                        p.name,
                        p.uuid,
                        p.team,
                        if p.admin { " admin" } else { "" }
                    ));
                }
                out
            }
            ("whitelist-add", Some(uuid)) => {
                self.session.admins.whitelist(uuid);
                self.session.persist();
                vec![format!("Whitelisted {uuid}")]
            }
            ("ban", Some(uuid)) => {
                self.session.admins.ban_id(uuid);
                self.session.persist();
                for player in self.session.roster.find_by_uuid(uuid) {
                    self.session.kick_player(player, KickReason::Banned);
                }
                vec![format!("Banned {uuid}")]
            }
            ("banip", Some(ip)) => {
                self.session.admins.ban_ip(ip);
                self.session.persist();
                let victims: Vec<ConnectionId> = self
                    .session
                    .roster
                    .connections()
                    .filter(|c| c.address.to_string() == ip)
                    .map(|c| c.id)
                    .collect();
                for conn in victims {
                    self.session.kick(conn, KickReason::Banned, None);
                }
                vec![format!("Banned address {ip}")]
            }
            ("unban", Some(target)) => {
                let removed = if target.parse::<IpAddr>().is_ok() {
                    self.session.admins.unban_ip(target)
                } else {
                    self.session.admins.unban_id(target)
                };
                self.session.persist();
                if removed {
                    vec![format!("Unbanned {target}")]
                } else {
                    vec![format!("{target} is not banned")]
                }
            }
            ("admin", Some(uuid)) => {
                let online = self.session.roster.find_by_uuid(uuid);
                // An online player binds the grant to its session id now.
                let usid = online
                    .first()
                    .and_then(|&p| self.session.roster.player(p))
                    .map(|p| p.usid.clone());
                self.session.admins.grant_admin(uuid, usid.as_deref());
                self.session.persist();
                for player in online {
                    if let Some(p) = self.session.roster.player_mut(player) {
                        p.admin = true;
                    }
                }
                vec![format!("{uuid} is now an admin")]
            }
            ("kickall", _) => {
                self.session.kick_all(KickReason::Kick);
                vec!["Kicked all connections".to_string()]
            }
            ("quit" | "exit", _) => {
                info!("Server shutting down");
                self.session.kick_all(KickReason::ServerClose);
                self.running = false;
                vec![]
            }
            ("whitelist-add" | "ban" | "banip" | "unban" | "admin", None) => {
                vec![format!("Usage: {command} <target>")]
            }
            _ => vec![format!("Unknown command '{command}'")],
        }
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for handle in self.deadlines.values() {
            handle.abort();
        }
    }
}

async fn accept_loop(listener: ReliableListener, events: mpsc::UnboundedSender<ServerEvent>) {
    loop {
        match listener.accept().await {
            Ok((conn, addr)) => {
                if !spawn_connection(conn, addr, &events) {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
}

/// Starts the reader and writer tasks of one connection. Returns `false`
/// once the server side is gone.
fn spawn_connection(conn: ReliableConn, addr: SocketAddr, events: &mpsc::UnboundedSender<ServerEvent>) -> bool {
    let id = ConnectionId::new_unique();
    let (mut reader, mut writer) = conn.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel();
    // Dropped by the writer on exit; stops the reader with it.
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
    if events
        .send(ServerEvent::Connected { conn: id, addr, outbound })
        .is_err()
    {
        return false;
    }

    tokio::spawn(async move {
        while let Some(cmd) = queue.recv().await {
            match cmd {
                WriterCmd::Send(msg) => {
                    if let Err(e) = writer.send(&msg).await {
                        debug!(conn = id.0, error = %e, "Write failed");
                        break;
                    }
                }
                WriterCmd::Close => break,
            }
        }
        let _ = writer.shutdown().await;
        drop(closed_tx);
    });

    let events = events.clone();
    tokio::spawn(async move {
        loop {
            let read = tokio::select! {
                biased;
                _ = &mut closed_rx => break,
                read = reader.recv() => read,
            };
            match read {
                Ok(msg) => {
                    if events.send(ServerEvent::Message { conn: id, msg }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(conn = id.0, error = %e, "Read ended");
                    break;
                }
            }
        }
        let _ = events.send(ServerEvent::Closed { conn: id });
    });
    true
}

/// Helper for tests: a server on an ephemeral localhost port with
/// in-memory player records.
pub async fn bind_ephemeral(mut cfg: ServerConfig) -> anyhow::Result<GameServer> {
    cfg.server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string();
    let mut server = GameServer::new(cfg, Administration::in_memory(), World::new(64, 64)).await?;
    server.cfg.server_addr = server.local_addr.to_string();
    Ok(server)
}
