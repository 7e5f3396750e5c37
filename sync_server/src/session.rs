//! One hosted game.
//!
//! A [`Session`] owns every piece of state the sync layer needs: config,
//! persisted player records, the roster, the world view, the vote slot and
//! the event bus. It never touches sockets. Handlers queue [`Outgoing`]
//! messages and [`TimerCommand`]s that the transport drains after each step,
//! so all session logic runs on the tick task and can be driven directly in
//! tests with an explicit `now`.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexSet;
use sync_shared::{
    command::ClientCommand,
    config::ServerConfig,
    event::EventBus,
    net::{ConnectionId, KickReason, NetMsg, PlayerId},
};
use tracing::{debug, info, warn};

use crate::{
    admin::Administration,
    events::{PlayerBanned, PlayerConnect, PlayerJoin, PlayerLeave, SessionEvent, VoteConcluded},
    player::{Player, Roster},
    policy::{ActionPolicy, NoRemoteOps, PermitAll, RemoteExecutor},
    team::{AssignContext, BalancedTeams, StatusAssigner, StatusView, TeamAssigner, TeamColorStatus, TeamId},
    vote::VoteKick,
    world::{PlayerView, World},
};

/// Minimum time between two `/sync` requests of one identity.
const SYNC_COOLDOWN_SECS: i64 = 5;

const COMMANDS_PER_PAGE: usize = 6;

/// A transport action queued by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Send { to: ConnectionId, msg: NetMsg },
    /// Flush pending sends, then close the connection.
    Close { conn: ConnectionId },
}

/// Vote deadline timer control, executed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    ArmVoteDeadline {
        session: u64,
        after: std::time::Duration,
    },
    CancelVoteDeadline {
        session: u64,
    },
}

pub struct Session {
    pub(crate) config: ServerConfig,
    pub(crate) admins: Administration,
    pub(crate) roster: Roster,
    pub(crate) world: World,
    pub(crate) votes: VoteKick,
    pub(crate) events: EventBus,
    pub(crate) assigner: Box<dyn TeamAssigner>,
    pub(crate) status: Box<dyn StatusAssigner>,
    pub(crate) policy: Box<dyn ActionPolicy>,
    pub(crate) executor: Box<dyn RemoteExecutor>,
    /// Packed positions of buildings awaiting a block snapshot.
    pub(crate) block_queue: IndexSet<u32>,
    pub(crate) last_block_sync: Option<DateTime<Utc>>,
    outbox: Vec<Outgoing>,
    timers: Vec<TimerCommand>,
}

impl Session {
    pub fn new(config: ServerConfig, admins: Administration, world: World) -> Self {
        Self {
            config,
            admins,
            roster: Roster::default(),
            world,
            votes: VoteKick::default(),
            events: EventBus::default(),
            assigner: Box::new(BalancedTeams),
            status: Box::new(TeamColorStatus),
            policy: Box::new(PermitAll),
            executor: Box::new(NoRemoteOps),
            block_queue: IndexSet::new(),
            last_block_sync: None,
            outbox: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn with_team_assigner(mut self, assigner: impl TeamAssigner + 'static) -> Self {
        self.assigner = Box::new(assigner);
        self
    }

    pub fn with_status_assigner(mut self, status: impl StatusAssigner + 'static) -> Self {
        self.status = Box::new(status);
        self
    }

    pub fn with_action_policy(mut self, policy: impl ActionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_remote_executor(mut self, executor: impl RemoteExecutor + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn admins(&self) -> &Administration {
        &self.admins
    }

    pub fn admins_mut(&mut self) -> &mut Administration {
        &mut self.admins
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Drains every lifecycle queue. Events come out grouped by type, each
    /// group oldest first.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        let bus = &mut self.events;
        let mut out = Vec::new();
        out.extend(bus.drain::<PlayerConnect>().into_iter().map(SessionEvent::Connect));
        out.extend(bus.drain::<PlayerJoin>().into_iter().map(SessionEvent::Join));
        out.extend(bus.drain::<PlayerLeave>().into_iter().map(SessionEvent::Leave));
        out.extend(bus.drain::<PlayerBanned>().into_iter().map(SessionEvent::Banned));
        out.extend(bus.drain::<VoteConcluded>().into_iter().map(SessionEvent::VoteConcluded));
        out
    }

    /// Drains queued transport actions, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_timers(&mut self) -> Vec<TimerCommand> {
        std::mem::take(&mut self.timers)
    }

    pub(crate) fn schedule(&mut self, cmd: TimerCommand) {
        self.timers.push(cmd);
    }

    // ─── Outbound ───

    pub fn send(&mut self, to: ConnectionId, msg: NetMsg) {
        self.outbox.push(Outgoing::Send { to, msg });
    }

    /// Sends to every admitted, still-open connection.
    pub fn broadcast(&mut self, msg: NetMsg) {
        let targets: Vec<ConnectionId> = self
            .roster
            .connections()
            .filter(|c| c.player.is_some() && !c.has_disconnected)
            .map(|c| c.id)
            .collect();
        for to in targets {
            self.send(to, msg.clone());
        }
    }

    pub fn send_to_player(&mut self, player: PlayerId, msg: NetMsg) {
        match self.roster.player(player) {
            Some(p) if p.local => debug!(player = %p.name, ?msg, "Message for local player"),
            Some(p) => {
                if let Some(conn) = p.connection {
                    self.send(conn, msg);
                }
            }
            None => {}
        }
    }

    /// Sends a system chat line to one player.
    pub fn tell(&mut self, player: PlayerId, text: impl Into<String>) {
        self.send_to_player(player, NetMsg::system(text));
    }

    pub fn announce(&mut self, text: impl Into<String>) {
        self.broadcast(NetMsg::system(text));
    }

    /// Saves player records, logging failures.
    pub(crate) fn persist(&self) {
        if let Err(e) = self.admins.save() {
            warn!(error = %e, "Failed to save player records");
        }
    }

    // ─── Inbound ───

    /// Dispatches one client message.
    pub fn handle_message(&mut self, conn: ConnectionId, msg: NetMsg, now: DateTime<Utc>) {
        match msg {
            NetMsg::Handshake(packet) => self.handle_handshake(conn, packet, now),
            NetMsg::UdpHello { client_udp_port } => self.udp_hello(conn, client_udp_port),
            NetMsg::ConnectConfirm => self.connect_confirm(conn),
            NetMsg::ClientSnapshot(snap) => self.handle_client_snapshot(conn, snap, now),
            NetMsg::Invoke { kind, payload } => self.handle_invoke(conn, kind, &payload),
            NetMsg::AdminRequest { target, action } => {
                if let Some(player) = self.roster.player_for(conn) {
                    self.admin_request(player, target, action, now);
                }
            }
            NetMsg::Chat { message } => {
                if let Some(player) = self.roster.player_for(conn) {
                    self.handle_chat(player, &message, now);
                }
            }
            other => debug!(conn = conn.0, ?other, "Ignoring server-bound message"),
        }
    }

    fn udp_hello(&mut self, conn: ConnectionId, port: u16) {
        if let Some(connection) = self.roster.connection_mut(conn) {
            let peer = SocketAddr::new(connection.address, port);
            connection.udp_peer = Some(peer);
            debug!(conn = conn.0, %peer, "Registered UDP peer");
        }
    }

    /// Whether a datagram from `from` may act for `conn`.
    pub fn udp_source_matches(&self, conn: ConnectionId, from: IpAddr) -> bool {
        self.roster
            .connection(conn)
            .is_some_and(|c| c.address == from && !c.has_disconnected)
    }

    /// The client finished loading the world.
    pub fn connect_confirm(&mut self, conn: ConnectionId) {
        let Some(connection) = self.roster.connection_mut(conn) else {
            return;
        };
        let Some(player) = connection.player else {
            return;
        };
        if connection.has_connected {
            return;
        }
        connection.has_connected = true;

        let Some(p) = self.roster.player(player) else {
            return;
        };
        let (name, uuid) = (p.name.clone(), p.uuid.clone());
        if self.config.show_connect_messages {
            self.announce(format!("[accent]{name}[accent] has connected."));
            info!(player = %name, %uuid, "Player connected");
        }
        if let Some(motd) = self.config.motd().map(str::to_string) {
            self.tell(player, motd);
        }
        self.events.publish(PlayerJoin { player });
    }

    fn handle_invoke(&mut self, conn: ConnectionId, kind: u16, payload: &[u8]) {
        let Some(player) = self.roster.player_for(conn).and_then(|id| self.roster.player(id)) else {
            return;
        };
        if let Err(e) = self.executor.execute(player, kind, payload) {
            debug!(player = %player.name, kind, error = %e, "Validation failed");
        }
    }

    // ─── Disconnects ───

    /// The transport reported the connection closed.
    pub fn on_transport_closed(&mut self, conn: ConnectionId, reason: &str) {
        let Some(connection) = self.roster.connection(conn) else {
            return;
        };
        if let Some(player) = connection.player {
            self.disconnect_player(player, reason);
        }
        self.roster.remove_connection(conn);
    }

    /// Removes a player. Confirmed players get a leave event and a
    /// disconnect broadcast, at most once per connection.
    pub fn disconnect_player(&mut self, player: PlayerId, reason: &str) {
        let Some(p) = self.roster.remove_player(player) else {
            return;
        };
        let Some(conn) = p.connection else {
            debug!(player = %p.name, "Removed local player");
            return;
        };

        let was_connected = match self.roster.connection_mut(conn) {
            Some(c) if c.has_disconnected => return,
            Some(c) => {
                c.has_disconnected = true;
                c.has_connected
            }
            // The connection vanished under a live player.
            None => true,
        };

        if was_connected {
            self.events.publish(PlayerLeave {
                player,
                uuid: p.uuid.clone(),
                reason: reason.to_string(),
            });
            if self.config.show_connect_messages {
                self.announce(format!("[accent]{}[accent] has disconnected.", p.name));
            }
            self.broadcast(NetMsg::PlayerDisconnect { player });
        }
        if self.config.show_connect_messages {
            info!(player = %p.name, uuid = %p.uuid, reason, "Player disconnected");
        }
    }

    /// Sends a coded kick, closes the connection and drops its player.
    pub fn kick(&mut self, conn: ConnectionId, reason: KickReason, detail: Option<String>) {
        let Some(connection) = self.roster.connection(conn) else {
            return;
        };
        info!(
            conn = conn.0,
            address = %connection.address,
            ?reason,
            text = reason.message(),
            detail = detail.as_deref().unwrap_or(""),
            "Kicking connection"
        );
        let player = connection.player;
        self.send(conn, NetMsg::Kick { reason, detail });
        self.outbox.push(Outgoing::Close { conn });
        if let Some(player) = player {
            self.disconnect_player(player, &format!("{reason:?}"));
        }
        self.roster.remove_connection(conn);
    }

    pub fn kick_player(&mut self, player: PlayerId, reason: KickReason) {
        match self.roster.player(player).map(|p| p.connection) {
            Some(Some(conn)) => self.kick(conn, reason, None),
            Some(None) => self.disconnect_player(player, &format!("{reason:?}")),
            None => {}
        }
    }

    pub fn kick_all(&mut self, reason: KickReason) {
        let conns: Vec<ConnectionId> = self.roster.connections().map(|c| c.id).collect();
        for conn in conns {
            self.kick(conn, reason, None);
        }
    }

    // ─── Players ───

    /// Adds an in-process host player with admin rights and no connection.
    pub fn add_local_player(&mut self, name: &str, uuid: &str) -> PlayerId {
        let id = self.roster.next_player_id();
        let mut player = Player::new(id, uuid, "", name);
        player.local = true;
        player.admin = true;
        player.team = self.assign_team(id);
        self.roster.insert_player(player);
        id
    }

    pub(crate) fn assign_team(&self, player: PlayerId) -> TeamId {
        let roster: Vec<(PlayerId, TeamId)> = self.roster.players().map(|p| (p.id, p.team)).collect();
        let active = self.world.active_teams();
        self.assigner.assign(&AssignContext {
            player,
            roster: &roster,
            active_teams: &active,
            rules: &self.world.rules,
        })
    }

    /// Status prefix followed by the player's name.
    pub fn status_name(&self, player: &Player) -> String {
        let connected = player.local
            || self
                .roster
                .connection_of(player.id)
                .is_some_and(|c| c.has_connected);
        let status = self.status.status(&StatusView {
            team: player.team,
            connected,
            dead: player.dead,
        });
        format!("{status}{}", player.name)
    }

    /// Sends the full world snapshot to a remote player.
    pub(crate) fn send_world_data(&mut self, player: PlayerId) {
        let Some(p) = self.roster.player(player) else {
            return;
        };
        let Some(conn) = p.connection else {
            return;
        };
        let view = PlayerView {
            id: p.id,
            name: &p.name,
            team: p.team,
            admin: p.admin,
            position: p.position,
        };
        match self.world.write_world_data(view) {
            Ok(data) => {
                debug!(player = %p.name, bytes = data.len(), "Packed world data");
                self.send(conn, NetMsg::WorldData { data });
            }
            Err(e) => warn!(player = %p.name, error = %e, "Failed to write world data"),
        }
    }

    /// `/sync`: resends world data, at most once per cooldown per identity.
    pub fn request_sync(&mut self, player: PlayerId, now: DateTime<Utc>) {
        let Some(p) = self.roster.player(player) else {
            return;
        };
        if p.local {
            self.tell(player, "[scarlet]Re-synchronizing as the host is pointless.");
            return;
        }
        let uuid = p.uuid.clone();
        let info = self.admins.info_mut(&uuid);
        if info
            .last_sync
            .is_some_and(|last| now - last < Duration::seconds(SYNC_COOLDOWN_SECS))
        {
            self.tell(
                player,
                format!("[scarlet]You may only /sync every {SYNC_COOLDOWN_SECS} seconds."),
            );
            return;
        }
        info.last_sync = Some(now);
        self.send_to_player(player, NetMsg::WorldDataBegin);
        self.send_world_data(player);
    }

    // ─── Chat ───

    pub fn handle_chat(&mut self, player: PlayerId, message: &str, now: DateTime<Utc>) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        let Some(p) = self.roster.player(player) else {
            return;
        };

        match ClientCommand::parse(message) {
            None => {
                let name = p.name.clone();
                info!(player = %name, message, "Chat");
                self.broadcast(NetMsg::ChatMessage {
                    message: message.to_string(),
                    sender: Some(name),
                });
            }
            Some(command) => self.run_command(player, command, now),
        }
    }

    fn run_command(&mut self, player: PlayerId, command: ClientCommand, now: DateTime<Utc>) {
        match command {
            ClientCommand::Help { page } => self.command_help(player, page.as_deref()),
            ClientCommand::TeamChat { message } => self.command_team_chat(player, &message),
            ClientCommand::VoteKick { target } => self.command_votekick(player, target.as_deref(), now),
            ClientCommand::Vote { choice } => self.command_vote(player, choice.as_deref(), now),
            ClientCommand::Sync => self.request_sync(player, now),
            ClientCommand::Unknown(name) => {
                debug!(command = %name, "Unknown client command");
                self.tell(player, "[scarlet]Unknown command. Check [lightgray]/help[scarlet].");
            }
        }
    }

    fn command_help(&mut self, player: PlayerId, page: Option<&str>) {
        let usage = ClientCommand::usage();
        let pages = usage.len().div_ceil(COMMANDS_PER_PAGE);
        let page = match page.map(str::parse::<usize>) {
            None => 1,
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                self.tell(player, "[scarlet]'page' must be a number.");
                return;
            }
        };
        if page == 0 || page > pages {
            self.tell(
                player,
                format!("[scarlet]'page' must be a number between[orange] 1[] and[orange] {pages}[scarlet]."),
            );
            return;
        }

        let mut text = format!("[orange]-- Commands Page[lightgray] {page}[gray]/[lightgray]{pages}[orange] --\n\n");
        for (syntax, description) in usage
            .iter()
            .skip((page - 1) * COMMANDS_PER_PAGE)
            .take(COMMANDS_PER_PAGE)
        {
            text.push_str(&format!("[orange] {syntax}[lightgray] - {description}\n"));
        }
        self.tell(player, text);
    }

    fn command_team_chat(&mut self, player: PlayerId, message: &str) {
        let Some(p) = self.roster.player(player) else {
            return;
        };
        if message.is_empty() {
            self.tell(player, "[scarlet]Usage: /t <message...>");
            return;
        }
        let team = p.team;
        let sender = format!("[#{}]<T>{}", team.color(), p.name);
        let mates: Vec<PlayerId> = self
            .roster
            .players()
            .filter(|o| o.team == team)
            .map(|o| o.id)
            .collect();
        for mate in mates {
            self.send_to_player(
                mate,
                NetMsg::ChatMessage {
                    message: message.to_string(),
                    sender: Some(sender.clone()),
                },
            );
        }
    }
}
