//! Players, their connections, and the roster that owns both.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
};

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use sync_shared::{
    math::{Rect, Vec2},
    net::{BuildRequest, ConnectionId, Intent, PlayerId},
};

use crate::team::TeamId;

/// Upper bound on a serialized player record.
pub const PLAYER_SYNC_CAPACITY: usize = 127;

/// How many refused build requests a connection remembers.
pub const REJECTED_REQUEST_MEMORY: usize = 64;

/// Transport-level state for one remote peer.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub address: IpAddr,
    pub player: Option<PlayerId>,
    /// Where unreliable traffic goes, once announced.
    pub udp_peer: Option<SocketAddr>,
    pub has_begun_connecting: bool,
    pub has_connected: bool,
    pub has_disconnected: bool,
    pub mobile: bool,
    pub modified_client: bool,
    pub version: Option<i32>,
    pub content: Vec<String>,
    pub last_sequence: Option<u32>,
    pub last_received: Option<DateTime<Utc>>,
    pub viewport: Rect,
    rejected: VecDeque<BuildRequest>,
}

impl Connection {
    pub fn new(id: ConnectionId, address: IpAddr) -> Self {
        Self {
            id,
            address,
            player: None,
            udp_peer: None,
            has_begun_connecting: false,
            has_connected: false,
            has_disconnected: false,
            mobile: false,
            modified_client: false,
            version: None,
            content: Vec::new(),
            last_sequence: None,
            last_received: None,
            viewport: Rect::default(),
            rejected: VecDeque::new(),
        }
    }

    /// Whether a request for the same tile and operation was refused recently.
    pub fn was_rejected(&self, req: &BuildRequest) -> bool {
        self.rejected
            .iter()
            .any(|r| r.x == req.x && r.y == req.y && r.breaking == req.breaking)
    }

    pub fn remember_rejection(&mut self, req: BuildRequest) {
        if self.rejected.len() >= REJECTED_REQUEST_MEMORY {
            self.rejected.pop_front();
        }
        self.rejected.push_back(req);
    }

    pub fn rejected_len(&self) -> usize {
        self.rejected.len()
    }
}

/// Movement caps of the player's current body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementCaps {
    pub speed: f32,
    pub boost_speed: f32,
    pub max_speed: f32,
    /// Flying bodies never use the boost speed.
    pub flying: bool,
}

impl Default for MovementCaps {
    fn default() -> Self {
        Self {
            speed: 0.5,
            boost_speed: 0.85,
            max_speed: 4.0,
            flying: false,
        }
    }
}

/// Server-side smoothing target for a remote player.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Interpolator {
    pub last: Vec2,
    pub target: Vec2,
    pub rotation: f32,
    pub base_rotation: f32,
}

impl Interpolator {
    pub fn read(&mut self, from: Vec2, to: Vec2, rotation: f32, base_rotation: f32) {
        self.last = from;
        self.target = to;
        self.rotation = rotation;
        self.base_rotation = base_rotation;
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub uuid: String,
    pub usid: String,
    pub name: String,
    pub color: u32,
    pub team: TeamId,
    pub admin: bool,
    /// Hosted in-process; has no connection.
    pub local: bool,
    pub mobile: bool,
    pub connection: Option<ConnectionId>,
    pub position: Vec2,
    pub velocity: Vec2,
    pub pointer: Vec2,
    pub rotation: f32,
    pub interpolator: Interpolator,
    pub dead: bool,
    pub intent: Intent,
    pub mining: Option<(i32, i32)>,
    pub build_queue: VecDeque<BuildRequest>,
    pub caps: MovementCaps,
    pub last_entity_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
#[error("player record of {0} bytes exceeds {PLAYER_SYNC_CAPACITY}")]
pub struct PlayerSyncOverflow(pub usize);

impl Player {
    pub fn new(id: PlayerId, uuid: impl Into<String>, usid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            uuid: uuid.into(),
            usid: usid.into(),
            name: name.into(),
            color: 0xffffffff,
            team: TeamId::SHARDED,
            admin: false,
            local: false,
            mobile: false,
            connection: None,
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            pointer: Vec2::ZERO,
            rotation: 0.0,
            interpolator: Interpolator::default(),
            dead: true,
            intent: Intent::default(),
            mining: None,
            build_queue: VecDeque::new(),
            caps: MovementCaps::default(),
            last_entity_sync: None,
        }
    }

    /// Writes the replicated player record.
    pub fn write_sync(&self, out: &mut BytesMut) {
        let name = self.name.as_bytes();
        out.put_u8(name.len().min(u8::MAX as usize) as u8);
        out.extend_from_slice(&name[..name.len().min(u8::MAX as usize)]);
        out.put_u32(self.color);
        out.put_u8(self.team.0);
        out.put_u8(u8::from(self.admin) | u8::from(self.dead) << 1 | u8::from(self.mobile) << 2);
        out.put_f32(self.position.x);
        out.put_f32(self.position.y);
        out.put_f32(self.rotation);
        out.put_f32(self.pointer.x);
        out.put_f32(self.pointer.y);
        let intent = &self.intent;
        out.put_u8(
            u8::from(intent.boosting)
                | u8::from(intent.shooting) << 1
                | u8::from(intent.chatting) << 2
                | u8::from(intent.building) << 3,
        );
    }

    /// Serializes into a record bounded by [`PLAYER_SYNC_CAPACITY`].
    pub fn write_sync_bounded(&self) -> Result<BytesMut, PlayerSyncOverflow> {
        let mut out = BytesMut::with_capacity(PLAYER_SYNC_CAPACITY);
        self.write_sync(&mut out);
        if out.len() > PLAYER_SYNC_CAPACITY {
            return Err(PlayerSyncOverflow(out.len()));
        }
        Ok(out)
    }
}

/// Owns every connection and player of one session.
#[derive(Debug, Default)]
pub struct Roster {
    players: BTreeMap<PlayerId, Player>,
    connections: HashMap<ConnectionId, Connection>,
    next_player: u32,
}

impl Roster {
    pub fn add_connection(&mut self, conn: Connection) {
        self.connections.insert(conn.id, conn);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn next_player_id(&mut self) -> PlayerId {
        self.next_player += 1;
        PlayerId(self.next_player)
    }

    pub fn insert_player(&mut self, player: Player) {
        self.players.insert(player.id, player);
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn remove_player(&mut self, id: PlayerId) -> Option<Player> {
        self.players.remove(&id)
    }

    /// Players in id order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Vec<PlayerId> {
        self.players
            .values()
            .filter(|p| p.uuid == uuid)
            .map(|p| p.id)
            .collect()
    }

    /// The player bound to a connection, if any.
    pub fn player_for(&self, conn: ConnectionId) -> Option<PlayerId> {
        self.connections.get(&conn).and_then(|c| c.player)
    }

    /// The live connection of a player, if it still exists.
    pub fn connection_of(&self, player: PlayerId) -> Option<&Connection> {
        self.players
            .get(&player)
            .and_then(|p| p.connection)
            .and_then(|c| self.connections.get(&c))
    }

    /// Borrows a connection and its player together.
    pub fn pair_mut(&mut self, conn: ConnectionId) -> Option<(&mut Connection, &mut Player)> {
        let connection = self.connections.get_mut(&conn)?;
        let player = self.players.get_mut(&connection.player?)?;
        Some((connection, player))
    }
}
