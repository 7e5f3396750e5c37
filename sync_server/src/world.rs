//! World state as seen by the sync layer.
//!
//! The simulation that advances this state lives outside the server; the
//! sync layer only reads tiles, buildings, cores and entity groups to build
//! snapshots, and writes the few things admin actions touch (wave skip).

use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sync_shared::{
    math::{pack_pos, Vec2},
    net::PlayerId,
    snapshot::{compress, CoreRecord},
};

use crate::team::{Rules, TeamId};

/// Block type id. `0` is empty space.
pub type BlockId = u16;

pub const AIR: BlockId = 0;

/// Entity group id reserved for players; world groups start after it.
pub const PLAYER_GROUP: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tile {
    pub block: BlockId,
    pub rotation: u8,
    pub team: Option<TeamId>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("entity group '{0}' syncs its members but has no identity mapping")]
    UnmappedSyncGroup(String),
    #[error("no free entity group ids")]
    TooManyGroups,
}

/// An entity whose state is replicated to clients.
pub trait SyncEntity: Send + Sync {
    fn id(&self) -> u32;
    fn type_tag(&self) -> u8;

    /// Entities may opt out of individual snapshots (e.g. while dying).
    fn is_syncing(&self) -> bool {
        true
    }

    fn write_state(&self, out: &mut BytesMut);
}

/// Registration parameters for an entity group.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    /// Members are sent in entity snapshots.
    pub sync: bool,
    /// Members are addressable by id on clients.
    pub mapping: bool,
}

pub struct EntityGroup {
    id: u8,
    sync: bool,
    members: Vec<Box<dyn SyncEntity>>,
}

impl EntityGroup {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn syncs(&self) -> bool {
        self.sync
    }

    pub fn add(&mut self, entity: Box<dyn SyncEntity>) {
        self.members.push(entity);
    }

    pub fn members(&self) -> impl Iterator<Item = &dyn SyncEntity> {
        self.members.iter().map(|e| e.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A placed structure.
#[derive(Debug, Clone)]
pub struct Building {
    pub team: TeamId,
    /// Whether the building's state is replicated in block snapshots.
    pub sync: bool,
    pub state: Bytes,
}

/// A team core and the resources it holds.
#[derive(Debug, Clone, Serialize)]
pub struct Core {
    pub x: u16,
    pub y: u16,
    pub team: TeamId,
    pub items: BTreeMap<u16, u32>,
}

impl Core {
    pub fn record(&self) -> CoreRecord {
        CoreRecord::at(
            self.x,
            self.y,
            self.items.iter().map(|(item, n)| (*item, *n)).collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WaveState {
    pub countdown: f32,
    pub wave: u32,
    pub enemies: u32,
}

impl Default for WaveState {
    fn default() -> Self {
        Self {
            countdown: 60.0 * 120.0,
            wave: 1,
            enemies: 0,
        }
    }
}

/// What a joining player needs to know about themselves.
#[derive(Debug, Serialize)]
pub struct PlayerView<'a> {
    pub id: PlayerId,
    pub name: &'a str,
    pub team: TeamId,
    pub admin: bool,
    pub position: Vec2,
}

#[derive(Serialize)]
struct WorldData<'a> {
    width: u16,
    height: u16,
    tiles: &'a [Tile],
    rules: &'a Rules,
    wave: &'a WaveState,
    cores: &'a [Core],
    buildings: Vec<(u32, &'a [u8])>,
    player: PlayerView<'a>,
}

pub struct World {
    width: u16,
    height: u16,
    tiles: Vec<Tile>,
    rotating: HashSet<BlockId>,
    groups: Vec<EntityGroup>,
    buildings: BTreeMap<u32, Building>,
    cores: Vec<Core>,
    pub rules: Rules,
    pub wave: WaveState,
}

impl World {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            tiles: vec![Tile::default(); width as usize * height as usize],
            rotating: HashSet::new(),
            groups: Vec::new(),
            buildings: BTreeMap::new(),
            cores: Vec::new(),
            rules: Rules::default(),
            wave: WaveState::default(),
        }
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    pub fn tile(&self, x: i32, y: i32) -> Option<&Tile> {
        self.index(x, y).map(|i| &self.tiles[i])
    }

    pub fn set_tile(&mut self, x: i32, y: i32, tile: Tile) -> bool {
        match self.index(x, y) {
            Some(i) => {
                self.tiles[i] = tile;
                true
            }
            None => false,
        }
    }

    /// Marks a block type as rotation-sensitive.
    pub fn set_rotates(&mut self, block: BlockId) {
        self.rotating.insert(block);
    }

    pub fn block_rotates(&self, block: BlockId) -> bool {
        self.rotating.contains(&block)
    }

    /// Registers an entity group. Groups that sync members must be
    /// identity-mapped, otherwise clients cannot apply their snapshots.
    pub fn register_group(&mut self, spec: GroupSpec) -> Result<u8, WorldError> {
        if spec.sync && !spec.mapping {
            return Err(WorldError::UnmappedSyncGroup(spec.name));
        }
        let id = u8::try_from(self.groups.len() + 1).map_err(|_| WorldError::TooManyGroups)?;
        self.groups.push(EntityGroup {
            id,
            sync: spec.sync,
            members: Vec::new(),
        });
        Ok(id)
    }

    pub fn group_mut(&mut self, id: u8) -> Option<&mut EntityGroup> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn groups(&self) -> &[EntityGroup] {
        &self.groups
    }

    pub fn add_building(&mut self, x: u16, y: u16, building: Building) {
        self.buildings.insert(pack_pos(x, y), building);
    }

    pub fn building(&self, pos: u32) -> Option<&Building> {
        self.buildings.get(&pos)
    }

    pub fn buildings(&self) -> impl Iterator<Item = (u32, &Building)> {
        self.buildings.iter().map(|(pos, b)| (*pos, b))
    }

    pub fn add_core(&mut self, core: Core) {
        self.cores.push(core);
    }

    pub fn cores_of(&self, team: TeamId) -> impl Iterator<Item = &Core> {
        self.cores.iter().filter(move |c| c.team == team)
    }

    /// Teams owning at least one core, ascending.
    pub fn active_teams(&self) -> Vec<TeamId> {
        let mut teams: Vec<TeamId> = self.cores.iter().map(|c| c.team).collect();
        teams.sort();
        teams.dedup();
        teams
    }

    pub fn skip_wave(&mut self) {
        self.wave.countdown = 0.0;
    }

    /// Full world snapshot for one player, as compressed JSON.
    pub fn write_world_data(&self, player: PlayerView<'_>) -> anyhow::Result<Vec<u8>> {
        let data = WorldData {
            width: self.width,
            height: self.height,
            tiles: &self.tiles,
            rules: &self.rules,
            wave: &self.wave,
            cores: &self.cores,
            buildings: self
                .buildings
                .iter()
                .filter(|(_, b)| b.sync)
                .map(|(pos, b)| (*pos, b.state.as_ref()))
                .collect(),
            player,
        };
        let json = serde_json::to_vec(&data).context("serialize world data")?;
        compress(&json).context("compress world data")
    }
}
