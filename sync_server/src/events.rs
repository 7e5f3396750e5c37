//! Lifecycle events published on the session's [`EventBus`].
//!
//! [`EventBus`]: sync_shared::event::EventBus

use sync_shared::net::PlayerId;

/// A player passed admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerConnect {
    pub player: PlayerId,
    pub uuid: String,
    pub name: String,
}

/// A player finished loading and entered the game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerJoin {
    pub player: PlayerId,
}

/// A confirmed player left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerLeave {
    pub player: PlayerId,
    pub uuid: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerBanned {
    pub uuid: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteConcluded {
    pub target_uuid: String,
    pub target_name: String,
    pub passed: bool,
    /// The caster ended up as the target.
    pub backfired: bool,
}

/// Any lifecycle event, as handed to server observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connect(PlayerConnect),
    Join(PlayerJoin),
    Leave(PlayerLeave),
    Banned(PlayerBanned),
    VoteConcluded(VoteConcluded),
}
