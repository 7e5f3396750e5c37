//! Pluggable gameplay policies consulted by the session.

use crate::{player::Player, world::BlockId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Place,
    Break,
}

/// A player-initiated world edit awaiting permission.
pub struct PlayerAction<'a> {
    pub player: &'a Player,
    pub kind: ActionKind,
    pub x: i32,
    pub y: i32,
    pub block: Option<BlockId>,
    pub rotation: u8,
    pub config: i32,
}

/// Decides whether a player may perform a world edit.
pub trait ActionPolicy: Send + Sync {
    fn allow(&self, action: &PlayerAction<'_>) -> bool;
}

/// Allows every action.
#[derive(Debug, Default)]
pub struct PermitAll;

impl ActionPolicy for PermitAll {
    fn allow(&self, _action: &PlayerAction<'_>) -> bool {
        true
    }
}

/// Raised when a remote operation fails validation. The connection is kept.
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("{0}")]
    Rejected(String),
    #[error("no handler for remote operation {0}")]
    UnknownOperation(u16),
}

/// Executes opaque remote operations invoked by clients.
pub trait RemoteExecutor: Send {
    fn execute(&mut self, player: &Player, kind: u16, payload: &[u8]) -> Result<(), ValidateError>;
}

/// Refuses every operation.
#[derive(Debug, Default)]
pub struct NoRemoteOps;

impl RemoteExecutor for NoRemoteOps {
    fn execute(&mut self, _player: &Player, kind: u16, _payload: &[u8]) -> Result<(), ValidateError> {
        Err(ValidateError::UnknownOperation(kind))
    }
}
