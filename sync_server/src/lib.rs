//! `sync_server`
//!
//! Authoritative multiplayer sync server:
//! - Admission of joining clients (bans, identity, version, content)
//! - Reconciliation of client-reported player state
//! - Byte-budgeted entity, state and block snapshots
//! - Vote-kicks and direct admin actions
//!
//! Networking model:
//! - TCP: handshake, chat, commands, corrections
//! - UDP: snapshots, in both directions
//!
//! All game-facing logic lives on [`Session`], which never touches sockets.
//! [`GameServer`] is the transport around it.

pub mod admin;
pub mod admission;
pub mod broadcast;
pub mod events;
pub mod moderation;
pub mod player;
pub mod policy;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod team;
pub mod vote;
pub mod world;

#[cfg(test)]
mod testing;

pub use server::GameServer;
pub use session::Session;
