//! `sync_shared`
//!
//! Types shared by the sync server and its clients.
//!
//! Design goals:
//! - Explicit, versionable wire formats (net, snapshot).
//! - Clear separation of concerns (config, identity, names, commands, events).
//! - No `unsafe`.

pub mod command;
pub mod config;
pub mod event;
pub mod identity;
pub mod math;
pub mod names;
pub mod net;
pub mod snapshot;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
}
