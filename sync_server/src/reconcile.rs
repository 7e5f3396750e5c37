//! Client state reconciliation.
//!
//! Clients report their own position every frame. The server accepts the
//! claim only as far as the player could have moved since the previous
//! packet, and tells the client where it really is when the two drift
//! apart. The visible position is never written here; only the
//! interpolation target moves.

use chrono::{DateTime, Utc};
use sync_shared::{
    math::Vec2,
    net::{ClientSnapshot, ConnectionId, NetMsg},
};
use tracing::debug;

use crate::{
    player::MovementCaps,
    policy::{ActionKind, PlayerAction},
    session::Session,
    world::AIR,
};

/// Slack on top of the nominal speed.
const MOVE_TOLERANCE: f32 = 1.2;

/// Assumed frame time before the first packet of a connection.
const FIRST_FRAME_MS: i64 = 16;

/// Claims further than this from the accepted position are corrected.
pub const CORRECTION_DISTANCE: f32 = 16.0;

/// How far a player may move in `elapsed_ms`.
pub fn max_move_radius(elapsed_ms: i64, caps: &MovementCaps, boosting: bool) -> f32 {
    let speed = if boosting && !caps.flying {
        caps.boost_speed
    } else {
        caps.speed
    };
    elapsed_ms.max(0) as f32 / 1000.0 * 60.0 * speed.min(caps.max_speed) * MOVE_TOLERANCE
}

/// Moves `target` toward `claimed` by at most `max_move`.
pub fn reconcile_movement(target: Vec2, claimed: Vec2, max_move: f32) -> Vec2 {
    target + (claimed - target).limit(max_move)
}

impl Session {
    /// Applies one client state packet. Packets are applied in strictly
    /// increasing sequence order; anything else is dropped untouched.
    pub fn handle_client_snapshot(&mut self, conn: ConnectionId, snap: ClientSnapshot, now: DateTime<Utc>) {
        let Some((connection, player)) = self.roster.pair_mut(conn) else {
            return;
        };
        if connection.last_sequence.is_some_and(|last| snap.sequence <= last) {
            debug!(conn = conn.0, sequence = snap.sequence, "Dropping stale client snapshot");
            return;
        }

        let elapsed_ms = connection
            .last_received
            .map_or(FIRST_FRAME_MS, |at| (now - at).num_milliseconds());
        let max_move = max_move_radius(elapsed_ms, &player.caps, snap.intent.boosting);

        connection.viewport = snap.viewport;
        player.pointer = snap.pointer;
        player.mining = snap.mining;
        player.intent = snap.intent;

        let mut replies = Vec::new();
        player.build_queue.clear();
        for req in &snap.requests {
            let Some(tile) = self.world.tile(req.x, req.y) else {
                continue;
            };
            if !req.breaking && req.block.is_none() {
                continue;
            }
            let done = if req.breaking {
                tile.block == AIR
            } else {
                req.block == Some(tile.block)
                    && (!self.world.block_rotates(tile.block) || tile.rotation == req.rotation)
            };
            if done || connection.was_rejected(req) {
                continue;
            }

            let action = PlayerAction {
                player: &*player,
                kind: if req.breaking {
                    ActionKind::Break
                } else {
                    ActionKind::Place
                },
                x: req.x,
                y: req.y,
                block: req.block,
                rotation: req.rotation,
                config: req.config,
            };
            if !self.policy.allow(&action) {
                replies.push(NetMsg::RemoveQueueBlock {
                    x: req.x,
                    y: req.y,
                    breaking: req.breaking,
                });
                connection.remember_rejection(*req);
                continue;
            }
            player.build_queue.push_back(*req);
        }

        let accepted = reconcile_movement(player.interpolator.target, snap.position, max_move);
        let verify = self.config.strict && !player.dead;
        let new_target = if !verify {
            snap.position
        } else {
            if snap.position.dst(accepted) > CORRECTION_DISTANCE {
                replies.push(NetMsg::PositionSet {
                    x: accepted.x,
                    y: accepted.y,
                });
            }
            accepted
        };

        player
            .interpolator
            .read(player.position, new_target, snap.rotation, snap.base_rotation);
        player.velocity = snap.velocity;

        connection.last_sequence = Some(snap.sequence);
        connection.last_received = Some(now);

        for msg in replies {
            self.send(conn, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::ActionPolicy,
        testing::*,
        world::Tile,
    };
    use chrono::Duration;
    use sync_shared::{
        math::Rect,
        net::{BuildRequest, Intent},
    };

    fn snapshot(conn: ConnectionId, sequence: u32, position: Vec2) -> ClientSnapshot {
        ClientSnapshot {
            connection: conn,
            sequence,
            position,
            pointer: Vec2::new(1.0, 2.0),
            rotation: 90.0,
            base_rotation: 45.0,
            velocity: Vec2::new(0.5, 0.0),
            mining: None,
            intent: Intent::default(),
            requests: Vec::new(),
            viewport: Rect::centered(0.0, 0.0, 100.0, 80.0),
        }
    }

    fn place(x: i32, block: u16) -> BuildRequest {
        BuildRequest {
            x,
            y: 1,
            breaking: false,
            block: Some(block),
            rotation: 0,
            config: 0,
        }
    }

    struct DenyBreaking;

    impl ActionPolicy for DenyBreaking {
        fn allow(&self, action: &PlayerAction<'_>) -> bool {
            action.kind != ActionKind::Break
        }
    }

    #[test]
    fn radius_uses_boost_only_on_foot() {
        let caps = MovementCaps::default();
        let walk = max_move_radius(1000, &caps, false);
        assert!((walk - 60.0 * 0.5 * 1.2).abs() < 1e-4);
        assert!(max_move_radius(1000, &caps, true) > walk);

        let flyer = MovementCaps {
            flying: true,
            ..caps
        };
        assert_eq!(max_move_radius(1000, &flyer, true), walk);

        let capped = MovementCaps {
            speed: 10.0,
            max_speed: 1.0,
            ..caps
        };
        assert!((max_move_radius(1000, &capped, false) - 72.0).abs() < 1e-4);
    }

    #[test]
    fn repeated_identical_delta_gives_identical_target() {
        let start = Vec2::new(10.0, 10.0);
        let claim = Vec2::new(40.0, 50.0);
        let first = reconcile_movement(start, claim, 5.0);
        let second = reconcile_movement(start, claim, 5.0);
        assert_eq!(first, second);
        assert!((first.dst(start) - 5.0).abs() < 1e-4);
        assert_eq!(reconcile_movement(start, Vec2::new(11.0, 10.0), 5.0), Vec2::new(11.0, 10.0));
    }

    #[test]
    fn stale_sequences_change_nothing() {
        let mut session = session_with(test_config());
        let (conn, id) = admit_confirmed(&mut session, "alice", 1);
        let t0 = now();

        session.handle_client_snapshot(conn, snapshot(conn, 5, Vec2::new(0.1, 0.0)), t0);
        let before = session.roster().player(id).unwrap().clone();

        let mut stale = snapshot(conn, 5, Vec2::new(3.0, 3.0));
        stale.pointer = Vec2::new(99.0, 99.0);
        session.handle_client_snapshot(conn, stale.clone(), t0 + Duration::milliseconds(50));
        stale.sequence = 4;
        session.handle_client_snapshot(conn, stale, t0 + Duration::milliseconds(60));

        let after = session.roster().player(id).unwrap();
        assert_eq!(after.interpolator, before.interpolator);
        assert_eq!(after.pointer, before.pointer);
        assert_eq!(session.roster().connection(conn).unwrap().last_sequence, Some(5));
        assert_eq!(session.roster().connection(conn).unwrap().last_received, Some(t0));
    }

    #[test]
    fn live_players_are_clamped_and_corrected() {
        let mut session = session_with(test_config());
        let (conn, id) = admit_confirmed(&mut session, "alice", 1);
        session.roster.player_mut(id).unwrap().dead = false;
        session.take_outbox();

        session.handle_client_snapshot(conn, snapshot(conn, 1, Vec2::new(100.0, 0.0)), now());

        let player = session.roster().player(id).unwrap();
        let radius = max_move_radius(16, &player.caps, false);
        assert!((player.interpolator.target.x - radius).abs() < 1e-4);
        assert_eq!(player.position, Vec2::ZERO);
        assert_eq!(player.velocity, Vec2::new(0.5, 0.0));
        assert_eq!(player.interpolator.rotation, 90.0);

        let sent = sent_to(&session.take_outbox(), conn);
        assert!(matches!(sent.as_slice(), [NetMsg::PositionSet { x, .. }] if (*x - radius).abs() < 1e-4));
        assert_eq!(
            session.roster().connection(conn).unwrap().viewport,
            Rect::centered(0.0, 0.0, 100.0, 80.0)
        );
    }

    #[test]
    fn small_drift_is_not_corrected() {
        let mut session = session_with(test_config());
        let (conn, id) = admit_confirmed(&mut session, "alice", 1);
        session.roster.player_mut(id).unwrap().dead = false;
        session.take_outbox();

        session.handle_client_snapshot(conn, snapshot(conn, 1, Vec2::new(10.0, 0.0)), now());
        assert!(sent_to(&session.take_outbox(), conn).is_empty());
    }

    #[test]
    fn dead_players_are_not_verified() {
        let mut session = session_with(test_config());
        let (conn, id) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        session.handle_client_snapshot(conn, snapshot(conn, 1, Vec2::new(100.0, 0.0)), now());
        assert_eq!(
            session.roster().player(id).unwrap().interpolator.target,
            Vec2::new(100.0, 0.0)
        );
        assert!(sent_to(&session.take_outbox(), conn).is_empty());
    }

    #[test]
    fn build_queue_skips_done_and_refused_requests() {
        let mut session = session_with(test_config()).with_action_policy(DenyBreaking);
        session.world.set_tile(2, 1, Tile { block: 7, rotation: 0, team: None });
        session.world.set_tile(3, 1, Tile { block: 7, rotation: 1, team: None });
        session.world.set_rotates(7);
        let (conn, id) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        let mut snap = snapshot(conn, 1, Vec2::ZERO);
        let breaking = BuildRequest {
            breaking: true,
            block: None,
            ..place(2, 0)
        };
        snap.requests = vec![
            place(1, 5),                                   // new placement
            place(2, 7),                                   // already built
            place(3, 7),                                   // wrong rotation, still pending
            BuildRequest { block: None, ..place(4, 0) },   // nothing to place
            BuildRequest { breaking: true, block: None, ..place(5, 0) }, // already empty
            place(500, 1),                                 // off the map
            breaking,                                      // refused by policy
        ];
        session.handle_client_snapshot(conn, snap.clone(), now());

        let queued: Vec<i32> = session.roster().player(id).unwrap().build_queue.iter().map(|r| r.x).collect();
        assert_eq!(queued, vec![1, 3]);
        let sent = sent_to(&session.take_outbox(), conn);
        assert_eq!(sent, vec![NetMsg::RemoveQueueBlock { x: 2, y: 1, breaking: true }]);

        snap.sequence = 2;
        session.handle_client_snapshot(conn, snap, now() + Duration::milliseconds(16));
        assert!(sent_to(&session.take_outbox(), conn).is_empty());
    }
}
