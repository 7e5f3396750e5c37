//! Periodic snapshot broadcast.
//!
//! Every confirmed remote player gets entity snapshots (one stream per
//! syncing group), a state snapshot carrying its team's core resources on
//! the entity cadence, and every admitted connection gets block snapshots on
//! the slower block cadence. Encoding faults are logged and the pass moves
//! on to the next player.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use sync_shared::{
    math::pack_pos,
    net::{ConnectionId, NetMsg, PlayerId},
    snapshot::{compress, write_core_list, BlockRecord, EntityRecord, SnapshotChunk, SnapshotEncoder, SnapshotError, SnapshotRecord},
};
use tracing::{debug, warn};

use crate::{
    session::Session,
    world::{Core, PLAYER_GROUP},
};

/// Type tag of player records in entity snapshots.
pub const PLAYER_TYPE_TAG: u8 = 0;

/// Encodes records, skipping any single record that cannot fit a buffer.
fn encode_skipping<R: SnapshotRecord>(ceiling: usize, records: &[R]) -> Result<Vec<SnapshotChunk>, SnapshotError> {
    let mut encoder = SnapshotEncoder::new(ceiling)?;
    for record in records {
        match encoder.push(record) {
            Err(SnapshotError::RecordTooLarge { size, ceiling }) => {
                debug!(size, ceiling, "Skipping oversized snapshot record");
            }
            Err(SnapshotError::LengthOverflow { what, len }) => {
                debug!(what, len, "Skipping snapshot record with overlong field");
            }
            other => other?,
        }
    }
    encoder.finish()
}

impl Session {
    /// Runs one sync pass. Called every tick.
    pub fn update(&mut self, now: DateTime<Utc>) {
        let entity_interval = Duration::milliseconds(self.config.entity_sync_interval_ms as i64);

        for id in self.roster.player_ids() {
            let Some(player) = self.roster.player(id) else {
                continue;
            };
            if player.local {
                continue;
            }
            let last_sync = player.last_entity_sync;
            let live = self
                .roster
                .connection_of(id)
                .filter(|c| !c.has_disconnected)
                .map(|c| (c.id, c.has_connected));
            let Some((conn, confirmed)) = live else {
                self.disconnect_player(id, "disappeared");
                continue;
            };
            if !confirmed || last_sync.is_some_and(|t| now - t < entity_interval) {
                continue;
            }

            if let Some(p) = self.roster.player_mut(id) {
                p.last_entity_sync = Some(now);
            }
            if let Err(e) = self.write_entity_snapshot(id, conn) {
                warn!(player = %id, error = %e, "Failed to write entity snapshot");
            }
        }

        let block_interval = Duration::milliseconds(self.config.block_sync_interval_ms as i64);
        if self.roster.player_count() > 0
            && self.config.block_sync
            && self.last_block_sync.map_or(true, |t| now - t >= block_interval)
        {
            self.last_block_sync = Some(now);
            self.queue_sync_blocks();
        }

        self.send_block_snapshots();
    }

    /// Entity and state snapshots for one player.
    fn write_entity_snapshot(&mut self, player: PlayerId, conn: ConnectionId) -> Result<(), SnapshotError> {
        let ceiling = self.config.max_snapshot_size;
        let Some(team) = self.roster.player(player).map(|p| p.team) else {
            return Ok(());
        };
        let mut out = Vec::new();

        let players: Vec<EntityRecord> = self
            .roster
            .players()
            .filter(|p| p.local || self.roster.connection_of(p.id).is_some_and(|c| c.has_connected))
            .map(|p| {
                let mut state = BytesMut::new();
                p.write_sync(&mut state);
                EntityRecord {
                    id: p.id.0,
                    type_tag: PLAYER_TYPE_TAG,
                    state: state.freeze(),
                }
            })
            .collect();
        push_entity_chunks(&mut out, PLAYER_GROUP, encode_skipping(ceiling, &players)?);

        for group in self.world.groups().iter().filter(|g| g.syncs() && !g.is_empty()) {
            let records: Vec<EntityRecord> = group
                .members()
                .filter(|e| e.is_syncing())
                .map(|e| {
                    let mut state = BytesMut::new();
                    e.write_state(&mut state);
                    EntityRecord {
                        id: e.id(),
                        type_tag: e.type_tag(),
                        state: state.freeze(),
                    }
                })
                .collect();
            push_entity_chunks(&mut out, group.id(), encode_skipping(ceiling, &records)?);
        }

        let cores: Vec<_> = self.world.cores_of(team).map(Core::record).collect();
        let raw = write_core_list(&cores)?;
        let core_data_size = u16::try_from(raw.len()).map_err(|_| SnapshotError::RecordTooLarge {
            size: raw.len(),
            ceiling: u16::MAX as usize,
        })?;
        let wave = self.world.wave;
        out.push(NetMsg::StateSnapshot {
            wave_countdown: wave.countdown,
            wave: wave.wave,
            enemies: wave.enemies,
            core_data_size,
            core_data: compress(&raw)?,
        });

        for msg in out {
            self.send(conn, msg);
        }
        Ok(())
    }

    /// Queues one building for the next block snapshot.
    pub fn queue_block(&mut self, x: u16, y: u16) {
        self.block_queue.insert(pack_pos(x, y));
    }

    fn queue_sync_blocks(&mut self) {
        let positions = self.world.buildings().filter(|(_, b)| b.sync).map(|(pos, _)| pos);
        self.block_queue.extend(positions);
    }

    fn send_block_snapshots(&mut self) {
        if self.block_queue.is_empty() {
            return;
        }
        let queue = std::mem::take(&mut self.block_queue);
        let records: Vec<BlockRecord> = queue
            .iter()
            .filter_map(|pos| {
                self.world.building(*pos).map(|b| BlockRecord {
                    pos: *pos,
                    state: Bytes::clone(&b.state),
                })
            })
            .collect();

        match encode_skipping(self.config.max_snapshot_size, &records) {
            Ok(chunks) => {
                for chunk in chunks {
                    self.broadcast(NetMsg::BlockSnapshot {
                        amount: chunk.count,
                        original_size: chunk.original_size,
                        data: chunk.data,
                    });
                }
            }
            Err(e) => warn!(blocks = records.len(), error = %e, "Failed to write block snapshot"),
        }
    }
}

fn push_entity_chunks(out: &mut Vec<NetMsg>, group: u8, chunks: Vec<SnapshotChunk>) {
    out.extend(chunks.into_iter().map(|chunk| NetMsg::EntitySnapshot {
        group,
        amount: chunk.count,
        original_size: chunk.original_size,
        data: chunk.data,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::PlayerLeave,
        team::TeamId,
        testing::*,
        world::{Building, GroupSpec, SyncEntity},
    };
    use std::collections::BTreeMap;
    use sync_shared::{
        config::ServerConfig,
        snapshot::{decode_chunk, decompress, read_core_list},
    };

    struct Unit {
        id: u32,
        size: usize,
    }

    impl SyncEntity for Unit {
        fn id(&self) -> u32 {
            self.id
        }
        fn type_tag(&self) -> u8 {
            4
        }
        fn write_state(&self, out: &mut BytesMut) {
            out.extend_from_slice(&vec![self.id as u8; self.size]);
        }
    }

    fn chunk_of(msg: &NetMsg) -> Option<(u8, SnapshotChunk)> {
        match msg {
            NetMsg::EntitySnapshot {
                group,
                amount,
                original_size,
                data,
            } => Some((
                *group,
                SnapshotChunk {
                    count: *amount,
                    original_size: *original_size,
                    data: data.clone(),
                },
            )),
            _ => None,
        }
    }

    fn with_units(config: ServerConfig, units: &[(u32, usize)]) -> (Session, u8) {
        let mut session = session_with(config);
        let group = session
            .world_mut()
            .register_group(GroupSpec {
                name: "units".into(),
                sync: true,
                mapping: true,
            })
            .unwrap();
        for &(id, size) in units {
            session.world_mut().group_mut(group).unwrap().add(Box::new(Unit { id, size }));
        }
        (session, group)
    }

    #[test]
    fn confirmed_players_get_entity_and_state_snapshots() {
        let (mut session, group) = with_units(test_config(), &[(1, 8), (2, 8)]);
        let (a, alice) = admit_confirmed(&mut session, "alice", 1);
        let (b, _) = admit(&mut session, "bob", 2);
        let host = session.add_local_player("host", &uuid(60));
        session.take_outbox();

        session.update(now());
        let out = session.take_outbox();
        let to_a = sent_to(&out, a);
        let groups: Vec<u8> = to_a.iter().filter_map(chunk_of).map(|(g, _)| g).collect();
        assert_eq!(groups, vec![PLAYER_GROUP, group]);
        assert!(matches!(to_a.last(), Some(NetMsg::StateSnapshot { .. })));
        assert!(sent_to(&out, b).is_empty());

        // Bob is still loading and stays out of the player group.
        let mut listed: Vec<u32> = to_a
            .iter()
            .filter_map(chunk_of)
            .filter(|(g, _)| *g == PLAYER_GROUP)
            .flat_map(|(_, c)| decode_chunk::<EntityRecord>(&c).unwrap())
            .map(|r| r.id)
            .collect();
        listed.sort_unstable();
        let mut expected = vec![alice.0, host.0];
        expected.sort_unstable();
        assert_eq!(listed, expected);
    }

    #[test]
    fn entity_snapshots_follow_cadence() {
        let (mut session, _) = with_units(test_config(), &[(1, 8)]);
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        session.update(now());
        assert!(!sent_to(&session.take_outbox(), a).is_empty());
        session.update(now() + Duration::milliseconds(100));
        assert!(sent_to(&session.take_outbox(), a).is_empty());
        session.update(now() + Duration::milliseconds(200));
        assert!(!sent_to(&session.take_outbox(), a).is_empty());
    }

    #[test]
    fn group_snapshot_round_trips_under_ceiling() {
        let units: Vec<(u32, usize)> = (1..=60).map(|id| (id, 20)).collect();
        let (mut session, group) = with_units(test_config(), &units);
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        session.update(now());
        let chunks: Vec<SnapshotChunk> = sent_to(&session.take_outbox(), a)
            .iter()
            .filter_map(chunk_of)
            .filter(|(g, _)| *g == group)
            .map(|(_, c)| c)
            .collect();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.original_size as usize <= 430));
        let ids: Vec<u32> = chunks
            .iter()
            .flat_map(|c| decode_chunk::<EntityRecord>(c).unwrap())
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, (1..=60).collect::<Vec<_>>());
    }

    #[test]
    fn oversized_entities_are_skipped() {
        let (mut session, group) = with_units(test_config(), &[(1, 8), (2, 1000), (3, 8)]);
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        session.update(now());
        let ids: Vec<u32> = sent_to(&session.take_outbox(), a)
            .iter()
            .filter_map(chunk_of)
            .filter(|(g, _)| *g == group)
            .flat_map(|(_, c)| decode_chunk::<EntityRecord>(&c).unwrap())
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn state_snapshot_carries_observer_team_cores() {
        let mut session = session_with(test_config());
        for (x, team, amount) in [(1, TeamId::SHARDED, 50), (2, TeamId::CRUX, 99)] {
            session.world_mut().add_core(Core {
                x,
                y: 3,
                team,
                items: BTreeMap::from([(7, amount)]),
            });
        }
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        session.update(now());
        let state = sent_to(&session.take_outbox(), a)
            .into_iter()
            .find_map(|m| match m {
                NetMsg::StateSnapshot {
                    core_data_size,
                    core_data,
                    ..
                } => Some((core_data_size, core_data)),
                _ => None,
            })
            .unwrap();
        let raw = decompress(&state.1).unwrap();
        assert_eq!(raw.len(), state.0 as usize);
        let cores = read_core_list(&raw).unwrap();
        assert_eq!(cores.len(), 1);
        assert_eq!(cores[0].pos, pack_pos(1, 3));
        assert_eq!(cores[0].items, vec![(7, 50)]);
    }

    #[test]
    fn block_sync_sends_only_syncing_buildings() {
        let mut session = session_with(test_config());
        for (x, sync) in [(1, true), (2, false), (3, true)] {
            session.world_mut().add_building(
                x,
                0,
                Building {
                    team: TeamId::SHARDED,
                    sync,
                    state: Bytes::from_static(b"on"),
                },
            );
        }
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        let (b, _) = admit(&mut session, "bob", 2);
        session.take_outbox();

        session.update(now());
        let out = session.take_outbox();
        let blocks: Vec<u32> = sent_to(&out, a)
            .into_iter()
            .filter_map(|m| match m {
                NetMsg::BlockSnapshot {
                    amount,
                    original_size,
                    data,
                } => Some(SnapshotChunk {
                    count: amount,
                    original_size,
                    data,
                }),
                _ => None,
            })
            .flat_map(|c| decode_chunk::<BlockRecord>(&c).unwrap())
            .map(|r| r.pos)
            .collect();
        assert_eq!(blocks, vec![pack_pos(1, 0), pack_pos(3, 0)]);
        assert!(sent_to(&out, b)
            .iter()
            .any(|m| matches!(m, NetMsg::BlockSnapshot { .. })));

        session.update(now() + Duration::milliseconds(300));
        assert!(!session
            .take_outbox()
            .iter()
            .any(|o| matches!(o, crate::session::Outgoing::Send { msg: NetMsg::BlockSnapshot { .. }, .. })));
    }

    #[test]
    fn queued_blocks_flush_even_without_block_sync() {
        let mut config = test_config();
        config.block_sync = false;
        let mut session = session_with(config);
        session.world_mut().add_building(
            4,
            4,
            Building {
                team: TeamId::SHARDED,
                sync: true,
                state: Bytes::from_static(b"x"),
            },
        );
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        session.update(now());
        assert!(!sent_to(&session.take_outbox(), a)
            .iter()
            .any(|m| matches!(m, NetMsg::BlockSnapshot { .. })));

        session.queue_block(4, 4);
        session.queue_block(4, 4);
        session.update(now() + Duration::milliseconds(1));
        let blocks: Vec<NetMsg> = sent_to(&session.take_outbox(), a)
            .into_iter()
            .filter(|m| matches!(m, NetMsg::BlockSnapshot { .. }))
            .collect();
        assert!(matches!(blocks.as_slice(), [NetMsg::BlockSnapshot { amount: 1, .. }]));
    }

    #[test]
    fn queued_blocks_keep_first_queue_order() {
        let mut config = test_config();
        config.block_sync = false;
        let mut session = session_with(config);
        for x in [5, 1] {
            session.world_mut().add_building(
                x,
                x,
                Building {
                    team: TeamId::SHARDED,
                    sync: true,
                    state: Bytes::from_static(b"s"),
                },
            );
        }
        let (a, _) = admit_confirmed(&mut session, "alice", 1);
        session.take_outbox();

        for x in [5, 1, 5, 1, 5] {
            session.queue_block(x, x);
        }
        assert_eq!(session.block_queue.len(), 2);
        session.update(now());
        let positions: Vec<u32> = sent_to(&session.take_outbox(), a)
            .into_iter()
            .filter_map(|m| match m {
                NetMsg::BlockSnapshot {
                    amount,
                    original_size,
                    data,
                } => Some(SnapshotChunk {
                    count: amount,
                    original_size,
                    data,
                }),
                _ => None,
            })
            .flat_map(|c| decode_chunk::<BlockRecord>(&c).unwrap())
            .map(|r| r.pos)
            .collect();
        assert_eq!(positions, vec![pack_pos(5, 5), pack_pos(1, 1)]);
        assert!(session.block_queue.is_empty());
    }

    #[test]
    fn players_without_connection_disappear() {
        let mut session = session_with(test_config());
        let (a, alice) = admit_confirmed(&mut session, "alice", 1);
        session.roster.remove_connection(a);

        session.update(now());
        assert!(session.roster().player(alice).is_none());
        let leaves = session.events.drain::<PlayerLeave>();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].reason, "disappeared");
    }
}
