//! Full socket-based integration tests for client ↔ server communication.

use sync_server::server::bind_ephemeral;
use sync_shared::{
    config::ServerConfig,
    math::{Rect, Vec2},
    net::{decode_from_bytes, encode_to_bytes, ClientSnapshot, Intent, KickReason, NetMsg},
};
use sync_tests::{corrupted_identity, handshake, init_tracing, TestClient};

#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Handshake(handshake("alice", 1));
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);
    Ok(())
}

#[tokio::test]
async fn handshake_receives_world_then_snapshots() -> anyhow::Result<()> {
    init_tracing();
    let mut server = bind_ephemeral(ServerConfig::default()).await?;
    let mut client = TestClient::connect(&mut server).await?;

    client.send(NetMsg::Handshake(handshake("alice", 1))).await?;
    client
        .pump(&mut server, 50, |m| matches!(m, NetMsg::WorldData { .. }))
        .await?;
    assert_eq!(server.session().roster().player_count(), 1);

    client.open_udp(server.local_addr()).await?;
    client.send(NetMsg::ConnectConfirm).await?;
    let snapshot = client
        .pump(&mut server, 200, |m| matches!(m, NetMsg::EntitySnapshot { .. }))
        .await?;
    match snapshot {
        NetMsg::EntitySnapshot { group, amount, .. } => {
            assert_eq!(group, 0);
            assert_eq!(amount, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn corrupted_identity_is_kicked() -> anyhow::Result<()> {
    init_tracing();
    let mut server = bind_ephemeral(ServerConfig::default()).await?;
    let mut client = TestClient::connect(&mut server).await?;

    let mut packet = handshake("mallory", 2);
    packet.uuid = Some(corrupted_identity(2));
    client.send(NetMsg::Handshake(packet)).await?;
    let kick = client
        .pump(&mut server, 50, |m| matches!(m, NetMsg::Kick { .. }))
        .await?;
    assert!(matches!(kick, NetMsg::Kick { reason: KickReason::IdentityCorrupted, .. }));
    assert_eq!(server.session().roster().player_count(), 0);
    Ok(())
}

#[tokio::test]
async fn udp_snapshot_moves_player() -> anyhow::Result<()> {
    init_tracing();
    let mut server = bind_ephemeral(ServerConfig::default()).await?;
    let mut client = TestClient::connect(&mut server).await?;
    client.send(NetMsg::Handshake(handshake("alice", 1))).await?;
    client
        .pump(&mut server, 50, |m| matches!(m, NetMsg::WorldData { .. }))
        .await?;
    client.open_udp(server.local_addr()).await?;
    client.send(NetMsg::ConnectConfirm).await?;
    client.pump(&mut server, 5, |_| false).await.ok();

    client
        .send_snapshot(ClientSnapshot {
            connection: client.id,
            sequence: 1,
            position: Vec2::new(3.0, 4.0),
            pointer: Vec2::ZERO,
            rotation: 0.0,
            base_rotation: 0.0,
            velocity: Vec2::ZERO,
            mining: None,
            intent: Intent::default(),
            requests: Vec::new(),
            viewport: Rect::centered(0.0, 0.0, 64.0, 64.0),
        })
        .await?;
    client.pump(&mut server, 10, |_| false).await.ok();

    let roster = server.session().roster();
    let player = roster.player_for(client.id).and_then(|id| roster.player(id));
    assert_eq!(player.map(|p| p.interpolator.target), Some(Vec2::new(3.0, 4.0)));
    assert_eq!(roster.connection(client.id).and_then(|c| c.last_sequence), Some(1));
    Ok(())
}

#[tokio::test]
async fn chat_and_disconnects_reach_other_players() -> anyhow::Result<()> {
    init_tracing();
    let mut server = bind_ephemeral(ServerConfig::default()).await?;
    let mut alice = TestClient::connect(&mut server).await?;
    let mut bob = TestClient::connect(&mut server).await?;

    for (client, name, seed) in [(&mut alice, "alice", 1), (&mut bob, "bob", 2)] {
        client.send(NetMsg::Handshake(handshake(name, seed))).await?;
        client
            .pump(&mut server, 50, |m| matches!(m, NetMsg::WorldData { .. }))
            .await?;
        client.send(NetMsg::ConnectConfirm).await?;
    }

    alice
        .send(NetMsg::Chat {
            message: "hello bob".into(),
        })
        .await?;
    bob.pump(&mut server, 50, |m| {
        matches!(m, NetMsg::ChatMessage { message, sender: Some(s) } if message == "hello bob" && s == "alice")
    })
    .await?;

    let alice_player = server.session().roster().player_for(alice.id);
    drop(alice);
    let gone = bob
        .pump(&mut server, 50, |m| matches!(m, NetMsg::PlayerDisconnect { .. }))
        .await?;
    assert_eq!(gone, NetMsg::PlayerDisconnect { player: alice_player.unwrap() });
    assert_eq!(server.session().roster().player_count(), 1);
    Ok(())
}
