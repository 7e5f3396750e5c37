//! Fixtures shared by the unit tests of every session module.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, TimeZone, Utc};
use sync_shared::{
    config::ServerConfig,
    identity::encode_identity,
    net::{ConnectionId, Handshake, KickReason, NetMsg, PlayerId},
};

use crate::{
    admin::Administration,
    session::{Outgoing, Session},
    world::World,
};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn test_config() -> ServerConfig {
    ServerConfig::default()
}

pub fn session_with(config: ServerConfig) -> Session {
    Session::new(config, Administration::in_memory(), World::new(32, 32))
}

pub fn uuid(seed: u8) -> String {
    encode_identity([seed; 8])
}

pub fn usid(seed: u8) -> String {
    format!("usid-{seed}")
}

pub fn addr(seed: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed))
}

pub fn handshake(name: &str, seed: u8) -> Handshake {
    Handshake {
        uuid: Some(uuid(seed)),
        usid: Some(usid(seed)),
        name: name.to_string(),
        content: Vec::new(),
        version: 104,
        version_type: Some("official".into()),
        mobile: false,
        color: 0xff8800ff,
    }
}

/// Opens a connection from the seed's address.
pub fn open(session: &mut Session, seed: u8) -> ConnectionId {
    let conn = ConnectionId::new_unique();
    session.on_connect(conn, addr(seed));
    conn
}

/// Opens a connection and sends a handshake, returning the connection.
pub fn try_admit(session: &mut Session, packet: Handshake, seed: u8) -> ConnectionId {
    let conn = open(session, seed);
    session.handle_handshake(conn, packet, now());
    conn
}

pub fn admit(session: &mut Session, name: &str, seed: u8) -> (ConnectionId, PlayerId) {
    let conn = try_admit(session, handshake(name, seed), seed);
    let player = session.roster().player_for(conn).expect("handshake admitted");
    (conn, player)
}

pub fn admit_confirmed(session: &mut Session, name: &str, seed: u8) -> (ConnectionId, PlayerId) {
    let (conn, player) = admit(session, name, seed);
    session.connect_confirm(conn);
    (conn, player)
}

pub fn sent_to(out: &[Outgoing], conn: ConnectionId) -> Vec<NetMsg> {
    out.iter()
        .filter_map(|o| match o {
            Outgoing::Send { to, msg } if *to == conn => Some(msg.clone()),
            _ => None,
        })
        .collect()
}

pub fn kick_of(out: &[Outgoing], conn: ConnectionId) -> Option<(KickReason, Option<String>)> {
    sent_to(out, conn).into_iter().find_map(|m| match m {
        NetMsg::Kick { reason, detail } => Some((reason, detail)),
        _ => None,
    })
}

/// Text of every system chat line sent to `conn`.
pub fn chat_to(out: &[Outgoing], conn: ConnectionId) -> Vec<String> {
    sent_to(out, conn)
        .into_iter()
        .filter_map(|m| match m {
            NetMsg::ChatMessage { message, sender: None } => Some(message),
            _ => None,
        })
        .collect()
}
