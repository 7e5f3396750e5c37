//! Connection admission.
//!
//! A raw connection becomes a player only after its handshake passes every
//! check below, in order. The first failing check decides the kick reason;
//! a rejected connection is closed and never gets a [`Player`].

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use sync_shared::{
    identity::verify_identity,
    names::{sanitize_name, strip_formatting},
    net::{ConnectionId, Handshake, KickReason, NetMsg, PlayerId},
};
use tracing::{info, warn};

use crate::{
    events::PlayerConnect,
    player::{Connection, Player},
    session::Session,
};

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: KickReason,
    pub detail: Option<String>,
}

impl Rejection {
    fn new(reason: KickReason) -> Self {
        Self {
            reason,
            detail: None,
        }
    }

    fn with(reason: KickReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
        }
    }
}

/// Formats the missing/extra content lists shown to the client.
fn content_mismatch(missing: &[&String], extra: &[&String]) -> String {
    let mut out = String::from("[accent]Incompatible content![]\n\n");
    if !missing.is_empty() {
        out.push_str("Missing:[lightgray]\n");
        for name in missing {
            out.push_str(&format!("> {name}\n"));
        }
        out.push_str("[]\n");
    }
    if !extra.is_empty() {
        out.push_str("Unnecessary:[lightgray]\n");
        let lines: Vec<String> = extra.iter().map(|name| format!("> {name}")).collect();
        out.push_str(&lines.join("\n"));
    }
    out
}

impl Session {
    /// A transport connection was accepted.
    pub fn on_connect(&mut self, conn: ConnectionId, address: IpAddr) {
        self.roster.add_connection(Connection::new(conn, address));
        let ip = address.to_string();
        if self.admins.is_ip_banned(&ip) {
            self.kick(conn, KickReason::Banned, Some(format!("ip {ip}")));
        } else if self.admins.is_subnet_banned(&ip) {
            self.kick(conn, KickReason::Banned, Some(format!("subnet {ip}")));
        } else {
            self.send(conn, NetMsg::Welcome { connection: conn });
        }
    }

    /// Runs admission for a handshake; rejected connections are kicked.
    pub fn handle_handshake(&mut self, conn: ConnectionId, packet: Handshake, now: DateTime<Utc>) {
        if self.roster.connection(conn).is_none() {
            return;
        }
        if let Err(rejection) = self.admit(conn, packet, now) {
            self.kick(conn, rejection.reason, rejection.detail);
        }
    }

    fn admit(&mut self, conn: ConnectionId, packet: Handshake, now: DateTime<Utc>) -> Result<PlayerId, Rejection> {
        let address = match self.roster.connection(conn) {
            Some(c) => c.address,
            None => return Err(Rejection::new(KickReason::Kick)),
        };
        let ip = address.to_string();

        if self.admins.is_ip_banned(&ip) || self.admins.is_subnet_banned(&ip) {
            return Err(Rejection::with(KickReason::Banned, "ip"));
        }

        if let Some(uuid) = &packet.uuid {
            if !verify_identity(uuid) {
                return Err(Rejection::new(KickReason::IdentityCorrupted));
            }
        }

        if let Some(connection) = self.roster.connection_mut(conn) {
            if connection.has_begun_connecting {
                return Err(Rejection::new(KickReason::DuplicateHandshake));
            }
            connection.has_begun_connecting = true;
            connection.mobile = packet.mobile;
        }

        let (Some(uuid), Some(usid)) = (packet.uuid.clone(), packet.usid.clone()) else {
            return Err(Rejection::new(KickReason::MissingIdentity));
        };

        if self.admins.is_id_banned(&uuid) {
            return Err(Rejection::with(KickReason::Banned, "uuid"));
        }

        if let Some(until) = self.admins.info(&uuid).and_then(|i| i.last_kicked) {
            if now < until {
                let millis = (until - now).num_milliseconds();
                let seconds = (millis + 999) / 1000;
                return Err(Rejection::with(KickReason::RecentKick, format!("{seconds} second(s)")));
            }
        }

        let limit = self.config.player_limit;
        if limit > 0 && self.roster.player_count() >= limit && !self.admins.is_admin(&uuid, &usid) {
            return Err(Rejection::with(KickReason::PlayerLimit, limit.to_string()));
        }

        let required = &self.config.required_content;
        let missing: Vec<&String> = required.iter().filter(|c| !packet.content.contains(c)).collect();
        let extra: Vec<&String> = packet.content.iter().filter(|c| !required.contains(c)).collect();
        if !missing.is_empty() || !extra.is_empty() {
            let detail = content_mismatch(&missing, &extra);
            if self.config.strict {
                return Err(Rejection::with(KickReason::IncompatibleContent, detail));
            }
            warn!(%uuid, missing = missing.len(), extra = extra.len(), "Admitting client with mismatched content");
        }

        if self.config.whitelist && !self.admins.is_whitelisted(&uuid) {
            self.admins.record_attempt(&uuid, &usid, &packet.name);
            self.persist();
            self.send(
                conn,
                NetMsg::InfoMessage {
                    message: "You are not whitelisted here.".into(),
                },
            );
            info!(%uuid, name = %packet.name, "Run `whitelist-add {uuid}` to whitelist this player");
            return Err(Rejection::new(KickReason::Whitelist));
        }

        self.check_version(&packet)?;
        if packet.version == -1 {
            if let Some(connection) = self.roster.connection_mut(conn) {
                connection.modified_client = true;
            }
        }

        if self.config.strict {
            let wanted = packet.name.trim();
            for other in self.roster.players() {
                if other.name.trim().eq_ignore_ascii_case(wanted) {
                    return Err(Rejection::new(KickReason::NameInUse));
                }
                if other.uuid == uuid || other.usid == usid {
                    return Err(Rejection::with(KickReason::IdInUse, "uuid"));
                }
            }
        }

        let name = sanitize_name(&packet.name);
        if strip_formatting(&name).trim().is_empty() {
            return Err(Rejection::new(KickReason::NameEmpty));
        }

        self.admins.record_join(&uuid, &ip, &name);
        let info = self.admins.info_mut(&uuid);
        // Grants bind to the session id seen on the first join after them.
        if !info.admin || info.admin_usid.is_none() {
            info.admin_usid = Some(usid.clone());
        }
        let admin = self.admins.is_admin(&uuid, &usid);
        self.persist();

        let id = self.roster.next_player_id();
        let mut player = Player::new(id, uuid.clone(), usid, name.clone());
        player.admin = admin;
        player.mobile = packet.mobile;
        player.color = packet.color | 0xff;
        player.connection = Some(conn);

        if let Err(e) = player.write_sync_bounded() {
            warn!(%uuid, error = %e, "Player record does not fit sync buffer");
            return Err(Rejection::with(KickReason::Malformed, "name"));
        }

        player.team = self.assign_team(id);
        let team = player.team;
        self.roster.insert_player(player);
        if let Some(connection) = self.roster.connection_mut(conn) {
            connection.player = Some(id);
            connection.version = Some(packet.version);
            connection.content = packet.content;
        }

        self.send_world_data(id);
        info!(player = %name, %uuid, %address, %team, admin, "Admitted player");
        self.events.publish(PlayerConnect {
            player: id,
            uuid,
            name,
        });
        Ok(id)
    }

    fn check_version(&self, packet: &Handshake) -> Result<(), Rejection> {
        if self.config.is_unversioned() {
            return Ok(());
        }
        let server = &self.config.version;

        let Some(kind) = &packet.version_type else {
            return Err(Rejection::new(KickReason::TypeMismatch));
        };
        if (packet.version == -1 || *kind != server.kind) && !self.config.allow_custom_clients {
            return Err(Rejection::new(if *kind != server.kind {
                KickReason::TypeMismatch
            } else {
                KickReason::CustomClient
            }));
        }

        if packet.version != -1 && packet.version != server.build {
            return Err(Rejection::new(if packet.version > server.build {
                KickReason::ServerOutdated
            } else {
                KickReason::ClientOutdated
            }));
        }
        Ok(())
    }
}
