//! Direct admin actions requested by a connected admin.

use chrono::{DateTime, Duration, Utc};
use sync_shared::net::{AdminAction, KickReason, NetMsg, PlayerId, TraceInfo};
use tracing::{info, warn};

use crate::{events::PlayerBanned, session::Session};

/// Ban length after a direct admin kick.
pub const ADMIN_KICK_MINUTES: i64 = 30;

impl Session {
    pub fn admin_request(&mut self, issuer: PlayerId, target: PlayerId, action: AdminAction, now: DateTime<Utc>) {
        let Some(admin) = self.roster.player(issuer) else {
            return;
        };
        if !admin.admin {
            warn!(player = %admin.name, ?action, "Non-admin attempted an admin action");
            return;
        }
        let Some(other) = self.roster.player(target) else {
            warn!(player = %admin.name, %target, ?action, "Admin action on a missing player");
            return;
        };
        if other.admin && !admin.local && other.id != admin.id {
            warn!(player = %admin.name, target = %other.name, ?action, "Admin action on another admin refused");
            return;
        }

        let admin_name = admin.name.clone();
        let (name, uuid) = (other.name.clone(), other.uuid.clone());
        let connection = other.connection.and_then(|c| self.roster.connection(c));
        let address = connection.map(|c| c.address.to_string());
        let (modified_client, mobile) = connection.map_or((false, other.mobile), |c| (c.modified_client, c.mobile));
        info!(admin = %admin_name, target = %name, ?action, "Admin action");

        match action {
            AdminAction::Wave => self.world.skip_wave(),
            AdminAction::Ban => {
                if let Some(ip) = &address {
                    self.admins.ban_ip(ip);
                }
                self.persist();
                self.kick_player(target, KickReason::Banned);
                self.events.publish(PlayerBanned { uuid, address });
            }
            AdminAction::Kick => {
                self.kick_player(target, KickReason::Kick);
                let info = self.admins.info_mut(&uuid);
                info.last_kicked = Some(now + Duration::minutes(ADMIN_KICK_MINUTES));
                info.times_kicked += 1;
                self.persist();
            }
            AdminAction::Trace => {
                let info = TraceInfo {
                    address: address.unwrap_or_default(),
                    uuid,
                    modified_client,
                    mobile,
                };
                self.send_to_player(issuer, NetMsg::TraceInfo { player: target, info });
            }
        }
    }
}
