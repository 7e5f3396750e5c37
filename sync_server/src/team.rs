//! Teams and team-assignment policies.

use serde::{Deserialize, Serialize};
use sync_shared::net::PlayerId;

/// Team identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamId(pub u8);

impl TeamId {
    pub const DERELICT: TeamId = TeamId(0);
    pub const SHARDED: TeamId = TeamId(1);
    pub const CRUX: TeamId = TeamId(2);
    pub const GREEN: TeamId = TeamId(3);
    pub const PURPLE: TeamId = TeamId(4);
    pub const BLUE: TeamId = TeamId(5);

    /// Hex colour used in chat formatting.
    pub fn color(&self) -> &'static str {
        match self.0 {
            0 => "4d4e58",
            1 => "ffd37f",
            2 => "f25555",
            3 => "4dd98b",
            4 => "9a4bdf",
            5 => "6c87fd",
            _ => "ffffff",
        }
    }
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "team{}", self.0)
    }
}

/// Game rules relevant to team assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    pub pvp: bool,
    pub waves: bool,
    pub wave_team: TeamId,
    pub default_team: TeamId,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            pvp: false,
            waves: true,
            wave_team: TeamId::CRUX,
            default_team: TeamId::SHARDED,
        }
    }
}

/// Inputs to a team-assignment decision.
pub struct AssignContext<'a> {
    /// The player being assigned.
    pub player: PlayerId,
    /// Current `(player, team)` pairs, including the player being assigned.
    pub roster: &'a [(PlayerId, TeamId)],
    /// Teams that currently own at least one core.
    pub active_teams: &'a [TeamId],
    pub rules: &'a Rules,
}

/// Chooses a team for a newly admitted player.
pub trait TeamAssigner: Send + Sync {
    fn assign(&self, ctx: &AssignContext<'_>) -> TeamId;
}

/// In PvP, joins the active team with the fewest players (excluding the
/// wave team while waves run; ties go to the lower team id). Otherwise, and
/// when no team is eligible, uses the rules' default team.
#[derive(Debug, Default)]
pub struct BalancedTeams;

impl TeamAssigner for BalancedTeams {
    fn assign(&self, ctx: &AssignContext<'_>) -> TeamId {
        if !ctx.rules.pvp {
            return ctx.rules.default_team;
        }

        ctx.active_teams
            .iter()
            .copied()
            .filter(|team| !(ctx.rules.waves && *team == ctx.rules.wave_team))
            .min_by_key(|team| {
                let members = ctx
                    .roster
                    .iter()
                    .filter(|(id, t)| t == team && *id != ctx.player)
                    .count();
                (members, *team)
            })
            .unwrap_or(ctx.rules.default_team)
    }
}

/// What a status prefix is computed from.
pub struct StatusView {
    pub team: TeamId,
    pub connected: bool,
    pub dead: bool,
}

/// Builds the formatted status prefix shown before a player's name.
pub trait StatusAssigner: Send + Sync {
    fn status(&self, view: &StatusView) -> String;
}

/// `[#teamcolor] <state icon> []`, empty until the player has connected.
#[derive(Debug, Default)]
pub struct TeamColorStatus;

impl StatusAssigner for TeamColorStatus {
    fn status(&self, view: &StatusView) -> String {
        if !view.connected {
            return String::new();
        }
        let icon = if view.dead { '\u{2716}' } else { '\u{25B6}' };
        format!("[#{}] {} []", view.team.color(), icon)
    }
}
