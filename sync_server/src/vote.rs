//! Player vote-kicks.
//!
//! At most one vote runs at a time. The caster's own vote opens it, every
//! other player may vote once (per identity and per address), and the vote
//! is evaluated after each ballot and once more when its deadline fires.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use sync_shared::net::{KickReason, PlayerId};
use tracing::{debug, info};

use crate::{
    events::VoteConcluded,
    session::{Session, TimerCommand},
};

/// How long a vote stays open.
pub const VOTE_DURATION_SECS: i64 = 30;

/// Minimum time between two votes started by the same caster.
pub const VOTE_COOLDOWN_SECS: i64 = 60;

/// Ban length per prior kick of the target.
pub const KICK_DURATION_MINUTES: i64 = 15;

pub const MIN_VOTEKICK_PLAYERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Passed { backfired: bool },
}

/// One running vote.
#[derive(Debug, Clone)]
pub struct VoteSession {
    pub id: u64,
    pub target: Identity,
    pub caster: Identity,
    /// Signed, weighted tally.
    pub votes: i32,
    voted: HashSet<String>,
    pub deadline: DateTime<Utc>,
}

impl VoteSession {
    pub fn new(id: u64, target: Identity, caster: Identity, deadline: DateTime<Utc>) -> Self {
        Self {
            id,
            target,
            caster,
            votes: 0,
            voted: HashSet::new(),
            deadline,
        }
    }

    /// Whether this identity, or anyone from its last known address, voted.
    pub fn has_voted(&self, uuid: &str, ip: Option<&str>) -> bool {
        self.voted.contains(uuid) || ip.is_some_and(|ip| self.voted.contains(ip))
    }

    pub fn vote(&mut self, uuid: &str, ip: Option<&str>, delta: i32) {
        self.votes += delta;
        self.voted.insert(uuid.to_string());
        if let Some(ip) = ip {
            self.voted.insert(ip.to_string());
        }
    }

    /// A tally at or below `-required` turns the vote on the caster with a
    /// full tally. There is no matching rule for positive overshoot.
    pub fn evaluate(&mut self, required: i32) -> Verdict {
        if self.votes <= -required {
            self.target = self.caster.clone();
            self.votes = required;
        }
        if self.votes >= required {
            Verdict::Passed {
                backfired: self.target == self.caster,
            }
        } else {
            Verdict::Pending
        }
    }
}

/// The vote slot of one session.
#[derive(Debug, Default)]
pub struct VoteKick {
    pub(crate) current: Option<VoteSession>,
    cooldowns: HashMap<String, DateTime<Utc>>,
    next_id: u64,
}

impl Session {
    pub fn votes_required(&self) -> i32 {
        2 + i32::from(self.roster.player_count() > 4)
    }

    pub fn current_vote(&self) -> Option<&VoteSession> {
        self.votes.current.as_ref()
    }

    fn vote_weight(&self, uuid: &str) -> i32 {
        self.admins.info(uuid).map_or(1, |i| i.vote_weight)
    }

    /// `/votekick [player...]`
    pub fn command_votekick(&mut self, caster: PlayerId, arg: Option<&str>, now: DateTime<Utc>) {
        let Some(c) = self.roster.player(caster) else {
            return;
        };
        if !self.config.enable_votekick {
            self.tell(caster, "[scarlet]Vote-kick is disabled on this server.");
            return;
        }
        if self.roster.player_count() < MIN_VOTEKICK_PLAYERS {
            self.tell(
                caster,
                format!("[scarlet]At least {MIN_VOTEKICK_PLAYERS} players are needed to start a votekick."),
            );
            return;
        }
        if c.local {
            self.tell(caster, "[scarlet]Just kick them yourself if you're the host.");
            return;
        }

        let Some(arg) = arg else {
            let mut text = String::from("[orange]Players to kick: \n");
            for p in self.roster.players() {
                if p.admin || p.connection.is_none() || p.id == caster {
                    continue;
                }
                text.push_str(&format!("[lightgray] {}[accent] ({})\n", p.name, p.id));
            }
            self.tell(caster, text);
            return;
        };

        if self.votes.current.is_some() {
            self.tell(caster, "[scarlet]A vote is already in progress.");
            return;
        }

        let by_id = arg
            .strip_prefix('#')
            .filter(|_| arg.len() > 1)
            .and_then(|n| n.parse::<u32>().ok());
        let mut found = match by_id {
            Some(id) => self.roster.players().find(|p| p.id.0 == id),
            None => self.roster.players().find(|p| p.name.eq_ignore_ascii_case(arg)),
        };
        if found.is_none() && arg.len() > 1 {
            found = self.roster.players().find(|p| self.status_name(p) == arg);
        }

        let Some(target) = found else {
            self.tell(caster, format!("[scarlet]No player[orange]'{arg}'[scarlet] found."));
            return;
        };
        let refusal = if target.admin {
            Some("[scarlet]Did you really expect to be able to kick an admin?")
        } else if target.local {
            Some("[scarlet]Local players cannot be kicked.")
        } else if target.team != c.team {
            Some("[scarlet]Only players on your team can be kicked.")
        } else {
            None
        };
        if let Some(refusal) = refusal {
            self.tell(caster, refusal);
            return;
        }

        let target = Identity {
            uuid: target.uuid.clone(),
            name: target.name.clone(),
        };
        let caster_id = Identity {
            uuid: c.uuid.clone(),
            name: c.name.clone(),
        };
        if self
            .votes
            .cooldowns
            .get(&caster_id.uuid)
            .is_some_and(|at| now - *at < Duration::seconds(VOTE_COOLDOWN_SECS))
        {
            self.tell(
                caster,
                format!(
                    "[scarlet]You must wait {} minute(s) between votekicks.",
                    VOTE_COOLDOWN_SECS / 60
                ),
            );
            return;
        }

        self.votes.next_id += 1;
        let id = self.votes.next_id;
        let mut session = VoteSession::new(
            id,
            target,
            caster_id.clone(),
            now + Duration::seconds(VOTE_DURATION_SECS),
        );
        let ip = self.admins.info(&caster_id.uuid).and_then(|i| i.last_ip.clone());
        session.vote(&caster_id.uuid, ip.as_deref(), self.vote_weight(&caster_id.uuid));
        info!(caster = %caster_id.name, target = %session.target.name, "Vote-kick started");
        self.announce_tally(&caster_id.name, &session);

        self.votes.cooldowns.insert(caster_id.uuid, now);
        self.votes.current = Some(session);
        self.schedule(TimerCommand::ArmVoteDeadline {
            session: id,
            after: std::time::Duration::from_secs(VOTE_DURATION_SECS as u64),
        });
        self.conclude_if_passed(now);
    }

    /// `/vote <y|n>`
    pub fn command_vote(&mut self, voter: PlayerId, arg: Option<&str>, now: DateTime<Utc>) {
        let Some(v) = self.roster.player(voter) else {
            return;
        };
        let Some(session) = &self.votes.current else {
            self.tell(voter, "[scarlet]Nobody is being voted on.");
            return;
        };
        if v.local {
            self.tell(voter, "Local players can't vote. Kick the player yourself instead.");
            return;
        }
        let uuid = v.uuid.clone();
        let name = v.name.clone();
        let ip = self.admins.info(&uuid).and_then(|i| i.last_ip.clone());
        if session.has_voted(&uuid, ip.as_deref()) {
            self.tell(voter, "[scarlet]You've already voted. Sit down.");
            return;
        }
        if session.target.uuid == uuid {
            self.tell(voter, "[scarlet]You can't vote on your own trial.");
            return;
        }
        let sign = match arg.map(str::to_ascii_lowercase).as_deref() {
            Some("y") => 1,
            Some("n") => -1,
            _ => {
                self.tell(voter, "[scarlet]Vote either 'y' (yes) or 'n' (no).");
                return;
            }
        };

        let weight = self.vote_weight(&uuid);
        if let Some(session) = self.votes.current.as_mut() {
            session.vote(&uuid, ip.as_deref(), sign * weight);
        }
        if let Some(session) = self.votes.current.clone() {
            self.announce_tally(&name, &session);
        }
        self.conclude_if_passed(now);
    }

    fn announce_tally(&mut self, voter: &str, session: &VoteSession) {
        let required = self.votes_required();
        self.announce(format!(
            "[orange]{voter}[lightgray] has voted on kicking[orange] {}[].[accent] ({}/{required})\n[lightgray]Type[orange] /vote <y/n>[] to agree.",
            session.target.name, session.votes
        ));
    }

    /// The vote deadline fired. Deadlines of finished votes are ignored.
    pub fn vote_deadline(&mut self, id: u64, now: DateTime<Utc>) {
        if self.votes.current.as_ref().map(|s| s.id) != Some(id) {
            debug!(session = id, "Ignoring stale vote deadline");
            return;
        }
        if self.conclude_if_passed(now) {
            return;
        }
        if let Some(session) = self.end_vote() {
            self.announce(format!(
                "[lightgray]Vote failed. Not enough votes to kick[orange] {}[lightgray].",
                session.target.name
            ));
            info!(target = %session.target.name, votes = session.votes, "Vote-kick failed");
            self.events.publish(VoteConcluded {
                target_uuid: session.target.uuid,
                target_name: session.target.name,
                passed: false,
                backfired: false,
            });
        }
    }

    fn end_vote(&mut self) -> Option<VoteSession> {
        let session = self.votes.current.take()?;
        self.schedule(TimerCommand::CancelVoteDeadline { session: session.id });
        Some(session)
    }

    /// Applies the verdict; on a pass bans and kicks the target.
    fn conclude_if_passed(&mut self, now: DateTime<Utc>) -> bool {
        let required = self.votes_required();
        let Some(session) = self.votes.current.as_mut() else {
            return false;
        };
        let Verdict::Passed { backfired } = session.evaluate(required) else {
            return false;
        };
        let Some(session) = self.end_vote() else {
            return false;
        };

        let target = session.target;
        let info = self.admins.info_mut(&target.uuid);
        let minutes = KICK_DURATION_MINUTES * (i64::from(info.times_kicked) + 1);
        info.last_kicked = Some(now + Duration::minutes(minutes));
        info.times_kicked += 1;
        self.persist();

        let outcome = if backfired { "backfired" } else { "passed" };
        self.announce(format!(
            "[orange]Vote {outcome}.[scarlet] {}[orange] will be banned from the server for {minutes} minutes.",
            target.name
        ));
        info!(target = %target.name, uuid = %target.uuid, backfired, minutes, "Vote-kick passed");

        for player in self.roster.find_by_uuid(&target.uuid) {
            self.kick_player(player, KickReason::Vote);
        }
        self.events.publish(VoteConcluded {
            target_uuid: target.uuid,
            target_name: target.name,
            passed: true,
            backfired,
        });
        true
    }
}
