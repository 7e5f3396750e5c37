//! Persistent player records, bans and admin grants.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_vote_weight() -> i32 {
    1
}

/// Everything remembered about one identity across sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: String,
    pub last_name: String,
    pub last_ip: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    /// Session id the admin grant is bound to.
    pub admin_usid: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub banned: bool,
    /// A time in the future blocks reconnection until then.
    pub last_kicked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub whitelisted: bool,
    #[serde(default = "default_vote_weight")]
    pub vote_weight: i32,
    #[serde(default)]
    pub times_kicked: u32,
    #[serde(default)]
    pub times_joined: u32,
    pub last_sync: Option<DateTime<Utc>>,
}

impl PlayerInfo {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            vote_weight: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AdminData {
    #[serde(default)]
    players: BTreeMap<String, PlayerInfo>,
    #[serde(default)]
    banned_ips: BTreeSet<String>,
    /// Address prefixes, e.g. `10.0.`.
    #[serde(default)]
    subnet_bans: Vec<String>,
}

/// Player records plus ban lists, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct Administration {
    data: AdminData,
    path: Option<PathBuf>,
}

impl Administration {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path`, starting empty if it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?
        } else {
            AdminData::default()
        };
        debug!(path = %path.display(), players = data.players.len(), "Loaded player records");
        Ok(Self {
            data,
            path: Some(path),
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.data).context("serialize player records")?;
        std::fs::write(path, text).with_context(|| format!("write {}", path.display()))
    }

    pub fn info(&self, uuid: &str) -> Option<&PlayerInfo> {
        self.data.players.get(uuid)
    }

    /// Returns the record for `uuid`, creating it if needed.
    pub fn info_mut(&mut self, uuid: &str) -> &mut PlayerInfo {
        self.data
            .players
            .entry(uuid.to_string())
            .or_insert_with(|| PlayerInfo::new(uuid))
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerInfo> {
        self.data.players.values()
    }

    pub fn is_ip_banned(&self, ip: &str) -> bool {
        self.data.banned_ips.contains(ip)
    }

    pub fn is_subnet_banned(&self, ip: &str) -> bool {
        self.data.subnet_bans.iter().any(|prefix| ip.starts_with(prefix.as_str()))
    }

    pub fn is_id_banned(&self, uuid: &str) -> bool {
        self.info(uuid).is_some_and(|info| info.banned)
    }

    /// Bans an address and every identity last seen on it.
    pub fn ban_ip(&mut self, ip: &str) {
        self.data.banned_ips.insert(ip.to_string());
        for info in self.data.players.values_mut() {
            if info.last_ip.as_deref() == Some(ip) {
                info.banned = true;
            }
        }
    }

    pub fn unban_ip(&mut self, ip: &str) -> bool {
        self.data.banned_ips.remove(ip)
    }

    pub fn add_subnet_ban(&mut self, prefix: &str) {
        if !self.data.subnet_bans.iter().any(|p| p == prefix) {
            self.data.subnet_bans.push(prefix.to_string());
        }
    }

    pub fn ban_id(&mut self, uuid: &str) {
        self.info_mut(uuid).banned = true;
    }

    /// Lifts an identity ban along with bans on every address it used.
    pub fn unban_id(&mut self, uuid: &str) -> bool {
        let Some(info) = self.data.players.get_mut(uuid) else {
            return false;
        };
        let was_banned = info.banned;
        info.banned = false;
        let ips = info.ips.clone();
        for ip in ips {
            self.data.banned_ips.remove(&ip);
        }
        was_banned
    }

    /// Admin status requires the grant to match the presented session id.
    pub fn is_admin(&self, uuid: &str, usid: &str) -> bool {
        self.info(uuid)
            .is_some_and(|info| info.admin && info.admin_usid.as_deref() == Some(usid))
    }

    pub fn grant_admin(&mut self, uuid: &str, usid: Option<&str>) {
        let info = self.info_mut(uuid);
        info.admin = true;
        if let Some(usid) = usid {
            info.admin_usid = Some(usid.to_string());
        }
    }

    pub fn revoke_admin(&mut self, uuid: &str) {
        if let Some(info) = self.data.players.get_mut(uuid) {
            info.admin = false;
        }
    }

    pub fn is_whitelisted(&self, uuid: &str) -> bool {
        self.info(uuid).is_some_and(|info| info.whitelisted)
    }

    pub fn whitelist(&mut self, uuid: &str) {
        self.info_mut(uuid).whitelisted = true;
    }

    /// Records a rejected whitelist attempt so an operator can approve it.
    pub fn record_attempt(&mut self, uuid: &str, usid: &str, name: &str) {
        let info = self.info_mut(uuid);
        info.admin_usid.get_or_insert_with(|| usid.to_string());
        info.last_name = name.to_string();
        if !info.names.iter().any(|n| n == name) {
            info.names.push(name.to_string());
        }
    }

    /// Records a successful join.
    pub fn record_join(&mut self, uuid: &str, ip: &str, name: &str) {
        let info = self.info_mut(uuid);
        info.last_name = name.to_string();
        info.last_ip = Some(ip.to_string());
        if !info.names.iter().any(|n| n == name) {
            info.names.push(name.to_string());
        }
        if !info.ips.iter().any(|i| i == ip) {
            info.ips.push(ip.to_string());
        }
        info.times_joined += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_ban_marks_identities_seen_on_it() {
        let mut admins = Administration::in_memory();
        admins.record_join("a", "10.0.0.1", "alice");
        admins.record_join("b", "10.0.0.2", "bob");
        admins.ban_ip("10.0.0.1");

        assert!(admins.is_ip_banned("10.0.0.1"));
        assert!(admins.is_id_banned("a"));
        assert!(!admins.is_id_banned("b"));

        assert!(admins.unban_id("a"));
        assert!(!admins.is_ip_banned("10.0.0.1"));
    }

    #[test]
    fn subnet_bans_match_prefixes() {
        let mut admins = Administration::in_memory();
        admins.add_subnet_ban("192.168.");
        assert!(admins.is_subnet_banned("192.168.4.4"));
        assert!(!admins.is_subnet_banned("10.192.168.1"));
    }

    #[test]
    fn admin_requires_matching_usid() {
        let mut admins = Administration::in_memory();
        admins.grant_admin("a", Some("usid-1"));
        assert!(admins.is_admin("a", "usid-1"));
        assert!(!admins.is_admin("a", "usid-2"));
        admins.revoke_admin("a");
        assert!(!admins.is_admin("a", "usid-1"));
    }

    #[test]
    fn joins_accumulate_history() {
        let mut admins = Administration::in_memory();
        admins.record_join("a", "1.1.1.1", "alice");
        admins.record_join("a", "1.1.1.1", "alicia");
        let info = admins.info("a").unwrap();
        assert_eq!(info.times_joined, 2);
        assert_eq!(info.names, vec!["alice", "alicia"]);
        assert_eq!(info.ips.len(), 1);
        assert_eq!(info.vote_weight, 1);
    }

    #[test]
    fn records_survive_save_and_load() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("sync-admin-{}", std::process::id()));
        let path = dir.join("players.json");
        let _ = std::fs::remove_file(&path);

        let mut admins = Administration::load(&path)?;
        admins.record_join("a", "1.1.1.1", "alice");
        admins.ban_ip("2.2.2.2");
        admins.save()?;

        let loaded = Administration::load(&path)?;
        assert_eq!(loaded.info("a").map(|i| i.times_joined), Some(1));
        assert!(loaded.is_ip_banned("2.2.2.2"));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
