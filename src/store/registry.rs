use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PimError, Result};
use crate::naming;
use crate::pathnorm::ReservedPath;
use crate::store::atomic;
use crate::store::lock::pid_alive;
use crate::store::paths::MeshPaths;

pub const RECENT_FILES_CAP: usize = 20;

/// A path reservation held by an agent, stored canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEntry {
    #[serde(flatten)]
    pub target: ReservedPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

/// Rolling per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStats {
    pub tool_calls: u64,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_files: Vec<String>,
}

impl SessionStats {
    /// Record a touched file, newest first, bounded to [`RECENT_FILES_CAP`].
    pub fn push_recent_file(&mut self, path: &str) {
        self.recent_files.retain(|p| p != path);
        self.recent_files.insert(0, path.to_string());
        self.recent_files.truncate(RECENT_FILES_CAP);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_call: Option<String>,
}

impl ActivityInfo {
    pub fn now() -> Self {
        Self {
            last_activity_at: Utc::now(),
            current: None,
            last_tool_call: None,
        }
    }
}

/// A registered agent. Authoritative only while `pid` is alive; any reader
/// that finds a dead PID removes the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub pid: u32,
    pub session_id: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    #[serde(default)]
    pub human: bool,
    #[serde(default)]
    pub stats: SessionStats,
    pub activity: ActivityInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<ReservationEntry>,
}

impl Registration {
    pub fn new(name: &str, session_id: &str, cwd: &str) -> Self {
        Self {
            name: name.into(),
            pid: crate::store::lock::owner_pid(),
            session_id: session_id.into(),
            cwd: cwd.into(),
            model: None,
            started_at: Utc::now(),
            branch: None,
            spec_path: None,
            human: false,
            stats: SessionStats::default(),
            activity: ActivityInfo::now(),
            status_message: None,
            reservations: Vec::new(),
        }
    }
}

/// The shared registry directory: one JSON file per live agent.
pub struct Registry {
    paths: MeshPaths,
}

impl Registry {
    pub fn new(paths: MeshPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &MeshPaths {
        &self.paths
    }

    /// Write the registration, then read it back and verify our own PID to
    /// detect a lost create race. A foreign PID is left untouched.
    pub fn register(&self, reg: &Registration) -> Result<()> {
        naming::validate_name(&reg.name)?;
        self.paths.ensure_dirs()?;

        let path = self.paths.registration_path(&reg.name);
        if let Some(existing) = atomic::read_json_opt::<Registration>(&path)
            && existing.pid != reg.pid
            && pid_alive(existing.pid)
        {
            return Err(PimError::NameTaken(reg.name.clone()));
        }

        atomic::write_json_atomic(&path, reg)?;

        let Some(written) = atomic::read_json_opt::<Registration>(&path) else {
            return Err(PimError::RegistrationFailed(format!(
                "registration for '{}' unreadable after write",
                reg.name
            )));
        };
        if written.pid != reg.pid {
            return Err(PimError::RaceLost(reg.name.clone()));
        }
        Ok(())
    }

    pub fn read(&self, name: &str) -> Option<Registration> {
        atomic::read_json_opt(&self.paths.registration_path(name))
    }

    /// Read a peer, distinguishing missing / dead / unreadable.
    pub fn read_live(&self, name: &str) -> Result<Registration> {
        naming::validate_name(name)?;
        let path = self.paths.registration_path(name);
        if !path.exists() {
            return Err(PimError::NotFound(name.into()));
        }
        let content = fs::read_to_string(&path)?;
        let reg: Registration = serde_json::from_str(&content)
            .map_err(|e| PimError::InvalidRegistration(name.into(), e.to_string()))?;
        if !pid_alive(reg.pid) {
            self.remove_dead(&reg);
            return Err(PimError::NotActive(name.into()));
        }
        Ok(reg)
    }

    /// Mutate our own registration in place. Fails if the file now belongs
    /// to a different PID.
    pub fn update_own<F>(&self, name: &str, mutate: F) -> Result<Registration>
    where
        F: FnOnce(&mut Registration),
    {
        let path = self.paths.registration_path(name);
        let mut reg: Registration =
            atomic::read_json_opt(&path).ok_or(PimError::NotRegistered)?;
        if reg.pid != crate::store::lock::owner_pid() {
            return Err(PimError::RaceLost(name.into()));
        }
        mutate(&mut reg);
        reg.activity.last_activity_at = Utc::now();
        atomic::write_json_atomic(&path, &reg)?;
        Ok(reg)
    }

    /// Scan the registry, dropping (and deleting) entries whose PID died.
    /// Malformed files are skipped.
    pub fn active_agents(&self) -> Result<Vec<Registration>> {
        let dir = self.paths.registry_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut agents = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(reg) = atomic::read_json_opt::<Registration>(&path) else {
                continue;
            };
            if pid_alive(reg.pid) {
                agents.push(reg);
            } else {
                self.remove_dead(&reg);
            }
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    fn remove_dead(&self, reg: &Registration) {
        tracing::debug!(name = %reg.name, pid = reg.pid, "removing dead registration");
        let _ = fs::remove_file(self.paths.registration_path(&reg.name));
        let inbox = self.paths.inbox_dir(&reg.session_id);
        if inbox.exists() {
            let _ = fs::remove_dir_all(&inbox);
        }
    }

    /// Clean shutdown: delete our registration and inbox.
    pub fn shutdown(&self, name: &str, session_id: &str) -> Result<()> {
        let _ = fs::remove_file(self.paths.registration_path(name));
        let inbox = self.paths.inbox_dir(session_id);
        if inbox.exists() {
            fs::remove_dir_all(&inbox)?;
        }
        Ok(())
    }

    /// Rename our registration. The inbox is keyed by session id and is
    /// reused as-is, so no messages are orphaned.
    pub fn rename(&self, old: &str, new: &str) -> Result<Registration> {
        naming::validate_name(new)?;
        let path_old = self.paths.registration_path(old);
        let mut reg: Registration =
            atomic::read_json_opt(&path_old).ok_or(PimError::NotRegistered)?;
        if reg.pid != crate::store::lock::owner_pid() {
            return Err(PimError::RaceLost(old.into()));
        }
        let path_new = self.paths.registration_path(new);
        if let Some(existing) = atomic::read_json_opt::<Registration>(&path_new) {
            if pid_alive(existing.pid) {
                return Err(PimError::NameTaken(new.into()));
            }
            self.remove_dead(&existing);
        }

        reg.name = new.into();
        reg.activity.last_activity_at = Utc::now();
        atomic::write_json_atomic(&path_new, &reg)?;

        let written: Registration = atomic::read_json_opt(&path_new)
            .ok_or_else(|| PimError::RegistrationFailed(format!("rename to '{new}' lost")))?;
        if written.pid != crate::store::lock::owner_pid() {
            return Err(PimError::RaceLost(new.into()));
        }

        fs::remove_file(&path_old)?;
        Ok(reg)
    }
}

const CACHE_TTL: Duration = Duration::from_secs(1);

/// Bounds the cost of the hot listing path (called on every keystroke and
/// write enforcement). Invalidated on any local registration mutation.
#[derive(Default)]
pub struct AgentsCache {
    entries: Option<(CacheKey, Vec<Registration>, Instant)>,
}

#[derive(PartialEq, Eq, Clone)]
struct CacheKey {
    exclude: Option<String>,
    cwd: Option<String>,
}

impl AgentsCache {
    pub fn active(
        &mut self,
        registry: &Registry,
        exclude: Option<&str>,
        scope_cwd: Option<&str>,
    ) -> Result<Vec<Registration>> {
        let key = CacheKey {
            exclude: exclude.map(String::from),
            cwd: scope_cwd.map(String::from),
        };
        if let Some((cached_key, entries, at)) = &self.entries
            && *cached_key == key
            && at.elapsed() < CACHE_TTL
        {
            return Ok(entries.clone());
        }

        let mut agents = registry.active_agents()?;
        if let Some(exclude) = exclude {
            agents.retain(|a| a.name != exclude);
        }
        if let Some(cwd) = scope_cwd {
            agents.retain(|a| a.cwd == cwd);
        }
        self.entries = Some((key, agents.clone(), Instant::now()));
        Ok(agents)
    }

    pub fn invalidate(&mut self) {
        self.entries = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Registry) {
        let dir = tempdir().unwrap();
        let paths = MeshPaths::new(dir.path().join("mesh"));
        paths.ensure_dirs().unwrap();
        (dir, Registry::new(paths))
    }

    fn reg(name: &str) -> Registration {
        Registration::new(name, &format!("sess-{name}"), "/repo")
    }

    #[test]
    fn registration_round_trips() {
        let mut r = reg("Fox");
        r.branch = Some("main".into());
        r.reservations.push(ReservationEntry {
            target: ReservedPath {
                path: "/repo/src/auth".into(),
                is_dir: true,
            },
            reason: Some("task-1".into()),
            since: Utc::now(),
        });
        let json = serde_json::to_string(&r).unwrap();
        let parsed: Registration = serde_json::from_str(&json).unwrap();
        assert_eq!(r, parsed);
    }

    #[test]
    fn minimal_registration_omits_optionals() {
        let r = reg("Fox");
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("model"));
        assert!(!json.contains("branch"));
        assert!(!json.contains("spec_path"));
        assert!(!json.contains("status_message"));
        assert!(!json.contains("reservations"));
    }

    #[test]
    fn recent_files_are_deduped_and_bounded() {
        let mut stats = SessionStats::default();
        for i in 0..25 {
            stats.push_recent_file(&format!("file-{i}.rs"));
        }
        stats.push_recent_file("file-24.rs");
        assert_eq!(stats.recent_files.len(), RECENT_FILES_CAP);
        assert_eq!(stats.recent_files[0], "file-24.rs");
    }

    #[test]
    fn register_and_list() {
        let (_dir, registry) = setup();
        registry.register(&reg("Fox")).unwrap();
        registry.register(&reg("Owl")).unwrap();

        let agents = registry.active_agents().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "Fox");
        assert_eq!(agents[1].name, "Owl");
    }

    #[test]
    fn register_rejects_live_duplicate() {
        let (_dir, registry) = setup();
        registry.register(&reg("Fox")).unwrap();

        let mut other = reg("Fox");
        other.pid = crate::store::lock::owner_pid() + 1; // pretend another process
        // Existing registration belongs to our live pid.
        let err = registry.register(&other).unwrap_err();
        assert!(matches!(err, PimError::NameTaken(_)));
    }

    #[test]
    fn register_reclaims_dead_name() {
        let (_dir, registry) = setup();
        let mut dead = reg("Fox");
        dead.pid = 999_999_999;
        atomic::write_json_atomic(&registry.paths.registration_path("Fox"), &dead).unwrap();

        registry.register(&reg("Fox")).unwrap();
        let live = registry.read("Fox").unwrap();
        assert_eq!(live.pid, crate::store::lock::owner_pid());
    }

    #[test]
    fn active_agents_deletes_dead_entries() {
        let (_dir, registry) = setup();
        registry.register(&reg("Live")).unwrap();

        let mut dead = reg("Ghost");
        dead.pid = 999_999_999;
        atomic::write_json_atomic(&registry.paths.registration_path("Ghost"), &dead).unwrap();
        fs::create_dir_all(registry.paths.inbox_dir(&dead.session_id)).unwrap();

        let agents = registry.active_agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "Live");
        assert!(!registry.paths.registration_path("Ghost").exists());
        assert!(!registry.paths.inbox_dir(&dead.session_id).exists());
    }

    #[test]
    fn active_agents_skips_malformed_files() {
        let (_dir, registry) = setup();
        registry.register(&reg("Fox")).unwrap();
        fs::write(registry.paths.registry_dir().join("bad.json"), "NOT JSON").unwrap();

        let agents = registry.active_agents().unwrap();
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn read_live_distinguishes_missing_and_dead() {
        let (_dir, registry) = setup();
        assert!(matches!(
            registry.read_live("Nobody").unwrap_err(),
            PimError::NotFound(_)
        ));

        let mut dead = reg("Ghost");
        dead.pid = 999_999_999;
        atomic::write_json_atomic(&registry.paths.registration_path("Ghost"), &dead).unwrap();
        assert!(matches!(
            registry.read_live("Ghost").unwrap_err(),
            PimError::NotActive(_)
        ));
        // Dead entry was removed on read.
        assert!(!registry.paths.registration_path("Ghost").exists());
    }

    #[test]
    fn update_own_touches_activity() {
        let (_dir, registry) = setup();
        registry.register(&reg("Fox")).unwrap();
        let before = registry.read("Fox").unwrap().activity.last_activity_at;

        let updated = registry
            .update_own("Fox", |r| {
                r.stats.tool_calls += 1;
                r.status_message = Some("working".into());
            })
            .unwrap();
        assert_eq!(updated.stats.tool_calls, 1);
        assert!(updated.activity.last_activity_at >= before);
    }

    #[test]
    fn shutdown_removes_registration_and_inbox() {
        let (_dir, registry) = setup();
        let r = reg("Fox");
        registry.register(&r).unwrap();
        fs::create_dir_all(registry.paths.inbox_dir(&r.session_id)).unwrap();

        registry.shutdown("Fox", &r.session_id).unwrap();
        assert!(!registry.paths.registration_path("Fox").exists());
        assert!(!registry.paths.inbox_dir(&r.session_id).exists());
    }

    #[test]
    fn rename_keeps_session_id_and_removes_old_file() {
        let (_dir, registry) = setup();
        let r = reg("Fox");
        registry.register(&r).unwrap();

        let renamed = registry.rename("Fox", "Vixen").unwrap();
        assert_eq!(renamed.name, "Vixen");
        assert_eq!(renamed.session_id, r.session_id);
        assert!(!registry.paths.registration_path("Fox").exists());
        assert!(registry.paths.registration_path("Vixen").exists());
    }

    #[test]
    fn rename_to_live_name_fails() {
        let (_dir, registry) = setup();
        registry.register(&reg("Fox")).unwrap();
        registry.register(&reg("Owl")).unwrap();
        let err = registry.rename("Fox", "Owl").unwrap_err();
        assert!(matches!(err, PimError::NameTaken(_)));
    }

    #[test]
    fn cache_serves_within_ttl_and_invalidates() {
        let (_dir, registry) = setup();
        registry.register(&reg("Fox")).unwrap();

        let mut cache = AgentsCache::default();
        let first = cache.active(&registry, None, None).unwrap();
        assert_eq!(first.len(), 1);

        // A new registration is invisible until invalidation or TTL expiry.
        registry.register(&reg("Owl")).unwrap();
        let cached = cache.active(&registry, None, None).unwrap();
        assert_eq!(cached.len(), 1);

        cache.invalidate();
        let fresh = cache.active(&registry, None, None).unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn cache_keys_on_exclude_and_cwd() {
        let (_dir, registry) = setup();
        let mut fox = reg("Fox");
        fox.cwd = "/a".into();
        let mut owl = reg("Owl");
        owl.cwd = "/b".into();
        registry.register(&fox).unwrap();
        registry.register(&owl).unwrap();

        let mut cache = AgentsCache::default();
        let all = cache.active(&registry, None, None).unwrap();
        assert_eq!(all.len(), 2);
        let scoped = cache.active(&registry, None, Some("/a")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "Fox");
        let excluded = cache.active(&registry, Some("Fox"), None).unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].name, "Owl");
    }
}
