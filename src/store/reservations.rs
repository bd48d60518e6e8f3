use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::pathnorm::{self, ReservedPath};
use crate::store::registry::{Registration, Registry, ReservationEntry};

/// What a blocked writer needs to know about the reserving peer. A small
/// value resolved at conflict time, not a back-pointer into the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub name: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl PeerSummary {
    pub fn of(reg: &Registration) -> Self {
        Self {
            name: reg.name.clone(),
            cwd: reg.cwd.clone(),
            branch: reg.branch.clone(),
            model: reg.model.clone(),
        }
    }
}

/// Result of a write-enforcement check that hit a peer's reservation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservationBlock {
    pub peer: PeerSummary,
    pub reserved_path: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReservationBlock {
    pub fn message(&self) -> String {
        let location = match &self.peer.branch {
            Some(branch) => format!("{} on {branch}", self.peer.cwd),
            None => self.peer.cwd.clone(),
        };
        let reason = self
            .reason
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default();
        format!(
            "{} is reserved by {} [{}]{}; coordinate before editing {}",
            self.reserved_path, self.peer.name, location, reason, self.target
        )
    }
}

/// Enforcement for local write-class tool calls: the first live peer
/// reservation covering the target blocks it. Reads are never checked.
pub fn check_write(peers: &[Registration], target: &str, anchor: &Path) -> Option<ReservationBlock> {
    let normalized = pathnorm::normalize(target, anchor);
    for peer in peers {
        for entry in &peer.reservations {
            if entry.target.covers(&normalized) {
                return Some(ReservationBlock {
                    peer: PeerSummary::of(peer),
                    reserved_path: entry.target.path.clone(),
                    target: normalized,
                    reason: entry.reason.clone(),
                });
            }
        }
    }
    None
}

/// Add reservations to our own registration. Same-path entries are replaced.
pub fn reserve(
    registry: &Registry,
    name: &str,
    paths: &[String],
    reason: Option<&str>,
    anchor: &Path,
) -> Result<Vec<ReservationEntry>> {
    let now = Utc::now();
    let new_entries: Vec<ReservationEntry> = paths
        .iter()
        .map(|p| ReservationEntry {
            target: ReservedPath::parse(p, anchor),
            reason: reason.map(String::from),
            since: now,
        })
        .collect();

    let updated = registry.update_own(name, |reg| {
        reg.reservations
            .retain(|held| !new_entries.iter().any(|n| n.target.path == held.target.path));
        reg.reservations.extend(new_entries.clone());
    })?;
    Ok(updated.reservations)
}

/// Release reservations; `all` drops every one, otherwise only the listed
/// paths (matched after normalization).
pub fn release(
    registry: &Registry,
    name: &str,
    paths: &[String],
    all: bool,
    anchor: &Path,
) -> Result<Vec<ReservationEntry>> {
    let normalized: Vec<String> = paths
        .iter()
        .map(|p| pathnorm::normalize(p, anchor))
        .collect();
    let updated = registry.update_own(name, |reg| {
        if all {
            reg.reservations.clear();
        } else {
            reg.reservations
                .retain(|held| !normalized.contains(&held.target.path));
        }
    })?;
    Ok(updated.reservations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::paths::MeshPaths;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Registry) {
        let dir = tempdir().unwrap();
        let paths = MeshPaths::new(dir.path().join("mesh"));
        paths.ensure_dirs().unwrap();
        (dir, Registry::new(paths))
    }

    fn join(registry: &Registry, name: &str) -> Registration {
        let reg = Registration::new(name, &format!("sess-{name}"), "/repo");
        registry.register(&reg).unwrap();
        reg
    }

    fn anchor() -> PathBuf {
        PathBuf::from("/repo")
    }

    #[test]
    fn reserve_stores_normalized_entries() {
        let (_dir, registry) = setup();
        join(&registry, "A");

        let held = reserve(
            &registry,
            "A",
            &["src/./auth/".into(), "src/main.rs".into()],
            Some("task-1"),
            &anchor(),
        )
        .unwrap();
        assert_eq!(held.len(), 2);
        assert_eq!(held[0].target.path, "/repo/src/auth");
        assert!(held[0].target.is_dir);
        assert_eq!(held[1].target.path, "/repo/src/main.rs");
        assert!(!held[1].target.is_dir);
        assert_eq!(held[0].reason.as_deref(), Some("task-1"));
    }

    #[test]
    fn directory_reservation_blocks_nested_writes_only_for_peers() {
        let (_dir, registry) = setup();
        join(&registry, "A");
        reserve(&registry, "A", &["src/auth/".into()], Some("refactor"), &anchor()).unwrap();

        let peers = registry.active_agents().unwrap();
        let peers: Vec<_> = peers.into_iter().filter(|r| r.name != "B").collect();

        let block = check_write(&peers, "src/auth/login.ts", &anchor()).unwrap();
        assert_eq!(block.peer.name, "A");
        assert_eq!(block.reserved_path, "/repo/src/auth");
        assert_eq!(block.target, "/repo/src/auth/login.ts");
        assert!(block.message().contains("A"));
        assert!(block.message().contains("refactor"));

        assert!(check_write(&peers, "src/model.rs", &anchor()).is_none());
        // Sibling with a shared prefix is not covered.
        assert!(check_write(&peers, "src/authz/x.rs", &anchor()).is_none());
    }

    #[test]
    fn first_match_wins() {
        let (_dir, registry) = setup();
        join(&registry, "A");
        join(&registry, "B");
        reserve(&registry, "A", &["src/".into()], None, &anchor()).unwrap();
        reserve(&registry, "B", &["src/auth/".into()], None, &anchor()).unwrap();

        let peers = registry.active_agents().unwrap();
        let block = check_write(&peers, "src/auth/login.ts", &anchor()).unwrap();
        // Registry listing is name-sorted; A's broader reservation matches first.
        assert_eq!(block.peer.name, "A");
    }

    #[test]
    fn release_specific_and_all() {
        let (_dir, registry) = setup();
        join(&registry, "A");
        reserve(
            &registry,
            "A",
            &["src/a.rs".into(), "src/b.rs".into()],
            None,
            &anchor(),
        )
        .unwrap();

        let held = release(&registry, "A", &["./src/a.rs".into()], false, &anchor()).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].target.path, "/repo/src/b.rs");

        let held = release(&registry, "A", &[], true, &anchor()).unwrap();
        assert!(held.is_empty());
    }

    #[test]
    fn re_reserving_same_path_replaces_entry() {
        let (_dir, registry) = setup();
        join(&registry, "A");
        reserve(&registry, "A", &["src/a.rs".into()], Some("old"), &anchor()).unwrap();
        let held = reserve(&registry, "A", &["src/a.rs".into()], Some("new"), &anchor()).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].reason.as_deref(), Some("new"));
    }
}
