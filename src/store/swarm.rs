use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PimError, Result};
use crate::store::atomic;
use crate::store::lock::{self, pid_alive};
use crate::store::paths::MeshPaths;
use crate::store::registry::{Registration, Registry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub agent: String,
    pub session_id: String,
    pub pid: u32,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub agent: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// absolute spec path -> task id -> entry
type ClaimMap = BTreeMap<String, BTreeMap<String, Claim>>;
type CompletionMap = BTreeMap<String, BTreeMap<String, Completion>>;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SwarmView {
    pub claims: ClaimMap,
    pub completions: CompletionMap,
}

/// Claim/complete protocol over `claims.json` and `completions.json`,
/// serialized by the swarm lock. Stale claims are collected on every entry
/// to the critical section, read paths included.
pub struct SwarmStore {
    paths: MeshPaths,
}

impl SwarmStore {
    pub fn new(paths: MeshPaths) -> Self {
        Self { paths }
    }

    fn load_claims(&self) -> ClaimMap {
        atomic::read_json_opt(&self.paths.claims_path()).unwrap_or_default()
    }

    fn load_completions(&self) -> CompletionMap {
        atomic::read_json_opt(&self.paths.completions_path()).unwrap_or_default()
    }

    fn save_claims(&self, claims: &ClaimMap) -> Result<()> {
        atomic::write_json_atomic(&self.paths.claims_path(), claims)
    }

    fn save_completions(&self, completions: &CompletionMap) -> Result<()> {
        atomic::write_json_atomic(&self.paths.completions_path(), completions)
    }

    /// A claim is stale when its PID is dead, its registration is gone, or
    /// the registration's session no longer matches the claim's.
    fn is_stale(claim: &Claim, live: &BTreeMap<String, &Registration>) -> bool {
        if !pid_alive(claim.pid) {
            return true;
        }
        match live.get(&claim.agent) {
            Some(reg) => reg.session_id != claim.session_id,
            None => true,
        }
    }

    fn collect_stale(claims: &mut ClaimMap, agents: &[Registration]) -> bool {
        let live: BTreeMap<String, &Registration> =
            agents.iter().map(|r| (r.name.clone(), r)).collect();
        let mut changed = false;
        for tasks in claims.values_mut() {
            let before = tasks.len();
            tasks.retain(|_, claim| !Self::is_stale(claim, &live));
            changed |= tasks.len() != before;
        }
        let before = claims.len();
        claims.retain(|_, tasks| !tasks.is_empty());
        changed | (claims.len() != before)
    }

    fn enter<T>(
        &self,
        registry: &Registry,
        f: impl FnOnce(&Self, &mut ClaimMap, &mut CompletionMap) -> Result<T>,
    ) -> Result<T> {
        let _lock = lock::acquire_swarm_lock(&self.paths.swarm_lock_path())?;
        let mut claims = self.load_claims();
        let mut completions = self.load_completions();
        let agents = registry.active_agents()?;
        if Self::collect_stale(&mut claims, &agents) {
            self.save_claims(&claims)?;
        }
        f(self, &mut claims, &mut completions)
    }

    fn find_claim_of<'a>(claims: &'a ClaimMap, agent: &str) -> Option<(&'a str, &'a str)> {
        for (spec, tasks) in claims {
            for (task, claim) in tasks {
                if claim.agent == agent {
                    return Some((spec, task));
                }
            }
        }
        None
    }

    /// Claim (spec, task) for `me`. Enforces at most one claim per agent
    /// across all specs and at most one claimant per slot.
    pub fn claim(
        &self,
        registry: &Registry,
        me: &Registration,
        spec: &str,
        task: &str,
        reason: Option<&str>,
    ) -> Result<Claim> {
        self.enter(registry, |store, claims, completions| {
            if let Some(done) = completions.get(spec).and_then(|t| t.get(task)) {
                return Err(PimError::AlreadyCompleted {
                    spec: spec.into(),
                    task: task.into(),
                    by: done.agent.clone(),
                });
            }
            if let Some((held_spec, held_task)) = Self::find_claim_of(claims, &me.name) {
                return Err(PimError::AlreadyHaveClaim {
                    spec: held_spec.into(),
                    task: held_task.into(),
                });
            }
            if let Some(existing) = claims.get(spec).and_then(|t| t.get(task)) {
                return Err(PimError::AlreadyClaimed {
                    spec: spec.into(),
                    task: task.into(),
                    owner: existing.agent.clone(),
                });
            }

            let claim = Claim {
                agent: me.name.clone(),
                session_id: me.session_id.clone(),
                pid: me.pid,
                claimed_at: Utc::now(),
                reason: reason.map(String::from),
            };
            claims
                .entry(spec.into())
                .or_default()
                .insert(task.into(), claim.clone());
            store.save_claims(claims)?;
            Ok(claim)
        })
    }

    /// Drop our claim on (spec, task).
    pub fn unclaim(
        &self,
        registry: &Registry,
        me: &Registration,
        spec: &str,
        task: &str,
    ) -> Result<()> {
        self.enter(registry, |store, claims, _completions| {
            let owner = claims
                .get(spec)
                .and_then(|t| t.get(task))
                .map(|c| c.agent.clone());
            match owner {
                None => Err(PimError::NotClaimed {
                    spec: spec.into(),
                    task: task.into(),
                }),
                Some(owner) if owner != me.name => Err(PimError::NotYourClaim {
                    spec: spec.into(),
                    task: task.into(),
                    owner,
                }),
                Some(_) => {
                    if let Some(tasks) = claims.get_mut(spec) {
                        tasks.remove(task);
                        if tasks.is_empty() {
                            claims.remove(spec);
                        }
                    }
                    store.save_claims(claims)?;
                    Ok(())
                }
            }
        })
    }

    /// Move (spec, task) from claims to completions. Completions are written
    /// first so a crash between the two writes leaves the durable outcome
    /// recorded and a dangling claim for the next GC.
    pub fn complete(
        &self,
        registry: &Registry,
        me: &Registration,
        spec: &str,
        task: &str,
        notes: Option<&str>,
    ) -> Result<Completion> {
        self.enter(registry, |store, claims, completions| {
            if let Some(done) = completions.get(spec).and_then(|t| t.get(task)) {
                return Err(PimError::AlreadyCompleted {
                    spec: spec.into(),
                    task: task.into(),
                    by: done.agent.clone(),
                });
            }
            let owner = claims
                .get(spec)
                .and_then(|t| t.get(task))
                .map(|c| c.agent.clone());
            match owner {
                None => Err(PimError::NotClaimed {
                    spec: spec.into(),
                    task: task.into(),
                }),
                Some(owner) if owner != me.name => Err(PimError::NotYourClaim {
                    spec: spec.into(),
                    task: task.into(),
                    owner,
                }),
                Some(_) => {
                    let completion = Completion {
                        agent: me.name.clone(),
                        completed_at: Utc::now(),
                        notes: notes.map(String::from),
                    };
                    completions
                        .entry(spec.into())
                        .or_default()
                        .insert(task.into(), completion.clone());
                    store.save_completions(completions)?;

                    if let Some(tasks) = claims.get_mut(spec) {
                        tasks.remove(task);
                        if tasks.is_empty() {
                            claims.remove(spec);
                        }
                    }
                    store.save_claims(claims)?;
                    Ok(completion)
                }
            }
        })
    }

    /// Snapshot of claims and completions, stale claims filtered out and
    /// collected.
    pub fn view(&self, registry: &Registry, spec: Option<&str>) -> Result<SwarmView> {
        self.enter(registry, |_store, claims, completions| {
            let filter = |map_spec: &String| spec.is_none_or(|s| s == map_spec.as_str());
            Ok(SwarmView {
                claims: claims
                    .iter()
                    .filter(|(k, _)| filter(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                completions: completions
                    .iter()
                    .filter(|(k, _)| filter(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
        })
    }

    /// The (spec, task) currently claimed by `agent`, if any.
    pub fn claim_of(&self, registry: &Registry, agent: &str) -> Result<Option<(String, String)>> {
        self.enter(registry, |_store, claims, _| {
            Ok(Self::find_claim_of(claims, agent).map(|(s, t)| (s.to_string(), t.to_string())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Registry, SwarmStore) {
        let dir = tempdir().unwrap();
        let paths = MeshPaths::new(dir.path().join("mesh"));
        paths.ensure_dirs().unwrap();
        let registry = Registry::new(paths.clone());
        let swarm = SwarmStore::new(paths);
        (dir, registry, swarm)
    }

    fn join(registry: &Registry, name: &str) -> Registration {
        let reg = Registration::new(name, &format!("sess-{name}"), "/repo");
        registry.register(&reg).unwrap();
        reg
    }

    const SPEC: &str = "/repo/SPEC.md";

    #[test]
    fn claim_then_contention() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        let b = join(&registry, "B");

        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();

        // Slot exclusivity.
        let err = swarm.claim(&registry, &b, SPEC, "TASK-1", None).unwrap_err();
        assert!(
            matches!(err, PimError::AlreadyClaimed { ref owner, .. } if owner == "A"),
            "{err:?}"
        );

        // B may claim a different slot.
        swarm.claim(&registry, &b, SPEC, "TASK-2", None).unwrap();

        // Single claim per agent across all specs.
        let err = swarm
            .claim(&registry, &b, "/other/SPEC.md", "TASK-3", None)
            .unwrap_err();
        match err {
            PimError::AlreadyHaveClaim { spec, task } => {
                assert_eq!(spec, SPEC);
                assert_eq!(task, "TASK-2");
            }
            other => panic!("expected AlreadyHaveClaim, got {other:?}"),
        }
    }

    #[test]
    fn complete_moves_claim_and_frees_the_agent() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");

        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();
        let completion = swarm
            .complete(&registry, &a, SPEC, "TASK-1", Some("done"))
            .unwrap();
        assert_eq!(completion.agent, "A");
        assert_eq!(completion.notes.as_deref(), Some("done"));

        let view = swarm.view(&registry, Some(SPEC)).unwrap();
        assert!(view.claims.get(SPEC).is_none());
        assert!(view.completions[SPEC].contains_key("TASK-1"));

        // Freed: a new claim is allowed.
        swarm.claim(&registry, &a, SPEC, "TASK-3", None).unwrap();
    }

    #[test]
    fn completion_is_terminal() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        let b = join(&registry, "B");

        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();
        swarm.complete(&registry, &a, SPEC, "TASK-1", None).unwrap();

        let err = swarm.claim(&registry, &b, SPEC, "TASK-1", None).unwrap_err();
        assert!(matches!(err, PimError::AlreadyCompleted { ref by, .. } if by == "A"));
    }

    #[test]
    fn unclaim_requires_ownership() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        let b = join(&registry, "B");

        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();

        let err = swarm.unclaim(&registry, &b, SPEC, "TASK-1").unwrap_err();
        assert!(matches!(err, PimError::NotYourClaim { .. }));

        swarm.unclaim(&registry, &a, SPEC, "TASK-1").unwrap();
        let err = swarm.unclaim(&registry, &a, SPEC, "TASK-1").unwrap_err();
        assert!(matches!(err, PimError::NotClaimed { .. }));
    }

    #[test]
    fn stale_claims_are_collected_on_entry() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        let b = join(&registry, "B");
        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();

        // A dies: registration gone, claim PID is ours (alive) but the
        // registration no longer exists.
        registry.shutdown("A", &a.session_id).unwrap();

        let view = swarm.view(&registry, Some(SPEC)).unwrap();
        assert!(view.claims.get(SPEC).is_none());

        // The slot is claimable again.
        swarm.claim(&registry, &b, SPEC, "TASK-1", None).unwrap();
    }

    #[test]
    fn session_mismatch_makes_claim_stale() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();

        // Same name re-registered under a new session.
        let reborn = Registration::new("A", "sess-A-2", "/repo");
        registry.register(&reborn).unwrap();

        let view = swarm.view(&registry, Some(SPEC)).unwrap();
        assert!(view.claims.get(SPEC).is_none());
    }

    #[test]
    fn completions_survive_owner_death() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();
        swarm.complete(&registry, &a, SPEC, "TASK-1", None).unwrap();
        registry.shutdown("A", &a.session_id).unwrap();

        let view = swarm.view(&registry, Some(SPEC)).unwrap();
        assert!(view.completions[SPEC].contains_key("TASK-1"));
    }

    #[test]
    fn claim_of_reports_current_holding() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        assert!(swarm.claim_of(&registry, "A").unwrap().is_none());

        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();
        assert_eq!(
            swarm.claim_of(&registry, "A").unwrap(),
            Some((SPEC.to_string(), "TASK-1".to_string()))
        );
    }

    #[test]
    fn malformed_claims_file_is_treated_as_empty() {
        let (_dir, registry, swarm) = setup();
        let a = join(&registry, "A");
        std::fs::write(swarm.paths.claims_path(), "NOT JSON").unwrap();
        swarm.claim(&registry, &a, SPEC, "TASK-1", None).unwrap();
        let view = swarm.view(&registry, None).unwrap();
        assert_eq!(view.claims[SPEC].len(), 1);
    }
}
