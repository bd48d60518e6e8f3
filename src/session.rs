use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{self, MessengerConfig};
use crate::error::{PimError, Result};
use crate::git;
use crate::naming;
use crate::output;
use crate::pathnorm;
use crate::store::feed::{self, CommandKind, EditDebounce, FeedEvent, FeedKind, FeedStore};
use crate::store::inbox::{self, Message};
use crate::store::paths::MeshPaths;
use crate::store::presence::{self, PresenceStatus, StuckTracker};
use crate::store::registry::{AgentsCache, Registration, Registry};
use crate::store::reservations::{self, ReservationBlock};
use crate::store::swarm::SwarmStore;

/// Presence-annotated view of a registration.
#[derive(Debug, Clone, Serialize)]
pub struct PeerPresence {
    #[serde(flatten)]
    pub registration: Registration,
    pub status: PresenceStatus,
    pub has_claim: bool,
}

/// The long-lived coordination object: identity, config, and the
/// process-local state (listing cache, seen senders, debounces) that the
/// handlers share.
pub struct Messenger {
    pub config: MessengerConfig,
    pub paths: MeshPaths,
    pub registry: Registry,
    pub swarm: SwarmStore,
    pub feed: FeedStore,
    pub cwd: PathBuf,
    session_id: String,
    identity: Option<String>,
    cache: AgentsCache,
    stuck: StuckTracker,
    seen_senders: HashSet<(String, String)>,
    edit_debounce: EditDebounce,
    oriented: bool,
}

impl Messenger {
    pub fn new() -> Result<Self> {
        let paths = MeshPaths::resolve();
        let config = MessengerConfig::load();
        let cwd = std::env::current_dir()?;
        let session_id = std::env::var(config::SESSION_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Self::assemble(paths, config, cwd, session_id))
    }

    /// Construction with everything explicit; the test entry point.
    pub fn with_parts(
        paths: MeshPaths,
        config: MessengerConfig,
        cwd: PathBuf,
        session_id: String,
    ) -> Self {
        Self::assemble(paths, config, cwd, session_id)
    }

    fn assemble(
        paths: MeshPaths,
        config: MessengerConfig,
        cwd: PathBuf,
        session_id: String,
    ) -> Self {
        Self {
            registry: Registry::new(paths.clone()),
            swarm: SwarmStore::new(paths.clone()),
            feed: FeedStore::new(paths.clone()),
            paths,
            config,
            cwd,
            session_id,
            identity: None,
            cache: AgentsCache::default(),
            stuck: StuckTracker::default(),
            seen_senders: HashSet::new(),
            edit_debounce: EditDebounce::default(),
            oriented: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_registered(&mut self) -> bool {
        self.resolve_identity().is_ok()
    }

    // -- identity ------------------------------------------------------------

    /// Resolve which registration is "us". Explicit env name first, then a
    /// unique session-id match, then a unique same-cwd match.
    pub fn resolve_identity(&mut self) -> Result<Registration> {
        if let Some(name) = self.identity.clone() {
            return self.registry.read_live(&name);
        }

        if let Some(name) = std::env::var(config::NAME_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        {
            let reg = self.registry.read_live(&name)?;
            self.identity = Some(reg.name.clone());
            return Ok(reg);
        }

        let agents = self.registry.active_agents()?;
        let by_session: Vec<&Registration> = agents
            .iter()
            .filter(|a| a.session_id == self.session_id)
            .collect();
        if by_session.len() == 1 {
            let reg = by_session[0].clone();
            self.identity = Some(reg.name.clone());
            return Ok(reg);
        }
        if by_session.len() > 1 {
            let names: Vec<&str> = by_session.iter().map(|a| a.name.as_str()).collect();
            return Err(PimError::AmbiguousIdentity(names.join(", ")));
        }

        let cwd = self.cwd.display().to_string();
        let by_cwd: Vec<&Registration> = agents.iter().filter(|a| a.cwd == cwd).collect();
        if by_cwd.len() == 1 {
            let reg = by_cwd[0].clone();
            self.identity = Some(reg.name.clone());
            return Ok(reg);
        }
        if by_cwd.len() > 1 {
            let names: Vec<&str> = by_cwd.iter().map(|a| a.name.as_str()).collect();
            return Err(PimError::AmbiguousIdentity(names.join(", ")));
        }

        Err(PimError::NotRegistered)
    }

    fn require_me(&mut self) -> Result<Registration> {
        self.resolve_identity()
    }

    // -- join / leave --------------------------------------------------------

    /// Register in the mesh. An explicit name (argument or environment)
    /// never retries on collision; generated names walk the suffix space.
    pub fn join(
        &mut self,
        name: Option<&str>,
        model: Option<&str>,
        spec_path: Option<&str>,
        human: bool,
    ) -> Result<Registration> {
        self.paths.ensure_dirs()?;
        let explicit = name
            .map(String::from)
            .or_else(|| std::env::var(config::NAME_ENV).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let resolved = match explicit {
            Some(name) => {
                naming::validate_name(&name)?;
                if self.name_is_taken(&name) {
                    return Err(PimError::NameTaken(name));
                }
                name
            }
            None => {
                let taken = |candidate: &str| self.name_is_taken(candidate);
                naming::generate_name(
                    self.config.name_theme,
                    self.config.name_words.as_ref(),
                    taken,
                )?
            }
        };

        let cwd = self.cwd.display().to_string();
        let mut reg = Registration::new(&resolved, &self.session_id, &cwd);
        reg.model = model.map(String::from);
        reg.spec_path = spec_path.map(String::from);
        reg.human = human;
        reg.branch = git::branch_label(&self.cwd);
        self.registry.register(&reg)?;
        self.cache.invalidate();
        self.identity = Some(resolved.clone());

        let _ = self.feed.append(&FeedEvent::now(&resolved, FeedKind::Join));
        Ok(reg)
    }

    fn name_is_taken(&self, name: &str) -> bool {
        match self.registry.read(name) {
            Some(existing) => crate::store::lock::pid_alive(existing.pid),
            None => false,
        }
    }

    /// Clean shutdown: registration and inbox are removed.
    pub fn leave(&mut self) -> Result<String> {
        let me = self.require_me()?;
        self.registry.shutdown(&me.name, &me.session_id)?;
        self.cache.invalidate();
        self.identity = None;
        let _ = self.feed.append(&FeedEvent::now(&me.name, FeedKind::Leave));
        Ok(me.name)
    }

    pub fn rename(&mut self, new_name: &str) -> Result<Registration> {
        let me = self.require_me()?;
        let renamed = self.registry.rename(&me.name, new_name)?;
        self.cache.invalidate();
        self.identity = Some(renamed.name.clone());
        Ok(renamed)
    }

    // -- listing & presence --------------------------------------------------

    /// Peers (excluding us), scoped to the folder when configured. Served
    /// from the 1-second cache.
    pub fn peers(&mut self) -> Result<Vec<Registration>> {
        let me = self.identity.clone();
        let cwd = self.cwd.display().to_string();
        let scope = self.config.scope_to_folder.then_some(cwd.as_str());
        self.cache.active(&self.registry, me.as_deref(), scope)
    }

    /// All live agents with derived presence. Stuck transitions surface a
    /// feed event once per episode.
    pub fn presence(&mut self) -> Result<Vec<PeerPresence>> {
        let agents = self.registry.active_agents()?;
        let view = self.swarm.view(&self.registry, None)?;
        let claimants: HashSet<&str> = view
            .claims
            .values()
            .flat_map(|tasks| tasks.values())
            .map(|c| c.agent.as_str())
            .collect();

        let threshold = std::time::Duration::from_secs(self.config.stuck_threshold);
        let now = chrono::Utc::now();
        let mut out = Vec::with_capacity(agents.len());
        for reg in agents {
            let has_claim = claimants.contains(reg.name.as_str());
            let has_commitment = has_claim || !reg.reservations.is_empty();
            let status = presence::derive_status(
                reg.activity.last_activity_at,
                now,
                has_commitment,
                threshold,
            );
            if status == PresenceStatus::Stuck {
                if self
                    .stuck
                    .should_notify(&reg.name, reg.activity.last_activity_at)
                {
                    let _ = self.feed.append(&FeedEvent::now(&reg.name, FeedKind::Stuck));
                }
            } else {
                self.stuck.resolve(&reg.name);
            }
            out.push(PeerPresence {
                registration: reg,
                status,
                has_claim,
            });
        }
        Ok(out)
    }

    pub fn whois(&mut self, name: &str) -> Result<PeerPresence> {
        let target = self.registry.read_live(name)?;
        self.presence()?
            .into_iter()
            .find(|p| p.registration.name == target.name)
            .ok_or_else(|| PimError::NotFound(name.into()))
    }

    // -- messaging -----------------------------------------------------------

    pub fn send(&mut self, to: &str, text: &str, reply_to: Option<&str>) -> Result<Message> {
        let me = self.require_me()?;
        let msg = inbox::send_to(&self.registry, &self.paths, &me, to, text, reply_to)?;
        let _ = self.feed.append(
            &FeedEvent::now(&me.name, FeedKind::Message)
                .with_target(to)
                .with_detail(output::truncate(text, 80)),
        );
        let _ = self
            .registry
            .update_own(&me.name, |r| r.stats.tool_calls += 1);
        Ok(msg)
    }

    /// Send to every live peer. Per-recipient failures do not stop the rest.
    pub fn broadcast(&mut self, text: &str) -> Vec<(String, Result<Message>)> {
        let me = match self.require_me() {
            Ok(me) => me,
            Err(err) => return vec![("(self)".into(), Err(err))],
        };
        let peers = match self.peers() {
            Ok(peers) => peers,
            Err(err) => return vec![("(registry)".into(), Err(err))],
        };
        peers
            .into_iter()
            .map(|peer| {
                let result =
                    inbox::send_to(&self.registry, &self.paths, &me, &peer.name, text, None);
                if result.is_ok() {
                    let _ = self.feed.append(
                        &FeedEvent::now(&me.name, FeedKind::Message)
                            .with_target(&peer.name)
                            .with_detail(output::truncate(text, 80)),
                    );
                }
                (peer.name, result)
            })
            .collect()
    }

    /// Render a delivered message, injecting orientation and first-contact
    /// cues per configuration. ANSI escapes in peer text are stripped.
    pub fn render_delivery(&mut self, msg: &Message) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !self.oriented {
            self.oriented = true;
            if let Some(context) = &self.config.registration_context {
                parts.push(context.clone());
            }
        }

        let sender_key = (
            msg.from.clone(),
            msg.from_session.clone().unwrap_or_default(),
        );
        let first_contact = self.seen_senders.insert(sender_key);
        if first_contact && self.config.sender_details_on_first_contact {
            if let Some(sender) = self.registry.read(&msg.from) {
                let branch = sender.branch.as_deref().unwrap_or("-");
                parts.push(format!(
                    "[{} is working in {} on {}]",
                    sender.name, sender.cwd, branch
                ));
            }
        }

        parts.push(format!("{}: {}", msg.from, output::strip_ansi(&msg.text)));

        if first_contact && let Some(hint) = &self.config.reply_hint {
            parts.push(hint.clone());
        }
        parts.join("\n")
    }

    // -- reservations --------------------------------------------------------

    pub fn reserve(
        &mut self,
        paths: &[String],
        reason: Option<&str>,
    ) -> Result<Vec<crate::store::registry::ReservationEntry>> {
        let me = self.require_me()?;
        let cwd = self.cwd.clone();
        let held = reservations::reserve(&self.registry, &me.name, paths, reason, &cwd)?;
        self.cache.invalidate();
        let _ = self
            .feed
            .append(&FeedEvent::now(&me.name, FeedKind::Reserve).with_target(paths.join(", ")));
        Ok(held)
    }

    pub fn release(
        &mut self,
        paths: &[String],
        all: bool,
    ) -> Result<Vec<crate::store::registry::ReservationEntry>> {
        let me = self.require_me()?;
        let cwd = self.cwd.clone();
        let held = reservations::release(&self.registry, &me.name, paths, all, &cwd)?;
        self.cache.invalidate();
        let target = if all { "all".to_string() } else { paths.join(", ") };
        let _ = self
            .feed
            .append(&FeedEvent::now(&me.name, FeedKind::Release).with_target(target));
        Ok(held)
    }

    /// Write-enforcement check for a local write-class tool call. Reads are
    /// never guarded; callers only consult this for write/edit operations.
    pub fn guard_write(&mut self, target: &str) -> Result<Option<ReservationBlock>> {
        let peers = self.peers()?;
        let cwd = self.cwd.clone();
        Ok(reservations::check_write(&peers, target, &cwd))
    }

    // -- swarm ---------------------------------------------------------------

    fn spec_key(&mut self, spec: Option<&str>) -> Result<String> {
        let me = self.require_me()?;
        let raw = spec
            .map(String::from)
            .or(me.spec_path)
            .ok_or(PimError::NoSpec)?;
        Ok(pathnorm::normalize(&raw, &self.cwd))
    }

    pub fn claim(
        &mut self,
        spec: Option<&str>,
        task: &str,
        reason: Option<&str>,
    ) -> Result<crate::store::swarm::Claim> {
        let key = self.spec_key(spec)?;
        let me = self.require_me()?;
        self.swarm.claim(&self.registry, &me, &key, task, reason)
    }

    pub fn unclaim(&mut self, spec: Option<&str>, task: &str) -> Result<()> {
        let key = self.spec_key(spec)?;
        let me = self.require_me()?;
        self.swarm.unclaim(&self.registry, &me, &key, task)
    }

    pub fn complete(
        &mut self,
        spec: Option<&str>,
        task: &str,
        notes: Option<&str>,
    ) -> Result<crate::store::swarm::Completion> {
        let key = self.spec_key(spec)?;
        let me = self.require_me()?;
        self.swarm.complete(&self.registry, &me, &key, task, notes)
    }

    // -- status & activity ---------------------------------------------------

    pub fn set_status(&mut self, message: Option<&str>) -> Result<Registration> {
        let me = self.require_me()?;
        let updated = self.registry.update_own(&me.name, |r| {
            r.status_message = message.map(String::from);
        })?;
        self.cache.invalidate();
        Ok(updated)
    }

    pub fn set_spec(&mut self, spec_path: Option<&str>) -> Result<Registration> {
        let me = self.require_me()?;
        let normalized = spec_path.map(|s| pathnorm::normalize(s, &self.cwd));
        let updated = self.registry.update_own(&me.name, |r| {
            r.spec_path = normalized.clone();
        })?;
        self.cache.invalidate();
        Ok(updated)
    }

    /// Record a host tool call: updates session counters and emits the
    /// derived feed events (edit debounced per file, commit, test).
    pub fn track_tool_call(
        &mut self,
        tool: &str,
        target: Option<&str>,
        command: Option<&str>,
        exit_code: Option<i32>,
        tokens: Option<u64>,
    ) -> Result<()> {
        let me = self.require_me()?;
        self.registry.update_own(&me.name, |r| {
            r.stats.tool_calls += 1;
            if let Some(tokens) = tokens {
                r.stats.tokens += tokens;
            }
            r.activity.last_tool_call = Some(tool.to_string());
            r.activity.current = Some(match target {
                Some(target) => format!("{tool}: {target}"),
                None => tool.to_string(),
            });
            if matches!(tool, "write" | "edit")
                && let Some(target) = target
            {
                r.stats.push_recent_file(target);
            }
        })?;
        self.cache.invalidate();

        if matches!(tool, "write" | "edit")
            && let Some(target) = target
            && self.edit_debounce.should_emit(target)
        {
            let _ = self
                .feed
                .append(&FeedEvent::now(&me.name, FeedKind::Edit).with_target(target));
        }
        if tool == "bash"
            && let Some(command) = command
            && let Some(kind) = feed::classify_command(command)
        {
            let event = match kind {
                CommandKind::Commit => FeedEvent::now(&me.name, FeedKind::Commit)
                    .with_detail(output::truncate(command, 80)),
                CommandKind::Test => {
                    let detail = match exit_code {
                        Some(0) => "passed",
                        Some(_) => "failed",
                        None => "ran",
                    };
                    FeedEvent::now(&me.name, FeedKind::Test).with_detail(detail)
                }
            };
            let _ = self.feed.append(&event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn messenger_at(dir: &Path, session: &str) -> Messenger {
        let paths = MeshPaths::new(dir.join("mesh"));
        paths.ensure_dirs().unwrap();
        Messenger::with_parts(
            paths,
            MessengerConfig::default(),
            dir.join("repo"),
            session.into(),
        )
    }

    #[test]
    fn join_generates_distinct_names() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");

        let ra = a.join(None, Some("opus"), None, false).unwrap();
        let rb = b.join(None, None, None, false).unwrap();
        assert_ne!(ra.name, rb.name);
        assert_eq!(ra.model.as_deref(), Some("opus"));
        naming::validate_name(&ra.name).unwrap();

        let feed_events = a.feed.read(None).unwrap();
        assert_eq!(feed_events.len(), 2);
        assert_eq!(feed_events[0].kind, FeedKind::Join);
    }

    #[test]
    fn explicit_name_conflict_fails_without_retry() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");

        a.join(Some("Fox"), None, None, false).unwrap();
        let err = b.join(Some("Fox"), None, None, false).unwrap_err();
        assert!(matches!(err, PimError::NameTaken(_)));
    }

    #[test]
    fn identity_resolves_by_session_id_then_cwd() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        a.join(Some("Fox"), None, None, false).unwrap();

        // A new Messenger for the same session finds the registration.
        let mut again = messenger_at(dir.path(), "sess-a");
        let me = again.resolve_identity().unwrap();
        assert_eq!(me.name, "Fox");

        // Unknown session in the same cwd falls back to the unique
        // same-folder registration.
        let mut same_dir = messenger_at(dir.path(), "sess-z");
        assert_eq!(same_dir.resolve_identity().unwrap().name, "Fox");

        // Unknown session elsewhere has no identity.
        let paths = MeshPaths::new(dir.path().join("mesh"));
        let mut elsewhere = Messenger::with_parts(
            paths,
            MessengerConfig::default(),
            dir.path().join("other-repo"),
            "sess-z".into(),
        );
        assert!(matches!(
            elsewhere.resolve_identity().unwrap_err(),
            PimError::NotRegistered
        ));
    }

    #[test]
    fn send_requires_registration_and_feeds() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");

        assert!(matches!(
            a.send("Nobody", "hi", None).unwrap_err(),
            PimError::NotRegistered
        ));

        a.join(Some("Alice"), None, None, false).unwrap();
        b.join(Some("Bob"), None, None, false).unwrap();

        let msg = a.send("Bob", "hello", None).unwrap();
        assert_eq!(msg.from, "Alice");
        assert_eq!(msg.from_session.as_deref(), Some("sess-a"));

        let kinds: Vec<FeedKind> = a.feed.read(None).unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&FeedKind::Message));
    }

    #[test]
    fn broadcast_reaches_all_peers_and_tolerates_failures() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");
        let mut c = messenger_at(dir.path(), "sess-c");
        a.join(Some("A"), None, None, false).unwrap();
        b.join(Some("B"), None, None, false).unwrap();
        c.join(Some("C"), None, None, false).unwrap();

        let results = a.broadcast("announcement");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"B") && names.contains(&"C"));
        assert!(!names.contains(&"A"));
    }

    #[test]
    fn render_delivery_injects_first_contact_cues_once() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");
        a.join(Some("Alice"), None, None, false).unwrap();
        b.join(Some("Bob"), None, None, false).unwrap();
        b.config.registration_context = Some("You are in a mesh.".into());
        b.config.reply_hint = Some("Reply with `pim send`.".into());

        let msg = a.send("Bob", "\u{1b}[31mhello\u{1b}[0m", None).unwrap();
        let first = b.render_delivery(&msg);
        assert!(first.contains("You are in a mesh."));
        assert!(first.contains("[Alice is working in"));
        assert!(first.contains("Alice: hello"));
        assert!(!first.contains('\u{1b}'));
        assert!(first.contains("Reply with `pim send`."));

        let msg2 = a.send("Bob", "again", None).unwrap();
        let second = b.render_delivery(&msg2);
        assert_eq!(second, "Alice: again");
    }

    #[test]
    fn first_contact_keys_on_name_and_session() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");
        a.join(Some("Alice"), None, None, false).unwrap();
        b.join(Some("Bob"), None, None, false).unwrap();

        let msg = a.send("Bob", "hi", None).unwrap();
        assert!(b.render_delivery(&msg).contains("is working in"));

        // Same name, new session: treated as a fresh contact.
        let mut reborn = messenger_at(dir.path(), "sess-a2");
        a.leave().unwrap();
        reborn.join(Some("Alice"), None, None, false).unwrap();
        let msg = reborn.send("Bob", "hi again", None).unwrap();
        assert!(b.render_delivery(&msg).contains("is working in"));
    }

    #[test]
    fn guard_write_blocks_only_writes_against_peer_reservations() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");
        a.join(Some("A"), None, None, false).unwrap();
        b.join(Some("B"), None, None, false).unwrap();

        a.reserve(&["src/auth/".into()], Some("task-1")).unwrap();

        // B's cache may be stale for up to a second; invalidate like a local
        // mutation would.
        b.cache.invalidate();
        let block = b.guard_write("src/auth/login.ts").unwrap().unwrap();
        assert_eq!(block.peer.name, "A");

        // Own reservation does not block us.
        a.cache.invalidate();
        assert!(a.guard_write("src/auth/login.ts").unwrap().is_none());

        a.release(&[], true).unwrap();
        b.cache.invalidate();
        assert!(b.guard_write("src/auth/login.ts").unwrap().is_none());
    }

    #[test]
    fn claim_uses_registered_spec_path_when_absent() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        a.join(Some("A"), None, Some("SPEC.md"), false).unwrap();

        let claim = a.claim(None, "TASK-1", None).unwrap();
        assert_eq!(claim.agent, "A");

        let mut b = messenger_at(dir.path(), "sess-b");
        b.join(Some("B"), None, None, false).unwrap();
        assert!(matches!(
            b.claim(None, "TASK-2", None).unwrap_err(),
            PimError::NoSpec
        ));
    }

    #[test]
    fn track_tool_call_updates_stats_and_feed() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        a.join(Some("A"), None, None, false).unwrap();

        a.track_tool_call("edit", Some("src/lib.rs"), None, None, Some(120))
            .unwrap();
        a.track_tool_call("bash", None, Some("cargo test"), Some(0), None)
            .unwrap();
        a.track_tool_call("bash", None, Some("git commit -m x"), Some(0), None)
            .unwrap();

        let me = a.resolve_identity().unwrap();
        assert_eq!(me.stats.tool_calls, 3);
        assert_eq!(me.stats.tokens, 120);
        assert_eq!(me.stats.recent_files, vec!["src/lib.rs"]);
        assert_eq!(me.activity.last_tool_call.as_deref(), Some("bash"));
        assert_eq!(me.activity.current.as_deref(), Some("bash"));

        let kinds: Vec<FeedKind> = a.feed.read(None).unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&FeedKind::Edit));
        assert!(kinds.contains(&FeedKind::Test));
        assert!(kinds.contains(&FeedKind::Commit));
    }

    #[test]
    fn presence_reports_claims_and_reservations_as_commitments() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        a.join(Some("A"), None, Some("SPEC.md"), false).unwrap();
        a.claim(None, "TASK-1", None).unwrap();

        let presence = a.presence().unwrap();
        assert_eq!(presence.len(), 1);
        assert!(presence[0].has_claim);
        assert_eq!(presence[0].status, PresenceStatus::Active);
    }

    #[test]
    fn leave_cleans_up_and_leaves_feed_trail() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        a.join(Some("A"), None, None, false).unwrap();
        let name = a.leave().unwrap();
        assert_eq!(name, "A");
        assert!(a.registry.read("A").is_none());

        let kinds: Vec<FeedKind> = a.feed.read(None).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![FeedKind::Join, FeedKind::Leave]);
    }
}
