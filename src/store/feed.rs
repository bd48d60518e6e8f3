use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::lock;
use crate::store::paths::MeshPaths;

/// Default retained feed length.
pub const FEED_RETENTION: usize = 500;
/// Appends beyond retention by this much trigger a compacting rewrite.
const FEED_SLACK: usize = 100;

/// Closed set of feed event kinds; unknown kinds fail deserialization and
/// are skipped by the lenient reader, so formatting is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Join,
    Leave,
    Message,
    Edit,
    Commit,
    Test,
    Reserve,
    Release,
    Stuck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub ts: DateTime<Utc>,
    pub agent: String,
    pub kind: FeedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FeedEvent {
    pub fn now(agent: &str, kind: FeedKind) -> Self {
        Self {
            ts: Utc::now(),
            agent: agent.into(),
            kind,
            target: None,
            detail: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One human-readable line per event. Exhaustive over [`FeedKind`].
pub fn format_line(event: &FeedEvent) -> String {
    let ts = event.ts.format("%H:%M:%S");
    let agent = &event.agent;
    let target = event.target.as_deref().unwrap_or("?");
    let body = match event.kind {
        FeedKind::Join => "joined the mesh".to_string(),
        FeedKind::Leave => "left the mesh".to_string(),
        FeedKind::Message => format!("messaged {target}"),
        FeedKind::Edit => format!("edited {target}"),
        FeedKind::Commit => match &event.detail {
            Some(detail) => format!("committed: {detail}"),
            None => "committed".to_string(),
        },
        FeedKind::Test => match &event.detail {
            Some(detail) => format!("ran tests ({detail})"),
            None => "ran tests".to_string(),
        },
        FeedKind::Reserve => format!("reserved {target}"),
        FeedKind::Release => format!("released {target}"),
        FeedKind::Stuck => "appears stuck".to_string(),
    };
    format!("{ts} {agent} {body}")
}

/// Append-only JSONL activity log with bounded retention, guarded by an
/// advisory lock on `feed.lock`.
pub struct FeedStore {
    paths: MeshPaths,
    retention: usize,
}

impl FeedStore {
    pub fn new(paths: MeshPaths) -> Self {
        Self {
            paths,
            retention: FEED_RETENTION,
        }
    }

    pub fn with_retention(paths: MeshPaths, retention: usize) -> Self {
        Self { paths, retention }
    }

    pub fn append(&self, event: &FeedEvent) -> Result<()> {
        let guard = lock::acquire_flock(&self.paths.feed_lock_path())?;
        let path = self.paths.feed_path();
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        drop(file);
        self.compact_if_needed(&path)?;
        lock::release_flock(guard)?;
        Ok(())
    }

    fn compact_if_needed(&self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= self.retention + FEED_SLACK {
            return Ok(());
        }
        let keep = &lines[lines.len() - self.retention..];
        let mut rewritten = keep.join("\n");
        rewritten.push('\n');
        fs::write(path, rewritten)?;
        Ok(())
    }

    /// Read events, optionally only the last `limit`. Malformed lines are
    /// skipped.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<FeedEvent>> {
        let path = self.paths.feed_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&path)?;
        let mut events: Vec<FeedEvent> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if let Some(n) = limit {
            let len = events.len();
            if len > n {
                events = events.split_off(len - n);
            }
        }
        Ok(events)
    }
}

/// Per-file debounce for edit events (5 s per file).
pub struct EditDebounce {
    window: Duration,
    last: HashMap<String, Instant>,
}

impl Default for EditDebounce {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            last: HashMap::new(),
        }
    }
}

impl EditDebounce {
    pub fn should_emit(&mut self, path: &str) -> bool {
        let now = Instant::now();
        match self.last.get(path) {
            Some(prev) if now.duration_since(*prev) < self.window => false,
            _ => {
                self.last.insert(path.into(), now);
                true
            }
        }
    }
}

/// Feed-relevant classification of a bash tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Commit,
    Test,
}

const TEST_PATTERNS: &[&str] = &[
    "cargo test",
    "cargo nextest",
    "npm test",
    "npm run test",
    "pnpm test",
    "yarn test",
    "pytest",
    "go test",
    "jest",
    "vitest",
    "make test",
];

/// Pattern-match a shell command for commit/test feed events.
pub fn classify_command(command: &str) -> Option<CommandKind> {
    let cmd = command.trim();
    if cmd.starts_with("git commit") || cmd.contains("&& git commit") || cmd.contains("; git commit")
    {
        return Some(CommandKind::Commit);
    }
    if TEST_PATTERNS.iter().any(|p| cmd.contains(p)) {
        return Some(CommandKind::Test);
    }
    None
}
