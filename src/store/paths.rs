use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Environment override for the shared mesh base directory.
pub const BASE_DIR_ENV: &str = "PI_MESSENGER_DIR";

/// Layout of the shared mesh base directory (default `~/.pi/agent/messenger`).
#[derive(Debug, Clone)]
pub struct MeshPaths {
    base: PathBuf,
}

impl MeshPaths {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Resolve from `PI_MESSENGER_DIR`, falling back to the home default.
    pub fn resolve() -> Self {
        let base = std::env::var(BASE_DIR_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".pi")
                    .join("agent")
                    .join("messenger")
            });
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.registry_dir())?;
        fs::create_dir_all(self.inbox_root())?;
        Ok(())
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.base.join("registry")
    }

    pub fn registration_path(&self, name: &str) -> PathBuf {
        self.registry_dir().join(format!("{name}.json"))
    }

    pub fn inbox_root(&self) -> PathBuf {
        self.base.join("inbox")
    }

    /// Inboxes are keyed by session id, never by name, so renames keep
    /// pending messages.
    pub fn inbox_dir(&self, session_id: &str) -> PathBuf {
        self.inbox_root().join(session_id)
    }

    pub fn deadletter_dir(&self, session_id: &str) -> PathBuf {
        self.inbox_dir(session_id).join(".deadletter")
    }

    pub fn claims_path(&self) -> PathBuf {
        self.base.join("claims.json")
    }

    pub fn completions_path(&self) -> PathBuf {
        self.base.join("completions.json")
    }

    pub fn swarm_lock_path(&self) -> PathBuf {
        self.base.join("swarm.lock")
    }

    pub fn feed_path(&self) -> PathBuf {
        self.base.join("feed.jsonl")
    }

    pub fn feed_lock_path(&self) -> PathBuf {
        self.base.join("feed.lock")
    }
}

/// Layout of the per-project crew directory `<project>/.pi/messenger/crew`.
#[derive(Debug, Clone)]
pub struct CrewPaths {
    root: PathBuf,
}

impl CrewPaths {
    pub fn for_project(project_root: &Path) -> Self {
        Self {
            root: project_root.join(".pi").join("messenger").join("crew"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.tasks_dir())?;
        fs::create_dir_all(self.blocks_dir())?;
        Ok(())
    }

    pub fn plan_json(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    pub fn plan_md(&self) -> PathBuf {
        self.root.join("plan.md")
    }

    pub fn plan_lock(&self) -> PathBuf {
        self.root.join("plan.lock")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn task_json(&self, id: u32) -> PathBuf {
        self.tasks_dir().join(format!("task-{id}.json"))
    }

    pub fn task_md(&self, id: u32) -> PathBuf {
        self.tasks_dir().join(format!("task-{id}.md"))
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    pub fn block_md(&self, id: u32) -> PathBuf {
        self.blocks_dir().join(format!("task-{id}.md"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.artifacts_dir().join(run_id)
    }

    pub fn progress_md(&self) -> PathBuf {
        self.root.join("planning-progress.md")
    }

    pub fn interview_json(&self) -> PathBuf {
        self.root.join("interview-questions.json")
    }

    pub fn config_json(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn autonomous_json(&self) -> PathBuf {
        self.root.join("autonomous.json")
    }
}
