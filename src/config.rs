use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::naming::{NameTheme, NameWords};
use crate::store::atomic;

/// Explicit agent name override. Collisions fail immediately, never retried.
pub const NAME_ENV: &str = "PI_MESSENGER_NAME";
/// Stable per-process session identifier provided by the host runtime.
pub const SESSION_ENV: &str = "PI_SESSION_ID";
/// Set on spawned crew children; crew actions refuse to recurse when present.
pub const CREW_CHILD_ENV: &str = "PI_MESSENGER_CREW_CHILD";

pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 900;

fn default_true() -> bool {
    true
}
fn default_stuck_threshold() -> u64 {
    DEFAULT_STUCK_THRESHOLD_SECS
}
fn default_scouts() -> u32 {
    3
}
fn default_workers() -> u32 {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_waves() -> u32 {
    5
}
fn default_max_iterations() -> u32 {
    2
}
fn default_max_passes() -> u32 {
    3
}
fn default_cleanup_days() -> u32 {
    7
}

/// User configuration at `~/.pi/agent/pi-messenger.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessengerConfig {
    pub auto_register: bool,
    pub auto_register_paths: Vec<String>,
    pub scope_to_folder: bool,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u64,
    pub name_theme: NameTheme,
    pub name_words: Option<NameWords>,
    pub registration_context: Option<String>,
    pub reply_hint: Option<String>,
    #[serde(default = "default_true")]
    pub sender_details_on_first_contact: bool,
    pub crew: CrewConfig,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            auto_register: false,
            auto_register_paths: Vec::new(),
            scope_to_folder: false,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD_SECS,
            name_theme: NameTheme::default(),
            name_words: None,
            registration_context: None,
            reply_hint: None,
            sender_details_on_first_contact: true,
            crew: CrewConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrewConfig {
    pub concurrency: ConcurrencyConfig,
    pub work: WorkConfig,
    pub review: ReviewConfig,
    pub planning: PlanningConfig,
    pub artifacts: ArtifactsConfig,
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            work: WorkConfig::default(),
            review: ReviewConfig::default(),
            planning: PlanningConfig::default(),
            artifacts: ArtifactsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_scouts")]
    pub scouts: u32,
    #[serde(default = "default_workers")]
    pub workers: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            scouts: default_scouts(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_task: u32,
    #[serde(default = "default_max_waves")]
    pub max_waves: u32,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_task: default_max_attempts(),
            max_waves: default_max_waves(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanningConfig {
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_passes: default_max_passes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u32,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_days: default_cleanup_days(),
        }
    }
}

/// Partial crew override at `<project>/.pi/messenger/crew/config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProjectCrewOverride {
    concurrency: Option<ConcurrencyConfig>,
    work: Option<WorkConfig>,
    review: Option<ReviewConfig>,
    planning: Option<PlanningConfig>,
    artifacts: Option<ArtifactsConfig>,
}

impl MessengerConfig {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pi")
            .join("agent")
            .join("pi-messenger.json")
    }

    /// Load the user config; a missing or malformed file yields defaults.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Self {
        atomic::read_json_opt(path).unwrap_or_default()
    }

    /// Overlay project-level crew settings, section by section.
    pub fn apply_project_overrides(&mut self, crew_config_path: &Path) {
        let Some(overrides) = atomic::read_json_opt::<ProjectCrewOverride>(crew_config_path)
        else {
            return;
        };
        if let Some(c) = overrides.concurrency {
            self.crew.concurrency = c;
        }
        if let Some(w) = overrides.work {
            self.crew.work = w;
        }
        if let Some(r) = overrides.review {
            self.crew.review = r;
        }
        if let Some(p) = overrides.planning {
            self.crew.planning = p;
        }
        if let Some(a) = overrides.artifacts {
            self.crew.artifacts = a;
        }
    }

    /// Whether auto-registration applies in `cwd`. An empty pattern list
    /// means "everywhere" when `autoRegister` is on. Patterns support `~`
    /// and `*` expansion.
    pub fn auto_register_matches(&self, cwd: &Path) -> bool {
        if !self.auto_register {
            return false;
        }
        if self.auto_register_paths.is_empty() {
            return true;
        }
        self.auto_register_paths
            .iter()
            .any(|pattern| pattern_matches(pattern, cwd))
    }
}

fn expand_tilde(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{rest}", home.display());
        }
    }
    pattern.to_string()
}

fn pattern_matches(pattern: &str, cwd: &Path) -> bool {
    let expanded = expand_tilde(pattern);
    match glob::Pattern::new(&expanded) {
        Ok(p) => p.matches_path(cwd),
        // A non-glob literal still matches by prefix-equality.
        Err(_) => cwd.starts_with(&expanded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_spec_defaults() {
        let cfg = MessengerConfig::default();
        assert!(!cfg.auto_register);
        assert_eq!(cfg.stuck_threshold, 900);
        assert_eq!(cfg.name_theme, NameTheme::Default);
        assert!(cfg.sender_details_on_first_contact);
        assert_eq!(cfg.crew.concurrency.scouts, 3);
        assert_eq!(cfg.crew.concurrency.workers, 2);
        assert_eq!(cfg.crew.work.max_attempts_per_task, 3);
        assert_eq!(cfg.crew.work.max_waves, 5);
        assert!(cfg.crew.review.enabled);
        assert_eq!(cfg.crew.planning.max_passes, 3);
        assert!(cfg.crew.artifacts.enabled);
        assert_eq!(cfg.crew.artifacts.cleanup_days, 7);
    }

    #[test]
    fn loads_camel_case_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pi-messenger.json");
        fs::write(
            &path,
            r#"{
                "autoRegister": true,
                "scopeToFolder": true,
                "stuckThreshold": 300,
                "nameTheme": "space",
                "crew": {"concurrency": {"workers": 4}}
            }"#,
        )
        .unwrap();
        let cfg = MessengerConfig::load_from(&path);
        assert!(cfg.auto_register);
        assert!(cfg.scope_to_folder);
        assert_eq!(cfg.stuck_threshold, 300);
        assert_eq!(cfg.name_theme, NameTheme::Space);
        assert_eq!(cfg.crew.concurrency.workers, 4);
        // Untouched sections keep defaults.
        assert_eq!(cfg.crew.concurrency.scouts, 3);
        assert_eq!(cfg.crew.work.max_waves, 5);
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pi-messenger.json");
        fs::write(&path, "{ not json").unwrap();
        let cfg = MessengerConfig::load_from(&path);
        assert_eq!(cfg.stuck_threshold, 900);
    }

    #[test]
    fn project_overrides_replace_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"work": {"maxWaves": 9, "maxAttemptsPerTask": 1}}"#).unwrap();

        let mut cfg = MessengerConfig::default();
        cfg.apply_project_overrides(&path);
        assert_eq!(cfg.crew.work.max_waves, 9);
        assert_eq!(cfg.crew.work.max_attempts_per_task, 1);
        assert_eq!(cfg.crew.planning.max_passes, 3);
    }

    #[test]
    fn auto_register_path_globbing() {
        let mut cfg = MessengerConfig {
            auto_register: true,
            ..Default::default()
        };
        assert!(cfg.auto_register_matches(Path::new("/anywhere")));

        cfg.auto_register_paths = vec!["/work/*".into()];
        assert!(cfg.auto_register_matches(Path::new("/work/project")));
        assert!(!cfg.auto_register_matches(Path::new("/home/other")));

        cfg.auto_register = false;
        assert!(!cfg.auto_register_matches(Path::new("/work/project")));
    }
}
