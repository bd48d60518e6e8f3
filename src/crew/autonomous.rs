use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::atomic;
use crate::store::paths::CrewPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Blocked,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveRecord {
    pub wave: u32,
    pub attempted: Vec<u32>,
    pub succeeded: Vec<u32>,
    pub failed: Vec<u32>,
    pub blocked: Vec<u32>,
    pub at: DateTime<Utc>,
}

/// Cross-turn state of an autonomous `work` run, persisted per project and
/// resumed on the next invocation.
///
/// `next_wave` is advanced when a wave result is recorded, so between turns
/// it reads as the number the *next* wave will carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousState {
    pub active: bool,
    pub cwd: String,
    pub next_wave: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attempts: BTreeMap<u32, u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waves: Vec<WaveRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl AutonomousState {
    pub fn start(cwd: &str) -> Self {
        Self {
            active: true,
            cwd: cwd.into(),
            next_wave: 1,
            attempts: BTreeMap::new(),
            waves: Vec::new(),
            started_at: Utc::now(),
            stopped_at: None,
            stop_reason: None,
        }
    }

    pub fn record_wave(&mut self, mut record: WaveRecord) {
        record.wave = self.next_wave;
        for task in &record.attempted {
            *self.attempts.entry(*task).or_insert(0) += 1;
        }
        self.waves.push(record);
        self.next_wave += 1;
    }

    pub fn stop(&mut self, reason: StopReason) {
        self.active = false;
        self.stopped_at = Some(Utc::now());
        self.stop_reason = Some(reason);
    }

    /// Waves completed so far.
    pub fn waves_run(&self) -> u32 {
        self.next_wave.saturating_sub(1)
    }
}

/// Persistence for [`AutonomousState`] at `crew/autonomous.json`.
pub struct AutonomousStore {
    paths: CrewPaths,
}

impl AutonomousStore {
    pub fn new(paths: CrewPaths) -> Self {
        Self { paths }
    }

    pub fn load(&self) -> Option<AutonomousState> {
        atomic::read_json_opt(&self.paths.autonomous_json())
    }

    pub fn save(&self, state: &AutonomousState) -> Result<()> {
        atomic::write_json_atomic(&self.paths.autonomous_json(), state)
    }

    /// The state to continue with: the persisted one if it is active and was
    /// started in the same cwd, otherwise a fresh run.
    pub fn resume_or_start(&self, cwd: &str) -> AutonomousState {
        match self.load() {
            Some(state) if state.active && state.cwd == cwd => state,
            _ => AutonomousState::start(cwd),
        }
    }
}
