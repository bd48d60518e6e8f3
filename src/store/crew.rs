use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{PimError, Result};
use crate::git;
use crate::store::atomic;
use crate::store::paths::CrewPaths;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ship,
    NeedsWork,
    MajorRethink,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ship => write!(f, "SHIP"),
            Self::NeedsWork => write!(f, "NEEDS_WORK"),
            Self::MajorRethink => write!(f, "MAJOR_RETHINK"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Evidence {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prs: Vec<String>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.tests.is_empty() && self.prs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewTask {
    pub id: u32,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Evidence::is_empty")]
    pub evidence: Evidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review: Option<ReviewRecord>,
}

impl CrewTask {
    /// The canonical task reference, e.g. `task-3`.
    pub fn reference(&self) -> String {
        task_ref(self.id)
    }
}

pub fn task_ref(id: u32) -> String {
    format!("task-{id}")
}

/// Parse `task-3`, `task 3`, or a bare `3`.
pub fn parse_task_ref(input: &str) -> Option<u32> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("task-")
        .or_else(|| trimmed.strip_prefix("task "))
        .unwrap_or(trimmed);
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub prd_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub task_count: u32,
    #[serde(default)]
    pub completed_count: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub missing_deps: Vec<(u32, u32)>,
    pub cycles: Vec<u32>,
    pub task_count_fixed: bool,
    pub completed_count_fixed: bool,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing_deps.is_empty()
            && self.cycles.is_empty()
            && !self.task_count_fixed
            && !self.completed_count_fixed
    }
}

fn transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    let allowed = match from {
        TaskStatus::Todo => matches!(to, TaskStatus::InProgress | TaskStatus::Todo),
        TaskStatus::InProgress => matches!(to, TaskStatus::Done | TaskStatus::Blocked | TaskStatus::Todo),
        TaskStatus::Blocked => matches!(to, TaskStatus::Todo),
        TaskStatus::Done => matches!(to, TaskStatus::Todo),
    };
    if allowed {
        Ok(())
    } else {
        Err(PimError::InvalidStatus {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Plan + task persistence under `<project>/.pi/messenger/crew`. One plan per
/// project; tasks are integer-sequential JSON files with markdown spec
/// sidecars.
pub struct CrewStore {
    paths: CrewPaths,
}

impl CrewStore {
    pub fn new(paths: CrewPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &CrewPaths {
        &self.paths
    }

    // -- plan ----------------------------------------------------------------

    pub fn load_plan(&self) -> Option<Plan> {
        atomic::read_json_opt(&self.paths.plan_json())
    }

    pub fn create_plan(&self, prd_path: &str) -> Result<Plan> {
        if let Some(existing) = self.load_plan() {
            return Err(PimError::PlanExists(existing.prd_path));
        }
        self.paths.ensure_dirs()?;
        let now = Utc::now();
        let plan = Plan {
            prd_path: prd_path.into(),
            created_at: now,
            updated_at: now,
            task_count: 0,
            completed_count: 0,
        };
        atomic::write_json_atomic(&self.paths.plan_json(), &plan)?;
        Ok(plan)
    }

    pub fn save_plan(&self, plan: &Plan) -> Result<()> {
        let mut plan = plan.clone();
        plan.updated_at = Utc::now();
        atomic::write_json_atomic(&self.paths.plan_json(), &plan)
    }

    /// Roll back a plan created earlier in the same call (planner failure).
    pub fn delete_plan(&self) -> Result<()> {
        for path in [self.paths.plan_json(), self.paths.plan_md()] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub fn write_plan_md(&self, content: &str) -> Result<()> {
        self.paths.ensure_dirs()?;
        atomic::write_bytes_atomic(&self.paths.plan_md(), content.as_bytes())
    }

    pub fn read_plan_md(&self) -> Option<String> {
        fs::read_to_string(self.paths.plan_md()).ok()
    }

    // -- tasks ---------------------------------------------------------------

    /// Ids are allocated by scanning existing task files and taking max + 1.
    pub fn next_task_id(&self) -> Result<u32> {
        Ok(self.task_ids()?.into_iter().max().unwrap_or(0) + 1)
    }

    pub fn task_ids(&self) -> Result<Vec<u32>> {
        let dir = self.paths.tasks_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json")
                && let Some(id) = parse_task_ref(stem)
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn create_task(&self, title: &str, spec: &str, depends_on: Vec<u32>) -> Result<CrewTask> {
        self.paths.ensure_dirs()?;
        let existing: HashSet<u32> = self.task_ids()?.into_iter().collect();
        for dep in &depends_on {
            if !existing.contains(dep) {
                return Err(PimError::DependencyNotFound(task_ref(*dep)));
            }
        }

        let id = self.next_task_id()?;
        let now = Utc::now();
        let mut depends_on = depends_on;
        depends_on.sort_unstable();
        depends_on.dedup();
        let task = CrewTask {
            id,
            title: title.trim().to_string(),
            status: TaskStatus::Todo,
            depends_on,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            base_commit: None,
            assigned_to: None,
            summary: None,
            evidence: Evidence::default(),
            blocked_reason: None,
            attempt_count: 0,
            last_review: None,
        };
        atomic::write_json_atomic(&self.paths.task_json(id), &task)?;
        atomic::write_bytes_atomic(&self.paths.task_md(id), spec.as_bytes())?;

        if let Some(mut plan) = self.load_plan() {
            plan.task_count += 1;
            self.save_plan(&plan)?;
        }
        Ok(task)
    }

    pub fn read_task(&self, id: u32) -> Result<CrewTask> {
        atomic::read_json_opt(&self.paths.task_json(id))
            .ok_or_else(|| PimError::TaskNotFound(task_ref(id)))
    }

    pub fn write_task(&self, task: &CrewTask) -> Result<()> {
        let mut task = task.clone();
        task.updated_at = Utc::now();
        atomic::write_json_atomic(&self.paths.task_json(task.id), &task)
    }

    pub fn list_tasks(&self) -> Result<Vec<CrewTask>> {
        self.task_ids()?
            .into_iter()
            .map(|id| self.read_task(id))
            .collect()
    }

    pub fn read_task_spec(&self, id: u32) -> Option<String> {
        fs::read_to_string(self.paths.task_md(id)).ok()
    }

    /// Append a section to a task spec; existing content is never replaced.
    pub fn append_task_spec(&self, id: u32, section: &str) -> Result<()> {
        let mut content = self.read_task_spec(id).unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push('\n');
        content.push_str(section.trim_end());
        content.push('\n');
        atomic::write_bytes_atomic(&self.paths.task_md(id), content.as_bytes())
    }

    /// Rewrite a task's dependency list (used by the post-parse resolution
    /// pass). References must exist and must not introduce a cycle.
    pub fn set_dependencies(&self, id: u32, depends_on: Vec<u32>) -> Result<CrewTask> {
        let existing: HashSet<u32> = self.task_ids()?.into_iter().collect();
        for dep in &depends_on {
            if !existing.contains(dep) {
                return Err(PimError::DependencyNotFound(task_ref(*dep)));
            }
        }
        let mut task = self.read_task(id)?;
        let mut depends_on = depends_on;
        depends_on.sort_unstable();
        depends_on.dedup();
        depends_on.retain(|d| *d != id);
        task.depends_on = depends_on;
        self.write_task(&task)?;

        let report = self.check_cycles()?;
        if let Some(node) = report.first() {
            // Undo the edge set that created the cycle.
            let mut task = self.read_task(id)?;
            task.depends_on.clear();
            self.write_task(&task)?;
            return Err(PimError::DependencyCycle(task_ref(*node)));
        }
        self.read_task(id)
    }

    // -- lifecycle -----------------------------------------------------------

    /// todo -> in_progress. Records the base git commit on first start and
    /// bumps the attempt counter every time (retries included).
    pub fn start_task(&self, id: u32, agent: Option<&str>, repo_root: &Path) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        transition(task.status, TaskStatus::InProgress)?;

        let pending = self.unmet_dependencies(&task)?;
        if !pending.is_empty() {
            return Err(PimError::UnmetDependencies {
                task: task.reference(),
                pending: pending
                    .iter()
                    .map(|d| task_ref(*d))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        task.status = TaskStatus::InProgress;
        task.attempt_count += 1;
        task.started_at = Some(Utc::now());
        if let Some(agent) = agent {
            task.assigned_to = Some(agent.into());
        }
        if task.base_commit.is_none() {
            task.base_commit = git::head_sha(repo_root);
        }
        self.write_task(&task)?;
        self.read_task(id)
    }

    /// in_progress -> done.
    pub fn complete_task(
        &self,
        id: u32,
        summary: Option<&str>,
        evidence: Evidence,
    ) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        transition(task.status, TaskStatus::Done)?;

        task.status = TaskStatus::Done;
        task.completed_at = Some(Utc::now());
        if let Some(summary) = summary {
            task.summary = Some(summary.into());
        }
        if !evidence.is_empty() {
            task.evidence = evidence;
        }
        task.blocked_reason = None;
        self.write_task(&task)?;

        if let Some(mut plan) = self.load_plan() {
            plan.completed_count += 1;
            self.save_plan(&plan)?;
        }
        self.read_task(id)
    }

    /// in_progress -> blocked, with the reason written to `blocks/task-N.md`.
    pub fn block_task(&self, id: u32, reason: &str) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        transition(task.status, TaskStatus::Blocked)?;

        task.status = TaskStatus::Blocked;
        task.blocked_reason = Some(reason.into());
        self.write_task(&task)?;

        fs::create_dir_all(self.paths.blocks_dir())?;
        let note = format!(
            "# {} blocked\n\n{}\n\n_recorded {}_\n",
            task.reference(),
            reason,
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        atomic::write_bytes_atomic(&self.paths.block_md(id), note.as_bytes())?;
        self.read_task(id)
    }

    /// blocked -> todo.
    pub fn unblock_task(&self, id: u32) -> Result<CrewTask> {
        let mut task = self.read_task(id)?;
        if task.status != TaskStatus::Blocked {
            return Err(PimError::InvalidStatus {
                from: task.status.to_string(),
                to: TaskStatus::Todo.to_string(),
            });
        }

        task.status = TaskStatus::Todo;
        task.blocked_reason = None;
        self.write_task(&task)?;
        self.read_task(id)
    }

    /// any -> todo, optionally cascading to transitive dependents. Attempt
    /// counts survive resets so retry caps stay meaningful.
    pub fn reset_task(&self, id: u32, cascade: bool) -> Result<Vec<u32>> {
        let mut to_reset = vec![id];
        if cascade {
            let tasks = self.list_tasks()?;
            let mut frontier = vec![id];
            while let Some(current) = frontier.pop() {
                for task in &tasks {
                    if task.depends_on.contains(&current) && !to_reset.contains(&task.id) {
                        to_reset.push(task.id);
                        frontier.push(task.id);
                    }
                }
            }
        }

        let mut was_done = 0u32;
        for reset_id in &to_reset {
            let mut task = self.read_task(*reset_id)?;
            if task.status == TaskStatus::Done {
                was_done += 1;
            }
            task.status = TaskStatus::Todo;
            task.assigned_to = None;
            task.started_at = None;
            task.completed_at = None;
            task.summary = None;
            task.evidence = Evidence::default();
            task.blocked_reason = None;
            self.write_task(&task)?;
        }

        if was_done > 0
            && let Some(mut plan) = self.load_plan()
        {
            plan.completed_count = plan.completed_count.saturating_sub(was_done);
            self.save_plan(&plan)?;
        }
        Ok(to_reset)
    }

    // -- readiness & validation ----------------------------------------------

    fn unmet_dependencies(&self, task: &CrewTask) -> Result<Vec<u32>> {
        let mut pending = Vec::new();
        for dep in &task.depends_on {
            let dep_task = self.read_task(*dep)?;
            if dep_task.status != TaskStatus::Done {
                pending.push(*dep);
            }
        }
        Ok(pending)
    }

    /// A task is ready iff it is `todo` and every dependency is `done`.
    pub fn ready_tasks(&self) -> Result<Vec<CrewTask>> {
        let tasks = self.list_tasks()?;
        let done: HashSet<u32> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id)
            .collect();
        Ok(tasks
            .into_iter()
            .filter(|t| {
                t.status == TaskStatus::Todo && t.depends_on.iter().all(|d| done.contains(d))
            })
            .collect())
    }

    /// DFS with an explicit recursion stack; returns tasks on a cycle.
    fn check_cycles(&self) -> Result<Vec<u32>> {
        let tasks = self.list_tasks()?;
        let ids: HashSet<u32> = tasks.iter().map(|t| t.id).collect();
        let mut visited: HashSet<u32> = HashSet::new();
        let mut on_stack: HashSet<u32> = HashSet::new();
        let mut cyclic: Vec<u32> = Vec::new();

        fn visit(
            id: u32,
            tasks: &[CrewTask],
            ids: &HashSet<u32>,
            visited: &mut HashSet<u32>,
            on_stack: &mut HashSet<u32>,
            cyclic: &mut Vec<u32>,
        ) {
            if on_stack.contains(&id) {
                if !cyclic.contains(&id) {
                    cyclic.push(id);
                }
                return;
            }
            if !visited.insert(id) {
                return;
            }
            on_stack.insert(id);
            if let Some(task) = tasks.iter().find(|t| t.id == id) {
                for dep in &task.depends_on {
                    if ids.contains(dep) {
                        visit(*dep, tasks, ids, visited, on_stack, cyclic);
                    }
                }
            }
            on_stack.remove(&id);
        }

        for task in &tasks {
            visit(task.id, &tasks, &ids, &mut visited, &mut on_stack, &mut cyclic);
        }
        cyclic.sort_unstable();
        Ok(cyclic)
    }

    /// Validate dependency references and acyclicity, and resync the plan's
    /// eventually-consistent counters.
    pub fn validate(&self) -> Result<ValidationReport> {
        let tasks = self.list_tasks()?;
        let ids: HashSet<u32> = tasks.iter().map(|t| t.id).collect();

        let mut report = ValidationReport {
            cycles: self.check_cycles()?,
            ..Default::default()
        };
        for task in &tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep) {
                    report.missing_deps.push((task.id, *dep));
                }
            }
        }

        if let Some(mut plan) = self.load_plan() {
            let task_count = tasks.len() as u32;
            let completed_count =
                tasks.iter().filter(|t| t.status == TaskStatus::Done).count() as u32;
            report.task_count_fixed = plan.task_count != task_count;
            report.completed_count_fixed = plan.completed_count != completed_count;
            if report.task_count_fixed || report.completed_count_fixed {
                plan.task_count = task_count;
                plan.completed_count = completed_count;
                self.save_plan(&plan)?;
            }
        }
        Ok(report)
    }
}
