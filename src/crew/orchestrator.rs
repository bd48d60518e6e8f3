use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use serde::Serialize;

use crate::config::{CREW_CHILD_ENV, CrewConfig};
use crate::crew::autonomous::{AutonomousState, AutonomousStore, StopReason, WaveRecord};
use crate::crew::parse;
use crate::crew::spawner::{AgentOutcome, AgentRequest, AgentRole, AgentRunner, run_wave};
use crate::error::{PimError, Result};
use crate::git;
use crate::store::crew::{
    CrewStore, CrewTask, Evidence, ReviewRecord, TaskStatus, Verdict, task_ref,
};
use crate::store::lock;
use crate::store::paths::CrewPaths;

const PRD_CANDIDATES: &[&str] = &["PRD.md", "SPEC.md", "REQUIREMENTS.md", "DESIGN.md", "PLAN.md"];
const PRD_MAX_BYTES: usize = 100 * 1024;
const PROGRESS_PROMPT_MAX: usize = 50 * 1024;
const DIFF_MAX_BYTES: usize = 50 * 1024;
const PLAN_SLICE_MAX: usize = 16 * 1024;
const TASK_PREVIEW_MAX: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub prd_path: String,
    pub passes: u32,
    pub task_ids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_verdict: Option<Verdict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkOutcome {
    pub attempted: Vec<u32>,
    pub succeeded: Vec<u32>,
    pub failed: Vec<u32>,
    pub blocked: Vec<u32>,
    pub attempt_capped: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous: Option<AutonomousOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutonomousOutcome {
    /// The number the next wave will carry (advanced when a wave records).
    pub next_wave: u32,
    pub continue_work: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub target: String,
    pub verdict: Verdict,
    pub summary: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub task: String,
    pub updated: Vec<String>,
}

/// Drives the plan / work / review / interview / sync actions: reads crew
/// state, fans out child agents through the spawner, and writes results back.
pub struct Orchestrator<'a> {
    store: CrewStore,
    autonomous: AutonomousStore,
    runner: &'a dyn AgentRunner,
    config: CrewConfig,
    project_root: PathBuf,
}

impl<'a> Orchestrator<'a> {
    pub fn new(project_root: &Path, runner: &'a dyn AgentRunner, config: CrewConfig) -> Self {
        let paths = CrewPaths::for_project(project_root);
        Self {
            store: CrewStore::new(paths.clone()),
            autonomous: AutonomousStore::new(paths),
            runner,
            config,
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn store(&self) -> &CrewStore {
        &self.store
    }

    fn guard_recursion() -> Result<()> {
        if std::env::var_os(CREW_CHILD_ENV).is_some() {
            return Err(PimError::CrewRecursion);
        }
        Ok(())
    }

    fn run_id() -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        format!("run-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &token[..8])
    }

    fn request(&self, role: AgentRole, label: &str, index: usize, prompt: String) -> AgentRequest {
        AgentRequest {
            role,
            label: label.to_string(),
            index,
            prompt,
            cwd: self.project_root.clone(),
            max_output: None,
        }
    }

    // -- prd discovery -------------------------------------------------------

    fn discover_prd(&self, explicit: Option<&str>) -> Result<(String, String)> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(explicit) = explicit {
            candidates.push(self.project_root.join(explicit));
        } else {
            for name in PRD_CANDIDATES {
                candidates.push(self.project_root.join(name));
            }
            for name in PRD_CANDIDATES {
                candidates.push(self.project_root.join("docs").join(name));
            }
        }

        // Case-insensitive filesystems can surface one file under several
        // candidate names; dedup on the canonical path.
        let mut seen: HashSet<PathBuf> = HashSet::new();
        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }
            let canonical = fs::canonicalize(&candidate).unwrap_or_else(|_| candidate.clone());
            if !seen.insert(canonical) {
                continue;
            }
            let content = fs::read_to_string(&candidate)?;
            let content = if content.len() > PRD_MAX_BYTES {
                format!("{}\n[PRD truncated]", parse::truncate_head(&content, PRD_MAX_BYTES))
            } else {
                content
            };
            let rel = candidate
                .strip_prefix(&self.project_root)
                .unwrap_or(&candidate)
                .display()
                .to_string();
            return Ok((rel, content));
        }
        Err(PimError::NoPrd)
    }

    // -- plan ----------------------------------------------------------------

    pub fn plan(&self, explicit_prd: Option<&str>) -> Result<PlanOutcome> {
        Self::guard_recursion()?;
        if !self.runner.available() {
            return Err(PimError::NoPlanner);
        }
        self.store.paths().ensure_dirs()?;
        let _lock = lock::acquire_crew_lock(&self.store.paths().plan_lock())?;

        let (prd_path, prd_content) = self.discover_prd(explicit_prd)?;
        self.store.create_plan(&prd_path)?;

        let run_id = Self::run_id();
        let planned = self
            .run_scouts(&run_id)
            .and_then(|_| self.planning_passes(&run_id, &prd_content));
        match planned {
            Ok((final_output, passes, verdict)) => {
                let parsed = parse::parse_tasks(&final_output);
                if parsed.is_empty() {
                    self.store.delete_plan()?;
                    return Err(PimError::PlannerFailed(
                        "planner output contained no tasks".into(),
                    ));
                }

                let mut created: Vec<(u32, String)> = Vec::new();
                for task in &parsed {
                    let created_task =
                        self.store.create_task(&task.title, &task.description, vec![])?;
                    created.push((created_task.id, created_task.title.clone()));
                }
                // Second pass: dependency strings resolve against the full set.
                for (task, (id, _)) in parsed.iter().zip(&created) {
                    let deps: Vec<u32> = task
                        .depends_on
                        .iter()
                        .filter_map(|d| parse::resolve_dependency(d, &created))
                        .collect();
                    if !deps.is_empty() {
                        self.store.set_dependencies(*id, deps)?;
                    }
                }

                self.store.write_plan_md(&final_output)?;
                self.store.validate()?;
                self.cleanup_artifacts();

                Ok(PlanOutcome {
                    prd_path,
                    passes,
                    task_ids: created.into_iter().map(|(id, _)| id).collect(),
                    final_verdict: verdict,
                })
            }
            Err(err) => {
                // Roll back the plan entry created earlier in this call.
                let _ = self.store.delete_plan();
                Err(err)
            }
        }
    }

    /// Survey pass before planning: scouts look at the project from
    /// different angles and their notes seed the progress log. Individual
    /// scout failures are tolerated; losing all of them aborts the plan.
    fn run_scouts(&self, run_id: &str) -> Result<()> {
        let count = self.config.concurrency.scouts.max(1) as usize;
        let requests: Vec<AgentRequest> = (0..count)
            .map(|i| {
                self.request(
                    AgentRole::Scout,
                    &format!("scout-{}", i + 1),
                    i,
                    scout_prompt(i),
                )
            })
            .collect();
        let results = run_wave(self.runner, requests, count, |outcome| {
            tracing::debug!(label = %outcome.label, "scout finished");
        });

        let succeeded: Vec<&AgentOutcome> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .filter(|o| !o.failed())
            .collect();
        if succeeded.is_empty() {
            return Err(PimError::AllScoutsFailed);
        }

        let mut section = format!("## Scout notes ({run_id})\n");
        for outcome in succeeded {
            if outcome.output.trim().is_empty() {
                continue;
            }
            section.push_str(&format!("\n### {}\n\n{}\n", outcome.label, outcome.output));
        }
        self.append_progress(&section)
    }

    fn planning_passes(
        &self,
        run_id: &str,
        prd_content: &str,
    ) -> Result<(String, u32, Option<Verdict>)> {
        let max_passes = self.config.planning.max_passes.max(1);
        let mut last_output = String::new();
        let mut last_review: Option<parse::ParsedReview> = None;
        let mut verdict = None;
        let mut passes = 0;

        for pass in 1..=max_passes {
            passes = pass;
            let progress = self.read_progress();
            let prompt = planner_prompt(
                prd_content,
                &parse::truncate_progress(&progress, PROGRESS_PROMPT_MAX),
            );
            let outcome = self.spawn_one(AgentRole::Analyst, "planner", pass as usize, prompt)?;
            if outcome.failed() {
                return Err(PimError::PlannerFailed(
                    outcome.progress.error.unwrap_or_else(|| "planner failed".into()),
                ));
            }
            last_output = outcome.output;
            self.append_progress(&format!(
                "## Run {} (pass {pass}, {run_id})\n\n{}\n",
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                last_output
            ))?;

            if !self.config.review.enabled || pass == max_passes {
                break;
            }
            let review_prompt = plan_review_prompt(&last_output, last_review.as_ref());
            let review_outcome =
                self.spawn_one(AgentRole::Reviewer, "plan-reviewer", pass as usize, review_prompt)?;
            if review_outcome.failed() {
                tracing::warn!("plan reviewer failed; shipping current pass");
                break;
            }
            let Some(review) = parse::parse_review(&review_outcome.output) else {
                tracing::warn!("plan review had no verdict; shipping current pass");
                break;
            };
            verdict = Some(review.verdict);
            self.append_progress(&format!(
                "### Review (pass {pass}): {}\n\n{}\n",
                review.verdict, review_outcome.output
            ))?;
            if review.verdict == Verdict::Ship {
                break;
            }
            last_review = Some(review);
        }
        Ok((last_output, passes, verdict))
    }

    fn spawn_one(
        &self,
        role: AgentRole,
        label: &str,
        index: usize,
        prompt: String,
    ) -> Result<AgentOutcome> {
        let req = self.request(role, label, index, prompt);
        self.runner.run(&req)
    }

    fn read_progress(&self) -> String {
        fs::read_to_string(self.store.paths().progress_md()).unwrap_or_default()
    }

    fn append_progress(&self, section: &str) -> Result<()> {
        let mut content = self.read_progress();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(section.trim_end());
        content.push('\n');
        crate::store::atomic::write_bytes_atomic(
            &self.store.paths().progress_md(),
            content.as_bytes(),
        )
    }

    // -- work ----------------------------------------------------------------

    pub fn work(&self, autonomous: bool, workers_override: Option<u32>) -> Result<WorkOutcome> {
        Self::guard_recursion()?;
        let Some(_plan) = self.store.load_plan() else {
            return Err(PimError::NoPlan);
        };
        if !self.runner.available() {
            return Err(PimError::NoWorker);
        }

        let cwd = self.project_root.display().to_string();
        let mut state = autonomous.then(|| self.autonomous.resume_or_start(&cwd));

        let max_attempts = self.config.work.max_attempts_per_task.max(1);
        let ready = self.store.ready_tasks()?;
        let (eligible, capped): (Vec<CrewTask>, Vec<CrewTask>) = ready
            .into_iter()
            .partition(|t| t.attempt_count < max_attempts);
        let attempt_capped: Vec<u32> = capped.iter().map(|t| t.id).collect();

        let workers = workers_override.unwrap_or(self.config.concurrency.workers).max(1) as usize;
        let batch: Vec<CrewTask> = eligible.into_iter().take(workers).collect();

        if batch.is_empty() {
            let autonomous_outcome = match state.as_mut() {
                Some(state) => Some(self.evaluate_autonomous(state)?),
                None => None,
            };
            return Ok(WorkOutcome {
                attempted: vec![],
                succeeded: vec![],
                failed: vec![],
                blocked: vec![],
                attempt_capped,
                autonomous: autonomous_outcome,
            });
        }

        let mut requests = Vec::new();
        for (index, task) in batch.iter().enumerate() {
            let started = self
                .store
                .start_task(task.id, Some("worker"), &self.project_root)?;
            let prompt = self.worker_prompt(&started)?;
            requests.push(self.request(AgentRole::Worker, &started.reference(), index, prompt));
        }

        let results = run_wave(self.runner, requests, workers, |outcome| {
            tracing::info!(label = %outcome.label, status = ?outcome.progress.status, "worker finished");
        });

        // Classify by post-execution task status: workers mutate the store
        // through the task actions themselves.
        let mut outcome = WorkOutcome {
            attempted: batch.iter().map(|t| t.id).collect(),
            succeeded: vec![],
            failed: vec![],
            blocked: vec![],
            attempt_capped,
            autonomous: None,
        };
        for (task, result) in batch.iter().zip(&results) {
            let current = self.store.read_task(task.id)?;
            match current.status {
                TaskStatus::Done => outcome.succeeded.push(task.id),
                TaskStatus::Blocked => outcome.blocked.push(task.id),
                _ => {
                    let error = match result {
                        Ok(agent) => agent
                            .progress
                            .error
                            .clone()
                            .unwrap_or_else(|| "worker did not complete the task".into()),
                        Err(err) => err.to_string(),
                    };
                    if state.is_some() {
                        if current.status == TaskStatus::InProgress {
                            self.store.block_task(task.id, &error)?;
                        }
                        outcome.blocked.push(task.id);
                    } else {
                        outcome.failed.push(task.id);
                    }
                }
            }
        }

        if let Some(state) = state.as_mut() {
            state.record_wave(WaveRecord {
                wave: 0,
                attempted: outcome.attempted.clone(),
                succeeded: outcome.succeeded.clone(),
                failed: outcome.failed.clone(),
                blocked: outcome.blocked.clone(),
                at: Utc::now(),
            });
            outcome.autonomous = Some(self.evaluate_autonomous(state)?);
        }
        self.cleanup_artifacts();
        Ok(outcome)
    }

    /// Decide whether an autonomous run continues, and persist its state.
    fn evaluate_autonomous(&self, state: &mut AutonomousState) -> Result<AutonomousOutcome> {
        let tasks = self.store.list_tasks()?;
        let all_done = !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Done);
        let any_in_progress = tasks.iter().any(|t| t.status == TaskStatus::InProgress);
        let ready = self.store.ready_tasks()?;
        let max_waves = self.config.work.max_waves.max(1);

        let stop_reason = if all_done {
            Some(StopReason::Completed)
        } else if ready.is_empty() && !any_in_progress {
            Some(StopReason::Blocked)
        } else if state.waves_run() >= max_waves {
            Some(StopReason::Manual)
        } else {
            None
        };

        if let Some(reason) = stop_reason {
            state.stop(reason);
        }
        self.autonomous.save(state)?;

        Ok(AutonomousOutcome {
            next_wave: state.next_wave,
            continue_work: stop_reason.is_none(),
            stop_reason,
        })
    }

    fn worker_prompt(&self, task: &CrewTask) -> Result<String> {
        let spec = self
            .store
            .read_task_spec(task.id)
            .unwrap_or_else(|| task.title.clone());

        let mut deps = String::new();
        for dep in &task.depends_on {
            let dep_task = self.store.read_task(*dep)?;
            let summary = dep_task.summary.as_deref().unwrap_or("(no summary)");
            deps.push_str(&format!(
                "- {}: {} ({summary})\n",
                task_ref(*dep),
                dep_task.title
            ));
        }

        let mut prompt = format!(
            "You are a crew worker on {task_id}: {title}.\n\n\
             Mark progress with `pim task start/done/block {task_id}`.\n\n\
             ## Task spec\n\n{spec}\n",
            task_id = task.reference(),
            title = task.title,
        );
        if !deps.is_empty() {
            prompt.push_str(&format!("\n## Completed dependencies\n\n{deps}"));
        }
        if task.attempt_count > 1
            && let Some(review) = &task.last_review
        {
            prompt.push_str(&format!(
                "\n## Review feedback from the previous attempt ({})\n\n",
                review.verdict
            ));
            if !review.summary.is_empty() {
                prompt.push_str(&format!("{}\n", review.summary));
            }
            for issue in &review.issues {
                prompt.push_str(&format!("- fix: {issue}\n"));
            }
            for suggestion in &review.suggestions {
                prompt.push_str(&format!("- consider: {suggestion}\n"));
            }
        }
        if let Some(plan_md) = self.store.read_plan_md() {
            prompt.push_str(&format!(
                "\n## Plan context\n\n{}\n",
                parse::truncate_head(&plan_md, PLAN_SLICE_MAX)
            ));
        }
        Ok(prompt)
    }

    // -- review --------------------------------------------------------------

    pub fn review(&self, target: Option<&str>) -> Result<ReviewOutcome> {
        Self::guard_recursion()?;
        if !self.runner.available() {
            return Err(PimError::NoReviewer);
        }
        let plan = self.store.load_plan().ok_or(PimError::NoPlan)?;

        match target {
            Some(target) if target.starts_with("task-") => {
                let id = crate::store::crew::parse_task_ref(target)
                    .ok_or_else(|| PimError::TaskNotFound(target.to_string()))?;
                self.review_implementation(id, &plan.prd_path)
            }
            _ => self.review_plan(),
        }
    }

    fn review_implementation(&self, id: u32, prd_path: &str) -> Result<ReviewOutcome> {
        let task = self.store.read_task(id)?;
        let spec = self.store.read_task_spec(id).unwrap_or_default();

        let (diff, commits) = match &task.base_commit {
            Some(base) => (
                git::diff_since(&self.project_root, base, DIFF_MAX_BYTES)
                    .unwrap_or_else(|| "(no diff available)".into()),
                match git::head_sha(&self.project_root) {
                    Some(head) => git::commits_since(&self.project_root, base, &head),
                    None => vec![],
                },
            ),
            None => ("(task has no base commit)".into(), vec![]),
        };

        let prompt = impl_review_prompt(&task, &spec, prd_path, &diff, &commits);
        let outcome = self.spawn_one(AgentRole::Reviewer, &task.reference(), 0, prompt)?;
        if outcome.failed() {
            return Err(PimError::AnalystFailed(
                outcome.progress.error.unwrap_or_else(|| "reviewer failed".into()),
            ));
        }

        let parsed = parse::parse_review(&outcome.output).unwrap_or(parse::ParsedReview {
            verdict: Verdict::NeedsWork,
            summary: "reviewer output had no verdict".into(),
            issues: vec![],
            suggestions: vec![],
        });

        // Persisted so the next worker attempt sees the feedback.
        let mut task = self.store.read_task(id)?;
        task.last_review = Some(ReviewRecord {
            verdict: parsed.verdict,
            summary: parsed.summary.clone(),
            issues: parsed.issues.clone(),
            suggestions: parsed.suggestions.clone(),
            reviewed_at: Utc::now(),
        });
        self.store.write_task(&task)?;

        Ok(ReviewOutcome {
            target: task.reference(),
            verdict: parsed.verdict,
            summary: parsed.summary,
            issues: parsed.issues,
            suggestions: parsed.suggestions,
        })
    }

    fn review_plan(&self) -> Result<ReviewOutcome> {
        let plan_md = self.store.read_plan_md().unwrap_or_default();
        let mut task_previews = String::new();
        for task in self.store.list_tasks()? {
            let preview = self
                .store
                .read_task_spec(task.id)
                .map(|s| parse::truncate_head(&s, TASK_PREVIEW_MAX))
                .unwrap_or_default();
            task_previews.push_str(&format!(
                "### {}: {} [{}]\n{}\n\n",
                task.reference(),
                task.title,
                task.status,
                preview
            ));
        }

        let prompt = plan_state_review_prompt(&plan_md, &task_previews);
        let outcome = self.spawn_one(AgentRole::Reviewer, "plan", 0, prompt)?;
        if outcome.failed() {
            return Err(PimError::AnalystFailed(
                outcome.progress.error.unwrap_or_else(|| "reviewer failed".into()),
            ));
        }
        let parsed = parse::parse_review(&outcome.output).unwrap_or(parse::ParsedReview {
            verdict: Verdict::NeedsWork,
            summary: "reviewer output had no verdict".into(),
            issues: vec![],
            suggestions: vec![],
        });
        Ok(ReviewOutcome {
            target: "plan".into(),
            verdict: parsed.verdict,
            summary: parsed.summary,
            issues: parsed.issues,
            suggestions: parsed.suggestions,
        })
    }

    // -- interview -----------------------------------------------------------

    pub fn interview(&self) -> Result<Vec<parse::InterviewQuestion>> {
        Self::guard_recursion()?;
        if !self.runner.available() {
            return Err(PimError::NoAnalyst);
        }

        let content = match self.store.read_plan_md() {
            Some(plan_md) => plan_md,
            None => self.discover_prd(None)?.1,
        };
        let prompt = interview_prompt(&content);
        let outcome = self.spawn_one(AgentRole::Analyst, "interview", 0, prompt)?;
        if outcome.failed() {
            return Err(PimError::AnalystFailed(
                outcome.progress.error.unwrap_or_else(|| "interview generator failed".into()),
            ));
        }

        let questions = parse::parse_interview(&outcome.output);
        self.store.paths().ensure_dirs()?;
        crate::store::atomic::write_json_atomic(
            &self.store.paths().interview_json(),
            &serde_json::json!({ "questions": questions }),
        )?;
        Ok(questions)
    }

    // -- sync ----------------------------------------------------------------

    pub fn sync(&self, id: u32) -> Result<SyncOutcome> {
        Self::guard_recursion()?;
        if !self.runner.available() {
            return Err(PimError::NoAnalyst);
        }
        let task = self.store.read_task(id)?;
        if task.status != TaskStatus::Done {
            return Err(PimError::InvalidStatus {
                from: task.status.to_string(),
                to: TaskStatus::Done.to_string(),
            });
        }

        let dependents: Vec<CrewTask> = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| t.depends_on.contains(&id) && t.status == TaskStatus::Todo)
            .collect();
        if dependents.is_empty() {
            return Ok(SyncOutcome {
                task: task.reference(),
                updated: vec![],
            });
        }

        let mut dependent_specs = String::new();
        for dep in &dependents {
            dependent_specs.push_str(&format!(
                "### {}: {}\n{}\n\n",
                dep.reference(),
                dep.title,
                self.store.read_task_spec(dep.id).unwrap_or_default()
            ));
        }
        let prompt = sync_prompt(&task, &dependent_specs);
        let outcome = self.spawn_one(AgentRole::Analyst, "sync", 0, prompt)?;
        if outcome.failed() {
            return Err(PimError::AnalystFailed(
                outcome.progress.error.unwrap_or_else(|| "sync agent failed".into()),
            ));
        }

        let dependent_ids: HashSet<u32> = dependents.iter().map(|t| t.id).collect();
        let mut updated = Vec::new();
        for (target, content) in parse::parse_sync_updates(&outcome.output) {
            let Some(target_id) = crate::store::crew::parse_task_ref(&target) else {
                continue;
            };
            if !dependent_ids.contains(&target_id) {
                tracing::debug!(%target, "sync update targets a non-dependent; skipping");
                continue;
            }
            // Amendments are appended, never replacing the original spec.
            self.store.append_task_spec(
                target_id,
                &format!("## Update after {}\n\n{content}", task.reference()),
            )?;
            updated.push(task_ref(target_id));
        }
        Ok(SyncOutcome {
            task: task.reference(),
            updated,
        })
    }

    // -- artifact retention --------------------------------------------------

    /// Prune artifact run directories older than the configured age.
    fn cleanup_artifacts(&self) {
        if !self.config.artifacts.enabled {
            return;
        }
        let dir = self.store.paths().artifacts_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        let max_age =
            std::time::Duration::from_secs(u64::from(self.config.artifacts.cleanup_days) * 86_400);
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age > max_age {
                tracing::debug!(path = %path.display(), "pruning old artifact run");
                let _ = fs::remove_dir_all(&path);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn scout_prompt(index: usize) -> String {
    const LENSES: &[&str] = &[
        "the repository structure and module boundaries",
        "the build, test, and tooling setup",
        "risks, undocumented behavior, and open questions in the code",
    ];
    let lens = LENSES[index % LENSES.len()];
    format!(
        "Survey {lens}. Report only what a planner breaking this project\n\
         into tasks would need to know, as terse notes."
    )
}

fn planner_prompt(prd: &str, progress: &str) -> String {
    let mut prompt = format!(
        "Break the following PRD into an ordered task list.\n\n\
         Emit a ```tasks-json fenced block containing an array of\n\
         {{\"title\", \"description\", \"dependsOn\"}} objects, then your notes.\n\n\
         ## PRD\n\n{prd}\n"
    );
    if !progress.trim().is_empty() {
        prompt.push_str(&format!("\n## Planning progress so far\n\n{progress}\n"));
    }
    prompt
}

fn plan_review_prompt(planner_output: &str, previous: Option<&parse::ParsedReview>) -> String {
    let mut prompt = format!(
        "Review this plan. Answer with Verdict (SHIP, NEEDS_WORK, or\n\
         MAJOR_RETHINK), Issues, and Suggestions sections.\n\n\
         ## Plan\n\n{planner_output}\n"
    );
    if let Some(previous) = previous {
        prompt.push_str(&format!(
            "\n## Your previous verdict\n\n{}: {}\n",
            previous.verdict, previous.summary
        ));
    }
    prompt
}

fn impl_review_prompt(
    task: &CrewTask,
    spec: &str,
    prd_path: &str,
    diff: &str,
    commits: &[String],
) -> String {
    format!(
        "Review the implementation of {task_id}: {title} (attempt {attempt}).\n\
         PRD: {prd_path}\n\n\
         Answer with Verdict (SHIP, NEEDS_WORK, or MAJOR_RETHINK), Issues,\n\
         and Suggestions sections.\n\n\
         ## Task spec\n\n{spec}\n\n\
         ## Commits\n\n{commits}\n\n\
         ## Diff\n\n{diff}\n",
        task_id = task.reference(),
        title = task.title,
        attempt = task.attempt_count,
        commits = commits.join("\n"),
    )
}

fn plan_state_review_prompt(plan_md: &str, task_previews: &str) -> String {
    format!(
        "Review the current plan and task breakdown. Answer with Verdict\n\
         (SHIP, NEEDS_WORK, or MAJOR_RETHINK), Issues, and Suggestions.\n\n\
         ## Plan\n\n{plan_md}\n\n## Tasks\n\n{task_previews}\n"
    )
}

fn interview_prompt(content: &str) -> String {
    format!(
        "Generate clarifying questions for this project. Use `### Q<N>\n\
         (<type>)` headings where type is single, multi, or text; list\n\
         options as `- ` bullets for single/multi.\n\n{content}\n"
    )
}

fn sync_prompt(completed: &CrewTask, dependent_specs: &str) -> String {
    format!(
        "{task_id} ({title}) just completed: {summary}.\n\n\
         Propose spec amendments for the dependent tasks below. For each one\n\
         that needs a change, emit `### Updated: <task-id>` followed by a\n\
         `New content` section. Leave the rest out.\n\n{dependent_specs}",
        task_id = completed.reference(),
        title = completed.title,
        summary = completed.summary.as_deref().unwrap_or("(no summary)"),
    )
}
