use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::config::CREW_CHILD_ENV;
use crate::error::Result;
use crate::store::atomic;

/// The host model-runner binary spawned for every crew child.
pub const RUNNER_BIN: &str = "pi";

const KILL_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Scout,
    Analyst,
    Worker,
    Reviewer,
}

impl AgentRole {
    pub fn agent_name(self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Analyst => "analyst",
            Self::Worker => "worker",
            Self::Reviewer => "reviewer",
        }
    }

    /// Per-role output budgets; scouts are summarizers, analysts emit plans,
    /// workers and reviewers get the widest window.
    pub fn default_budget(self) -> OutputBudget {
        match self {
            Self::Scout => OutputBudget {
                max_bytes: 50 * 1024,
                max_lines: 500,
            },
            Self::Analyst => OutputBudget {
                max_bytes: 100 * 1024,
                max_lines: 2000,
            },
            Self::Worker | Self::Reviewer => OutputBudget {
                max_bytes: 400 * 1024,
                max_lines: 8000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBudget {
    pub max_bytes: usize,
    pub max_lines: usize,
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: AgentRole,
    /// Display label, also used for artifact filenames (`<label>-<idx>.*`).
    pub label: String,
    pub index: usize,
    pub prompt: String,
    pub cwd: PathBuf,
    /// Per-agent override of the role's default output budget.
    pub max_output: Option<OutputBudget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentProgress {
    pub phase: String,
    pub tokens: u64,
    pub elapsed_ms: u64,
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub label: String,
    pub index: usize,
    pub role: AgentRole,
    pub output: String,
    pub truncated: bool,
    pub progress: AgentProgress,
}

impl AgentOutcome {
    pub fn failed(&self) -> bool {
        self.progress.status == ProgressStatus::Failed
    }
}

/// One parsed line of the child's JSONL stdout protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonlEvent {
    Assistant(String),
    Phase(String),
    Usage(u64),
    Error(String),
    Other,
}

/// Malformed lines yield None and are skipped.
pub fn parse_jsonl_line(line: &str) -> Option<JsonlEvent> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let kind = value.get("type")?.as_str()?;
    Some(match kind {
        "assistant" => JsonlEvent::Assistant(value.get("text")?.as_str()?.to_string()),
        "phase" => JsonlEvent::Phase(value.get("phase")?.as_str()?.to_string()),
        "usage" => JsonlEvent::Usage(value.get("tokens")?.as_u64()?),
        "error" => JsonlEvent::Error(
            value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        ),
        _ => JsonlEvent::Other,
    })
}

/// Truncate assembled output to a budget; returns (text, truncated).
pub fn apply_budget(output: &str, budget: OutputBudget, artifact_hint: bool) -> (String, bool) {
    let line_count = output.lines().count();
    let over_lines = line_count > budget.max_lines;
    let over_bytes = output.len() > budget.max_bytes;
    if !over_lines && !over_bytes {
        return (output.to_string(), false);
    }

    let mut kept: String = output
        .lines()
        .take(budget.max_lines)
        .collect::<Vec<_>>()
        .join("\n");
    if kept.len() > budget.max_bytes {
        let mut cut = budget.max_bytes;
        while cut > 0 && !kept.is_char_boundary(cut) {
            cut -= 1;
        }
        kept.truncate(cut);
    }
    let marker = if artifact_hint {
        "\n[output truncated; full output saved under crew/artifacts/]"
    } else {
        "\n[output truncated]"
    };
    kept.push_str(marker);
    (kept, true)
}

/// Persists the four per-run artifacts: input prompt, raw output, JSONL
/// transcript, and run metadata.
pub struct ArtifactSink {
    run_dir: PathBuf,
}

impl ArtifactSink {
    pub fn new(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn file(&self, label: &str, index: usize, suffix: &str) -> PathBuf {
        self.run_dir.join(format!("{label}-{index}.{suffix}"))
    }

    pub fn write(
        &self,
        req: &AgentRequest,
        raw_output: &str,
        jsonl: &str,
        progress: &AgentProgress,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        atomic::write_bytes_atomic(
            &self.file(&req.label, req.index, "input.md"),
            req.prompt.as_bytes(),
        )?;
        atomic::write_bytes_atomic(
            &self.file(&req.label, req.index, "output.md"),
            raw_output.as_bytes(),
        )?;
        atomic::write_bytes_atomic(&self.file(&req.label, req.index, "jsonl"), jsonl.as_bytes())?;
        atomic::write_json_atomic(
            &self.file(&req.label, req.index, "metadata.json"),
            &json!({
                "agent": req.role.agent_name(),
                "label": req.label,
                "index": req.index,
                "progress": progress,
            }),
        )?;
        Ok(())
    }
}

/// Abstraction over the child model-runner so orchestration is testable
/// without a real `pi` binary on PATH.
pub trait AgentRunner: Send + Sync {
    fn available(&self) -> bool;
    fn run(&self, req: &AgentRequest) -> Result<AgentOutcome>;
}

/// Spawns `pi --mode json --agent <name> -p <prompt>` and consumes its JSONL
/// stdout.
pub struct PiRunner {
    binary: String,
    artifacts: Option<ArtifactSink>,
    abort: Arc<AtomicBool>,
}

impl PiRunner {
    pub fn new(artifacts: Option<ArtifactSink>) -> Self {
        Self {
            binary: RUNNER_BIN.into(),
            artifacts,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Test seam: a different runner binary speaking the same protocol.
    pub fn with_binary(binary: impl Into<String>, artifacts: Option<ArtifactSink>) -> Self {
        Self {
            binary: binary.into(),
            artifacts,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// SIGTERM first, escalating to SIGKILL after a grace window.
    fn terminate(child: &mut Child) {
        let pid = child.id() as i32;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl AgentRunner for PiRunner {
    fn available(&self) -> bool {
        binary_on_path(&self.binary)
    }

    fn run(&self, req: &AgentRequest) -> Result<AgentOutcome> {
        let started = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(["--mode", "json", "--agent", req.role.agent_name(), "-p", &req.prompt])
            .current_dir(&req.cwd)
            .env(CREW_CHILD_ENV, "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(std::io::Error::other("child stdout was not piped").into());
        };
        let reader = BufReader::new(stdout);

        let mut progress = AgentProgress {
            phase: "starting".into(),
            tokens: 0,
            elapsed_ms: 0,
            status: ProgressStatus::Running,
            error: None,
        };
        let mut assistant_parts: Vec<String> = Vec::new();
        let mut transcript = String::new();
        let mut aborted = false;

        for line in reader.lines() {
            if self.abort.load(Ordering::Relaxed) {
                aborted = true;
                Self::terminate(&mut child);
                break;
            }
            let Ok(line) = line else { break };
            transcript.push_str(&line);
            transcript.push('\n');
            match parse_jsonl_line(&line) {
                Some(JsonlEvent::Assistant(text)) => assistant_parts.push(text),
                Some(JsonlEvent::Phase(phase)) => progress.phase = phase,
                Some(JsonlEvent::Usage(tokens)) => progress.tokens += tokens,
                Some(JsonlEvent::Error(message)) => progress.error = Some(message),
                Some(JsonlEvent::Other) => {}
                None => {
                    tracing::trace!(label = %req.label, "skipping malformed jsonl line");
                }
            }
        }

        let status = child.wait()?;
        progress.elapsed_ms = started.elapsed().as_millis() as u64;
        let raw_output = assistant_parts.join("\n\n");

        if aborted {
            progress.status = ProgressStatus::Failed;
            progress.error.get_or_insert_with(|| "aborted".into());
        } else if !status.success() {
            progress.status = ProgressStatus::Failed;
            progress
                .error
                .get_or_insert_with(|| format!("exited with {status}"));
        } else {
            progress.status = ProgressStatus::Done;
        }

        if let Some(sink) = &self.artifacts
            && let Err(err) = sink.write(req, &raw_output, &transcript, &progress)
        {
            tracing::warn!(%err, label = %req.label, "failed to write artifacts");
        }

        let budget = req.max_output.unwrap_or_else(|| req.role.default_budget());
        let (output, truncated) = apply_budget(&raw_output, budget, self.artifacts.is_some());

        tracing::debug!(
            label = %req.label,
            tokens = progress.tokens,
            elapsed_ms = progress.elapsed_ms,
            status = ?progress.status,
            "agent finished"
        );

        Ok(AgentOutcome {
            label: req.label.clone(),
            index: req.index,
            role: req.role,
            output,
            truncated,
            progress,
        })
    }
}

fn binary_on_path(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).exists();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// Run a wave of requests with at most `cap` children in flight, invoking
/// `on_complete` as each child finishes. Results come back ordered by
/// request index.
pub fn run_wave(
    runner: &dyn AgentRunner,
    requests: Vec<AgentRequest>,
    cap: usize,
    mut on_complete: impl FnMut(&AgentOutcome),
) -> Vec<Result<AgentOutcome>> {
    let cap = cap.max(1);
    let total = requests.len();
    let queue = Mutex::new(requests.into_iter().enumerate().collect::<Vec<_>>());
    let (tx, rx) = mpsc::channel::<(usize, Result<AgentOutcome>)>();

    std::thread::scope(|scope| {
        for _ in 0..cap.min(total) {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || {
                loop {
                    let next = queue.lock().unwrap().pop();
                    let Some((slot, req)) = next else { break };
                    let result = runner.run(&req);
                    if tx.send((slot, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut results: Vec<Option<Result<AgentOutcome>>> =
            (0..total).map(|_| None).collect();
        for (slot, result) in rx {
            if let Ok(outcome) = &result {
                on_complete(outcome);
            }
            results[slot] = Some(result);
        }
        results.into_iter().flatten().collect()
    })
}
