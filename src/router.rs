use serde_json::{Value, json};

use crate::crew::orchestrator::Orchestrator;
use crate::crew::spawner::AgentRunner;
use crate::error::{PimError, Result};
use crate::output::ActionResult;
use crate::session::Messenger;
use crate::store::atomic;
use crate::store::crew::{Evidence, parse_task_ref, task_ref};
use crate::store::feed;

/// Actions that may be called before `join`.
const UNGATED: &[&str] = &["join", "autoRegisterPath"];

/// Parse an action string and dispatch. The action splits at the first `.`
/// into group and sub-op (`task.done` -> `task` / `done`). An empty action
/// falls back to the legacy key-based form inferred from the params.
pub fn dispatch(
    mx: &mut Messenger,
    runner: &dyn AgentRunner,
    action: &str,
    params: &Value,
) -> Result<ActionResult> {
    let action = if action.is_empty() {
        infer_legacy_action(params).ok_or_else(|| {
            PimError::InvalidParams("no action given and none inferable from params".into())
        })?
    } else {
        action.to_string()
    };

    let (group, op) = match action.split_once('.') {
        Some((group, op)) => (group, Some(op)),
        None => (action.as_str(), None),
    };

    if !UNGATED.contains(&group) && !mx.is_registered() {
        return Err(PimError::NotRegistered);
    }

    match (group, op) {
        ("join", None) => join(mx, params),
        ("status", None) => status(mx),
        ("list", None) => list(mx),
        ("whois", None) => whois(mx, params),
        ("feed", None) => feed_view(mx, params),
        ("set_status", None) => set_status(mx, params),
        ("reserve", None) => reserve(mx, params),
        ("release", None) => release(mx, params),
        ("guard", None) => guard(mx, params),
        ("rename", None) => rename(mx, params),
        ("send", None) => send(mx, params),
        ("broadcast", None) => broadcast(mx, params),
        ("inbox", None) => inbox_drain(mx),
        ("leave", None) => leave(mx),
        ("swarm", None) => swarm_view(mx, params),
        ("claim", None) => claim(mx, params),
        ("unclaim", None) => unclaim(mx, params),
        ("complete", None) => complete(mx, params),
        ("spec", None) => spec(mx, params),
        ("track", None) => track(mx, params),
        ("autoRegisterPath", None) => auto_register_path(mx, params),
        ("task", Some(op)) => task_op(mx, op, params),
        ("plan", None) => plan(mx, runner, params),
        ("work", None) => work(mx, runner, params),
        ("review", None) => review(mx, runner, params),
        ("interview", None) => interview(mx, runner),
        ("sync", None) => sync(mx, runner, params),
        ("crew", Some(op)) => crew_op(mx, runner, op),
        _ => Err(PimError::UnknownAction(action)),
    }
}

/// Legacy key-based form: the bare params carry the intent.
fn infer_legacy_action(params: &Value) -> Option<String> {
    for (key, action) in [
        ("to", "send"),
        ("claim", "claim"),
        ("unclaim", "unclaim"),
        ("complete", "complete"),
        ("reserve", "reserve"),
        ("release", "release"),
        ("join", "join"),
    ] {
        if params.get(key).is_some() {
            return Some(action.to_string());
        }
    }
    None
}

// -- param helpers -----------------------------------------------------------

fn str_param(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_str(params: &Value, key: &str) -> Result<String> {
    str_param(params, key).ok_or_else(|| PimError::InvalidParams(format!("missing '{key}'")))
}

fn bool_param(params: &Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn u32_param(params: &Value, key: &str) -> Option<u32> {
    params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
}

/// A string or a list of strings (the legacy union shape), normalized to a
/// list at the boundary.
fn list_param(params: &Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => vec![],
    }
}

fn task_id_param(params: &Value, key: &str) -> Result<u32> {
    let raw = require_str(params, key)?;
    parse_task_ref(&raw).ok_or(PimError::TaskNotFound(raw))
}

// -- mesh handlers -----------------------------------------------------------

fn join(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let reg = mx.join(
        str_param(params, "name").as_deref(),
        str_param(params, "model").as_deref(),
        str_param(params, "spec").as_deref(),
        bool_param(params, "human"),
    )?;
    Ok(ActionResult::new(
        format!("joined the mesh as {}", reg.name),
        json!({ "name": reg.name, "sessionId": reg.session_id, "cwd": reg.cwd }),
    ))
}

fn leave(mx: &mut Messenger) -> Result<ActionResult> {
    let name = mx.leave()?;
    Ok(ActionResult::new(
        format!("{name} left the mesh"),
        json!({ "name": name }),
    ))
}

fn status(mx: &mut Messenger) -> Result<ActionResult> {
    let me = mx.resolve_identity()?;
    let presence = mx.whois(&me.name.clone())?;
    Ok(ActionResult::new(
        format!("{} ({})", me.name, presence.status),
        serde_json::to_value(&presence)?,
    ))
}

fn list(mx: &mut Messenger) -> Result<ActionResult> {
    let presence = mx.presence()?;
    let lines: Vec<String> = presence
        .iter()
        .map(|p| {
            format!(
                "{} [{}] {}",
                p.registration.name,
                p.status,
                p.registration.cwd
            )
        })
        .collect();
    let text = if lines.is_empty() {
        "no agents registered".to_string()
    } else {
        lines.join("\n")
    };
    Ok(ActionResult::new(
        text,
        json!({ "agents": serde_json::to_value(&presence)? }),
    ))
}

fn whois(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let name = require_str(params, "name")?;
    let presence = mx.whois(&name)?;
    Ok(ActionResult::new(
        format!("{} [{}]", presence.registration.name, presence.status),
        serde_json::to_value(&presence)?,
    ))
}

fn feed_view(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);
    let events = mx.feed.read(limit)?;
    let text = events
        .iter()
        .map(feed::format_line)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(ActionResult::new(
        if text.is_empty() { "no activity".into() } else { text },
        json!({ "events": serde_json::to_value(&events)? }),
    ))
}

fn set_status(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let message = str_param(params, "message");
    mx.set_status(message.as_deref())?;
    Ok(ActionResult::new(
        match &message {
            Some(message) => format!("status set: {message}"),
            None => "status cleared".into(),
        },
        json!({ "message": message }),
    ))
}

fn reserve(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let paths = list_param(params, "reserve");
    let paths = if paths.is_empty() {
        list_param(params, "paths")
    } else {
        paths
    };
    if paths.is_empty() {
        return Err(PimError::InvalidParams("missing 'paths'".into()));
    }
    let reason = str_param(params, "reason");
    let held = mx.reserve(&paths, reason.as_deref())?;
    Ok(ActionResult::new(
        format!("reserved {}", paths.join(", ")),
        json!({ "reservations": serde_json::to_value(&held)? }),
    ))
}

fn release(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    // Legacy union: `release` may be a list or a boolean all-sentinel.
    let release_all = bool_param(params, "releaseAll")
        || params.get("release").and_then(|v| v.as_bool()).unwrap_or(false);
    let mut paths = list_param(params, "paths");
    if paths.is_empty() {
        paths = list_param(params, "release");
    }
    if !release_all && paths.is_empty() {
        return Err(PimError::InvalidParams(
            "give 'paths' or set 'releaseAll'".into(),
        ));
    }
    let held = mx.release(&paths, release_all)?;
    Ok(ActionResult::new(
        if release_all {
            "released all reservations".to_string()
        } else {
            format!("released {}", paths.join(", "))
        },
        json!({ "reservations": serde_json::to_value(&held)? }),
    ))
}

fn guard(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let path = require_str(params, "path")?;
    match mx.guard_write(&path)? {
        Some(block) => Ok(ActionResult::new(
            block.message(),
            json!({ "error": "reserved", "block": serde_json::to_value(&block)? }),
        )),
        None => Ok(ActionResult::new(
            format!("{path} is free"),
            json!({ "blocked": false }),
        )),
    }
}

fn rename(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let name = require_str(params, "name")?;
    let reg = mx.rename(&name)?;
    Ok(ActionResult::new(
        format!("renamed to {}", reg.name),
        json!({ "name": reg.name }),
    ))
}

fn send(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let recipients = list_param(params, "to");
    if recipients.is_empty() {
        return Err(PimError::InvalidParams("missing 'to'".into()));
    }
    let text = require_str(params, "message")?;
    let reply_to = str_param(params, "replyTo");

    let mut delivered = Vec::new();
    let mut failures = Vec::new();
    for to in &recipients {
        match mx.send(to, &text, reply_to.as_deref()) {
            Ok(msg) => delivered.push(json!({ "to": to, "id": msg.id })),
            Err(err) => failures.push(json!({ "to": to, "error": err.code() })),
        }
    }
    let text = if failures.is_empty() {
        format!("sent to {}", recipients.join(", "))
    } else {
        format!(
            "sent to {} of {} recipients",
            delivered.len(),
            recipients.len()
        )
    };
    Ok(ActionResult::new(
        text,
        json!({ "delivered": delivered, "failed": failures }),
    ))
}

fn broadcast(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let text = require_str(params, "message")?;
    let results = mx.broadcast(&text);
    let sent = results.iter().filter(|(_, r)| r.is_ok()).count();
    let details: Vec<Value> = results
        .iter()
        .map(|(name, result)| match result {
            Ok(msg) => json!({ "to": name, "id": msg.id }),
            Err(err) => json!({ "to": name, "error": err.code() }),
        })
        .collect();
    Ok(ActionResult::new(
        format!("broadcast to {sent} agents"),
        json!({ "results": details }),
    ))
}

fn inbox_drain(mx: &mut Messenger) -> Result<ActionResult> {
    let session_id = mx.session_id().to_string();
    let consumer = crate::store::inbox::InboxConsumer::new(&mx.paths, &session_id);
    let mut rendered = Vec::new();
    let mut messages = Vec::new();
    consumer.scan(&mut |msg| {
        messages.push(msg.clone());
    })?;
    for msg in &messages {
        rendered.push(mx.render_delivery(msg));
    }
    Ok(ActionResult::new(
        if rendered.is_empty() {
            "inbox empty".to_string()
        } else {
            rendered.join("\n")
        },
        json!({ "messages": serde_json::to_value(&messages)? }),
    ))
}

// -- swarm handlers ----------------------------------------------------------

fn swarm_view(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let spec = str_param(params, "spec");
    let spec_key = spec.map(|s| crate::pathnorm::normalize(&s, &mx.cwd));
    let view = mx.swarm.view(&mx.registry, spec_key.as_deref())?;
    let claims: usize = view.claims.values().map(|t| t.len()).sum();
    let completions: usize = view.completions.values().map(|t| t.len()).sum();
    Ok(ActionResult::new(
        format!("{claims} active claims, {completions} completions"),
        serde_json::to_value(&view)?,
    ))
}

fn claim(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let task = require_str(params, "task").or_else(|_| require_str(params, "claim"))?;
    let spec = str_param(params, "spec");
    let reason = str_param(params, "reason");
    let claim = mx.claim(spec.as_deref(), &task, reason.as_deref())?;
    Ok(ActionResult::new(
        format!("claimed {task}"),
        serde_json::to_value(&claim)?,
    ))
}

fn unclaim(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let task = require_str(params, "task").or_else(|_| require_str(params, "unclaim"))?;
    let spec = str_param(params, "spec");
    mx.unclaim(spec.as_deref(), &task)?;
    Ok(ActionResult::new(
        format!("unclaimed {task}"),
        json!({ "task": task }),
    ))
}

fn complete(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let task = require_str(params, "task").or_else(|_| require_str(params, "complete"))?;
    let spec = str_param(params, "spec");
    let notes = str_param(params, "notes");
    let completion = mx.complete(spec.as_deref(), &task, notes.as_deref())?;
    Ok(ActionResult::new(
        format!("completed {task}"),
        serde_json::to_value(&completion)?,
    ))
}

fn spec(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    match str_param(params, "path") {
        Some(path) => {
            let reg = mx.set_spec(Some(&path))?;
            Ok(ActionResult::new(
                format!("spec set to {}", reg.spec_path.as_deref().unwrap_or("?")),
                json!({ "spec": reg.spec_path }),
            ))
        }
        None => {
            let me = mx.resolve_identity()?;
            Ok(ActionResult::new(
                me.spec_path
                    .clone()
                    .unwrap_or_else(|| "no spec announced".into()),
                json!({ "spec": me.spec_path }),
            ))
        }
    }
}

fn track(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let tool = require_str(params, "tool")?;
    let target = str_param(params, "target");
    let command = str_param(params, "command");
    let exit_code = params
        .get("exitCode")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let tokens = params.get("tokens").and_then(|v| v.as_u64());
    mx.track_tool_call(&tool, target.as_deref(), command.as_deref(), exit_code, tokens)?;
    Ok(ActionResult::new("tracked", json!({ "tool": tool })))
}

fn auto_register_path(mx: &mut Messenger, params: &Value) -> Result<ActionResult> {
    let path = require_str(params, "path")?;
    let remove = bool_param(params, "remove");

    let config_path = crate::config::MessengerConfig::default_path();
    let mut value: Value = atomic::read_json_opt(&config_path).unwrap_or_else(|| json!({}));
    let list = value
        .as_object_mut()
        .ok_or_else(|| PimError::InvalidParams("config file is not an object".into()))?
        .entry("autoRegisterPaths")
        .or_insert_with(|| json!([]));
    let mut paths: Vec<String> = list
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    if remove {
        paths.retain(|p| p != &path);
    } else if !paths.contains(&path) {
        paths.push(path.clone());
    }
    *list = json!(paths);
    atomic::write_json_atomic(&config_path, &value)?;
    mx.config.auto_register_paths = paths.clone();

    Ok(ActionResult::new(
        if remove {
            format!("removed {path} from autoRegisterPaths")
        } else {
            format!("added {path} to autoRegisterPaths")
        },
        json!({ "autoRegisterPaths": paths }),
    ))
}

// -- task handlers -----------------------------------------------------------

fn crew_store(mx: &Messenger) -> crate::store::crew::CrewStore {
    crate::store::crew::CrewStore::new(crate::store::paths::CrewPaths::for_project(&mx.cwd))
}

fn task_op(mx: &mut Messenger, op: &str, params: &Value) -> Result<ActionResult> {
    let store = crew_store(mx);
    match op {
        "create" => {
            let title = require_str(params, "title")?;
            let spec = str_param(params, "spec").unwrap_or_else(|| title.clone());
            let deps: Vec<u32> = list_param(params, "dependsOn")
                .iter()
                .filter_map(|d| parse_task_ref(d))
                .collect();
            let task = store.create_task(&title, &spec, deps)?;
            Ok(ActionResult::new(
                format!("created {}: {}", task.reference(), task.title),
                serde_json::to_value(&task)?,
            ))
        }
        "show" => {
            let id = task_id_param(params, "id")?;
            let task = store.read_task(id)?;
            let spec = store.read_task_spec(id);
            Ok(ActionResult::new(
                format!("{}: {} [{}]", task.reference(), task.title, task.status),
                json!({ "task": serde_json::to_value(&task)?, "spec": spec }),
            ))
        }
        "list" => {
            let tasks = store.list_tasks()?;
            let lines: Vec<String> = tasks
                .iter()
                .map(|t| format!("{} [{}] {}", t.reference(), t.status, t.title))
                .collect();
            Ok(ActionResult::new(
                if lines.is_empty() {
                    "no tasks".into()
                } else {
                    lines.join("\n")
                },
                json!({ "tasks": serde_json::to_value(&tasks)? }),
            ))
        }
        "start" => {
            let id = task_id_param(params, "id")?;
            let agent = str_param(params, "agent")
                .or_else(|| mx.resolve_identity().ok().map(|r| r.name));
            let task = store.start_task(id, agent.as_deref(), &mx.cwd)?;
            Ok(ActionResult::new(
                format!("started {} (attempt {})", task.reference(), task.attempt_count),
                serde_json::to_value(&task)?,
            ))
        }
        "done" => {
            let id = task_id_param(params, "id")?;
            let evidence = Evidence {
                commits: list_param(params, "commits"),
                tests: list_param(params, "tests"),
                prs: list_param(params, "prs"),
            };
            let summary = str_param(params, "summary");
            let task = store.complete_task(id, summary.as_deref(), evidence)?;
            Ok(ActionResult::new(
                format!("{} done", task.reference()),
                serde_json::to_value(&task)?,
            ))
        }
        "block" => {
            let id = task_id_param(params, "id")?;
            let reason = require_str(params, "reason")?;
            let task = store.block_task(id, &reason)?;
            Ok(ActionResult::new(
                format!("{} blocked: {reason}", task.reference()),
                serde_json::to_value(&task)?,
            ))
        }
        "unblock" => {
            let id = task_id_param(params, "id")?;
            let task = store.unblock_task(id)?;
            Ok(ActionResult::new(
                format!("{} unblocked", task.reference()),
                serde_json::to_value(&task)?,
            ))
        }
        "ready" => {
            let ready = store.ready_tasks()?;
            let refs: Vec<String> = ready.iter().map(|t| t.reference()).collect();
            Ok(ActionResult::new(
                if refs.is_empty() {
                    "no tasks ready".into()
                } else {
                    format!("ready: {}", refs.join(", "))
                },
                json!({ "ready": serde_json::to_value(&ready)? }),
            ))
        }
        "reset" => {
            let id = task_id_param(params, "id")?;
            let cascade = bool_param(params, "cascade");
            let reset = store.reset_task(id, cascade)?;
            let refs: Vec<String> = reset.iter().map(|id| task_ref(*id)).collect();
            Ok(ActionResult::new(
                format!("reset {}", refs.join(", ")),
                json!({ "reset": refs }),
            ))
        }
        other => Err(PimError::UnknownAction(format!("task.{other}"))),
    }
}

// -- crew handlers -----------------------------------------------------------

fn crew_config(mx: &Messenger) -> crate::config::CrewConfig {
    let mut cfg = mx.config.clone();
    let crew_paths = crate::store::paths::CrewPaths::for_project(&mx.cwd);
    cfg.apply_project_overrides(&crew_paths.config_json());
    cfg.crew
}

fn plan(mx: &mut Messenger, runner: &dyn AgentRunner, params: &Value) -> Result<ActionResult> {
    let orch = Orchestrator::new(&mx.cwd, runner, crew_config(mx));
    let outcome = orch.plan(str_param(params, "prd").as_deref())?;
    Ok(ActionResult::new(
        format!(
            "planned {} tasks from {} in {} pass(es)",
            outcome.task_ids.len(),
            outcome.prd_path,
            outcome.passes
        ),
        serde_json::to_value(&outcome)?,
    ))
}

fn work(mx: &mut Messenger, runner: &dyn AgentRunner, params: &Value) -> Result<ActionResult> {
    let orch = Orchestrator::new(&mx.cwd, runner, crew_config(mx));
    let autonomous = bool_param(params, "autonomous");
    let outcome = orch.work(autonomous, u32_param(params, "workers"))?;

    let mut text = format!(
        "wave done: {} succeeded, {} blocked, {} failed",
        outcome.succeeded.len(),
        outcome.blocked.len(),
        outcome.failed.len()
    );
    if let Some(auto) = &outcome.autonomous {
        if auto.continue_work {
            // The continuation steer: the host loop re-invokes `work` on the
            // next agent step while this is set.
            text.push_str(&format!("; continuing with wave {}", auto.next_wave));
        } else if let Some(reason) = auto.stop_reason {
            text.push_str(&format!("; stopped ({reason:?})"));
        }
    }
    Ok(ActionResult::new(text, serde_json::to_value(&outcome)?))
}

fn review(mx: &mut Messenger, runner: &dyn AgentRunner, params: &Value) -> Result<ActionResult> {
    let orch = Orchestrator::new(&mx.cwd, runner, crew_config(mx));
    let outcome = orch.review(str_param(params, "target").as_deref())?;
    Ok(ActionResult::new(
        format!("{}: {}", outcome.target, outcome.verdict),
        serde_json::to_value(&outcome)?,
    ))
}

fn interview(mx: &mut Messenger, runner: &dyn AgentRunner) -> Result<ActionResult> {
    let orch = Orchestrator::new(&mx.cwd, runner, crew_config(mx));
    let questions = orch.interview()?;
    Ok(ActionResult::new(
        format!("generated {} interview questions", questions.len()),
        json!({ "questions": serde_json::to_value(&questions)? }),
    ))
}

fn sync(mx: &mut Messenger, runner: &dyn AgentRunner, params: &Value) -> Result<ActionResult> {
    let id = task_id_param(params, "task")?;
    let orch = Orchestrator::new(&mx.cwd, runner, crew_config(mx));
    let outcome = orch.sync(id)?;
    Ok(ActionResult::new(
        if outcome.updated.is_empty() {
            format!("{}: no dependent specs needed changes", outcome.task)
        } else {
            format!("{}: updated {}", outcome.task, outcome.updated.join(", "))
        },
        serde_json::to_value(&outcome)?,
    ))
}

fn crew_op(mx: &mut Messenger, runner: &dyn AgentRunner, op: &str) -> Result<ActionResult> {
    let store = crew_store(mx);
    match op {
        "status" => {
            let plan = store.load_plan();
            let tasks = store.list_tasks().unwrap_or_default();
            let by_status = |s: crate::store::crew::TaskStatus| {
                tasks.iter().filter(|t| t.status == s).count()
            };
            let autonomous = crate::crew::autonomous::AutonomousStore::new(
                crate::store::paths::CrewPaths::for_project(&mx.cwd),
            )
            .load();
            let text = match &plan {
                Some(plan) => format!(
                    "plan for {}: {}/{} done ({} in progress, {} blocked)",
                    plan.prd_path,
                    by_status(crate::store::crew::TaskStatus::Done),
                    tasks.len(),
                    by_status(crate::store::crew::TaskStatus::InProgress),
                    by_status(crate::store::crew::TaskStatus::Blocked),
                ),
                None => "no plan".to_string(),
            };
            Ok(ActionResult::new(
                text,
                json!({
                    "plan": serde_json::to_value(&plan)?,
                    "tasks": serde_json::to_value(&tasks)?,
                    "autonomous": serde_json::to_value(&autonomous)?,
                }),
            ))
        }
        "agents" => {
            let cfg = crew_config(mx);
            let available = runner.available();
            Ok(ActionResult::new(
                if available {
                    "pi runner available".to_string()
                } else {
                    "pi runner not found on PATH".to_string()
                },
                json!({
                    "available": available,
                    "concurrency": { "scouts": cfg.concurrency.scouts, "workers": cfg.concurrency.workers },
                }),
            ))
        }
        "validate" => {
            let report = store.validate()?;
            Ok(ActionResult::new(
                if report.is_clean() {
                    "crew state is consistent".to_string()
                } else {
                    let mut resynced = Vec::new();
                    if report.task_count_fixed {
                        resynced.push("task_count");
                    }
                    if report.completed_count_fixed {
                        resynced.push("completed_count");
                    }
                    format!(
                        "resynced counters: {}; missing deps: {}; cycles: {}",
                        if resynced.is_empty() {
                            "none".to_string()
                        } else {
                            resynced.join(", ")
                        },
                        report.missing_deps.len(),
                        report.cycles.len()
                    )
                },
                serde_json::to_value(&report)?,
            ))
        }
        other => Err(PimError::UnknownAction(format!("crew.{other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessengerConfig;
    use crate::crew::spawner::{
        AgentOutcome, AgentProgress, AgentRequest, AgentRole, ProgressStatus,
    };
    use crate::store::paths::MeshPaths;
    use std::path::Path;
    use tempfile::tempdir;

    struct NoRunner;

    impl AgentRunner for NoRunner {
        fn available(&self) -> bool {
            false
        }
        fn run(&self, req: &AgentRequest) -> Result<AgentOutcome> {
            Ok(AgentOutcome {
                label: req.label.clone(),
                index: req.index,
                role: AgentRole::Worker,
                output: String::new(),
                truncated: false,
                progress: AgentProgress {
                    phase: "done".into(),
                    tokens: 0,
                    elapsed_ms: 0,
                    status: ProgressStatus::Done,
                    error: None,
                },
            })
        }
    }

    fn messenger_at(dir: &Path, session: &str) -> Messenger {
        let paths = MeshPaths::new(dir.join("mesh"));
        paths.ensure_dirs().unwrap();
        let cwd = dir.join("repo");
        std::fs::create_dir_all(&cwd).unwrap();
        Messenger::with_parts(paths, MessengerConfig::default(), cwd, session.into())
    }

    fn call(mx: &mut Messenger, action: &str, params: Value) -> Result<ActionResult> {
        dispatch(mx, &NoRunner, action, &params)
    }

    #[test]
    fn registration_gate_spares_only_join_and_auto_register_path() {
        let dir = tempdir().unwrap();
        let mut mx = messenger_at(dir.path(), "sess-1");

        for action in ["list", "send", "claim", "task.list", "work", "crew.status"] {
            let err = call(&mut mx, action, json!({})).unwrap_err();
            assert!(
                matches!(err, PimError::NotRegistered),
                "{action} should be gated, got {err:?}"
            );
        }

        let result = call(&mut mx, "join", json!({ "name": "Fox" })).unwrap();
        assert!(result.text.contains("Fox"));
    }

    #[test]
    fn action_strings_split_at_first_dot() {
        let dir = tempdir().unwrap();
        let mut mx = messenger_at(dir.path(), "sess-1");
        call(&mut mx, "join", json!({ "name": "Fox" })).unwrap();

        let err = call(&mut mx, "task.nope", json!({})).unwrap_err();
        assert!(matches!(err, PimError::UnknownAction(a) if a == "task.nope"));

        let err = call(&mut mx, "bogus", json!({})).unwrap_err();
        assert!(matches!(err, PimError::UnknownAction(_)));
    }

    #[test]
    fn legacy_key_form_infers_send_and_claim() {
        let dir = tempdir().unwrap();
        let mut alice = messenger_at(dir.path(), "sess-a");
        let mut bob = messenger_at(dir.path(), "sess-b");
        call(&mut alice, "join", json!({ "name": "Alice", "spec": "SPEC.md" })).unwrap();
        call(&mut bob, "join", json!({ "name": "Bob" })).unwrap();

        // Bare `to` means send.
        let result = call(&mut alice, "", json!({ "to": "Bob", "message": "hi" })).unwrap();
        assert!(result.text.contains("sent to Bob"));

        // Bare `claim` means claim, with the task as its value.
        let result = call(&mut alice, "", json!({ "claim": "TASK-1" })).unwrap();
        assert!(result.text.contains("claimed TASK-1"));

        let err = call(&mut alice, "", json!({ "unrelated": true })).unwrap_err();
        assert!(matches!(err, PimError::InvalidParams(_)));
    }

    #[test]
    fn send_accepts_string_or_list_recipients() {
        let dir = tempdir().unwrap();
        let mut alice = messenger_at(dir.path(), "sess-a");
        let mut bob = messenger_at(dir.path(), "sess-b");
        call(&mut alice, "join", json!({ "name": "Alice" })).unwrap();
        call(&mut bob, "join", json!({ "name": "Bob" })).unwrap();

        let single = call(&mut alice, "send", json!({ "to": "Bob", "message": "one" })).unwrap();
        assert_eq!(single.details["failed"].as_array().unwrap().len(), 0);

        let multi = call(
            &mut alice,
            "send",
            json!({ "to": ["Bob", "Ghost"], "message": "two" }),
        )
        .unwrap();
        assert_eq!(multi.details["delivered"].as_array().unwrap().len(), 1);
        let failed = multi.details["failed"].as_array().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["error"], "not_found");
    }

    #[test]
    fn task_lifecycle_via_router() {
        let dir = tempdir().unwrap();
        let mut mx = messenger_at(dir.path(), "sess-1");
        call(&mut mx, "join", json!({ "name": "Fox" })).unwrap();

        call(
            &mut mx,
            "task.create",
            json!({ "title": "First", "spec": "# First\nDo it." }),
        )
        .unwrap();
        call(
            &mut mx,
            "task.create",
            json!({ "title": "Second", "dependsOn": ["task-1"] }),
        )
        .unwrap();

        let ready = call(&mut mx, "task.ready", json!({})).unwrap();
        assert!(ready.text.contains("task-1"));
        assert!(!ready.text.contains("task-2"));

        call(&mut mx, "task.start", json!({ "id": "task-1" })).unwrap();
        let done = call(
            &mut mx,
            "task.done",
            json!({ "id": "task-1", "summary": "built", "commits": ["abc123"] }),
        )
        .unwrap();
        assert!(done.text.contains("task-1 done"));

        let ready = call(&mut mx, "task.ready", json!({})).unwrap();
        assert!(ready.text.contains("task-2"));

        call(&mut mx, "task.start", json!({ "id": "2" })).unwrap();
        call(&mut mx, "task.block", json!({ "id": "2", "reason": "stuck on infra" })).unwrap();
        let listed = call(&mut mx, "task.list", json!({})).unwrap();
        assert!(listed.text.contains("task-2 [blocked]"));

        call(&mut mx, "task.unblock", json!({ "id": "2" })).unwrap();
        let reset = call(&mut mx, "task.reset", json!({ "id": "1", "cascade": true })).unwrap();
        assert!(reset.text.contains("task-1"));
    }

    #[test]
    fn crew_actions_report_runner_unavailability() {
        let dir = tempdir().unwrap();
        let mut mx = messenger_at(dir.path(), "sess-1");
        call(&mut mx, "join", json!({ "name": "Fox" })).unwrap();
        std::fs::write(mx.cwd.join("PRD.md"), "# PRD").unwrap();

        let err = call(&mut mx, "plan", json!({})).unwrap_err();
        assert!(matches!(err, PimError::NoPlanner));

        let agents = call(&mut mx, "crew.agents", json!({})).unwrap();
        assert_eq!(agents.details["available"], false);
    }

    #[test]
    fn release_union_forms() {
        let dir = tempdir().unwrap();
        let mut mx = messenger_at(dir.path(), "sess-1");
        call(&mut mx, "join", json!({ "name": "Fox" })).unwrap();
        call(&mut mx, "reserve", json!({ "paths": ["src/a.rs", "src/b.rs"] })).unwrap();

        // Legacy list form.
        let result = call(&mut mx, "", json!({ "release": ["src/a.rs"] })).unwrap();
        assert!(result.text.contains("released src/a.rs"));

        // Legacy boolean sentinel form.
        let result = call(&mut mx, "", json!({ "release": true })).unwrap();
        assert!(result.text.contains("released all"));
        assert_eq!(
            result.details["reservations"].as_array().unwrap().len(),
            0
        );
    }

    #[test]
    fn guard_reports_block_with_peer_details() {
        let dir = tempdir().unwrap();
        let mut a = messenger_at(dir.path(), "sess-a");
        let mut b = messenger_at(dir.path(), "sess-b");
        call(&mut a, "join", json!({ "name": "A" })).unwrap();
        call(&mut b, "join", json!({ "name": "B" })).unwrap();
        call(&mut a, "reserve", json!({ "paths": ["src/auth/"], "reason": "task-1" })).unwrap();

        let result = call(&mut b, "guard", json!({ "path": "src/auth/login.ts" })).unwrap();
        assert_eq!(result.details["error"], "reserved");
        assert!(result.text.contains('A'));

        let result = call(&mut b, "guard", json!({ "path": "src/other.rs" })).unwrap();
        assert_eq!(result.details["blocked"], false);
    }

    #[test]
    fn crew_validate_via_router() {
        let dir = tempdir().unwrap();
        let mut mx = messenger_at(dir.path(), "sess-1");
        call(&mut mx, "join", json!({ "name": "Fox" })).unwrap();
        call(&mut mx, "task.create", json!({ "title": "One" })).unwrap();

        let result = call(&mut mx, "crew.validate", json!({})).unwrap();
        assert!(result.text.contains("consistent"));

        let status = call(&mut mx, "crew.status", json!({})).unwrap();
        assert!(status.text.contains("no plan"));
    }
}
