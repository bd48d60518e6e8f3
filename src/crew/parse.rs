use serde::{Deserialize, Serialize};

use crate::store::crew::Verdict;

/// A task as emitted by the planner, before dependency resolution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Extract the planner's task list. Preferred format is a fenced
/// ```tasks-json block containing an array of {title, description,
/// dependsOn}; the fallback is `### Task N: <title>` markdown headings with
/// a `Dependencies:` line.
pub fn parse_tasks(output: &str) -> Vec<ParsedTask> {
    if let Some(tasks) = parse_tasks_json(output) {
        return tasks;
    }
    parse_tasks_markdown(output)
}

fn parse_tasks_json(output: &str) -> Option<Vec<ParsedTask>> {
    let start = output.find("```tasks-json")?;
    let body = &output[start + "```tasks-json".len()..];
    let end = body.find("```")?;
    let json = body[..end].trim();
    match serde_json::from_str::<Vec<ParsedTask>>(json) {
        Ok(tasks) => Some(tasks),
        Err(err) => {
            tracing::debug!(%err, "tasks-json block did not parse; trying markdown fallback");
            None
        }
    }
}

fn parse_tasks_markdown(output: &str) -> Vec<ParsedTask> {
    let mut tasks: Vec<ParsedTask> = Vec::new();
    let mut current: Option<ParsedTask> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("### Task ") {
            if let Some(task) = current.take() {
                tasks.push(task);
            }
            // "N: Title"; the numeric label is positional, the title is kept.
            let title = heading
                .split_once(':')
                .map(|(_, t)| t.trim())
                .unwrap_or(heading.trim())
                .to_string();
            current = Some(ParsedTask {
                title,
                description: String::new(),
                depends_on: Vec::new(),
            });
            continue;
        }
        let Some(task) = current.as_mut() else { continue };
        if let Some(deps) = trimmed.strip_prefix("Dependencies:") {
            task.depends_on = deps
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("none"))
                .collect();
        } else {
            if !task.description.is_empty() {
                task.description.push('\n');
            }
            task.description.push_str(line);
        }
    }
    if let Some(task) = current.take() {
        tasks.push(task);
    }
    for task in &mut tasks {
        task.description = task.description.trim().to_string();
    }
    tasks.retain(|t| !t.title.is_empty());
    tasks
}

/// Resolve a planner dependency string against created tasks, matching by
/// lowercased title or a `task N` / `task-N` / bare-number alias.
pub fn resolve_dependency(dep: &str, created: &[(u32, String)]) -> Option<u32> {
    let needle = dep.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    if let Some(id) = crate::store::crew::parse_task_ref(&needle) {
        // Positional alias: "task 2" means the second created task.
        if let Some((resolved, _)) = created.get(id.checked_sub(1)? as usize) {
            return Some(*resolved);
        }
    }
    created
        .iter()
        .find(|(_, title)| title.to_lowercase() == needle)
        .map(|(id, _)| *id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReview {
    pub verdict: Verdict,
    pub summary: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Parse the reviewer's structured sections (Verdict, Issues, Suggestions).
/// Returns None when no verdict token is present.
pub fn parse_review(output: &str) -> Option<ParsedReview> {
    let mut verdict = None;
    let mut summary = String::new();
    let mut issues = Vec::new();
    let mut suggestions = Vec::new();

    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Verdict,
        Issues,
        Suggestions,
        Other,
    }
    let mut section = Section::Preamble;

    for line in output.lines() {
        let trimmed = line.trim();
        let lowered = trimmed.trim_start_matches('#').trim().to_lowercase();
        if lowered.starts_with("verdict") {
            section = Section::Verdict;
            if verdict.is_none() {
                verdict = extract_verdict(trimmed);
            }
            continue;
        }
        if lowered == "issues" || lowered.starts_with("issues:") {
            section = Section::Issues;
            continue;
        }
        if lowered == "suggestions" || lowered.starts_with("suggestions:") {
            section = Section::Suggestions;
            continue;
        }
        if trimmed.starts_with('#') {
            section = Section::Other;
            continue;
        }

        match section {
            Section::Verdict => {
                if verdict.is_none() {
                    verdict = extract_verdict(trimmed);
                }
                if !trimmed.is_empty() && extract_verdict(trimmed).is_none() {
                    if !summary.is_empty() {
                        summary.push(' ');
                    }
                    summary.push_str(trimmed);
                }
            }
            Section::Issues => {
                if let Some(item) = bullet(trimmed) {
                    issues.push(item);
                }
            }
            Section::Suggestions => {
                if let Some(item) = bullet(trimmed) {
                    suggestions.push(item);
                }
            }
            Section::Preamble | Section::Other => {}
        }
    }

    Some(ParsedReview {
        verdict: verdict?,
        summary,
        issues,
        suggestions,
    })
}

fn extract_verdict(line: &str) -> Option<Verdict> {
    let upper = line.to_uppercase();
    if upper.contains("MAJOR_RETHINK") || upper.contains("MAJOR RETHINK") {
        Some(Verdict::MajorRethink)
    } else if upper.contains("NEEDS_WORK") || upper.contains("NEEDS WORK") {
        Some(Verdict::NeedsWork)
    } else if upper.contains("SHIP") {
        Some(Verdict::Ship)
    } else {
        None
    }
}

fn bullet(line: &str) -> Option<String> {
    let item = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))?;
    let item = item.trim();
    (!item.is_empty()).then(|| item.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Single,
    Multi,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterviewQuestion {
    pub id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Parse `### Q<N> (<type>)` blocks where type is single, multi, or text.
/// Options come from `- ` bullets; remaining lines form the prompt.
pub fn parse_interview(output: &str) -> Vec<InterviewQuestion> {
    let mut questions: Vec<InterviewQuestion> = Vec::new();
    let mut current: Option<InterviewQuestion> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_prefix("### Q") {
            if let Some(q) = current.take() {
                questions.push(q);
            }
            current = parse_question_header(header);
            continue;
        }
        let Some(q) = current.as_mut() else { continue };
        if let Some(option) = bullet(trimmed) {
            q.options.push(option);
        } else if !trimmed.is_empty() {
            if !q.prompt.is_empty() {
                q.prompt.push(' ');
            }
            q.prompt.push_str(trimmed);
        }
    }
    if let Some(q) = current.take() {
        questions.push(q);
    }
    questions.retain(|q| !q.prompt.is_empty());
    questions
}

fn parse_question_header(header: &str) -> Option<InterviewQuestion> {
    // header looks like "3 (multi)" after the stripped "### Q" prefix.
    let (number, rest) = header.split_once('(')?;
    let number = number.trim();
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let kind = match rest.split(')').next()?.trim().to_lowercase().as_str() {
        "single" => QuestionKind::Single,
        "multi" => QuestionKind::Multi,
        "text" => QuestionKind::Text,
        _ => return None,
    };
    Some(InterviewQuestion {
        id: format!("Q{number}"),
        kind,
        prompt: String::new(),
        options: Vec::new(),
    })
}

/// Parse the sync agent's `### Updated: <task-id>` blocks, returning
/// (task reference, new content) pairs. Content is everything under a
/// "New content" label up to the next block.
pub fn parse_sync_updates(output: &str) -> Vec<(String, String)> {
    let mut updates: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<String>, bool)> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(target) = trimmed.strip_prefix("### Updated:") {
            if let Some((task, lines, _)) = current.take() {
                push_update(&mut updates, task, lines);
            }
            current = Some((target.trim().to_string(), Vec::new(), false));
            continue;
        }
        let Some((_, lines, in_content)) = current.as_mut() else {
            continue;
        };
        let lowered = trimmed.trim_start_matches('#').trim().to_lowercase();
        if lowered == "new content" || lowered == "new content:" {
            *in_content = true;
            continue;
        }
        if *in_content {
            lines.push(line.to_string());
        }
    }
    if let Some((task, lines, _)) = current.take() {
        push_update(&mut updates, task, lines);
    }
    updates
}

fn push_update(updates: &mut Vec<(String, String)>, task: String, lines: Vec<String>) {
    let content = lines.join("\n").trim().to_string();
    if !task.is_empty() && !content.is_empty() {
        updates.push((task, content));
    }
}

/// Shrink the planning-progress log to fit a prompt budget: the notes prefix
/// (everything before the first run header) and the current (last) run are
/// kept; earlier runs are elided with a marker.
pub fn truncate_progress(progress: &str, max_bytes: usize) -> String {
    if progress.len() <= max_bytes {
        return progress.to_string();
    }

    let marker = "\n[earlier runs elided]\n";
    let headers: Vec<usize> = progress
        .match_indices("\n## Run ")
        .map(|(i, _)| i)
        .collect();
    let first_run = if progress.starts_with("## Run ") {
        Some(0)
    } else {
        headers.first().copied()
    };

    let (prefix, last_run) = match (first_run, headers.last()) {
        (Some(first), Some(last)) => (&progress[..first], &progress[*last..]),
        _ => ("", progress),
    };

    let mut kept = String::new();
    kept.push_str(prefix);
    kept.push_str(marker);
    kept.push_str(last_run);

    // Still over budget: hard-tail the result, keeping the newest text.
    if kept.len() > max_bytes {
        let mut cut = kept.len() - max_bytes;
        while cut < kept.len() && !kept.is_char_boundary(cut) {
            cut += 1;
        }
        kept = format!("[truncated]\n{}", &kept[cut..]);
    }
    kept
}

/// Head-truncate free text (plan slices in worker prompts).
pub fn truncate_head(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated]", &text[..cut])
}
