use std::path::Path;

use git2::{Oid, Repository};

/// Snapshot of HEAD recorded on registrations and task baselines.
pub struct HeadInfo {
    pub sha: String,
    pub branch: Option<String>,
}

impl HeadInfo {
    /// Label shown to peers: the branch name, or `@<short-sha>` when the
    /// head is detached.
    pub fn label(&self) -> String {
        match &self.branch {
            Some(branch) => branch.clone(),
            None => format!("@{}", self.short_sha()),
        }
    }

    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(7)]
    }
}

/// Resolve HEAD for the repository containing `root`. None outside a git
/// repository or before the first commit.
pub fn current_head_info(root: &Path) -> Option<HeadInfo> {
    let repo = Repository::discover(root).ok()?;
    let head = repo.head().ok()?;
    let sha = head.peel_to_commit().ok()?.id().to_string();
    // `shorthand` answers "HEAD" for a detached head; only a real branch
    // ref yields a name here.
    let branch = head
        .is_branch()
        .then(|| head.shorthand())
        .flatten()
        .map(str::to_owned);
    Some(HeadInfo { sha, branch })
}

pub fn branch_label(root: &Path) -> Option<String> {
    Some(current_head_info(root)?.label())
}

pub fn head_sha(root: &Path) -> Option<String> {
    Some(current_head_info(root)?.sha)
}

/// One-line `<short-sha> <summary>` entries for `start_sha..end_sha`,
/// newest first. Any resolution failure (non-git dir, unknown shas, shallow
/// clone) yields an empty list; review prompts treat that as "no commits".
pub fn commits_since(root: &Path, start_sha: &str, end_sha: &str) -> Vec<String> {
    fn walk(root: &Path, start: &str, end: &str) -> Option<Vec<String>> {
        let repo = Repository::discover(root).ok()?;
        let mut revwalk = repo.revwalk().ok()?;
        revwalk.push(Oid::from_str(end).ok()?).ok()?;
        revwalk.hide(Oid::from_str(start).ok()?).ok()?;

        let mut lines = Vec::new();
        for oid in revwalk.flatten() {
            let Ok(commit) = repo.find_commit(oid) else {
                continue;
            };
            let sha = commit.id().to_string();
            lines.push(format!(
                "{} {}",
                &sha[..sha.len().min(7)],
                commit.summary().unwrap_or("(no message)")
            ));
        }
        Some(lines)
    }
    walk(root, start_sha, end_sha).unwrap_or_default()
}

/// Textual patch of `start_sha..HEAD`, truncated at `max_bytes` with a
/// marker. None when either end cannot be resolved.
pub fn diff_since(root: &Path, start_sha: &str, max_bytes: usize) -> Option<String> {
    let repo = Repository::discover(root).ok()?;
    let start_oid = Oid::from_str(start_sha).ok()?;
    let start_tree = repo.find_commit(start_oid).ok()?.tree().ok()?;
    let head_tree = repo
        .head()
        .ok()?
        .peel_to_commit()
        .ok()?
        .tree()
        .ok()?;

    let diff = repo
        .diff_tree_to_tree(Some(&start_tree), Some(&head_tree), None)
        .ok()?;

    let mut text = String::new();
    let mut truncated = false;
    let _ = diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        if text.len() >= max_bytes {
            truncated = true;
            return false;
        }
        let origin = line.origin();
        if matches!(origin, '+' | '-' | ' ') {
            text.push(origin);
        }
        text.push_str(&String::from_utf8_lossy(line.content()));
        true
    });
    if truncated {
        text.push_str("\n[diff truncated]\n");
    }
    Some(text)
}
