//! Publish an applied fix as a branch, commit and pull request.
//!
//! Objects are built bottom-up through the git data API (blobs, a tree over
//! the base tree, a commit) and the branch ref is created only once all of
//! them exist, so a failed publish never leaves a half-built branch behind.

use crate::github::{
    CiBackend, NewPullRequest, NewTreeEntry, RunInfo, DEFAULT_FILE_MODE, SYMLINK_MODE,
};
use crate::llm::diagnose::Diagnosis;
use crate::llm::fix::AppliedFile;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

/// Where a published fix ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeResult {
    pub branch_name: String,
    pub commit_sha: String,
    pub pr_url: String,
}

pub async fn publish_fix(
    ci: &dyn CiBackend,
    run: &RunInfo,
    diagnosis: &Diagnosis,
    files: &[AppliedFile],
    branch_prefix: &str,
    now: DateTime<Utc>,
) -> Result<ChangeResult> {
    if files.is_empty() {
        bail!("No changed files to publish");
    }

    let base_sha = base_commit(run);
    let base_tree = ci
        .commit_tree(base_sha)
        .await
        .with_context(|| format!("Failed to read base commit {}", base_sha))?;
    let modes: HashMap<String, String> = ci
        .tree_entries(&base_tree)
        .await
        .context("Failed to read base tree")?
        .into_iter()
        // Published content is always a regular file.
        .filter(|entry| entry.kind == "blob" && entry.mode != SYMLINK_MODE)
        .map(|entry| (entry.path, entry.mode))
        .collect();

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let blob = ci
            .create_blob(&file.content)
            .await
            .with_context(|| format!("Failed to upload {}", file.path))?;
        let mode = modes
            .get(&file.path)
            .map(String::as_str)
            .unwrap_or(DEFAULT_FILE_MODE);
        entries.push(NewTreeEntry::blob(file.path.clone(), mode, blob));
    }

    let tree = ci
        .create_tree(&base_tree, &entries)
        .await
        .context("Failed to create tree")?;
    let commit_sha = ci
        .create_commit(&commit_message(run, diagnosis), &tree, base_sha)
        .await
        .context("Failed to create commit")?;

    let target = match target_branch(run) {
        Some(branch) => branch.to_string(),
        None => ci
            .default_branch()
            .await
            .context("Failed to read default branch")?,
    };

    let branch_name = branch_name(branch_prefix, run.id, now);
    ci.create_branch(&branch_name, &commit_sha)
        .await
        .with_context(|| format!("Failed to create branch {}", branch_name))?;
    info!(branch = %branch_name, commit = %commit_sha, "fix branch created");

    let request = NewPullRequest {
        title: pr_title(run, diagnosis),
        body: pr_body(run, diagnosis, files),
        head: branch_name.clone(),
        base: target,
    };
    let pr_url = ci
        .create_pull_request(&request)
        .await
        .with_context(|| format!("Branch {} was pushed but opening the pull request failed", branch_name))?;
    info!(%pr_url, "fix pull request opened");

    Ok(ChangeResult {
        branch_name,
        commit_sha,
        pr_url,
    })
}

/// The PR head when the run belongs to a pull request, else the run's commit.
fn base_commit(run: &RunInfo) -> &str {
    run.pull_request()
        .map(|pr| pr.head.sha.as_str())
        .unwrap_or(run.head_sha.as_str())
}

/// The PR's branch, else the triggering branch. `None` means the default branch.
fn target_branch(run: &RunInfo) -> Option<&str> {
    run.pull_request()
        .map(|pr| pr.head.branch.as_str())
        .or(run.head_branch.as_deref())
        .filter(|branch| !branch.is_empty())
}

fn branch_name(prefix: &str, run_id: u64, now: DateTime<Utc>) -> String {
    format!(
        "{}/run-{}-{}",
        prefix.trim_end_matches('/'),
        run_id,
        now.format("%Y%m%d%H%M%S")
    )
}

fn pr_title(run: &RunInfo, diagnosis: &Diagnosis) -> String {
    format!(
        "Fix {} failure in {}",
        diagnosis.category.as_str(),
        run.name.as_deref().unwrap_or("CI")
    )
}

fn commit_message(run: &RunInfo, diagnosis: &Diagnosis) -> String {
    format!(
        "fix(ci): {} failure in run {}\n\nCategory: {}\nRoot cause: {}\nSuggested fix: {}\n",
        diagnosis.category.as_str(),
        run.id,
        diagnosis.category.as_str(),
        diagnosis.root_cause,
        diagnosis.suggested_fix
    )
}

fn pr_body(run: &RunInfo, diagnosis: &Diagnosis, files: &[AppliedFile]) -> String {
    let changed = files
        .iter()
        .map(|file| format!("- `{}`", file.path))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Automated fix for [workflow run {}]({}).\n\n**Root cause:** {}\n\n**Fix:** {}\n\n**Confidence:** {}\n\n### Changed files\n{}\n\nPlease review before merging.",
        run.id,
        run.html_url,
        diagnosis.root_cause,
        diagnosis.suggested_fix,
        diagnosis.confidence.as_str(),
        changed
    )
}
