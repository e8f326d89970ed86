use super::agentic::ToolLoop;
use super::diagnose::Diagnosis;
use super::parse::decode_structured;
use super::prompts::{fix_user_prompt, FIX_SYSTEM};
use super::tools::{ToolContext, ToolRegistry};
use crate::util::{normalize_relative_path, resolve_in_workspace};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use tracing::{info, warn};

// ═══════════════════════════════════════════════════════════════════════════
//  FIX GENERATION
// ═══════════════════════════════════════════════════════════════════════════

/// Full replacement contents keyed by repository-relative path.
///
/// An empty bundle means the model had no confident fix; it is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FixBundle {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl FixBundle {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// Ask the model for a fix using the read-only tool set.
///
/// Refuses to run for a diagnosis that is not marked fixable.
pub async fn generate_fix(
    tool_loop: &ToolLoop,
    ctx: &ToolContext,
    diagnosis: &Diagnosis,
) -> Result<FixBundle> {
    if !diagnosis.fixable {
        bail!("Diagnosis is not marked fixable");
    }

    let registry = ToolRegistry::fix()?;
    let prompt = fix_user_prompt(diagnosis);
    let text = tool_loop
        .run_tool_loop(FIX_SYSTEM, &prompt, &registry, ctx)
        .await
        .context("Fix conversation failed")?;
    let bundle: FixBundle = decode_structured(&text, "fix")?;

    if bundle.is_empty() {
        info!("no confident fix");
    } else {
        info!(files = bundle.len(), "fix generated");
    }
    Ok(bundle)
}

// ═══════════════════════════════════════════════════════════════════════════
//  APPLYING TO THE WORKSPACE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFile {
    /// Normalized, `/`-separated path relative to the workspace root
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub written: Vec<AppliedFile>,
    /// Entries identical to what is already on disk
    pub unchanged: Vec<String>,
    pub skipped: Vec<SkippedFile>,
}

/// Write the bundle into the workspace.
///
/// Every path goes through the same safety check as `read_file`. Unsafe or
/// unwritable entries are skipped with a warning; the rest still apply.
pub fn apply_fix(workspace: &Path, bundle: &FixBundle) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    for (path, content) in &bundle.files {
        let mut skip = |reason: String| {
            warn!(path = %path, %reason, "skipping fix entry");
            outcome.skipped.push(SkippedFile {
                path: path.clone(),
                reason,
            });
        };

        let relative = match normalize_relative_path(path) {
            Ok(relative) => relative,
            Err(reason) => {
                skip(reason);
                continue;
            }
        };
        let target = match resolve_in_workspace(workspace, path) {
            Ok(target) => target,
            Err(reason) => {
                skip(reason);
                continue;
            }
        };
        if let Some(link) = symlink_on_path(&target, &relative) {
            skip(format!("{} goes through symlink {}", path, link));
            continue;
        }
        if target.is_dir() {
            skip(format!("{} is a directory", path));
            continue;
        }
        if fs::read(&target).is_ok_and(|existing| existing == content.as_bytes()) {
            outcome.unchanged.push(repo_path(&relative));
            continue;
        }
        if let Some(parent) = target.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                skip(format!("Failed to create {}: {}", parent.display(), e));
                continue;
            }
        }
        if let Err(e) = fs::write(&target, content) {
            skip(format!("Failed to write: {}", e));
            continue;
        }

        outcome.written.push(AppliedFile {
            path: repo_path(&relative),
            content: content.clone(),
        });
    }

    info!(
        written = outcome.written.len(),
        unchanged = outcome.unchanged.len(),
        skipped = outcome.skipped.len(),
        "fix applied to workspace"
    );
    outcome
}

/// First existing symlink among `target` and its ancestors inside the
/// workspace, as a repo path.
fn symlink_on_path(target: &Path, relative: &Path) -> Option<String> {
    let depth = relative.components().count();
    target
        .ancestors()
        .take(depth)
        .zip(relative.ancestors())
        .filter(|(absolute, _)| {
            fs::symlink_metadata(absolute).is_ok_and(|meta| meta.file_type().is_symlink())
        })
        .last()
        .map(|(_, rel)| repo_path(rel))
}

fn repo_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
