use std::future::Future;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Appended whenever text is cut down to a character budget.
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Cap `s` to `max_chars` characters, marking the cut with [`TRUNCATION_MARKER`].
///
/// The marker counts against the budget: the returned string never has more
/// than `max_chars` characters.
pub fn cap_chars(s: &str, max_chars: usize) -> String {
    // Byte length bounds char count from above.
    if s.len() <= max_chars || s.chars().count() <= max_chars {
        return s.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return s.chars().take(max_chars).collect();
    }

    let mut capped: String = s.chars().take(max_chars - marker_len).collect();
    capped.push_str(TRUNCATION_MARKER);
    capped
}

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
pub fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "api_key",
        "ghp_",
        "gho_",
        "ghs_",
        "github_pat_",
        "sk-",
    ];

    let truncated = truncate(body.trim(), MAX_ERROR_BODY_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

/// Validate a caller-supplied relative path and return its normalized form.
///
/// Rejects empty paths, absolute paths (including drive-letter and UNC forms),
/// any `..` segment, and anything inside `.git`. `.` segments are dropped.
pub fn normalize_relative_path(candidate: &str) -> Result<PathBuf, String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err("Path is empty".to_string());
    }

    let looks_absolute = trimmed.starts_with('/')
        || trimmed.starts_with('\\')
        || trimmed.starts_with('~')
        || has_drive_prefix(trimmed);
    let path = Path::new(trimmed);
    if looks_absolute || path.is_absolute() || path.has_root() {
        return Err(format!("Absolute paths are not allowed: {}", trimmed));
    }

    // Catch `..` hidden behind backslash separators, which unix paths treat
    // as ordinary file-name characters.
    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(format!("Parent traversal is not allowed: {}", trimmed));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                return Err(format!("Parent traversal is not allowed: {}", trimmed));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("Absolute paths are not allowed: {}", trimmed));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(format!("Path does not name a file: {}", trimmed));
    }
    if normalized
        .components()
        .next()
        .is_some_and(|first| first.as_os_str() == ".git")
    {
        return Err(format!("Paths inside .git are not allowed: {}", trimmed));
    }

    Ok(normalized)
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

/// Resolve a relative path inside `workspace_root`, allowing files that do
/// not exist yet.
///
/// After the lexical check, the deepest existing ancestor is canonicalized and
/// must still live under the canonical root, which keeps symlinks from
/// leading reads or writes out of the workspace.
pub fn resolve_in_workspace(workspace_root: &Path, candidate: &str) -> Result<PathBuf, String> {
    let relative = normalize_relative_path(candidate)?;
    let root = workspace_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve workspace root: {}", e))?;
    let joined = root.join(&relative);

    let existing = canonicalize_existing_ancestor(&joined)?;
    if !existing.starts_with(&root) {
        return Err(format!("Path escapes the workspace: {}", candidate.trim()));
    }

    Ok(joined)
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Run `fut` to completion unless `cancel` fires first, in which case the
/// future is dropped and `None` is returned.
pub async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}
