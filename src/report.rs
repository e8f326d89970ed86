//! Human-readable triage report and the sinks it is delivered to.
//!
//! Every sink is optional and best-effort: a failed comment, webhook or
//! summary write is logged and the remaining sinks still run.

use crate::github::{CiBackend, RunInfo};
use crate::llm::diagnose::Diagnosis;
use crate::publish::ChangeResult;
use crate::util::{cancellable, sanitize_error_body, truncate};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SLACK_TIMEOUT_SECS: u64 = 10;
/// Slack rejects section text longer than 3000 characters
const SLACK_SECTION_CHARS: usize = 2_900;

/// What happened to the fix stage, as reported to humans
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixStatus {
    /// Auto-fix is switched off in the configuration
    Disabled,
    NotFixable,
    NoConfidentFix,
    /// The fix matched the files already on disk or every entry was unsafe
    NothingToPublish,
    Failed { stage: &'static str, error: String },
    DryRun { files: Vec<String> },
    Published(ChangeResult),
}

impl FixStatus {
    pub fn describe(&self) -> String {
        match self {
            FixStatus::Disabled => "Auto-fix is disabled for this repository.".to_string(),
            FixStatus::NotFixable => {
                "Auto-fix was not attempted: the failure does not look fixable from the repository."
                    .to_string()
            }
            FixStatus::NoConfidentFix => {
                "Auto-fix was attempted but no confident fix was found.".to_string()
            }
            FixStatus::NothingToPublish => {
                "Auto-fix produced no file changes to publish.".to_string()
            }
            FixStatus::Failed { stage, error } => {
                format!("Auto-fix failed while trying to {}: {}", stage, error)
            }
            FixStatus::DryRun { files } => format!(
                "Dry run: a fix touching {} file(s) was applied locally and not published.",
                files.len()
            ),
            FixStatus::Published(change) => format!("Fix PR: {}", change.pr_url),
        }
    }
}

/// Everything a report is composed from
pub struct Report<'a> {
    pub repository: &'a str,
    pub run: &'a RunInfo,
    pub diagnosis: &'a Diagnosis,
    pub fix: &'a FixStatus,
    pub failed_jobs: &'a [String],
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn affected_files_line(diagnosis: &Diagnosis) -> String {
    if diagnosis.affected_files.is_empty() {
        "_none identified_".to_string()
    } else {
        diagnosis
            .affected_files
            .iter()
            .map(|path| format!("`{}`", path))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ============================================================================
// Composition
// ============================================================================

/// Markdown body used for the PR comment and the step summary.
pub fn compose_markdown(report: &Report<'_>) -> String {
    let d = report.diagnosis;
    let mut out = format!(
        "## CI triage: {} failure\n\n| Category | Confidence | Fixable |\n|---|---|---|\n| {} | {} | {} |\n\n",
        d.category.as_str(),
        d.category.as_str(),
        d.confidence.as_str(),
        yes_no(d.fixable),
    );
    out.push_str(&format!("**Root cause:** {}\n\n", d.root_cause));
    if !d.suggested_fix.is_empty() {
        out.push_str(&format!("**Suggested fix:** {}\n\n", d.suggested_fix));
    }
    out.push_str(&format!("**Affected files:** {}\n\n", affected_files_line(d)));
    if !report.failed_jobs.is_empty() {
        out.push_str(&format!("**Failed jobs:** {}\n\n", report.failed_jobs.join(", ")));
    }
    out.push_str(&format!("**Auto-fix:** {}\n\n", report.fix.describe()));
    out.push_str(&format!(
        "<sub>Workflow run [#{}]({})</sub>\n",
        report.run.id, report.run.html_url
    ));
    out
}

fn mrkdwn_section(title: &str, body: &str) -> Value {
    json!({
        "type": "section",
        "text": {
            "type": "mrkdwn",
            "text": format!("*{}:*\n{}", title, truncate(body, SLACK_SECTION_CHARS)),
        }
    })
}

/// Block Kit payload for an incoming webhook.
pub fn compose_slack_payload(report: &Report<'_>) -> Value {
    let d = report.diagnosis;
    let branch = report.run.head_branch.as_deref().unwrap_or("(detached)");
    let jobs = if report.failed_jobs.is_empty() {
        "_not collected_".to_string()
    } else {
        report
            .failed_jobs
            .iter()
            .map(|name| format!("• {}", name))
            .collect::<Vec<_>>()
            .join("\n")
    };

    json!({
        "text": format!(
            "CI failure in {} ({}): {}",
            report.repository,
            branch,
            d.category.as_str()
        ),
        "blocks": [
            {
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": format!("CI failure: {}", d.category.as_str()),
                }
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*Repository:*\n{}", report.repository) },
                    { "type": "mrkdwn", "text": format!("*Branch:*\n{}", branch) },
                    { "type": "mrkdwn", "text": format!("*Confidence:*\n{}", d.confidence.as_str()) },
                    { "type": "mrkdwn", "text": format!("*Fixable:*\n{}", yes_no(d.fixable)) },
                ]
            },
            mrkdwn_section("Root cause", &d.root_cause),
            mrkdwn_section("Suggested fix", &d.suggested_fix),
            mrkdwn_section("Failed jobs", &jobs),
            mrkdwn_section("Auto-fix", &report.fix.describe()),
            {
                "type": "context",
                "elements": [
                    { "type": "mrkdwn", "text": format!("<{}|View workflow run #{}>", report.run.html_url, report.run.id) }
                ]
            }
        ]
    })
}

// ============================================================================
// Sinks
// ============================================================================

pub struct SlackWebhook {
    http: reqwest::Client,
    url: String,
}

impl SlackWebhook {
    pub fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(SLACK_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(SlackWebhook {
            http,
            url: url.to_string(),
        })
    }

    pub async fn post(&self, payload: &Value) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .context("Failed to send Slack notification")?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow::anyhow!(
            "Slack webhook returned {}: {}",
            status,
            sanitize_error_body(&body)
        ))
    }
}

/// Which sinks accepted the report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    pub comment_posted: bool,
    pub slack_posted: bool,
    pub summary_written: bool,
}

pub struct Reporter {
    ci: Arc<dyn CiBackend>,
    slack: Option<SlackWebhook>,
    step_summary: Option<PathBuf>,
    dry_run: bool,
    cancel: CancellationToken,
}

impl Reporter {
    pub fn new(
        ci: Arc<dyn CiBackend>,
        slack: Option<SlackWebhook>,
        step_summary: Option<PathBuf>,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Self {
        Reporter {
            ci,
            slack,
            step_summary,
            dry_run,
            cancel,
        }
    }

    /// Deliver the report to every configured sink. Never fails.
    pub async fn report(&self, report: &Report<'_>) -> ReportOutcome {
        let markdown = compose_markdown(report);
        let mut outcome = ReportOutcome::default();

        if self.dry_run {
            info!("dry run: skipping PR comment and Slack notification");
            eprintln!("{}", markdown);
        } else {
            outcome.comment_posted = self.post_comment(report.run, &markdown).await;
            outcome.slack_posted = self.notify_slack(report).await;
        }

        if let Some(path) = &self.step_summary {
            match append_step_summary(path, &markdown) {
                Ok(()) => outcome.summary_written = true,
                Err(e) => warn!(error = %format!("{:#}", e), "failed to write step summary"),
            }
        }

        outcome
    }

    async fn post_comment(&self, run: &RunInfo, markdown: &str) -> bool {
        let Some(pr) = run.pull_request() else {
            return false;
        };
        match cancellable(&self.cancel, self.ci.create_issue_comment(pr.number, markdown)).await {
            Some(Ok(())) => {
                info!(pr = pr.number, "posted triage comment");
                true
            }
            Some(Err(e)) => {
                warn!(pr = pr.number, error = %format!("{:#}", e), "failed to post PR comment");
                false
            }
            None => false,
        }
    }

    async fn notify_slack(&self, report: &Report<'_>) -> bool {
        let Some(slack) = &self.slack else {
            return false;
        };
        let payload = compose_slack_payload(report);
        match cancellable(&self.cancel, slack.post(&payload)).await {
            Some(Ok(())) => {
                info!("posted Slack notification");
                true
            }
            Some(Err(e)) => {
                warn!(error = %format!("{:#}", e), "failed to post Slack notification");
                false
            }
            None => false,
        }
    }
}

fn append_step_summary(path: &Path, markdown: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", markdown).context("Failed to append step summary")
}
