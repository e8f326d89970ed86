//! End-to-end triage of one failed workflow run.
//!
//! Diagnosis is the only stage allowed to fail the run. Fix generation,
//! application and publishing are best-effort and end up as a [`FixStatus`]
//! in the report, which is always delivered.

use crate::config::Config;
use crate::github::CiBackend;
use crate::llm::agentic::ToolLoop;
use crate::llm::client::ChatBackend;
use crate::llm::diagnose::{diagnose, Diagnosis};
use crate::llm::fix::{apply_fix, generate_fix};
use crate::llm::tools::ToolContext;
use crate::publish::publish_fix;
use crate::report::{FixStatus, Report, ReportOutcome, Reporter};
use crate::util::cancellable;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub struct TriageOutcome {
    pub diagnosis: Diagnosis,
    pub fix: FixStatus,
    pub report: ReportOutcome,
}

pub struct Triage {
    config: Arc<Config>,
    ci: Arc<dyn CiBackend>,
    tool_loop: ToolLoop,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl Triage {
    pub fn new(
        config: Arc<Config>,
        ci: Arc<dyn CiBackend>,
        chat: Arc<dyn ChatBackend>,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Self {
        let tool_loop = ToolLoop::new(chat, config.tool_loop_config(), cancel.clone());
        Triage {
            config,
            ci,
            tool_loop,
            reporter,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<TriageOutcome> {
        let config = &self.config;
        let run = cancellable(&self.cancel, self.ci.run_info(config.run_id))
            .await
            .ok_or_else(|| anyhow!("Cancelled before the run was loaded"))?
            .with_context(|| format!("Failed to load workflow run {}", config.run_id))?;
        info!(
            run_id = run.id,
            event = %run.event,
            branch = run.head_branch.as_deref().unwrap_or("-"),
            model = %config.model,
            "triaging failed run"
        );

        let repository = config.repository();
        let ctx = ToolContext::new(self.ci.clone(), config.workspace.clone(), run, config.profile);
        let diagnosis = diagnose(&self.tool_loop, &ctx, &repository).await?;

        let fix = self.fix_stage(&ctx, &diagnosis).await;
        info!(status = %fix.describe(), "fix stage finished");

        let failed_jobs = ctx.failed_job_names();
        let report = self
            .reporter
            .report(&Report {
                repository: &repository,
                run: &ctx.run,
                diagnosis: &diagnosis,
                fix: &fix,
                failed_jobs: &failed_jobs,
            })
            .await;

        Ok(TriageOutcome {
            diagnosis,
            fix,
            report,
        })
    }

    async fn fix_stage(&self, ctx: &ToolContext, diagnosis: &Diagnosis) -> FixStatus {
        let config = &self.config;
        if !config.auto_fix {
            return FixStatus::Disabled;
        }
        if !diagnosis.fixable {
            return FixStatus::NotFixable;
        }

        let bundle = match generate_fix(&self.tool_loop, ctx, diagnosis).await {
            Ok(bundle) => bundle,
            Err(e) => return failed("generate a fix", e),
        };
        if bundle.is_empty() {
            return FixStatus::NoConfidentFix;
        }

        let applied = apply_fix(&config.workspace, &bundle);
        if applied.written.is_empty() {
            return FixStatus::NothingToPublish;
        }

        if config.dry_run {
            return FixStatus::DryRun {
                files: applied.written.into_iter().map(|file| file.path).collect(),
            };
        }

        let published = cancellable(
            &self.cancel,
            publish_fix(
                self.ci.as_ref(),
                &ctx.run,
                diagnosis,
                &applied.written,
                &config.branch_prefix,
                Utc::now(),
            ),
        )
        .await;
        match published {
            Some(Ok(change)) => FixStatus::Published(change),
            Some(Err(e)) => failed("publish the fix", e),
            None => failed("publish the fix", anyhow!("cancelled")),
        }
    }
}

fn failed(stage: &'static str, error: anyhow::Error) -> FixStatus {
    let error = format!("{:#}", error);
    warn!(stage, %error, "auto-fix failed");
    FixStatus::Failed { stage, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{
        job, pr_run, test_config, text_response, tool_call_response, FakeCi, ScriptedChat,
    };
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const FIXABLE: &str = r#"{"category":"build","rootCause":"missing import of fmt","suggestedFix":"import fmt","confidence":"high","fixable":true,"affectedFiles":["main.go"]}"#;
    const NOT_FIXABLE: &str = r#"{"category":"infra","rootCause":"runner ran out of disk","confidence":"medium","fixable":false}"#;

    fn triage(config: Config, ci: &Arc<FakeCi>, chat: &Arc<ScriptedChat>) -> Triage {
        let cancel = CancellationToken::new();
        let reporter = Reporter::new(ci.clone(), None, config.step_summary.clone(), config.dry_run, cancel.clone());
        Triage::new(Arc::new(config), ci.clone(), chat.clone(), reporter, cancel)
    }

    fn workspace_with_main(dir: &Path) {
        fs::write(dir.join("main.go"), "package main\n\nfunc main() { fmt.Println(1) }\n").unwrap();
    }

    fn has_op(ci: &FakeCi, op: &str) -> bool {
        ci.ops().iter().any(|recorded| recorded == op)
    }

    #[tokio::test]
    async fn test_no_confident_fix_skips_publishing() {
        let dir = tempdir().unwrap();
        let ci = Arc::new(FakeCi::new(pr_run()));
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(text_response(FIXABLE)),
            Ok(text_response(r#"{"files": {}}"#)),
        ]));

        let outcome = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap();

        assert_eq!(outcome.fix, FixStatus::NoConfidentFix);
        assert!(!has_op(&ci, "create_blob"));
        assert!(!has_op(&ci, "create_branch"));
        assert!(!has_op(&ci, "create_pull_request"));
        assert!(outcome.report.comment_posted);
        let comments = ci.comments.lock().unwrap();
        assert_eq!(comments[0].0, 7);
        assert!(comments[0].1.contains("no confident fix"));
    }

    #[tokio::test]
    async fn test_fixable_failure_is_published_and_reported() {
        let dir = tempdir().unwrap();
        workspace_with_main(dir.path());
        let ci = Arc::new(
            FakeCi::new(pr_run())
                .with_jobs(vec![job(11, "build", "failure", Some("go build"))]),
        );
        let fixed = "package main\n\nimport \"fmt\"\n\nfunc main() { fmt.Println(1) }\n";
        let fix_answer = serde_json::json!({ "files": { "main.go": fixed } }).to_string();
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(tool_call_response(&[("c1", "list_failed_jobs", "{}")])),
            Ok(text_response(FIXABLE)),
            Ok(text_response(&fix_answer)),
        ]));

        let outcome = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap();

        let FixStatus::Published(change) = &outcome.fix else {
            panic!("expected a published fix, got {:?}", outcome.fix);
        };
        assert!(change.branch_name.starts_with("ci-triage/run-4242-"));
        assert_eq!(fs::read_to_string(dir.path().join("main.go")).unwrap(), fixed);
        assert_eq!(ci.blobs.lock().unwrap().as_slice(), [fixed.to_string()]);

        let comment = &ci.comments.lock().unwrap()[0].1;
        assert!(comment.contains(&change.pr_url));
        assert!(comment.contains("build"));
    }

    #[tokio::test]
    async fn test_diagnosis_failure_is_fatal_and_unreported() {
        let dir = tempdir().unwrap();
        let ci = Arc::new(FakeCi::new(pr_run()));
        let chat = Arc::new(ScriptedChat::new(vec![Ok(text_response("no idea, sorry"))]));

        let err = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to parse diagnosis"));
        assert!(ci.comments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run_is_fatal() {
        let dir = tempdir().unwrap();
        let ci = Arc::new(FakeCi::new(pr_run()).failing_at("run_info"));
        let chat = Arc::new(ScriptedChat::new(vec![]));

        let err = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap_err();

        assert!(err.to_string().contains("Failed to load workflow run 4242"));
        assert_eq!(chat.call_count(), 0);
    }

    #[tokio::test]
    async fn test_not_fixable_skips_fix_producer() {
        let dir = tempdir().unwrap();
        let ci = Arc::new(FakeCi::new(pr_run()));
        let chat = Arc::new(ScriptedChat::new(vec![Ok(text_response(NOT_FIXABLE))]));

        let outcome = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap();

        assert_eq!(outcome.fix, FixStatus::NotFixable);
        assert_eq!(chat.call_count(), 1);
        assert!(outcome.report.comment_posted);
    }

    #[tokio::test]
    async fn test_auto_fix_disabled() {
        let dir = tempdir().unwrap();
        let ci = Arc::new(FakeCi::new(pr_run()));
        let chat = Arc::new(ScriptedChat::new(vec![Ok(text_response(FIXABLE))]));
        let config = Config {
            auto_fix: false,
            ..test_config(dir.path())
        };

        let outcome = triage(config, &ci, &chat).run().await.unwrap();

        assert_eq!(outcome.fix, FixStatus::Disabled);
        assert_eq!(chat.call_count(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_applies_locally_only() {
        let dir = tempdir().unwrap();
        workspace_with_main(dir.path());
        let summary = dir.path().join("summary.md");
        let ci = Arc::new(FakeCi::new(pr_run()));
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(text_response(FIXABLE)),
            Ok(text_response(r#"{"files": {"main.go": "package main\n"}}"#)),
        ]));
        let config = Config {
            dry_run: true,
            step_summary: Some(summary.clone()),
            ..test_config(dir.path())
        };

        let outcome = triage(config, &ci, &chat).run().await.unwrap();

        assert_eq!(
            outcome.fix,
            FixStatus::DryRun {
                files: vec!["main.go".to_string()]
            }
        );
        assert_eq!(ci.ops(), vec!["run_info"]);
        assert!(!outcome.report.comment_posted);
        assert!(outcome.report.summary_written);
        assert!(fs::read_to_string(&summary).unwrap().contains("Dry run"));
        assert_eq!(fs::read_to_string(dir.path().join("main.go")).unwrap(), "package main\n");
    }

    #[tokio::test]
    async fn test_publish_failure_still_reports() {
        let dir = tempdir().unwrap();
        workspace_with_main(dir.path());
        let ci = Arc::new(FakeCi::new(pr_run()).failing_at("create_tree"));
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(text_response(FIXABLE)),
            Ok(text_response(r#"{"files": {"main.go": "package main\n"}}"#)),
        ]));

        let outcome = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap();

        assert!(matches!(
            outcome.fix,
            FixStatus::Failed {
                stage: "publish the fix",
                ..
            }
        ));
        assert!(!has_op(&ci, "create_branch"));
        let comment = &ci.comments.lock().unwrap()[0].1;
        assert!(comment.contains("Auto-fix failed while trying to publish the fix"));
    }

    #[tokio::test]
    async fn test_unchanged_fix_is_not_published() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        let ci = Arc::new(FakeCi::new(pr_run()));
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok(text_response(FIXABLE)),
            Ok(text_response(r#"{"files": {"main.go": "package main\n"}}"#)),
        ]));

        let outcome = triage(test_config(dir.path()), &ci, &chat).run().await.unwrap();

        assert_eq!(outcome.fix, FixStatus::NothingToPublish);
        assert!(!has_op(&ci, "create_blob"));
    }
}
