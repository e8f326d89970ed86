use anyhow::{Context, Result};
use ci_triage::config::{Config, Overrides};
use ci_triage::github::{CiBackend, GithubClient};
use ci_triage::llm::client::HttpChatBackend;
use ci_triage::logging;
use ci_triage::pipeline::Triage;
use ci_triage::report::{Reporter, SlackWebhook};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "ci-triage",
    about = "Diagnose a failed GitHub Actions run and propose a fix",
    version
)]
struct Args {
    /// Repository checkout to read and patch (defaults to GITHUB_WORKSPACE, then .)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Workflow run to triage (defaults to GITHUB_RUN_ID)
    #[arg(long)]
    run_id: Option<u64>,

    /// Chat model id, e.g. openai/gpt-4.1
    #[arg(long)]
    model: Option<String>,

    /// Apply fixes locally and print the report; write nothing to GitHub or Slack
    #[arg(long)]
    dry_run: bool,

    /// Diagnose only
    #[arg(long)]
    no_fix: bool,

    /// TOML settings file (defaults to .github/ci-triage.toml in the workspace)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl From<Args> for Overrides {
    fn from(args: Args) -> Self {
        Overrides {
            workspace: args.workspace,
            run_id: args.run_id,
            model: args.model,
            dry_run: args.dry_run,
            no_fix: args.no_fix,
            config_path: args.config,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    match run(args.into()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(overrides: Overrides) -> Result<()> {
    let env = |key: &str| std::env::var(key).ok();
    let config = Arc::new(Config::load(&env, &overrides)?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let ci: Arc<dyn CiBackend> = Arc::new(GithubClient::new(
        &config.api_url,
        &config.owner,
        &config.repo,
        &config.github_token,
    )?);
    let chat = Arc::new(HttpChatBackend::new(&config.llm_endpoint, &config.llm_api_key)?);
    let slack = config
        .slack_webhook
        .as_deref()
        .map(SlackWebhook::new)
        .transpose()?;
    let reporter = Reporter::new(
        ci.clone(),
        slack,
        config.step_summary.clone(),
        config.dry_run,
        cancel.clone(),
    );

    let triage = Triage::new(config.clone(), ci, chat, reporter, cancel);
    let outcome = triage.run().await?;
    info!(
        comment = outcome.report.comment_posted,
        slack = outcome.report.slack_posted,
        summary = outcome.report.summary_written,
        "report delivered"
    );

    let json = serde_json::to_string_pretty(&outcome.diagnosis)
        .context("Failed to serialize diagnosis")?;
    println!("{}", json);
    Ok(())
}
