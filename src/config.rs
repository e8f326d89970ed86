//! Configuration for ci-triage
//!
//! Resolved once at startup from built-in defaults, an optional TOML file,
//! the environment and command-line flags (in increasing precedence), then
//! shared read-only with every component.

use crate::github::{get_remote_info, parse_repository_slug};
use crate::llm::agentic::ToolLoopConfig;
use crate::llm::models::ModelProfile;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_MODEL: &str = "openai/gpt-4.1";
pub const DEFAULT_LLM_ENDPOINT: &str = "https://models.github.ai/inference/chat/completions";
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_MAX_ROUNDS: usize = 20;
pub const DEFAULT_BRANCH_PREFIX: &str = "ci-triage";

/// Looked up inside the workspace when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = ".github/ci-triage.toml";

#[derive(Debug, Clone)]
pub struct Config {
    pub github_token: String,
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub run_id: u64,
    /// Root that every file read and write is confined to
    pub workspace: PathBuf,
    pub step_summary: Option<PathBuf>,
    pub model: String,
    /// Tuning derived from `model`
    pub profile: ModelProfile,
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub max_rounds: usize,
    pub auto_fix: bool,
    pub dry_run: bool,
    pub branch_prefix: String,
    pub slack_webhook: Option<String>,
}

/// Non-secret settings that may be committed to the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model: Option<String>,
    pub llm_endpoint: Option<String>,
    pub max_rounds: Option<usize>,
    pub auto_fix: Option<bool>,
    pub branch_prefix: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// An explicit path must exist; the default location is optional.
    pub fn discover(workspace: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default = workspace.join(DEFAULT_CONFIG_PATH);
        if default.is_file() {
            Self::load(&default)
        } else {
            Ok(Self::default())
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub workspace: Option<PathBuf>,
    pub run_id: Option<u64>,
    pub model: Option<String>,
    pub dry_run: bool,
    pub no_fix: bool,
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn load(env: &dyn Fn(&str) -> Option<String>, overrides: &Overrides) -> Result<Self> {
        let workspace = resolve_workspace(env, overrides);
        let file = FileConfig::discover(&workspace, overrides.config_path.as_deref())?;
        Self::resolve(file, env, overrides)
    }

    /// Merge every source into one validated configuration.
    ///
    /// All validation problems are reported together in a single error.
    pub fn resolve(
        file: FileConfig,
        env: &dyn Fn(&str) -> Option<String>,
        overrides: &Overrides,
    ) -> Result<Self> {
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut problems: Vec<String> = Vec::new();

        let workspace = resolve_workspace(env, overrides);

        let github_token = var("GITHUB_TOKEN").unwrap_or_else(|| {
            problems.push("GITHUB_TOKEN is not set".to_string());
            String::new()
        });

        let run_id = match overrides.run_id {
            Some(id) => id,
            None => match var("GITHUB_RUN_ID") {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    problems.push(format!("GITHUB_RUN_ID is not a number: {}", raw));
                    0
                }),
                None => {
                    problems.push("GITHUB_RUN_ID is not set (or pass --run-id)".to_string());
                    0
                }
            },
        };

        let (owner, repo) = match var("GITHUB_REPOSITORY") {
            Some(slug) => parse_repository_slug(&slug).unwrap_or_else(|| {
                problems.push(format!("GITHUB_REPOSITORY must look like owner/repo, got {}", slug));
                (String::new(), String::new())
            }),
            None => get_remote_info(&workspace).unwrap_or_else(|e| {
                problems.push(format!("GITHUB_REPOSITORY is not set and {:#}", e));
                (String::new(), String::new())
            }),
        };

        let api_url = var("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        check_url("GITHUB_API_URL", &api_url, &mut problems);

        let model = overrides
            .model
            .clone()
            .or_else(|| var("TRIAGE_MODEL"))
            .or(file.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let llm_endpoint = var("TRIAGE_LLM_ENDPOINT")
            .or(file.llm_endpoint)
            .unwrap_or_else(|| DEFAULT_LLM_ENDPOINT.to_string());
        check_url("TRIAGE_LLM_ENDPOINT", &llm_endpoint, &mut problems);

        let llm_api_key = var("TRIAGE_LLM_API_KEY")
            .unwrap_or_else(|| github_token.clone());

        let max_rounds = match var("TRIAGE_MAX_ROUNDS") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                problems.push(format!("TRIAGE_MAX_ROUNDS is not a number: {}", raw));
                DEFAULT_MAX_ROUNDS
            }),
            None => file.max_rounds.unwrap_or(DEFAULT_MAX_ROUNDS),
        };
        if max_rounds == 0 {
            problems.push("max_rounds must be at least 1".to_string());
        }

        let auto_fix = match var("TRIAGE_AUTO_FIX") {
            Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                problems.push(format!("TRIAGE_AUTO_FIX is not a boolean: {}", raw));
                true
            }),
            None => file.auto_fix.unwrap_or(true),
        } && !overrides.no_fix;

        let dry_run = overrides.dry_run
            || match var("TRIAGE_DRY_RUN") {
                Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                    problems.push(format!("TRIAGE_DRY_RUN is not a boolean: {}", raw));
                    false
                }),
                None => false,
            };

        let branch_prefix = file
            .branch_prefix
            .map(|prefix| prefix.trim_matches('/').to_string())
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| DEFAULT_BRANCH_PREFIX.to_string());

        let slack_webhook = var("SLACK_WEBHOOK_URL");
        if let Some(url) = &slack_webhook {
            check_url("SLACK_WEBHOOK_URL", url, &mut problems);
        }

        if !problems.is_empty() {
            bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }

        Ok(Config {
            github_token,
            api_url,
            owner,
            repo,
            run_id,
            step_summary: var("GITHUB_STEP_SUMMARY").map(PathBuf::from),
            workspace,
            profile: ModelProfile::for_model(&model),
            model,
            llm_endpoint,
            llm_api_key,
            max_rounds,
            auto_fix,
            dry_run,
            branch_prefix,
            slack_webhook,
        })
    }

    /// `owner/repo`
    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn tool_loop_config(&self) -> ToolLoopConfig {
        ToolLoopConfig {
            max_rounds: self.max_rounds,
            ..ToolLoopConfig::new(&self.model)
        }
    }
}

fn resolve_workspace(env: &dyn Fn(&str) -> Option<String>, overrides: &Overrides) -> PathBuf {
    overrides
        .workspace
        .clone()
        .or_else(|| env("GITHUB_WORKSPACE").filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn check_url(name: &str, raw: &str, problems: &mut Vec<String>) {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => problems.push(format!("{} must be http(s), got {}", name, url.scheme())),
        Err(e) => problems.push(format!("{} is not a valid URL ({})", name, e)),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn base_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GITHUB_TOKEN", "ghs_token"),
            ("GITHUB_REPOSITORY", "octo/widgets"),
            ("GITHUB_RUN_ID", "987"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), &env_of(&base_env()), &Overrides::default())
            .unwrap();

        assert_eq!(config.repository(), "octo/widgets");
        assert_eq!(config.run_id, 987);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.llm_endpoint, DEFAULT_LLM_ENDPOINT);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.llm_api_key, "ghs_token");
        assert_eq!(config.max_rounds, 20);
        assert_eq!(config.branch_prefix, "ci-triage");
        assert!(config.auto_fix);
        assert!(!config.dry_run);
        assert!(config.slack_webhook.is_none());
        assert_eq!(config.workspace, PathBuf::from("."));
        assert_eq!(config.profile, ModelProfile::for_model(DEFAULT_MODEL));
    }

    #[test]
    fn test_precedence_file_env_cli() {
        let file = FileConfig {
            model: Some("file-model".to_string()),
            max_rounds: Some(8),
            auto_fix: Some(false),
            branch_prefix: Some("bot/fixes/".to_string()),
            ..Default::default()
        };
        let mut env = base_env();
        env.push(("TRIAGE_MODEL", "env-model"));
        env.push(("TRIAGE_MAX_ROUNDS", "12"));
        let overrides = Overrides {
            model: Some("microsoft/phi-4-mini".to_string()),
            run_id: Some(5),
            ..Default::default()
        };

        let config = Config::resolve(file, &env_of(&env), &overrides).unwrap();

        assert_eq!(config.model, "microsoft/phi-4-mini");
        assert_eq!(config.profile, ModelProfile::SMALL);
        assert_eq!(config.run_id, 5);
        assert_eq!(config.max_rounds, 12);
        assert!(!config.auto_fix);
        assert_eq!(config.branch_prefix, "bot/fixes");
        assert_eq!(config.tool_loop_config().max_rounds, 12);
        assert_eq!(config.tool_loop_config().model, "microsoft/phi-4-mini");
    }

    #[test]
    fn test_flags_and_secrets() {
        let mut env = base_env();
        env.push(("TRIAGE_LLM_API_KEY", "sk-llm"));
        env.push(("TRIAGE_DRY_RUN", "yes"));
        env.push(("SLACK_WEBHOOK_URL", "https://hooks.slack.com/services/T/B/X"));
        env.push(("GITHUB_STEP_SUMMARY", "/tmp/summary.md"));
        let overrides = Overrides {
            no_fix: true,
            ..Default::default()
        };

        let config = Config::resolve(FileConfig::default(), &env_of(&env), &overrides).unwrap();

        assert_eq!(config.llm_api_key, "sk-llm");
        assert!(config.dry_run);
        assert!(!config.auto_fix);
        assert_eq!(config.step_summary, Some(PathBuf::from("/tmp/summary.md")));
        assert!(config.slack_webhook.is_some());
    }

    #[test]
    fn test_problems_are_reported_together() {
        let env = env_of(&[
            ("GITHUB_REPOSITORY", "not-a-slug"),
            ("TRIAGE_MAX_ROUNDS", "many"),
            ("TRIAGE_LLM_ENDPOINT", "not a url"),
            ("TRIAGE_AUTO_FIX", "sometimes"),
        ]);

        let err = Config::resolve(FileConfig::default(), &env, &Overrides::default()).unwrap_err();
        let msg = err.to_string();

        assert!(msg.contains("GITHUB_TOKEN is not set"));
        assert!(msg.contains("GITHUB_RUN_ID is not set"));
        assert!(msg.contains("owner/repo"));
        assert!(msg.contains("TRIAGE_MAX_ROUNDS"));
        assert!(msg.contains("TRIAGE_LLM_ENDPOINT"));
        assert!(msg.contains("TRIAGE_AUTO_FIX"));
    }

    #[test]
    fn test_zero_rounds_rejected() {
        let mut env = base_env();
        env.push(("TRIAGE_MAX_ROUNDS", "0"));
        assert!(Config::resolve(FileConfig::default(), &env_of(&env), &Overrides::default()).is_err());
    }

    #[test]
    fn test_repository_falls_back_to_git_remote() {
        let dir = tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        repo.remote("origin", "git@github.com:octo/from-remote.git").unwrap();

        let env = env_of(&[("GITHUB_TOKEN", "t"), ("GITHUB_RUN_ID", "1")]);
        let overrides = Overrides {
            workspace: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = Config::resolve(FileConfig::default(), &env, &overrides).unwrap();
        assert_eq!(config.repository(), "octo/from-remote");
    }

    #[test]
    fn test_file_config_discovery() {
        let dir = tempdir().unwrap();
        assert_eq!(FileConfig::discover(dir.path(), None).unwrap(), FileConfig::default());

        fs::create_dir_all(dir.path().join(".github")).unwrap();
        fs::write(
            dir.path().join(DEFAULT_CONFIG_PATH),
            "model = \"openai/gpt-4o-mini\"\nauto_fix = false\n",
        )
        .unwrap();
        let file = FileConfig::discover(dir.path(), None).unwrap();
        assert_eq!(file.model.as_deref(), Some("openai/gpt-4o-mini"));
        assert_eq!(file.auto_fix, Some(false));

        let missing = dir.path().join("nope.toml");
        assert!(FileConfig::discover(dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.toml");
        fs::write(&path, "github_token = \"leak\"\n").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_reads_workspace_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".github")).unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_PATH), "max_rounds = 6\n").unwrap();
        let workspace = dir.path().to_string_lossy().to_string();
        let mut env: Vec<(&str, &str)> = base_env();
        env.push(("GITHUB_WORKSPACE", workspace.as_str()));

        let config = Config::load(&env_of(&env), &Overrides::default()).unwrap();
        assert_eq!(config.max_rounds, 6);
        assert_eq!(config.workspace, dir.path());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
