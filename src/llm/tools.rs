//! Tools the model can call while investigating a failed run.
//!
//! Two registries exist: the diagnostic set can enumerate jobs, pull logs,
//! read run metadata and read files; the fix set can only read files. A tool
//! never fails the conversation: every problem (bad arguments, missing file,
//! backend error) comes back as text so the model can adapt.

use super::client::ToolCall;
use super::models::ModelProfile;
use crate::github::{CiBackend, RunInfo};
use crate::util::{cap_chars, resolve_in_workspace};
use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use tracing::debug;

/// Fixed budget for a single `read_file` result
pub const READ_FILE_MAX_CHARS: usize = 40_000;

/// GitHub prefixes every log line with `2024-01-15T10:23:45.1234567Z `.
static LOG_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z ?").expect("timestamp regex")
});

// ═══════════════════════════════════════════════════════════════════════════
//  TOOL DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Tool definition sent to the chat endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    fn function(
        name: &'static str,
        description: &'static str,
        parameters: serde_json::Value,
    ) -> Self {
        ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name,
                description,
                parameters,
            },
        }
    }
}

/// State shared by every tool call of one triage run
pub struct ToolContext {
    pub ci: Arc<dyn CiBackend>,
    pub workspace: PathBuf,
    pub run: RunInfo,
    pub profile: ModelProfile,
    failed_jobs: Mutex<Vec<String>>,
}

impl ToolContext {
    pub fn new(
        ci: Arc<dyn CiBackend>,
        workspace: PathBuf,
        run: RunInfo,
        profile: ModelProfile,
    ) -> Self {
        ToolContext {
            ci,
            workspace,
            run,
            profile,
            failed_jobs: Mutex::new(Vec::new()),
        }
    }

    /// Names recorded by the most recent `list_failed_jobs` call.
    pub fn failed_job_names(&self) -> Vec<String> {
        self.failed_jobs
            .lock()
            .map(|names| names.clone())
            .unwrap_or_default()
    }

    fn record_failed_jobs(&self, names: Vec<String>) {
        if let Ok(mut slot) = self.failed_jobs.lock() {
            *slot = names;
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Run the tool with the model's raw JSON arguments.
    async fn call(&self, ctx: &ToolContext, arguments: &str) -> String;
}

// ═══════════════════════════════════════════════════════════════════════════
//  REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// A validated, ordered set of tools keyed by name.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    definitions: Vec<ToolDefinition>,
    by_name: BTreeMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Box<dyn Tool>>) -> Result<Self> {
        let definitions: Vec<ToolDefinition> = tools.iter().map(|t| t.definition()).collect();
        let mut by_name = BTreeMap::new();

        for (index, def) in definitions.iter().enumerate() {
            let name = def.function.name;
            if name.is_empty() {
                bail!("Tool at position {} has an empty name", index);
            }
            if def.function.parameters.get("type").and_then(|t| t.as_str()) != Some("object") {
                bail!("Tool {} must take an object of parameters", name);
            }
            if by_name.insert(name, index).is_some() {
                bail!("Tool {} is registered twice", name);
            }
        }

        Ok(ToolRegistry {
            tools,
            definitions,
            by_name,
        })
    }

    /// Everything needed to investigate a failed run.
    pub fn diagnostic() -> Result<Self> {
        Self::new(vec![
            Box::new(ListFailedJobs),
            Box::new(GetJobLogs),
            Box::new(ReadFile),
            Box::new(GetWorkflowRunInfo),
        ])
    }

    /// File inspection only.
    pub fn fix() -> Result<Self> {
        Self::new(vec![Box::new(ReadFile)])
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.definitions.iter().map(|d| d.function.name).collect()
    }

    /// Execute one tool call. Unknown names come back as text.
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> String {
        let name = call.function.name.as_str();
        match self.by_name.get(name) {
            Some(&index) => {
                debug!(tool = name, "executing tool call");
                self.tools[index].call(ctx, &call.function.arguments).await
            }
            None => format!("Unknown tool: {}", name),
        }
    }
}

fn parse_args<'a, T: Deserialize<'a>>(arguments: &'a str) -> Result<T, String> {
    // Some models send an empty string for tools without parameters.
    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(raw).map_err(|e| format!("Invalid arguments: {}", e))
}

/// Accept ids sent as `123` or `"123"`.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  LIST_FAILED_JOBS
// ═══════════════════════════════════════════════════════════════════════════

pub struct ListFailedJobs;

#[derive(Serialize)]
struct FailedJobSummary<'a> {
    id: u64,
    name: &'a str,
    failed_steps: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

#[async_trait]
impl Tool for ListFailedJobs {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "list_failed_jobs",
            "List the jobs of this workflow run that failed, with their ids and failed steps. Start here.",
            serde_json::json!({ "type": "object", "properties": {} }),
        )
    }

    async fn call(&self, ctx: &ToolContext, _arguments: &str) -> String {
        let jobs = match ctx.ci.list_jobs(ctx.run.id).await {
            Ok(jobs) => jobs,
            Err(e) => return format!("Failed to list jobs: {:#}", e),
        };

        let failed: Vec<_> = jobs.iter().filter(|job| job.is_failed()).collect();
        ctx.record_failed_jobs(failed.iter().map(|job| job.name.clone()).collect());

        if failed.is_empty() {
            return format!("No failed jobs found in run {}", ctx.run.id);
        }

        let summaries: Vec<FailedJobSummary> = failed
            .iter()
            .map(|job| FailedJobSummary {
                id: job.id,
                name: &job.name,
                failed_steps: job.failed_steps(),
                url: job.html_url.as_deref(),
            })
            .collect();
        serde_json::to_string_pretty(&summaries)
            .unwrap_or_else(|e| format!("Failed to encode jobs: {}", e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET_JOB_LOGS
// ═══════════════════════════════════════════════════════════════════════════

pub struct GetJobLogs;

#[derive(Deserialize)]
struct JobLogsArgs {
    #[serde(deserialize_with = "lenient_u64")]
    job_id: u64,
    #[serde(default)]
    tail_lines: Option<usize>,
}

#[async_trait]
impl Tool for GetJobLogs {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "get_job_logs",
            "Fetch the last lines of a job's log. Errors are usually near the end.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "job_id": {
                        "type": "integer",
                        "description": "Job id from list_failed_jobs"
                    },
                    "tail_lines": {
                        "type": "integer",
                        "description": "How many trailing lines to return"
                    }
                },
                "required": ["job_id"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: &str) -> String {
        let args: JobLogsArgs = match parse_args(arguments) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let keep = ctx.profile.clamp_tail_lines(args.tail_lines);

        let log = match ctx.ci.job_logs(args.job_id).await {
            Ok(log) => log,
            Err(e) => return format!("Failed to fetch logs for job {}: {:#}", args.job_id, e),
        };

        // Borrowed slices only; the log text is the single owned copy.
        let tail = tail_lines(log.lines().map(strip_log_timestamp), keep);
        if tail.is_empty() {
            return format!("Log for job {} is empty", args.job_id);
        }
        tail.join("\n")
    }
}

/// Keep the last `n` items, dropping the oldest whenever the buffer grows past `n`.
pub fn tail_lines<T, I>(lines: I, n: usize) -> Vec<T>
where
    I: IntoIterator<Item = T>,
{
    let mut window = VecDeque::with_capacity(n.saturating_add(1).min(4096));
    for line in lines {
        window.push_back(line);
        if window.len() > n {
            window.pop_front();
        }
    }
    window.into()
}

pub fn strip_log_timestamp(line: &str) -> &str {
    match LOG_TIMESTAMP.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  READ_FILE
// ═══════════════════════════════════════════════════════════════════════════

pub struct ReadFile;

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[async_trait]
impl Tool for ReadFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "read_file",
            "Read a file from the repository checkout. Paths are relative to the repository root.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Repository-relative path, e.g. src/main.rs"
                    }
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: &str) -> String {
        let args: ReadFileArgs = match parse_args(arguments) {
            Ok(a) => a,
            Err(e) => return e,
        };

        let target = match resolve_in_workspace(&ctx.workspace, &args.path) {
            Ok(target) => target,
            Err(e) => return format!("Error: {}", e),
        };

        if !target.exists() {
            return format!("File not found: {}", args.path);
        }
        if target.is_dir() {
            return format!("{} is a directory, not a file", args.path);
        }

        match fs::read(&target) {
            Ok(bytes) => cap_chars(&String::from_utf8_lossy(&bytes), READ_FILE_MAX_CHARS),
            Err(e) => format!("Failed to read file: {}", e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET_WORKFLOW_RUN_INFO
// ═══════════════════════════════════════════════════════════════════════════

pub struct GetWorkflowRunInfo;

#[async_trait]
impl Tool for GetWorkflowRunInfo {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "get_workflow_run_info",
            "Get metadata about this workflow run: branch, commit, triggering event and workflow file.",
            serde_json::json!({ "type": "object", "properties": {} }),
        )
    }

    async fn call(&self, ctx: &ToolContext, _arguments: &str) -> String {
        let run = &ctx.run;
        serde_json::json!({
            "run_id": run.id,
            "workflow": run.name,
            "branch": run.head_branch,
            "commit": run.head_sha,
            "event": run.event,
            "workflow_path": run.path,
            "url": run.html_url,
            "pull_request": run.pull_request().map(|pr| pr.number),
        })
        .to_string()
    }
}
