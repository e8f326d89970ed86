//! In-memory doubles for the chat endpoint and the CI backend.

use crate::config::Config;
use crate::github::{
    BranchRef, CiBackend, Job, JobStep, NewPullRequest, NewTreeEntry, RunInfo, RunPullRequest,
    TreeEntry,
};
use crate::llm::client::{
    ChatBackend, ChatError, ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, Role,
    ToolCall, FINISH_REASON_TOOL_CALLS,
};
use crate::llm::models::{ModelProfile, Usage};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

// ═══════════════════════════════════════════════════════════════════════════
//  CHAT
// ═══════════════════════════════════════════════════════════════════════════

/// Replays a fixed script of responses and records every request.
pub(crate) struct ScriptedChat {
    script: Mutex<VecDeque<Result<ChatResponse, ChatError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

impl ScriptedChat {
    pub fn new(script: Vec<Result<ChatResponse, ChatError>>) -> Self {
        ScriptedChat {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ChatError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: request.messages.to_vec(),
            tool_names: request
                .tools
                .iter()
                .map(|tool| tool.function.name.to_string())
                .collect(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ChatError::Status {
                status: 500,
                body: "script exhausted".to_string(),
            }))
    }
}

pub(crate) fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        choices: vec![Choice {
            message: ChatMessage {
                role: Role::Assistant,
                content: Some(text.to_string()),
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        }),
    }
}

/// An assistant turn requesting `(id, name, arguments)` tool calls in order.
pub(crate) fn tool_call_response(calls: &[(&str, &str, &str)]) -> ChatResponse {
    let tool_calls = calls
        .iter()
        .map(|(id, name, arguments)| ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        })
        .collect();
    ChatResponse {
        choices: vec![Choice {
            message: ChatMessage {
                role: Role::Assistant,
                content: None,
                tool_calls: Some(tool_calls),
                tool_call_id: None,
            },
            finish_reason: Some(FINISH_REASON_TOOL_CALLS.to_string()),
        }],
        usage: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CI BACKEND
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory CI backend that records every write in call order.
#[derive(Default)]
pub(crate) struct FakeCi {
    pub run: RunInfo,
    pub jobs: Vec<Job>,
    pub logs: HashMap<u64, String>,
    pub tree: Vec<TreeEntry>,
    /// Operation name that returns an error instead of succeeding
    pub fail_on: Option<&'static str>,
    pub ops: Mutex<Vec<String>>,
    pub blobs: Mutex<Vec<String>>,
    pub new_trees: Mutex<Vec<(String, Vec<NewTreeEntry>)>>,
    pub commit_messages: Mutex<Vec<String>>,
    pub branches: Mutex<Vec<(String, String)>>,
    pub pull_requests: Mutex<Vec<NewPullRequest>>,
    pub comments: Mutex<Vec<(u64, String)>>,
}

impl FakeCi {
    pub fn new(run: RunInfo) -> Self {
        FakeCi {
            run,
            ..FakeCi::default()
        }
    }

    pub fn with_jobs(mut self, jobs: Vec<Job>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_log(mut self, job_id: u64, log: impl Into<String>) -> Self {
        self.logs.insert(job_id, log.into());
        self
    }

    pub fn with_tree(mut self, tree: Vec<TreeEntry>) -> Self {
        self.tree = tree;
        self
    }

    pub fn failing_at(mut self, op: &'static str) -> Self {
        self.fail_on = Some(op);
        self
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str) -> Result<()> {
        self.ops.lock().unwrap().push(op.to_string());
        if self.fail_on == Some(op) {
            anyhow::bail!("injected failure in {}", op);
        }
        Ok(())
    }
}

#[async_trait]
impl CiBackend for FakeCi {
    async fn run_info(&self, _run_id: u64) -> Result<RunInfo> {
        self.record("run_info")?;
        Ok(self.run.clone())
    }

    async fn list_jobs(&self, _run_id: u64) -> Result<Vec<Job>> {
        self.record("list_jobs")?;
        Ok(self.jobs.clone())
    }

    async fn job_logs(&self, job_id: u64) -> Result<String> {
        self.record("job_logs")?;
        self.logs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("GitHub API error (404): Not Found"))
    }

    async fn commit_tree(&self, commit_sha: &str) -> Result<String> {
        self.record("commit_tree")?;
        Ok(format!("tree-of-{}", commit_sha))
    }

    async fn tree_entries(&self, _tree_sha: &str) -> Result<Vec<TreeEntry>> {
        self.record("tree_entries")?;
        Ok(self.tree.clone())
    }

    async fn create_blob(&self, content: &str) -> Result<String> {
        self.record("create_blob")?;
        let mut blobs = self.blobs.lock().unwrap();
        blobs.push(content.to_string());
        Ok(format!("blob-{}", blobs.len()))
    }

    async fn create_tree(&self, base_tree: &str, entries: &[NewTreeEntry]) -> Result<String> {
        self.record("create_tree")?;
        self.new_trees
            .lock()
            .unwrap()
            .push((base_tree.to_string(), entries.to_vec()));
        Ok("new-tree".to_string())
    }

    async fn create_commit(
        &self,
        message: &str,
        _tree_sha: &str,
        _parent_sha: &str,
    ) -> Result<String> {
        self.record("create_commit")?;
        self.commit_messages
            .lock()
            .unwrap()
            .push(message.to_string());
        Ok("new-commit".to_string())
    }

    async fn create_branch(&self, branch: &str, commit_sha: &str) -> Result<()> {
        self.record("create_branch")?;
        self.branches
            .lock()
            .unwrap()
            .push((branch.to_string(), commit_sha.to_string()));
        Ok(())
    }

    async fn default_branch(&self) -> Result<String> {
        self.record("default_branch")?;
        Ok("main".to_string())
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<String> {
        self.record("create_pull_request")?;
        let mut prs = self.pull_requests.lock().unwrap();
        prs.push(request.clone());
        Ok(format!("https://github.com/o/r/pull/{}", 100 + prs.len()))
    }

    async fn create_issue_comment(&self, issue_number: u64, body: &str) -> Result<()> {
        self.record("create_issue_comment")?;
        self.comments
            .lock()
            .unwrap()
            .push((issue_number, body.to_string()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  FIXTURES
// ═══════════════════════════════════════════════════════════════════════════

/// A failed `pull_request` run on `feature/x`, PR #7.
pub(crate) fn pr_run() -> RunInfo {
    RunInfo {
        id: 4242,
        name: Some("CI".to_string()),
        head_branch: Some("feature/x".to_string()),
        head_sha: "runsha".to_string(),
        event: "pull_request".to_string(),
        path: ".github/workflows/ci.yml".to_string(),
        html_url: "https://github.com/o/r/actions/runs/4242".to_string(),
        pull_requests: vec![RunPullRequest {
            number: 7,
            head: BranchRef {
                branch: "feature/x".to_string(),
                sha: "prheadsha".to_string(),
            },
            base: BranchRef {
                branch: "main".to_string(),
                sha: "basesha".to_string(),
            },
        }],
    }
}

/// A failed `push` run on `main` with no pull request attached.
pub(crate) fn push_run() -> RunInfo {
    RunInfo {
        pull_requests: Vec::new(),
        head_branch: Some("main".to_string()),
        event: "push".to_string(),
        ..pr_run()
    }
}

pub(crate) fn job(id: u64, name: &str, conclusion: &str, failed_step: Option<&str>) -> Job {
    Job {
        id,
        name: name.to_string(),
        conclusion: Some(conclusion.to_string()),
        html_url: Some(format!("https://github.com/o/r/actions/runs/4242/job/{}", id)),
        steps: failed_step
            .map(|step| {
                vec![JobStep {
                    name: step.to_string(),
                    number: 3,
                    conclusion: Some("failure".to_string()),
                }]
            })
            .unwrap_or_default(),
    }
}

/// Configuration for `o/r` run 4242 rooted at `workspace`.
pub(crate) fn test_config(workspace: &Path) -> Config {
    Config {
        github_token: "token".to_string(),
        api_url: "https://api.github.com".to_string(),
        owner: "o".to_string(),
        repo: "r".to_string(),
        run_id: 4242,
        workspace: workspace.to_path_buf(),
        step_summary: None,
        model: "openai/gpt-4.1".to_string(),
        profile: ModelProfile::LARGE,
        llm_endpoint: "https://models.github.ai/inference/chat/completions".to_string(),
        llm_api_key: "token".to_string(),
        max_rounds: 20,
        auto_fix: true,
        dry_run: false,
        branch_prefix: "ci-triage".to_string(),
        slack_webhook: None,
    }
}
