use super::diagnose::Diagnosis;
use crate::github::RunInfo;

pub const DIAGNOSIS_SYSTEM: &str = r#"You are a senior build engineer triaging a failed CI run. Find out why it failed.

INVESTIGATE WITH TOOLS:
1. Call list_failed_jobs to see which jobs failed and at which step.
2. Call get_job_logs for each failed job. The error is almost always in the last lines.
3. Call read_file on source or config files the log points at, to confirm the cause.
4. Call get_workflow_run_info if the branch, commit or workflow file matters.

Stop calling tools as soon as you can name the root cause. Do not guess when the log is clear.

CATEGORIES:
- build: compilation or bundling failed
- test: a test assertion or test runner failed
- lint: formatter, linter or static analysis failed
- dependency: resolving, downloading or version-matching packages failed
- infra: runner, network, permissions, secrets or other environment problems
- unknown: none of the above fits

FIXABLE:
Mark fixable true only when the fix is a change to files in this repository that you are confident about.
Infra problems, flaky tests and anything needing secrets or manual steps are not fixable.

OUTPUT FORMAT (JSON only, no other text):
{
  "category": "build|test|lint|dependency|infra|unknown",
  "rootCause": "What broke and why, citing the log line",
  "suggestedFix": "The concrete change that would make the run pass",
  "confidence": "high|medium|low",
  "fixable": true,
  "affectedFiles": ["path/relative/to/repo/root"]
}"#;

pub const FIX_SYSTEM: &str = r#"You are a senior developer fixing a failed CI run. The failure has already been diagnosed.

Read every file you intend to change with read_file before changing it. Paths are relative to the repository root.

RULES:
- Make the smallest change that fixes the diagnosed failure
- Return the COMPLETE new content of each changed file, not a diff
- Preserve formatting, indentation and line endings of untouched lines
- Do not touch files unrelated to the failure
- Do not edit CI workflow files to skip or silence the failing step
- If you are not confident in a fix, return an empty files object

OUTPUT FORMAT (JSON only, no other text):
{
  "files": {
    "path/relative/to/repo/root": "full new file content"
  }
}"#;

pub fn diagnosis_user_prompt(run: &RunInfo, repository: &str) -> String {
    let mut prompt = format!(
        "Workflow run {} of {} failed.\n\nWorkflow: {}\nWorkflow file: {}\nEvent: {}\nBranch: {}\nCommit: {}\n",
        run.id,
        repository,
        run.name.as_deref().unwrap_or("(unnamed)"),
        run.path,
        run.event,
        run.head_branch.as_deref().unwrap_or("(detached)"),
        run.head_sha,
    );
    if let Some(pr) = run.pull_request() {
        prompt.push_str(&format!(
            "Pull request: #{} ({} -> {})\n",
            pr.number, pr.head.branch, pr.base.branch
        ));
    }
    prompt.push_str("\nDiagnose the failure and answer with the JSON object.");
    prompt
}

pub fn fix_user_prompt(diagnosis: &Diagnosis) -> String {
    let files = if diagnosis.affected_files.is_empty() {
        "(none named; find them from the root cause)".to_string()
    } else {
        diagnosis
            .affected_files
            .iter()
            .map(|path| format!("- {}", path))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Category: {}\n\nROOT CAUSE:\n{}\n\nSUGGESTED FIX:\n{}\n\nLIKELY FILES:\n{}\n\nRead the files, apply the fix and answer with the JSON object.",
        diagnosis.category.as_str(),
        diagnosis.root_cause,
        diagnosis.suggested_fix,
        files
    )
}
