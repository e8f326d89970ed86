use super::agentic::ToolLoop;
use super::parse::decode_structured;
use super::prompts::{diagnosis_user_prompt, DIAGNOSIS_SYSTEM};
use super::tools::{ToolContext, ToolRegistry};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Category {
    Build,
    Test,
    Lint,
    Dependency,
    Infra,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Build => "build",
            Category::Test => "test",
            Category::Lint => "lint",
            Category::Dependency => "dependency",
            Category::Infra => "infra",
            Category::Unknown => "unknown",
        }
    }
}

impl From<String> for Category {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "build" => Category::Build,
            "test" => Category::Test,
            "lint" => Category::Lint,
            "dependency" => Category::Dependency,
            "infra" => Category::Infra,
            _ => Category::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl From<String> for Confidence {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

/// Structured verdict on why a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub category: Category,
    pub root_cause: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub fixable: bool,
    #[serde(default)]
    pub affected_files: Vec<String>,
}

/// Investigate the run with the diagnostic tool set and decode the verdict.
///
/// Any failure here is fatal for the run: nothing downstream has meaning
/// without a diagnosis.
pub async fn diagnose(tool_loop: &ToolLoop, ctx: &ToolContext, repository: &str) -> Result<Diagnosis> {
    let registry = ToolRegistry::diagnostic()?;
    let prompt = diagnosis_user_prompt(&ctx.run, repository);

    let text = tool_loop
        .run_tool_loop(DIAGNOSIS_SYSTEM, &prompt, &registry, ctx)
        .await
        .context("Diagnosis conversation failed")?;
    let diagnosis: Diagnosis = decode_structured(&text, "diagnosis")?;

    info!(
        category = diagnosis.category.as_str(),
        confidence = diagnosis.confidence.as_str(),
        fixable = diagnosis.fixable,
        affected_files = diagnosis.affected_files.len(),
        "diagnosis complete"
    );
    Ok(diagnosis)
}
