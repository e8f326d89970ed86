//! Chat-completion endpoint client.
//!
//! [`ChatBackend`] performs one request/response exchange and classifies the
//! failure modes the tool loop knows how to recover from. Rate limiting is
//! absorbed here by [`chat_with_backoff`]; token-limit and content-filter
//! failures are surfaced to the caller, which owns the conversation and can
//! rewrite it.

use super::models::Usage;
use super::tools::ToolDefinition;
use crate::util::{cancellable, sanitize_error_body};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Chat requests can take a while on long tool transcripts.
pub const CHAT_TIMEOUT_SECS: u64 = 300;

/// Finish reason the endpoint reports when the assistant wants tools run
pub const FINISH_REASON_TOOL_CALLS: &str = "tool_calls";

const CONTENT_FILTER_MARKERS: &[&str] = &[
    "content_filter",
    "content management policy",
    "responsibleaipolicyviolation",
    "content_policy_violation",
];

const TOKEN_LIMIT_MARKERS: &[&str] = &[
    "tokens_limit_reached",
    "context_length_exceeded",
    "maximum context length",
];

// ═══════════════════════════════════════════════════════════════════════════
//  WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Rough size used when compressing the history.
    pub fn char_len(&self) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .flatten()
            .map(|call| call.function.name.chars().count() + call.function.arguments.chars().count())
            .sum();
        self.content_str().chars().count() + calls
    }
}

/// A tool call issued by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    #[serde(default)]
    pub arguments: String,
}

fn function_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    pub tools: &'a [ToolDefinition],
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
//  ERRORS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("rate limited by the chat endpoint")]
    RateLimited { retry_after: Option<Duration> },
    #[error("still rate limited after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("request exceeds the model's token limit: {0}")]
    TokenLimit(String),
    #[error("request rejected by the content filter: {0}")]
    ContentFilter(String),
    #[error("chat endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed chat response: {0}")]
    Decode(String),
    #[error("chat request cancelled")]
    Cancelled,
}

/// Map a non-2xx response onto the failure class the caller recovers from.
pub fn classify_failure(status: u16, body: &str, retry_after: Option<Duration>) -> ChatError {
    let lower = body.to_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|marker| lower.contains(marker));

    match status {
        429 => ChatError::RateLimited { retry_after },
        413 => ChatError::TokenLimit(sanitize_error_body(body)),
        400 if mentions(CONTENT_FILTER_MARKERS) => {
            ChatError::ContentFilter(sanitize_error_body(body))
        }
        400 if mentions(TOKEN_LIMIT_MARKERS) => ChatError::TokenLimit(sanitize_error_body(body)),
        _ => ChatError::Status {
            status,
            body: sanitize_error_body(body),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  BACKEND
// ═══════════════════════════════════════════════════════════════════════════

/// One chat-completion exchange. Implementations must not retry.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ChatError>;
}

/// OpenAI-compatible chat endpoint over HTTPS
pub struct HttpChatBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpChatBackend {
    pub fn new(endpoint: &str, api_key: &str) -> anyhow::Result<Self> {
        Ok(HttpChatBackend {
            client: create_http_client(CHAT_TIMEOUT_SECS)?,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ChatError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await?;

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &text, retry_after));
        }

        serde_json::from_str(&text).map_err(|e| {
            ChatError::Decode(format!("{} ({})", e, sanitize_error_body(&text)))
        })
    }
}

/// Create a configured HTTP client
pub(crate) fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("ci-triage/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

// ═══════════════════════════════════════════════════════════════════════════
//  RATE-LIMIT BACKOFF
// ═══════════════════════════════════════════════════════════════════════════

/// Exponential backoff applied to HTTP 429 inside a single chat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first request
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based): 5s, 10s, 20s, ...
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Send `request`, sleeping and retrying while the endpoint answers 429.
///
/// Every other outcome is returned as-is. Cancellation aborts both the
/// in-flight request and any pending backoff sleep.
pub async fn chat_with_backoff(
    backend: &dyn ChatBackend,
    request: &ChatRequest<'_>,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<ChatResponse, ChatError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = cancellable(cancel, backend.complete(request))
            .await
            .ok_or(ChatError::Cancelled)?;

        let retry_after = match result {
            Err(ChatError::RateLimited { retry_after }) => retry_after,
            other => return other,
        };

        if attempt >= policy.max_attempts {
            warn!(attempts = attempt, "chat endpoint still rate limited; giving up");
            return Err(ChatError::RetriesExhausted { attempts: attempt });
        }

        let hinted = retry_after.unwrap_or_default().min(policy.max_delay);
        let delay = policy.delay_for_retry(attempt).max(hinted);
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "chat endpoint rate limited; backing off"
        );

        cancellable(cancel, tokio::time::sleep(delay))
            .await
            .ok_or(ChatError::Cancelled)?;
        debug!(attempt = attempt + 1, "retrying chat request");
    }
}
