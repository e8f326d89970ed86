//! Multi-round tool-calling conversation with the chat endpoint.
//!
//! The model calls tools in a loop until it answers with plain text. Each
//! round is one chat request; within a round the loop recovers from rate
//! limiting (backoff inside the chat call), oversized requests (history
//! compression, once) and content-filter rejections (word substitution, a
//! bounded number of times).

use super::client::{
    chat_with_backoff, BackoffPolicy, ChatBackend, ChatError, ChatMessage, ChatRequest,
    ChatResponse, FINISH_REASON_TOOL_CALLS,
};
use super::models::Usage;
use super::recovery::{compress_history, sanitize_history, COMPRESSED_TOOL_RESULT_CHARS};
use super::tools::{ToolContext, ToolDefinition, ToolRegistry};
use crate::util::{cap_chars, cancellable};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ROUNDS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLoopConfig {
    pub model: String,
    pub max_rounds: usize,
    pub backoff: BackoffPolicy,
    /// Pause before resending a sanitized request
    pub filter_retry_delay: Duration,
    pub max_filter_retries: u32,
    pub compressed_tool_result_chars: usize,
}

impl ToolLoopConfig {
    pub fn new(model: impl Into<String>) -> Self {
        ToolLoopConfig {
            model: model.into(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            backoff: BackoffPolicy::default(),
            filter_retry_delay: Duration::from_secs(2),
            max_filter_retries: 2,
            compressed_tool_result_chars: COMPRESSED_TOOL_RESULT_CHARS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolLoopError {
    /// The model kept calling tools past the round budget.
    #[error("no final answer after {max_rounds} rounds")]
    RoundLimit { max_rounds: usize },
    #[error("chat request failed in round {round}")]
    Chat {
        round: usize,
        #[source]
        source: ChatError,
    },
    #[error("chat endpoint returned no choices in round {round}")]
    NoChoices { round: usize },
    #[error("tool loop cancelled")]
    Cancelled,
}

pub struct ToolLoop {
    chat: Arc<dyn ChatBackend>,
    config: ToolLoopConfig,
    cancel: CancellationToken,
}

impl ToolLoop {
    pub fn new(chat: Arc<dyn ChatBackend>, config: ToolLoopConfig, cancel: CancellationToken) -> Self {
        ToolLoop {
            chat,
            config,
            cancel,
        }
    }

    /// Run the conversation to a final text answer.
    ///
    /// Tool calls are executed strictly in the order the model issued them,
    /// and each result is capped to the profile's budget before it is sent
    /// back under the originating call id.
    pub async fn run_tool_loop(
        &self,
        system: &str,
        user: &str,
        registry: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<String, ToolLoopError> {
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let mut usage = Usage::default();

        for round in 1..=self.config.max_rounds {
            let response = self
                .request_round(round, &mut messages, registry.definitions())
                .await?;
            if let Some(round_usage) = &response.usage {
                usage.add(round_usage);
            }

            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or(ToolLoopError::NoChoices { round })?;
            let wants_tools = choice.finish_reason.as_deref() == Some(FINISH_REASON_TOOL_CALLS);
            let calls = choice.message.tool_calls.clone().unwrap_or_default();
            let text = choice.message.content_str().trim().to_string();
            messages.push(choice.message);

            if !wants_tools || calls.is_empty() {
                info!(
                    rounds = round,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "tool loop finished"
                );
                return Ok(text);
            }

            for call in &calls {
                debug!(round, tool = %call.function.name, id = %call.id, "tool call");
                let result = cancellable(&self.cancel, registry.execute(ctx, call))
                    .await
                    .ok_or(ToolLoopError::Cancelled)?;
                let capped = cap_chars(&result, ctx.profile.max_tool_result_chars);
                messages.push(ChatMessage::tool_result(call.id.clone(), capped));
            }
        }

        warn!(
            max_rounds = self.config.max_rounds,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "tool loop hit the round limit"
        );
        Err(ToolLoopError::RoundLimit {
            max_rounds: self.config.max_rounds,
        })
    }

    /// One round's chat call, with token-limit and content-filter recovery.
    async fn request_round(
        &self,
        round: usize,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ToolLoopError> {
        let mut compressed = false;
        let mut filter_retries = 0u32;

        loop {
            let request = ChatRequest {
                model: &self.config.model,
                messages: messages.as_slice(),
                tools,
            };
            let result =
                chat_with_backoff(&*self.chat, &request, &self.config.backoff, &self.cancel).await;

            match result {
                Ok(response) => return Ok(response),
                Err(ChatError::Cancelled) => return Err(ToolLoopError::Cancelled),
                Err(ChatError::TokenLimit(detail)) if !compressed => {
                    compressed = true;
                    let shortened =
                        compress_history(messages, self.config.compressed_tool_result_chars);
                    warn!(
                        round,
                        shortened,
                        %detail,
                        "request exceeded the token limit; compressing history and retrying"
                    );
                }
                Err(ChatError::ContentFilter(detail))
                    if filter_retries < self.config.max_filter_retries =>
                {
                    filter_retries += 1;
                    let rewritten = sanitize_history(messages);
                    warn!(
                        round,
                        attempt = filter_retries,
                        rewritten,
                        %detail,
                        "request rejected by the content filter; sanitizing and retrying"
                    );
                    cancellable(&self.cancel, tokio::time::sleep(self.config.filter_retry_delay))
                        .await
                        .ok_or(ToolLoopError::Cancelled)?;
                }
                Err(source) => return Err(ToolLoopError::Chat { round, source }),
            }
        }
    }
}
