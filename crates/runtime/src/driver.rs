//! The LLM ↔ tool loop for a single user turn.
//!
//! Streams one assistant response at a time, executes any requested tool
//! calls in the order the assistant emitted them, appends the results as a
//! single user-role message, and iterates until the assistant answers
//! without tool calls. Retry, backoff, and backup-model fallback for each
//! model call live here too.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use dockhand_config::RetryConfig;
use dockhand_llm::{
    CompletionRequest, ContentBlock, LlmError, Message, ModelApi, ToolResultContent, builtin,
    collect_text,
};
use dockhand_tools::ToolReply;

/// Past this many iterations, note progress every ten so runaway tool loops
/// are visible in the logs. There is no hard cap.
const LONG_LOOP_NOTE_AFTER: u64 = 50;

/// Executes one validated tool call for the driver.
#[async_trait]
pub trait ToolRoute: Send + Sync {
    async fn call(&self, tool_id: &str, input: &Value) -> Result<ToolReply, String>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub primary_model: String,
    pub backup_model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub builtin_tools: Vec<String>,
    pub retry: RetryConfig,
}

#[derive(Debug)]
pub struct TurnOutcome {
    /// Concatenated text of the final assistant response.
    pub reply: String,
    /// Full updated history including this turn.
    pub history: Vec<Message>,
}

pub struct TurnDriver<M: ModelApi + ?Sized> {
    api: std::sync::Arc<M>,
    config: DriverConfig,
}

impl<M: ModelApi + ?Sized> TurnDriver<M> {
    pub fn new(api: std::sync::Arc<M>, config: DriverConfig) -> Self {
        Self { api, config }
    }

    /// Run one user turn to completion.
    ///
    /// Fatal model errors propagate; everything tool-related stays inside
    /// the conversation as tool results.
    ///
    /// There is no cancel input. A deployment that aborts this future must
    /// do so before the iteration's assistant message is appended, or the
    /// caller's history ends with an unanswered tool_use block.
    pub async fn run_turn(
        &self,
        history: &[Message],
        prompt: &str,
        catalog: Vec<Value>,
        route: &dyn ToolRoute,
    ) -> Result<TurnOutcome, LlmError> {
        let mut messages = history.to_vec();
        messages.push(Message::user_text(prompt));

        let (builtin_entries, extra_headers) =
            builtin::configure(&self.config.builtin_tools, &self.config.primary_model);
        let mut tools = catalog;
        tools.extend(builtin_entries);

        let final_reply;
        let mut iteration: u64 = 0;

        loop {
            iteration += 1;
            if iteration > LONG_LOOP_NOTE_AFTER && iteration % 10 == 0 {
                info!(iteration, "tool-call loop still running");
            }

            let blocks = self
                .call_with_retry(&messages, &tools, &extra_headers)
                .await?;

            let text = collect_text(&blocks);

            let mut results: Vec<ContentBlock> = Vec::new();
            for block in &blocks {
                if let ContentBlock::ToolUse { id, name, input } = block {
                    let outcome = route.call(name, input).await;
                    results.push(package_tool_result(id, name, outcome));
                }
            }

            messages.push(Message::assistant(blocks));

            if results.is_empty() {
                // The terminating response: the reply is this iteration's
                // text, even when it is empty.
                final_reply = text;
                break;
            }
            messages.push(Message::tool_results(results));
        }

        Ok(TurnOutcome {
            reply: final_reply,
            history: messages,
        })
    }

    /// One model call, wrapped in the unbounded retry loop. Covers the whole
    /// stream collection: a connection dropped mid-stream retries the call
    /// from scratch.
    async fn call_with_retry(
        &self,
        messages: &[Message],
        tools: &[Value],
        extra_headers: &[(String, String)],
    ) -> Result<Vec<ContentBlock>, LlmError> {
        let retry = &self.config.retry;
        let mut retries: u32 = 0;
        let mut backoff = retry.initial_backoff();
        let mut model = self.config.primary_model.clone();
        let mut switched = false;

        loop {
            if retries == retry.fallback_retry_count && !switched {
                warn!(
                    "\n======================================================================\n\
                     SWITCHING TO BACKUP MODEL\n\
                     primary model `{}` failed {} times\n\
                     now using `{}`; retries continue indefinitely\n\
                     ======================================================================",
                    self.config.primary_model, retries, self.config.backup_model,
                );
                model = self.config.backup_model.clone();
                switched = true;
                backoff = retry.initial_backoff();
            }

            if retries > 0 {
                info!(
                    attempt = retries,
                    sleep_secs = backoff.as_secs_f64(),
                    model = %model,
                    backup_active = switched,
                    "retrying model call"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, retry);
            }

            let mut request =
                CompletionRequest::new(model.clone(), self.config.max_tokens, messages);
            request.system = self.config.system_prompt.clone();
            request.tools = tools.to_vec();
            request.extra_headers = extra_headers.to_vec();

            match self.api.complete(&request).await {
                Ok(blocks) => {
                    if switched && retries > 0 {
                        info!(model = %model, "backup model responded successfully");
                    }
                    return Ok(blocks);
                }
                Err(err) if err.is_retryable() => {
                    retries += 1;
                    if retries == 1 {
                        warn!(%err, "model call failed; entering retry loop");
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Double the backoff, clamped to the configured maximum.
fn next_backoff(current: Duration, retry: &RetryConfig) -> Duration {
    current
        .mul_f64(retry.backoff_multiplier.max(1.0))
        .min(retry.max_backoff())
}

/// Package one tool outcome as a tool_result block. Image replies become a
/// two-element content array (image + short acknowledgement) so the model's
/// vision-input contract holds.
fn package_tool_result(
    tool_use_id: &str,
    tool_name: &str,
    outcome: Result<ToolReply, String>,
) -> ContentBlock {
    match outcome {
        Ok(ToolReply::Json(value)) => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: ToolResultContent::Text(
                serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string()),
            ),
            is_error: false,
        },
        Ok(ToolReply::Image {
            media_type,
            data,
            name,
        }) => {
            let image = ContentBlock::Image { media_type, data }.to_wire();
            let ack = ContentBlock::text(format!(
                "I can now see the image '{name}'. The image has been loaded into my context."
            ))
            .to_wire();
            ContentBlock::ToolResult {
                tool_use_id: tool_use_id.to_string(),
                content: ToolResultContent::Blocks(vec![image, ack]),
                is_error: false,
            }
        }
        Err(error) => {
            warn!(tool = %tool_name, %error, "tool call returned an error result");
            ContentBlock::ToolResult {
                tool_use_id: tool_use_id.to_string(),
                content: ToolResultContent::Text(error),
                is_error: true,
            }
        }
    }
}
