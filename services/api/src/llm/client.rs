//! services/api/src/llm/client.rs
//!
//! The structured generation client. One `generate` call drives the model to
//! a value that strictly conforms to the requested output schema: transient
//! provider failures are retried with backoff, schema violations are
//! re-prompted with the validation error, and allow-listed tool calls are
//! dispatched between model rounds under their budgets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    ChatApi, ChatApiError, ChatMessage, ChatOutcome, ChatRequest, GenerationError, RetryPolicy,
    SchemaSpec, StructuredOutput, ToolSet,
};

/// Upper bound on assistant/tool rounds inside one `generate` call. A model
/// that keeps requesting tools past this is treated as having burned its
/// tool budget.
const MAX_TOOL_ROUNDS: u32 = 8;

#[derive(Clone)]
pub struct GenerationClient {
    api: Arc<dyn ChatApi>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl GenerationClient {
    pub fn new(api: Arc<dyn ChatApi>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            api,
            retry,
            call_timeout,
        }
    }

    /// Runs one structured generation: `role_prompt` is the fixed system
    /// role, `conversation` the stage's input messages, `tools` the stage's
    /// allow-list (if any). Returns a validated `T` or a classified failure
    /// carrying the stage name.
    pub async fn generate<T: StructuredOutput>(
        &self,
        stage: &str,
        model: &str,
        role_prompt: &str,
        conversation: Vec<ChatMessage>,
        tools: Option<&ToolSet>,
        cancel: &CancellationToken,
    ) -> Result<T, GenerationError> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(ChatMessage::System(role_prompt.to_string()));
        messages.extend(conversation);

        let tool_specs = tools.map(|set| set.specs()).unwrap_or_default();
        let schema = SchemaSpec {
            name: T::NAME,
            schema: T::schema(),
        };

        let mut run_counts: HashMap<String, u32> = HashMap::new();
        let mut tool_rounds = 0u32;
        let mut schema_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled {
                    stage: stage.to_string(),
                });
            }

            let request = ChatRequest {
                model: model.to_string(),
                messages: messages.clone(),
                tools: tool_specs.clone(),
                schema: Some(schema.clone()),
            };
            let outcome = self.call_with_retry(stage, &request, cancel).await?;

            match outcome {
                ChatOutcome::ToolCalls(calls) => {
                    tool_rounds += 1;
                    if tool_rounds > MAX_TOOL_ROUNDS {
                        return Err(GenerationError::ToolBudgetExceeded {
                            stage: stage.to_string(),
                        });
                    }
                    let Some(tool_set) = tools else {
                        // A tool call without an allow-list is a provider bug.
                        return Err(GenerationError::Provider {
                            stage: stage.to_string(),
                            detail: "model requested tools but none were offered".to_string(),
                        });
                    };
                    messages.push(ChatMessage::Assistant {
                        content: None,
                        tool_calls: calls.clone(),
                    });
                    for call in &calls {
                        if cancel.is_cancelled() {
                            return Err(GenerationError::Cancelled {
                                stage: stage.to_string(),
                            });
                        }
                        let output = tool_set.dispatch(call, &mut run_counts).await;
                        messages.push(ChatMessage::Tool {
                            call_id: call.id.clone(),
                            content: output,
                        });
                    }
                }
                ChatOutcome::Content(text) => match parse_structured::<T>(&text) {
                    Ok(value) => {
                        info!(stage, schema = T::NAME, "structured generation succeeded");
                        return Ok(value);
                    }
                    Err(detail) => {
                        schema_attempts += 1;
                        if schema_attempts > self.retry.schema_retries {
                            return Err(GenerationError::SchemaValidation {
                                stage: stage.to_string(),
                                attempts: schema_attempts,
                                detail,
                            });
                        }
                        warn!(stage, attempt = schema_attempts, %detail, "schema violation, re-prompting");
                        messages.push(ChatMessage::Assistant {
                            content: Some(text),
                            tool_calls: Vec::new(),
                        });
                        messages.push(ChatMessage::User(format!(
                            "The previous reply did not satisfy the required schema: {detail}. \
                             Reply again with ONLY a valid JSON object matching the schema."
                        )));
                    }
                },
            }
        }
    }

    /// One provider invocation under the wall-clock timeout and the
    /// transient-failure retry policy.
    async fn call_with_retry(
        &self,
        stage: &str,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, GenerationError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled {
                    stage: stage.to_string(),
                });
            }

            let result = tokio::time::timeout(self.call_timeout, self.api.complete(request)).await;
            let error = match result {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(err)) => err,
                Err(_elapsed) => ChatApiError::Timeout,
            };

            match error {
                ChatApiError::Timeout => {
                    if attempt >= self.retry.max_attempts {
                        return Err(GenerationError::ProviderTimeout {
                            stage: stage.to_string(),
                            attempts: attempt,
                        });
                    }
                    warn!(stage, attempt, "provider timeout, backing off");
                }
                ChatApiError::RateLimited => {
                    if attempt >= self.retry.max_attempts {
                        return Err(GenerationError::ProviderRateLimited {
                            stage: stage.to_string(),
                            attempts: attempt,
                        });
                    }
                    warn!(stage, attempt, "provider rate limited, backing off");
                }
                ChatApiError::Provider(detail) => {
                    return Err(GenerationError::Provider {
                        stage: stage.to_string(),
                        detail,
                    });
                }
            }
            tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
        }
    }
}

/// Parses and validates the model's final text into `T`. Some providers wrap
/// JSON in a markdown fence even when a schema was requested; strip it
/// before parsing.
fn parse_structured<T: StructuredOutput>(text: &str) -> Result<T, String> {
    let fence = Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("static regex");
    let payload = match fence.captures(text) {
        Some(captures) => captures.get(1).map(|m| m.as_str()).unwrap_or(text),
        None => text,
    };
    let value: T = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    value.validate()?;
    Ok(value)
}
