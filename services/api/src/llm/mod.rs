//! services/api/src/llm/mod.rs
//!
//! The structured generation client and its supporting types. Every pipeline
//! stage talks to the language model through this module: a fixed system
//! role, an optional allow-listed tool set, and a required output schema.
//! The backend itself sits behind the small `ChatApi` trait so tests can
//! script it.

pub mod client;
pub mod openai;
pub mod toolset;

use std::time::Duration;

use courseforge_core::ports::PortError;
use serde::de::DeserializeOwned;

pub use client::GenerationClient;
pub use openai::OpenAiChatApi;
pub use toolset::{ToolBudget, ToolSet};

//=========================================================================================
// Failure taxonomy
//=========================================================================================

/// Typed, non-overlapping failures of a structured generation call. Each
/// carries the stage name (and attempt count where it matters) so the
/// orchestrator can decide retry vs abort.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("provider timed out in stage '{stage}' after {attempts} attempts")]
    ProviderTimeout { stage: String, attempts: u32 },

    #[error("provider rate limited in stage '{stage}' after {attempts} attempts")]
    ProviderRateLimited { stage: String, attempts: u32 },

    #[error("stage '{stage}' output violated its schema after {attempts} attempts: {detail}")]
    SchemaValidation {
        stage: String,
        attempts: u32,
        detail: String,
    },

    #[error("tool budget exceeded in stage '{stage}'")]
    ToolBudgetExceeded { stage: String },

    #[error("provider error in stage '{stage}': {detail}")]
    Provider { stage: String, detail: String },

    #[error("generation cancelled in stage '{stage}'")]
    Cancelled { stage: String },

    #[error(transparent)]
    Port(#[from] PortError),
}

//=========================================================================================
// Retry policy
//=========================================================================================

/// One reusable retry/backoff policy injected into the generation client,
/// instead of ad hoc per-call middleware.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per model call for transient provider failures.
    pub max_attempts: u32,
    /// Re-prompts allowed when the model output violates the schema.
    pub schema_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schema_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt number, capped at
    /// `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

//=========================================================================================
// Chat message model (backend-neutral)
//=========================================================================================

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

/// Declaration of one callable tool, sent to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema of the tool's arguments.
    pub parameters: serde_json::Value,
}

/// One message in the conversation handed to the backend.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

/// The required shape of the model's final answer.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    pub name: &'static str,
    pub schema: serde_json::Value,
}

/// One backend invocation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub schema: Option<SchemaSpec>,
}

/// What the backend came back with: either final text content or a batch of
/// tool calls to satisfy first.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    Content(String),
    ToolCalls(Vec<ToolCall>),
}

/// Transport-level failures, already classified for the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum ChatApiError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider error: {0}")]
    Provider(String),
}

/// The seam between the generation client and a concrete model provider.
#[async_trait::async_trait]
pub trait ChatApi: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, ChatApiError>;
}

//=========================================================================================
// Structured output contract
//=========================================================================================

/// A type the model can be asked to produce. The JSON schema is closed
/// (`additionalProperties: false` everywhere) and `validate` covers the
/// bounds a schema cannot express; together they make a successful
/// `generate` call return a value that strictly conforms, not one that
/// merely parsed.
pub trait StructuredOutput: DeserializeOwned {
    /// Schema name reported to the provider.
    const NAME: &'static str;

    /// The closed JSON schema of the expected value.
    fn schema() -> serde_json::Value;

    /// Semantic validation beyond the schema (ranges, cross-field rules).
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            schema_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(350));
    }
}
