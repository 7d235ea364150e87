//! services/api/src/llm/openai.rs
//!
//! The OpenAI-compatible backend of the generation client. Translates the
//! backend-neutral chat model into `async-openai` request builders and maps
//! provider failures into the classified `ChatApiError`.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;

use super::{ChatApi, ChatApiError, ChatMessage, ChatOutcome, ChatRequest, ToolCall};

/// `ChatApi` implementation over an OpenAI-compatible chat-completions
/// endpoint (the base URL is configurable, so any compatible provider works).
#[derive(Clone)]
pub struct OpenAiChatApi {
    client: Client<OpenAIConfig>,
}

impl OpenAiChatApi {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }

    fn build_messages(
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut built = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                ChatMessage::System(content) => built.push(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(content.as_str())
                        .build()?
                        .into(),
                ),
                ChatMessage::User(content) => built.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content.as_str())
                        .build()?
                        .into(),
                ),
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    if let Some(content) = content {
                        args.content(content.as_str());
                    }
                    if !tool_calls.is_empty() {
                        let calls: Vec<ChatCompletionMessageToolCall> = tool_calls
                            .iter()
                            .map(|call| ChatCompletionMessageToolCall {
                                id: call.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: call.name.clone(),
                                    arguments: call.arguments.clone(),
                                },
                            })
                            .collect();
                        args.tool_calls(calls);
                    }
                    built.push(args.build()?.into());
                }
                ChatMessage::Tool { call_id, content } => built.push(
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(call_id.as_str())
                        .content(content.as_str())
                        .build()?
                        .into(),
                ),
            }
        }
        Ok(built)
    }

    fn build_tools(request: &ChatRequest) -> Result<Vec<ChatCompletionTool>, OpenAIError> {
        request
            .tools
            .iter()
            .map(|spec| {
                ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(
                        FunctionObjectArgs::default()
                            .name(spec.name)
                            .description(spec.description)
                            .parameters(spec.parameters.clone())
                            .build()?,
                    )
                    .build()
            })
            .collect()
    }

    /// Maps provider failures onto the retry loop's classification. The
    /// rendered error text is the one stable surface across providers that
    /// speak the OpenAI protocol.
    fn classify(err: OpenAIError) -> ChatApiError {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            ChatApiError::Timeout
        } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
            ChatApiError::RateLimited
        } else {
            ChatApiError::Provider(text)
        }
    }
}

#[async_trait]
impl ChatApi for OpenAiChatApi {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, ChatApiError> {
        let messages = Self::build_messages(&request.messages).map_err(Self::classify)?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model).messages(messages);

        if !request.tools.is_empty() {
            args.tools(Self::build_tools(request).map_err(Self::classify)?);
        }
        if let Some(schema) = &request.schema {
            args.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    name: schema.name.to_string(),
                    description: None,
                    schema: Some(schema.schema.clone()),
                    strict: Some(true),
                },
            });
        }

        let built = args.build().map_err(Self::classify)?;
        let response = self
            .client
            .chat()
            .create(built)
            .await
            .map_err(Self::classify)?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatApiError::Provider("response contained no choices".to_string()))?;

        if let Some(tool_calls) = choice.message.tool_calls {
            if !tool_calls.is_empty() {
                let calls = tool_calls
                    .into_iter()
                    .map(|call| ToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    })
                    .collect();
                return Ok(ChatOutcome::ToolCalls(calls));
            }
        }

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(ChatOutcome::Content(content)),
            _ => Err(ChatApiError::Provider(
                "response contained no text content".to_string(),
            )),
        }
    }
}
