//! The dialect-neutral canonical chat types (spec §3.1).
//!
//! `ContentPart` is a discriminated union rather than a single record with
//! many optional fields, so that exhaustive matches over it catch new
//! shapes at compile time — the wire dialects use the grab-bag shape, this
//! boundary deliberately does not.

use serde::{Deserialize, Serialize};

/// A conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Where an [`ContentPart::Image`] gets its bytes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSource {
    Url { url: String },
    Base64 { media_type: String, data_base64: String },
}

/// One piece of message content. See spec §3.1.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        text: String,
        is_error: bool,
    },
    Thinking {
        text: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// The part's plain-text rendering, used by dialects that only carry a
    /// flat string (e.g. dialect A's `tool` message content).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::Thinking { text } => Some(text),
            ContentPart::ToolResult { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub name: Option<String>,
}

/// Error constructing a [`Message`]: content must be non-empty (spec §3.1).
#[derive(Debug, thiserror::Error)]
#[error("message content must not be empty")]
pub struct EmptyMessageError;

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Result<Self, EmptyMessageError> {
        if content.is_empty() {
            return Err(EmptyMessageError);
        }
        Ok(Self {
            role,
            content,
            name: None,
        })
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
            name: None,
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// How the model should choose whether/which tool to call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Any,
    Tool { name: String },
}

/// Constrains the shape of the model's final answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema {
        name: String,
        schema: serde_json::Value,
        strict: bool,
    },
}

/// Extended "thinking"/reasoning token configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinkingConfig {
    pub enabled: bool,
    pub budget_tokens: Option<u32>,
}

/// Error constructing a [`ThinkingConfig`] with too small a budget.
#[derive(Debug, thiserror::Error)]
#[error("thinking.budget_tokens must be >= 1024 when enabled, got {0}")]
pub struct ThinkingBudgetTooSmall(pub u32);

impl ThinkingConfig {
    pub const MIN_BUDGET_TOKENS: u32 = 1024;

    pub fn new(enabled: bool, budget_tokens: Option<u32>) -> Result<Self, ThinkingBudgetTooSmall> {
        if enabled {
            if let Some(budget) = budget_tokens {
                if budget < Self::MIN_BUDGET_TOKENS {
                    return Err(ThinkingBudgetTooSmall(budget));
                }
            }
        }
        Ok(Self {
            enabled,
            budget_tokens,
        })
    }
}

/// Sampling / generation parameters common across dialects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

/// A fully decoded, dialect-neutral chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub disable_parallel_tool_calls: bool,
    pub stream: bool,
    pub params: GenerationParams,
    pub response_format: Option<ResponseFormat>,
    pub thinking: Option<ThinkingConfig>,
}

/// Error validating a decoded [`ChatRequest`] (spec §3.3 invariant 1, §4.1).
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RequestValidationError {
    #[error("tool_result {0:?} does not reference any prior tool_use in the conversation")]
    DanglingToolResult(String),
    #[error("max_tokens must not be negative")]
    NegativeMaxTokens,
}

impl ChatRequest {
    /// Validate invariant 1 (every ToolResult references an earlier ToolUse)
    /// plus the negative-max_tokens decode error named in spec §4.1.
    pub fn validate(&self) -> Result<(), RequestValidationError> {
        let mut seen_tool_use_ids = std::collections::HashSet::new();
        for message in &self.messages {
            for part in &message.content {
                match part {
                    ContentPart::ToolUse { tool_call_id, .. } => {
                        seen_tool_use_ids.insert(tool_call_id.clone());
                    }
                    ContentPart::ToolResult { tool_call_id, .. } => {
                        if !seen_tool_use_ids.contains(tool_call_id) {
                            return Err(RequestValidationError::DanglingToolResult(
                                tool_call_id.clone(),
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Why a response or stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

/// Token accounting for a completed (or partially completed) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Construct usage, computing `total_tokens` so the invariant in
    /// spec §3.1 cannot be violated by hand-assembling the struct.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A complete, non-streaming chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentPart>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
    pub provider_name: String,
}

/// One incremental unit of a streaming response (spec §3.1).
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Content(ContentPart),
    Thinking(ContentPart),
    ToolUse(ContentPart),
    Done {
        finish_reason: FinishReason,
        usage: Option<TokenUsage>,
    },
}
