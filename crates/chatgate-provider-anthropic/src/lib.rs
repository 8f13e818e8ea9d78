#![deny(unsafe_code)]

//! The Anthropic-kind upstream provider adapter (spec §4.2, provider kind B).
//!
//! Request shaping and the `x-api-key`/`anthropic-version` header pair are
//! grounded on the teacher's `llm::anthropic::AnthropicProvider`. Consecutive
//! canonical `tool`-role messages are coalesced back into a single upstream
//! user turn with multiple `tool_result` blocks — Anthropic's wire requires
//! every pending tool result to land in one turn, the mirror image of
//! `chatgate-dialect-anthropic`'s decode-side split. Streaming ingest parses
//! the typed SSE event sequence, grounded on the `kotoba` pack repo's
//! `provider::anthropic_messages::stream::convert_stream_event` (teacher's
//! own `chat_stream` only replayed a non-streaming response as fake chunks).

use std::time::Duration;

use chatgate_config::{ProviderInstance, ProviderKind};
use chatgate_core::model::{
    ChatRequest, ChatResponse, ContentPart, FinishReason, ImageSource, Message, Role, StreamDelta,
    ToolChoice, TokenUsage,
};
use chatgate_core::ports::{LlmProvider, ProviderCapabilities, ProviderError};
use chatgate_core::BoxFuture;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

const API_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic-style `/v1/messages` wire.
pub struct AnthropicProvider {
    client: reqwest::Client,
    name: String,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(provider: &ProviderInstance) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(provider.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            name: provider.name.clone(),
            api_key: provider.credential.clone(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
        }
    }
}

// ── Wire request types ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    Image { source: WireImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

/// Builds the upstream body, coalescing consecutive canonical `Role::Tool`
/// messages into one `user` turn (spec §4.2, §9 design note) and mapping
/// `Role::Assistant` tool_use parts into `tool_use` blocks on their own
/// assistant turn, matching how the teacher's `build_request_body` shapes
/// one canonical message into one upstream message, generalized to merge
/// adjacent tool-result turns instead of emitting one per result.
fn build_request_body(request: &ChatRequest, stream: bool) -> WireRequest {
    let mut messages: Vec<WireMessage> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {} // folded into `system` below
            Role::Tool => {
                let blocks: Vec<WireBlock> = message
                    .content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::ToolResult { tool_call_id, text, is_error } => {
                            Some(WireBlock::ToolResult {
                                tool_use_id: tool_call_id.clone(),
                                content: text.clone(),
                                is_error: *is_error,
                            })
                        }
                        _ => None,
                    })
                    .collect();
                if blocks.is_empty() {
                    continue;
                }
                match messages.last_mut() {
                    Some(WireMessage { role: "user", content }) if content.iter().all(|b| matches!(b, WireBlock::ToolResult { .. })) =>
                    {
                        content.extend(blocks);
                    }
                    _ => messages.push(WireMessage { role: "user", content: blocks }),
                }
            }
            Role::User | Role::Assistant => {
                let role = if message.role == Role::Assistant { "assistant" } else { "user" };
                let content = message.content.iter().map(convert_content_part).collect();
                messages.push(WireMessage { role, content });
            }
        }
    }

    let system = request.system.clone();

    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| WireTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect(),
        )
    };

    let disable_parallel = request.disable_parallel_tool_calls;
    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => json!({"type": "auto", "disable_parallel_tool_use": disable_parallel}),
        ToolChoice::Any => json!({"type": "any", "disable_parallel_tool_use": disable_parallel}),
        ToolChoice::Tool { name } => {
            json!({"type": "tool", "name": name, "disable_parallel_tool_use": disable_parallel})
        }
        // Anthropic has no "none" tool_choice value; omitting tools entirely
        // is the only way to forbid tool use on this wire.
        ToolChoice::None => Value::Null,
    });
    let tool_choice = tool_choice.filter(|v| !v.is_null());

    let thinking = request.thinking.filter(|t| t.enabled).map(|t| {
        json!({
            "type": "enabled",
            "budget_tokens": t.budget_tokens.unwrap_or(chatgate_core::model::ThinkingConfig::MIN_BUDGET_TOKENS),
        })
    });

    WireRequest {
        model: request.model.clone(),
        max_tokens: request.params.max_tokens.unwrap_or(4096),
        system,
        messages,
        tools,
        tool_choice,
        temperature: request.params.temperature,
        top_p: request.params.top_p,
        top_k: request.params.top_k,
        stop_sequences: request.params.stop_sequences.clone(),
        thinking,
        stream,
    }
}

fn convert_content_part(part: &ContentPart) -> WireBlock {
    match part {
        ContentPart::Text { text } => WireBlock::Text { text: text.clone() },
        ContentPart::Thinking { text } => WireBlock::Text { text: text.clone() },
        ContentPart::Image { source } => WireBlock::Image { source: convert_image_source(source) },
        ContentPart::ToolUse { tool_call_id, tool_name, input } => {
            WireBlock::ToolUse { id: tool_call_id.clone(), name: tool_name.clone(), input: input.clone() }
        }
        ContentPart::ToolResult { tool_call_id, text, is_error } => {
            WireBlock::ToolResult { tool_use_id: tool_call_id.clone(), content: text.clone(), is_error: *is_error }
        }
    }
}

fn convert_image_source(source: &ImageSource) -> WireImageSource {
    match source {
        ImageSource::Url { url } => WireImageSource::Url { url: url.clone() },
        ImageSource::Base64 { media_type, data_base64 } => {
            WireImageSource::Base64 { media_type: media_type.clone(), data: data_base64.clone() }
        }
    }
}

// ── Wire response types (non-streaming) ─────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: Option<String>,
    model: Option<String>,
    content: Vec<WireRespBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRespBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn finish_reason_from_stop_reason(s: Option<&str>) -> FinishReason {
    match s {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

fn parse_response(model: &str, provider_name: &str, wire: WireResponse) -> Result<ChatResponse, ProviderError> {
    let content = wire
        .content
        .into_iter()
        .filter_map(|block| match block {
            WireRespBlock::Text { text } => Some(ContentPart::text(text)),
            WireRespBlock::Thinking { thinking } => Some(ContentPart::Thinking { text: thinking }),
            WireRespBlock::ToolUse { id, name, input } => {
                Some(ContentPart::ToolUse { tool_call_id: id, tool_name: name, input })
            }
            WireRespBlock::Unknown => None,
        })
        .collect();

    Ok(ChatResponse {
        id: wire.id.unwrap_or_default(),
        model: wire.model.unwrap_or_else(|| model.to_string()),
        content,
        finish_reason: finish_reason_from_stop_reason(wire.stop_reason.as_deref()),
        usage: wire.usage.map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        provider_name: provider_name.to_string(),
    })
}

// ── Wire response types (streaming) ──────────────────────────────────────

/// Accumulates `input_json_delta` fragments for one open tool_use block,
/// keyed by the block's `index` (spec §4.2's typed-SSE tool-call shape).
#[derive(Default)]
struct OpenToolBlock {
    index: u64,
    id: String,
    name: String,
    partial_json: String,
}

async fn error_for_status(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    if status.as_u16() == 401 {
        return ProviderError::Auth("upstream rejected credentials".to_string());
    }
    if status.as_u16() == 429 {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return ProviderError::Overloaded { retry_after_secs };
    }
    let status_code = status.as_u16();
    let message = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
    ProviderError::UpstreamError { status: status_code, message }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::UpstreamB
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities { streaming: true, tools: true, vision: true }
    }

    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ProviderError>> {
        Box::pin(async move {
            let body = build_request_body(&request, false);
            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(error_for_status(response).await);
            }

            let wire: WireResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            parse_response(&request.model, &self.name, wire)
        })
    }

    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<(mpsc::Receiver<StreamDelta>, String), ProviderError>> {
        Box::pin(async move {
            let body = build_request_body(&request, true);
            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(error_for_status(response).await);
            }

            let (tx, rx) = mpsc::channel(100);
            let provider_name = self.name.clone();
            tokio::spawn(async move {
                let mut events = response.bytes_stream().eventsource();
                let mut open_tool: Option<OpenToolBlock> = None;
                let mut stop_reason: Option<String> = None;
                let mut usage: Option<WireUsage> = None;

                while let Some(event) = events.next().await {
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(provider = %provider_name, error = %err, "SSE stream error");
                            break;
                        }
                    };
                    let value: Value = match serde_json::from_str(&event.data) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(provider = %provider_name, error = %err, "failed to decode stream event");
                            continue;
                        }
                    };
                    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or_default();

                    match kind {
                        "content_block_start" => {
                            let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                            if let Some(block) = value.get("content_block") {
                                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                                    open_tool = Some(OpenToolBlock {
                                        index,
                                        id: block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                                        partial_json: String::new(),
                                    });
                                }
                            }
                        }
                        "content_block_delta" => {
                            let Some(delta) = value.get("delta") else { continue };
                            let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or_default();
                            match delta_type {
                                "text_delta" => {
                                    if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                        if tx.send(StreamDelta::Content(ContentPart::text(text))).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                "thinking_delta" => {
                                    if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                                        if tx.send(StreamDelta::Thinking(ContentPart::text(text))).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                "input_json_delta" => {
                                    if let Some(fragment) = delta.get("partial_json").and_then(|v| v.as_str()) {
                                        if let Some(block) = open_tool.as_mut() {
                                            block.partial_json.push_str(fragment);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                            if let Some(block) = open_tool.take() {
                                if block.index == index {
                                    let input = if block.partial_json.is_empty() {
                                        json!({})
                                    } else {
                                        serde_json::from_str(&block.partial_json).unwrap_or(Value::Null)
                                    };
                                    let delta = StreamDelta::ToolUse(ContentPart::ToolUse {
                                        tool_call_id: block.id,
                                        tool_name: block.name,
                                        input,
                                    });
                                    if tx.send(delta).await.is_err() {
                                        return;
                                    }
                                } else {
                                    open_tool = Some(block);
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(delta) = value.get("delta") {
                                if let Some(reason) = delta.get("stop_reason").and_then(|v| v.as_str()) {
                                    stop_reason = Some(reason.to_string());
                                }
                                if let Some(usage_obj) = delta.get("usage") {
                                    if let Ok(parsed) = serde_json::from_value::<WireUsage>(usage_obj.clone()) {
                                        usage = Some(parsed);
                                    }
                                }
                            }
                        }
                        "message_stop" => break,
                        _ => {}
                    }
                }

                let _ = tx
                    .send(StreamDelta::Done {
                        finish_reason: finish_reason_from_stop_reason(stop_reason.as_deref()),
                        usage: usage.map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
                    })
                    .await;
            });

            Ok((rx, provider_name))
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/v1/models", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .send()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(error_for_status(response).await);
            }

            #[derive(Deserialize)]
            struct ModelsResponse {
                data: Vec<ModelEntry>,
            }
            #[derive(Deserialize)]
            struct ModelEntry {
                id: String,
            }

            let parsed: ModelsResponse =
                response.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
            Ok(parsed.data.into_iter().map(|m| m.id).collect())
        })
    }
}
