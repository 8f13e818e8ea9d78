#![deny(unsafe_code)]

//! The OpenAI-kind upstream provider adapter (spec §4.2, provider kind A).
//!
//! Canonical-to-wire request shaping and the non-streaming status-code
//! taxonomy are grounded on the teacher's `llm::openai::OpenAiProvider`.
//! Streaming is not a copy of the teacher's stub (which replayed a
//! non-streaming response as a fake chunk sequence) — it is a genuine
//! `eventsource-stream` ingest over the real chat-completions SSE wire,
//! grounded on the `km-tools::llm::openai` pack repo's
//! `byte_stream.eventsource()` producer-task shape.

use std::time::Duration;

use chatgate_config::{ProviderInstance, ProviderKind};
use chatgate_core::model::{
    ChatRequest, ChatResponse, ContentPart, FinishReason, ImageSource, Message, ResponseFormat,
    Role, StreamDelta, ToolChoice, TokenUsage,
};
use chatgate_core::ports::{LlmProvider, ProviderCapabilities, ProviderError};
use chatgate_core::BoxFuture;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

/// Adapter for the OpenAI-style `/chat/completions` wire.
pub struct OpenAiProvider {
    client: reqwest::Client,
    name: String,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
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
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

fn build_request_body(request: &ChatRequest, stream: bool) -> WireRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        messages.push(WireMessage {
            role: "system",
            content: Some(Value::String(system.clone())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in &request.messages {
        messages.push(convert_message(message));
    }

    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| WireTool {
                    r#type: "function",
                    function: WireToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect(),
        )
    };

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Any => Value::String("required".to_string()),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    });

    // OpenAI's default is `parallel_tool_calls: true`; only emit the field
    // to turn it off, matching the wire's own omit-for-default convention.
    let parallel_tool_calls = request.disable_parallel_tool_calls.then_some(false);

    let response_format = request.response_format.as_ref().and_then(|f| match f {
        ResponseFormat::Text => None,
        ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
        ResponseFormat::JsonSchema { name, schema, strict } => Some(json!({
            "type": "json_schema",
            "json_schema": {"name": name, "schema": schema, "strict": strict},
        })),
    });

    WireRequest {
        model: request.model.clone(),
        messages,
        tools,
        tool_choice,
        parallel_tool_calls,
        max_tokens: request.params.max_tokens,
        temperature: request.params.temperature,
        top_p: request.params.top_p,
        stop: request.params.stop_sequences.clone(),
        presence_penalty: request.params.presence_penalty,
        frequency_penalty: request.params.frequency_penalty,
        response_format,
        stream,
        stream_options: stream.then(|| json!({"include_usage": true})),
    }
}

/// `Thinking` parts have no representation on this wire's request side (the
/// dialect only ever surfaces `reasoning_content` on responses) and are
/// dropped rather than invented a field for.
fn convert_message(message: &Message) -> WireMessage {
    match message.role {
        Role::Tool => {
            // Each canonical tool message carries exactly one ToolResult
            // (chatgate-dialect-* split multi-result turns apart on decode);
            // one wire `tool` message per canonical one preserves that.
            let (id, text) = message
                .content
                .iter()
                .find_map(|part| match part {
                    ContentPart::ToolResult { tool_call_id, text, .. } => {
                        Some((tool_call_id.clone(), text.clone()))
                    }
                    _ => None,
                })
                .unwrap_or_default();
            WireMessage {
                role: "tool",
                content: Some(Value::String(text)),
                tool_calls: None,
                tool_call_id: Some(id),
            }
        }
        Role::Assistant => {
            let tool_calls: Vec<WireToolCall> = message
                .content
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ToolUse { tool_call_id, tool_name, input } => Some(WireToolCall {
                        id: tool_call_id.clone(),
                        r#type: "function",
                        function: WireFunctionCall {
                            name: tool_name.clone(),
                            arguments: serde_json::to_string(input).unwrap_or_default(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            let text = concat_text(message);
            WireMessage {
                role: "assistant",
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(Value::String(text))
                },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                tool_call_id: None,
            }
        }
        role => {
            let role_str = match role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant | Role::Tool => unreachable!("handled above"),
            };
            let content = build_content_value(message);
            WireMessage { role: role_str, content: Some(content), tool_calls: None, tool_call_id: None }
        }
    }
}

fn concat_text(message: &Message) -> String {
    message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn build_content_value(message: &Message) -> Value {
    let has_image = message.content.iter().any(|p| matches!(p, ContentPart::Image { .. }));
    if !has_image {
        return Value::String(concat_text(message));
    }
    let parts: Vec<Value> = message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentPart::Image { source } => Some(json!({
                "type": "image_url",
                "image_url": {"url": image_url(source)},
            })),
            _ => None,
        })
        .collect();
    Value::Array(parts)
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { media_type, data_base64 } => {
            format!("data:{media_type};base64,{data_base64}")
        }
    }
}

// ── Wire response types (non-streaming) ─────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireRespMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireRespMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireRespToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireRespToolCall {
    id: String,
    function: WireRespFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireRespFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn finish_reason_from_str(s: Option<&str>) -> FinishReason {
    match s {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn parse_response(model: &str, provider_name: &str, wire: WireResponse) -> Result<ChatResponse, ProviderError> {
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode("response contained no choices".to_string()))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.reasoning_content.filter(|t| !t.is_empty()) {
        content.push(ContentPart::Thinking { text });
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ContentPart::text(text));
    }
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let input = serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null);
        content.push(ContentPart::ToolUse {
            tool_call_id: tc.id,
            tool_name: tc.function.name,
            input,
        });
    }

    Ok(ChatResponse {
        id: wire.id.unwrap_or_default(),
        model: wire.model.unwrap_or_else(|| model.to_string()),
        content,
        finish_reason: finish_reason_from_str(choice.finish_reason.as_deref()),
        usage: wire.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        provider_name: provider_name.to_string(),
    })
}

// ── Wire response types (streaming) ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates one tool call's id/name/argument fragments across however
/// many incremental `tool_calls` deltas OpenAI splits it over, so a single
/// complete [`StreamDelta::ToolUse`] can be emitted once the call closes —
/// the codecs downstream encode `ToolUse` as one block, not a partial-JSON
/// stream (see `chatgate-dialect-anthropic`'s `content_block_start`/`_stop`
/// pairing around a single delta).
#[derive(Default)]
struct ToolCallAccumulator {
    index: Option<usize>,
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn flush(&mut self) -> Option<StreamDelta> {
        if self.index.take().is_none() {
            return None;
        }
        let input = serde_json::from_str(&self.arguments).unwrap_or(Value::Null);
        let delta = StreamDelta::ToolUse(ContentPart::ToolUse {
            tool_call_id: std::mem::take(&mut self.id),
            tool_name: std::mem::take(&mut self.name),
            input,
        });
        self.arguments.clear();
        Some(delta)
    }

    fn apply(&mut self, delta: WireToolCallDelta) -> Option<StreamDelta> {
        let flushed = if self.index.is_some() && self.index != Some(delta.index) {
            self.flush()
        } else {
            None
        };
        self.index = Some(delta.index);
        if let Some(id) = delta.id {
            self.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                self.name = name;
            }
            if let Some(arguments) = function.arguments {
                self.arguments.push_str(&arguments);
            }
        }
        flushed
    }
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

impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::UpstreamA
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities { streaming: true, tools: true, vision: true }
    }

    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ProviderError>> {
        Box::pin(async move {
            let body = build_request_body(&request, false);
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
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
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
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
                let mut tool_calls = ToolCallAccumulator::default();
                let mut finish_reason: Option<String> = None;
                let mut usage: Option<WireUsage> = None;

                while let Some(event) = events.next().await {
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(provider = %provider_name, error = %err, "SSE stream error");
                            break;
                        }
                    };
                    if event.data == "[DONE]" {
                        break;
                    }
                    let chunk: WireChunk = match serde_json::from_str(&event.data) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            warn!(provider = %provider_name, error = %err, "failed to decode stream chunk");
                            continue;
                        }
                    };
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
                            if tx.send(StreamDelta::Thinking(ContentPart::text(text))).await.is_err() {
                                return;
                            }
                        }
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            if let Some(done) = tool_calls.flush() {
                                if tx.send(done).await.is_err() {
                                    return;
                                }
                            }
                            if tx.send(StreamDelta::Content(ContentPart::text(text))).await.is_err() {
                                return;
                            }
                        }
                        for tc_delta in choice.delta.tool_calls.unwrap_or_default() {
                            if let Some(done) = tool_calls.apply(tc_delta) {
                                if tx.send(done).await.is_err() {
                                    return;
                                }
                            }
                        }
                        if choice.finish_reason.is_some() {
                            finish_reason = choice.finish_reason;
                        }
                    }
                }

                if let Some(done) = tool_calls.flush() {
                    if tx.send(done).await.is_err() {
                        return;
                    }
                }

                let _ = tx
                    .send(StreamDelta::Done {
                        finish_reason: finish_reason_from_str(finish_reason.as_deref()),
                        usage: usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
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
                .get(format!("{}/models", self.base_url))
                .bearer_auth(&self.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::model::{GenerationParams, Role};
    use pretty_assertions::assert_eq;

    fn sample_provider() -> ProviderInstance {
        ProviderInstance {
            name: "openai-main".to_string(),
            kind: ProviderKind::UpstreamA,
            credential: "sk-test".to_string(),
            base_url: "https://api.openai.invalid/v1".to_string(),
            timeout_secs: 30,
            enabled: true,
            is_default: true,
        }
    }

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            system: Some("be terse".to_string()),
            messages: vec![Message::text(Role::User, "hello")],
            tools: vec![],
            tool_choice: None,
            disable_parallel_tool_calls: false,
            stream: false,
            params: GenerationParams::default(),
            response_format: None,
            thinking: None,
        }
    }

    #[test]
    fn builds_request_with_system_as_leading_message() {
        let body = build_request_body(&sample_request(), false);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[1].role, "user");
        assert!(!body.stream);
    }

    #[test]
    fn tool_result_message_carries_tool_call_id() {
        let mut request = sample_request();
        request.messages.push(
            Message::new(
                Role::Tool,
                vec![ContentPart::ToolResult {
                    tool_call_id: "abc".to_string(),
                    text: "15C".to_string(),
                    is_error: false,
                }],
            )
            .unwrap(),
        );
        let body = build_request_body(&request, false);
        let tool_msg = body.messages.last().unwrap();
        assert_eq!(tool_msg.role, "tool");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("abc"));
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls_array() {
        let mut request = sample_request();
        request.messages.push(
            Message::new(
                Role::Assistant,
                vec![ContentPart::ToolUse {
                    tool_call_id: "call1".to_string(),
                    tool_name: "get_weather".to_string(),
                    input: json!({"city": "Tokyo"}),
                }],
            )
            .unwrap(),
        );
        let body = build_request_body(&request, false);
        let assistant_msg = body.messages.last().unwrap();
        let tool_calls = assistant_msg.tool_calls.as_ref().unwrap();
        assert_eq!(tool_calls[0].function.name, "get_weather");
        assert_eq!(tool_calls[0].function.arguments, r#"{"city":"Tokyo"}"#);
    }

    #[test]
    fn base64_image_becomes_data_url() {
        let mut request = sample_request();
        request.messages.push(
            Message::new(
                Role::User,
                vec![ContentPart::Image {
                    source: ImageSource::Base64 {
                        media_type: "image/png".to_string(),
                        data_base64: "AAAA".to_string(),
                    },
                }],
            )
            .unwrap(),
        );
        let body = build_request_body(&request, false);
        let content = body.messages.last().unwrap().content.as_ref().unwrap();
        assert_eq!(content[0]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn parses_text_response_with_usage() {
        let wire = WireResponse {
            id: Some("resp-1".to_string()),
            model: Some("gpt-4o".to_string()),
            choices: vec![WireChoice {
                message: WireRespMessage {
                    content: Some("hi there".to_string()),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(WireUsage { prompt_tokens: 7, completion_tokens: 3 }),
        };
        let resp = parse_response("gpt-4o", "openai-main", wire).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage, Some(TokenUsage::new(7, 3)));
        assert_eq!(resp.content[0].as_text(), Some("hi there"));
    }

    #[test]
    fn parses_tool_calls_finish_reason() {
        let wire = WireResponse {
            id: None,
            model: None,
            choices: vec![WireChoice {
                message: WireRespMessage {
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(vec![WireRespToolCall {
                        id: "call1".to_string(),
                        function: WireRespFunctionCall {
                            name: "get_weather".to_string(),
                            arguments: r#"{"city":"Tokyo"}"#.to_string(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };
        let resp = parse_response("gpt-4o", "openai-main", wire).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        match &resp.content[0] {
            ContentPart::ToolUse { tool_name, input, .. } => {
                assert_eq!(tool_name, "get_weather");
                assert_eq!(input["city"], "Tokyo");
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_accumulator_flushes_on_index_change() {
        let mut acc = ToolCallAccumulator::default();
        assert!(acc
            .apply(WireToolCallDelta {
                index: 0,
                id: Some("call1".to_string()),
                function: Some(WireFunctionDelta {
                    name: Some("get_weather".to_string()),
                    arguments: Some(r#"{"city":"#.to_string()),
                }),
            })
            .is_none());
        let flushed = acc.apply(WireToolCallDelta {
            index: 0,
            id: None,
            function: Some(WireFunctionDelta { name: None, arguments: Some(r#""Tokyo"}"#.to_string()) }),
        });
        assert!(flushed.is_none());
        let second = acc.apply(WireToolCallDelta {
            index: 1,
            id: Some("call2".to_string()),
            function: Some(WireFunctionDelta {
                name: Some("get_time".to_string()),
                arguments: Some("{}".to_string()),
            }),
        });
        match second {
            Some(StreamDelta::ToolUse(ContentPart::ToolUse { tool_call_id, input, .. })) => {
                assert_eq!(tool_call_id, "call1");
                assert_eq!(input["city"], "Tokyo");
            }
            other => panic!("expected flushed tool use, got {other:?}"),
        }
    }
}
