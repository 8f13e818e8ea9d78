#![deny(unsafe_code)]

//! The OpenAI-style wire dialect (`/v1/chat/completions`, spec §4.1 dialect
//! A) — decodes the flat `messages` array plus `tool_calls`/`tool_choice`
//! into the canonical model, and encodes canonical responses/deltas back
//! into `chat.completion`/`chat.completion.chunk` objects.
//!
//! Grounded on the teacher's `llm::openai` wire structs (`OpenAiRequest`,
//! `OpenAiMessage`, `OpenAiToolCall`), generalized from "one outbound
//! request shape" into a full decode/encode codec since this crate now
//! sits on the *inbound* side of the gateway too.

use chatgate_core::model::{
    ChatRequest, ChatResponse, ContentPart, FinishReason, GenerationParams, ImageSource, Message,
    ResponseFormat, Role, StreamDelta, ToolChoice, ToolDefinition, TokenUsage,
};
use chatgate_core::ports::{DecodeError, DialectCodec, StreamEncodeState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Codec for the OpenAI-style chat-completions wire.
pub struct OpenAiDialect;

impl DialectCodec for OpenAiDialect {
    fn format_name(&self) -> &'static str {
        "openai"
    }

    fn decode(&self, body: &[u8]) -> Result<ChatRequest, DecodeError> {
        let wire: WireRequest = serde_json::from_slice(body)?;
        decode_request(wire)
    }

    fn encode_response(&self, resp: &ChatResponse) -> Vec<u8> {
        encode_response(resp)
    }

    fn encode_stream_delta(&self, delta: &StreamDelta, _state: &mut StreamEncodeState) -> Vec<u8> {
        encode_stream_delta(delta)
    }

    fn stream_terminator(&self) -> &'static [u8] {
        b"data: [DONE]\n\n"
    }
}

// ── Wire types (decode side) ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: Option<String>,
    messages: Vec<WireMessage>,
    tools: Option<Vec<WireTool>>,
    tool_choice: Option<Value>,
    #[serde(default)]
    parallel_tool_calls: Option<bool>,
    #[serde(default)]
    stream: bool,
    max_tokens: Option<i64>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    #[serde(default)]
    stop: Option<WireStop>,
    presence_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    response_format: Option<WireResponseFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireStop {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
    tool_call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Deserialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    #[allow(dead_code)]
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionDef,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDef {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_schema")]
    parameters: Value,
}

fn default_schema() -> Value {
    json!({})
}

#[derive(Debug, Deserialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: String,
    json_schema: Option<WireJsonSchema>,
}

#[derive(Debug, Deserialize)]
struct WireJsonSchema {
    name: String,
    schema: Value,
    #[serde(default)]
    strict: bool,
}

fn decode_request(wire: WireRequest) -> Result<ChatRequest, DecodeError> {
    let model = wire.model.ok_or(DecodeError::MissingField("model"))?;

    if let Some(max_tokens) = wire.max_tokens {
        if max_tokens < 0 {
            return Err(DecodeError::InvalidValue(
                "max_tokens must not be negative".to_string(),
            ));
        }
    }

    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for m in wire.messages {
        if m.role == "system" {
            if let Some(text) = content_as_text(&m.content) {
                system_parts.push(text);
            }
            continue;
        }

        let role = match m.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => return Err(DecodeError::InvalidValue(format!("unknown role {other:?}"))),
        };

        let mut parts = Vec::new();

        if role == Role::Tool {
            let tool_call_id = m
                .tool_call_id
                .clone()
                .ok_or(DecodeError::MissingField("tool_call_id"))?;
            let text = content_as_text(&m.content).unwrap_or_default();
            parts.push(ContentPart::ToolResult {
                tool_call_id,
                text,
                is_error: false,
            });
        } else {
            match m.content {
                Some(WireContent::Text(text)) => parts.push(ContentPart::text(text)),
                Some(WireContent::Parts(wire_parts)) => {
                    for part in wire_parts {
                        match part {
                            WireContentPart::Text { text } => parts.push(ContentPart::text(text)),
                            WireContentPart::ImageUrl { image_url } => {
                                parts.push(ContentPart::Image {
                                    source: decode_image_url(&image_url.url),
                                });
                            }
                        }
                    }
                }
                None => {}
            }

            for tool_call in m.tool_calls.into_iter().flatten() {
                let input: Value =
                    serde_json::from_str(&tool_call.function.arguments).unwrap_or(json!({}));
                parts.push(ContentPart::ToolUse {
                    tool_call_id: tool_call.id,
                    tool_name: tool_call.function.name,
                    input,
                });
            }
        }

        if parts.is_empty() {
            continue;
        }

        let mut message = Message::new(role, parts).map_err(|e| DecodeError::InvalidValue(e.to_string()))?;
        message.name = m.name;
        messages.push(message);
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };

    let tools = wire
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.function.name,
            description: t.function.description,
            input_schema: t.function.parameters,
        })
        .collect();

    let tool_choice = wire.tool_choice.map(decode_tool_choice).transpose()?;

    let response_format = wire.response_format.map(decode_response_format);

    Ok(ChatRequest {
        model,
        system,
        messages,
        tools,
        tool_choice,
        disable_parallel_tool_calls: wire.parallel_tool_calls == Some(false),
        stream: wire.stream,
        params: GenerationParams {
            max_tokens: wire.max_tokens.map(|v| v as u32),
            temperature: wire.temperature,
            top_p: wire.top_p,
            top_k: None,
            stop_sequences: match wire.stop {
                Some(WireStop::One(s)) => vec![s],
                Some(WireStop::Many(v)) => v,
                None => Vec::new(),
            },
            presence_penalty: wire.presence_penalty,
            frequency_penalty: wire.frequency_penalty,
        },
        response_format,
        thinking: None,
    })
}

fn content_as_text(content: &Option<WireContent>) -> Option<String> {
    match content {
        Some(WireContent::Text(text)) => Some(text.clone()),
        Some(WireContent::Parts(parts)) => {
            let joined: String = parts
                .iter()
                .filter_map(|p| match p {
                    WireContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            Some(joined)
        }
        None => None,
    }
}

fn decode_image_url(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return ImageSource::Base64 {
                media_type: media_type.to_string(),
                data_base64: data.to_string(),
            };
        }
    }
    ImageSource::Url { url: url.to_string() }
}

fn decode_tool_choice(value: Value) -> Result<ToolChoice, DecodeError> {
    match value {
        Value::String(s) => match s.as_str() {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Any),
            other => Err(DecodeError::InvalidValue(format!("unknown tool_choice {other:?}"))),
        },
        Value::Object(mut obj) => {
            let function = obj
                .remove("function")
                .ok_or(DecodeError::MissingField("tool_choice.function"))?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingField("tool_choice.function.name"))?;
            Ok(ToolChoice::Tool { name: name.to_string() })
        }
        _ => Err(DecodeError::InvalidValue("invalid tool_choice".to_string())),
    }
}

fn decode_response_format(wire: WireResponseFormat) -> ResponseFormat {
    match wire.kind.as_str() {
        "json_object" => ResponseFormat::JsonObject,
        "json_schema" => {
            if let Some(schema) = wire.json_schema {
                ResponseFormat::JsonSchema {
                    name: schema.name,
                    schema: schema.schema,
                    strict: schema.strict,
                }
            } else {
                ResponseFormat::JsonObject
            }
        }
        _ => ResponseFormat::Text,
    }
}

// ── Encode side ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OutMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OutToolCall>>,
}

#[derive(Debug, Serialize)]
struct OutToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: OutFunctionCall,
}

#[derive(Debug, Serialize)]
struct OutFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OutUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::Error => "stop",
    }
}

fn usage_wire(usage: &TokenUsage) -> OutUsage {
    OutUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

fn encode_response(resp: &ChatResponse) -> Vec<u8> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in &resp.content {
        match part {
            ContentPart::Text { text: t } | ContentPart::Thinking { text: t } => text.push_str(t),
            ContentPart::ToolUse { tool_call_id, tool_name, input } => {
                tool_calls.push(OutToolCall {
                    id: tool_call_id.clone(),
                    kind: "function",
                    function: OutFunctionCall {
                        name: tool_name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            _ => {}
        }
    }

    let message = OutMessage {
        role: "assistant",
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
    };

    let body = json!({
        "id": resp.id,
        "object": "chat.completion",
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason_str(resp.finish_reason),
        }],
        "usage": resp.usage.as_ref().map(usage_wire),
    });
    serde_json::to_vec(&body).unwrap_or_default()
}

/// Every chunk reuses this placeholder id; the canonical [`StreamDelta`]
/// carries no request id to stay consistent across a stream, and dialect A
/// clients do not rely on it changing per-request.
const STREAM_ID: &str = "chatcmpl-stream";

fn sse_frame(value: Value) -> Vec<u8> {
    let mut out = format!("data: {value}\n\n").into_bytes();
    out.shrink_to_fit();
    out
}

fn encode_stream_delta(delta: &StreamDelta) -> Vec<u8> {
    match delta {
        StreamDelta::Content(part) => {
            let Some(text) = part.as_text() else { return Vec::new() };
            if text.is_empty() {
                return Vec::new();
            }
            sse_frame(chunk_json(json!({ "content": text })))
        }
        StreamDelta::Thinking(part) => {
            let Some(text) = part.as_text() else { return Vec::new() };
            if text.is_empty() {
                return Vec::new();
            }
            sse_frame(chunk_json(json!({ "reasoning_content": text })))
        }
        StreamDelta::ToolUse(part) => {
            let ContentPart::ToolUse { tool_call_id, tool_name, input } = part else {
                return Vec::new();
            };
            sse_frame(chunk_json(json!({
                "tool_calls": [{
                    "index": 0,
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": tool_name,
                        "arguments": serde_json::to_string(input).unwrap_or_default(),
                    },
                }],
            })))
        }
        StreamDelta::Done { finish_reason, usage } => {
            let mut body = json!({
                "id": STREAM_ID,
                "object": "chat.completion.chunk",
                "model": "",
                "choices": [{
                    "index": 0,
                    "delta": {},
                    "finish_reason": finish_reason_str(*finish_reason),
                }],
            });
            if let Some(usage) = usage {
                body["usage"] = serde_json::to_value(usage_wire(usage)).unwrap_or(Value::Null);
            }
            sse_frame(body)
        }
    }
}

fn chunk_json(delta: Value) -> Value {
    json!({
        "id": STREAM_ID,
        "object": "chat.completion.chunk",
        "model": "",
        "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::model::TokenUsage;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_system_and_user_text() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        });
        let req = OpenAiDialect.decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].content[0].as_text(), Some("hi"));
    }

    #[test]
    fn decodes_data_url_image() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                ],
            }],
        });
        let req = OpenAiDialect.decode(body.to_string().as_bytes()).unwrap();
        match &req.messages[0].content[1] {
            ContentPart::Image { source: ImageSource::Base64 { media_type, data_base64 } } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data_base64, "AAAA");
            }
            other => panic!("expected base64 image, got {other:?}"),
        }
    }

    #[test]
    fn decodes_tool_call_and_tool_result() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather in Tokyo?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Tokyo\"}"},
                }]},
                {"role": "tool", "tool_call_id": "call1", "content": "15C"},
            ],
        });
        let req = OpenAiDialect.decode(body.to_string().as_bytes()).unwrap();
        assert!(req.validate().is_ok());
        match &req.messages[1].content[0] {
            ContentPart::ToolUse { tool_name, input, .. } => {
                assert_eq!(tool_name, "get_weather");
                assert_eq!(input["city"], "Tokyo");
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_model() {
        let body = json!({"messages": []});
        assert!(OpenAiDialect.decode(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn rejects_negative_max_tokens() {
        let body = json!({"model": "gpt-4o", "messages": [], "max_tokens": -1});
        assert!(matches!(
            OpenAiDialect.decode(body.to_string().as_bytes()),
            Err(DecodeError::InvalidValue(_))
        ));
    }

    #[test]
    fn maps_string_and_object_tool_choice() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "x"}],
            "tool_choice": "required",
        });
        let req = OpenAiDialect.decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.tool_choice, Some(ToolChoice::Any));

        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "x"}],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}},
        });
        let req = OpenAiDialect.decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.tool_choice, Some(ToolChoice::Tool { name: "get_weather".into() }));
    }

    #[test]
    fn encodes_response_with_usage() {
        let resp = ChatResponse {
            id: "resp1".into(),
            model: "gpt-4o".into(),
            content: vec![ContentPart::text("hello")],
            finish_reason: FinishReason::Stop,
            usage: Some(TokenUsage::new(7, 3)),
            provider_name: "primary".into(),
        };
        let bytes = OpenAiDialect.encode_response(&resp);
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["choices"][0]["message"]["content"], "hello");
        assert_eq!(parsed["usage"]["total_tokens"], 10);
    }

    #[test]
    fn encodes_thinking_then_content_then_done() {
        let mut state = StreamEncodeState::default();
        let thinking = OpenAiDialect
            .encode_stream_delta(&StreamDelta::Thinking(ContentPart::text("let me think")), &mut state);
        let content =
            OpenAiDialect.encode_stream_delta(&StreamDelta::Content(ContentPart::text("42")), &mut state);
        let done = OpenAiDialect.encode_stream_delta(
            &StreamDelta::Done {
                finish_reason: FinishReason::Stop,
                usage: Some(TokenUsage::new(7, 3)),
            },
            &mut state,
        );

        let thinking_json: Value = serde_json::from_slice(strip_data_prefix(&thinking)).unwrap();
        assert_eq!(thinking_json["choices"][0]["delta"]["reasoning_content"], "let me think");

        let content_json: Value = serde_json::from_slice(strip_data_prefix(&content)).unwrap();
        assert_eq!(content_json["choices"][0]["delta"]["content"], "42");

        let done_json: Value = serde_json::from_slice(strip_data_prefix(&done)).unwrap();
        assert_eq!(done_json["choices"][0]["finish_reason"], "stop");
        assert_eq!(done_json["usage"]["total_tokens"], 10);
    }

    fn strip_data_prefix(frame: &[u8]) -> &[u8] {
        let s = std::str::from_utf8(frame).unwrap();
        s.strip_prefix("data: ").unwrap().trim_end().as_bytes()
    }
}
