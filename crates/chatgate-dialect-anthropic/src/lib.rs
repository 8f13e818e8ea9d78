#![deny(unsafe_code)]

//! The Anthropic-style wire dialect (`/v1/messages`, spec §4.1 dialect B) —
//! decodes `system`/content-block messages into the canonical model, and
//! encodes canonical responses/deltas as Anthropic's typed content blocks
//! and SSE event sequence.
//!
//! Grounded on the teacher's `llm::anthropic` wire structs (`AnthropicRequest`,
//! `AnthropicContent`, `AnthropicBlock`) and its `tool`-role-to-`tool_result`-
//! block translation, generalized into a full decode/encode codec.

use chatgate_core::model::{
    ChatRequest, ChatResponse, ContentPart, FinishReason, GenerationParams, ImageSource, Message,
    ResponseFormat, Role, StreamDelta, ThinkingConfig, ToolChoice, ToolDefinition,
};
use chatgate_core::ports::{DecodeError, DialectCodec, OpenBlock, StreamEncodeState};
use serde::Deserialize;
use serde_json::{json, Value};

/// Codec for the Anthropic-style messages wire.
pub struct AnthropicDialect;

impl DialectCodec for AnthropicDialect {
    fn format_name(&self) -> &'static str {
        "anthropic"
    }

    fn decode(&self, body: &[u8]) -> Result<ChatRequest, DecodeError> {
        let wire: WireRequest = serde_json::from_slice(body)?;
        decode_request(wire)
    }

    fn encode_response(&self, resp: &ChatResponse) -> Vec<u8> {
        encode_response(resp)
    }

    fn encode_stream_delta(&self, delta: &StreamDelta, state: &mut StreamEncodeState) -> Vec<u8> {
        encode_stream_delta(delta, state)
    }

    fn stream_terminator(&self) -> &'static [u8] {
        // Dialect B's terminal frames (content_block_stop/message_delta/
        // message_stop) are emitted as ordinary deltas by `encode_stream_delta`
        // itself, so there is nothing extra to send once the loop exits.
        b""
    }
}

// ── Wire types (decode side) ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: Option<String>,
    #[serde(default)]
    system: Option<WireSystem>,
    messages: Vec<WireMessage>,
    #[serde(default)]
    tools: Vec<WireTool>,
    tool_choice: Option<WireToolChoice>,
    max_tokens: Option<i64>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    #[serde(default)]
    stop_sequences: Vec<String>,
    #[serde(default)]
    stream: bool,
    thinking: Option<WireThinking>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSystem {
    Text(String),
    Blocks(Vec<WireTextBlock>),
}

#[derive(Debug, Deserialize)]
struct WireTextBlock {
    #[allow(dead_code)]
    #[serde(rename = "type")]
    kind: Option<String>,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Block(Box<WireBlock>),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    Image { source: WireImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: Option<WireToolResultContent>, #[serde(default)] is_error: bool },
    Thinking { #[serde(default)] thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireToolResultContent {
    Text(String),
    Blocks(Vec<WireTextBlock>),
    Block(Box<WireTextBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct WireToolChoice {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireThinking {
    #[serde(rename = "type")]
    kind: String,
    budget_tokens: Option<u32>,
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

    let system = match wire.system {
        Some(WireSystem::Text(text)) => Some(text),
        Some(WireSystem::Blocks(blocks)) => {
            Some(blocks.into_iter().map(|b| b.text).collect::<Vec<_>>().join("\n"))
        }
        None => None,
    };

    let mut messages = Vec::new();

    for m in wire.messages {
        let blocks = match m.content {
            WireContent::Text(text) => vec![WireBlock::Text { text }],
            WireContent::Block(b) => vec![*b],
            WireContent::Blocks(bs) => bs,
        };

        // The user-role inbound side can mix tool_result blocks with plain
        // content; tool_result blocks are split back into separate
        // canonical tool-role messages to preserve P2 (spec §9 design note),
        // while runs of non-tool_result blocks become one canonical message
        // in the sender's own role.
        let mut pending: Vec<ContentPart> = Vec::new();
        let role = decode_role(&m.role)?;

        for block in blocks {
            match block {
                WireBlock::ToolResult { tool_use_id, content, is_error } => {
                    if !pending.is_empty() {
                        messages.push(
                            Message::new(role, std::mem::take(&mut pending))
                                .map_err(|e| DecodeError::InvalidValue(e.to_string()))?,
                        );
                    }
                    let text = decode_tool_result_content(content);
                    messages.push(
                        Message::new(
                            Role::Tool,
                            vec![ContentPart::ToolResult { tool_call_id: tool_use_id, text, is_error }],
                        )
                        .map_err(|e| DecodeError::InvalidValue(e.to_string()))?,
                    );
                }
                WireBlock::Text { text } => pending.push(ContentPart::text(text)),
                WireBlock::Image { source } => pending.push(ContentPart::Image {
                    source: decode_image_source(source),
                }),
                WireBlock::ToolUse { id, name, input } => pending.push(ContentPart::ToolUse {
                    tool_call_id: id,
                    tool_name: name,
                    input,
                }),
                WireBlock::Thinking { thinking } => pending.push(ContentPart::Thinking { text: thinking }),
                WireBlock::Unknown => {} // lenient: unrecognized block types are ignored (spec §4.1)
            }
        }
        if !pending.is_empty() {
            messages.push(
                Message::new(role, pending).map_err(|e| DecodeError::InvalidValue(e.to_string()))?,
            );
        }
    }

    let tools = wire
        .tools
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.name,
            description: t.description,
            input_schema: t.input_schema,
        })
        .collect();

    let tool_choice = wire.tool_choice.map(decode_tool_choice).transpose()?;

    let thinking = wire
        .thinking
        .map(|t| ThinkingConfig::new(t.kind == "enabled", t.budget_tokens))
        .transpose()
        .map_err(|e| DecodeError::InvalidValue(e.to_string()))?;

    Ok(ChatRequest {
        model,
        system,
        messages,
        tools,
        tool_choice,
        disable_parallel_tool_calls: false,
        stream: wire.stream,
        params: GenerationParams {
            max_tokens: wire.max_tokens.map(|v| v as u32),
            temperature: wire.temperature,
            top_p: wire.top_p,
            top_k: wire.top_k,
            stop_sequences: wire.stop_sequences,
            presence_penalty: None,
            frequency_penalty: None,
        },
        response_format: Some(ResponseFormat::Text),
        thinking,
    })
}

fn decode_role(role: &str) -> Result<Role, DecodeError> {
    match role {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(DecodeError::InvalidValue(format!("unknown role {other:?}"))),
    }
}

fn decode_tool_result_content(content: Option<WireToolResultContent>) -> String {
    match content {
        Some(WireToolResultContent::Text(text)) => text,
        Some(WireToolResultContent::Block(block)) => block.text,
        Some(WireToolResultContent::Blocks(blocks)) => {
            blocks.into_iter().map(|b| b.text).collect::<Vec<_>>().join("")
        }
        None => String::new(),
    }
}

fn decode_image_source(source: WireImageSource) -> ImageSource {
    match source {
        WireImageSource::Base64 { media_type, data } => {
            ImageSource::Base64 { media_type, data_base64: data }
        }
        WireImageSource::Url { url } => ImageSource::Url { url },
    }
}

fn decode_tool_choice(wire: WireToolChoice) -> Result<ToolChoice, DecodeError> {
    match wire.kind.as_str() {
        "auto" => Ok(ToolChoice::Auto),
        "none" => Ok(ToolChoice::None),
        "any" => Ok(ToolChoice::Any),
        "tool" => {
            let name = wire.name.ok_or(DecodeError::MissingField("tool_choice.name"))?;
            Ok(ToolChoice::Tool { name })
        }
        other => Err(DecodeError::InvalidValue(format!("unknown tool_choice.type {other:?}"))),
    }
}

// ── Encode side: non-streaming response ─────────────────────────────────

fn stop_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::Error => "end_turn",
    }
}

fn encode_response(resp: &ChatResponse) -> Vec<u8> {
    let blocks: Vec<Value> = resp
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentPart::Thinking { text } => Some(json!({"type": "thinking", "thinking": text})),
            ContentPart::ToolUse { tool_call_id, tool_name, input } => Some(json!({
                "type": "tool_use",
                "id": tool_call_id,
                "name": tool_name,
                "input": input,
            })),
            _ => None,
        })
        .collect();

    let body = json!({
        "id": resp.id,
        "type": "message",
        "role": "assistant",
        "model": resp.model,
        "content": blocks,
        "stop_reason": stop_reason_str(resp.finish_reason),
        "usage": resp.usage.as_ref().map(|u| json!({
            "input_tokens": u.prompt_tokens,
            "output_tokens": u.completion_tokens,
        })),
    });
    serde_json::to_vec(&body).unwrap_or_default()
}

// ── Encode side: streaming (typed SSE events, spec §4.1 dialect B) ──────

fn sse_event(name: &str, data: Value) -> Vec<u8> {
    format!("event: {name}\ndata: {data}\n\n").into_bytes()
}

const MESSAGE_ID: &str = "msg-stream";

fn close_open_block(state: &mut StreamEncodeState, out: &mut Vec<u8>) {
    if let Some(block) = state.open_block.take() {
        let index = match block {
            OpenBlock::Text { index } => index,
            OpenBlock::Tool { index, .. } => index,
        };
        out.extend(sse_event("content_block_stop", json!({ "type": "content_block_stop", "index": index })));
    }
}

fn ensure_text_block(state: &mut StreamEncodeState, out: &mut Vec<u8>) -> u32 {
    if let Some(OpenBlock::Text { index }) = &state.open_block {
        return *index;
    }
    close_open_block(state, out);
    let index = state.next_index;
    state.next_index += 1;
    out.extend(sse_event(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "text", "text": "" },
        }),
    ));
    state.open_block = Some(OpenBlock::Text { index });
    index
}

fn ensure_tool_block(state: &mut StreamEncodeState, out: &mut Vec<u8>, id: &str, name: &str) -> u32 {
    if let Some(OpenBlock::Tool { index, id: open_id }) = &state.open_block {
        if open_id == id {
            return *index;
        }
    }
    close_open_block(state, out);
    let index = state.next_index;
    state.next_index += 1;
    out.extend(sse_event(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} },
        }),
    ));
    state.open_block = Some(OpenBlock::Tool { index, id: id.to_string() });
    index
}

fn encode_stream_delta(delta: &StreamDelta, state: &mut StreamEncodeState) -> Vec<u8> {
    let mut out = Vec::new();

    if state.open_block.is_none() && !matches!(delta, StreamDelta::Done { .. }) {
        out.extend(sse_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": { "id": MESSAGE_ID, "type": "message", "role": "assistant", "content": [] },
            }),
        ));
    }

    match delta {
        StreamDelta::Content(part) => {
            let Some(text) = part.as_text() else { return out };
            let index = ensure_text_block(state, &mut out);
            out.extend(sse_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": { "type": "text_delta", "text": text },
                }),
            ));
        }
        StreamDelta::Thinking(part) => {
            let Some(text) = part.as_text() else { return out };
            let index = ensure_text_block(state, &mut out);
            out.extend(sse_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": { "type": "thinking_delta", "thinking": text },
                }),
            ));
        }
        StreamDelta::ToolUse(part) => {
            let ContentPart::ToolUse { tool_call_id, tool_name, input } = part else { return out };
            let index = ensure_tool_block(state, &mut out, tool_call_id, tool_name);
            out.extend(sse_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {
                        "type": "input_json_delta",
                        "partial_json": serde_json::to_string(input).unwrap_or_default(),
                    },
                }),
            ));
        }
        StreamDelta::Done { finish_reason, usage } => {
            close_open_block(state, &mut out);
            let mut message_delta = json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason_str(*finish_reason) },
            });
            if let Some(usage) = usage {
                message_delta["usage"] = json!({
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                });
            }
            out.extend(sse_event("message_delta", message_delta));
            out.extend(sse_event("message_stop", json!({ "type": "message_stop" })));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::model::TokenUsage;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_string_system_and_block_content() {
        let body = json!({
            "model": "claude-3-opus",
            "system": "be terse",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
        });
        let req = AnthropicDialect.decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.messages[0].content[0].as_text(), Some("hi"));
    }

    #[test]
    fn splits_tool_result_block_into_separate_tool_message() {
        let body = json!({
            "model": "claude-3-opus",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "call1", "content": "15C"},
                ],
            }],
        });
        let req = AnthropicDialect.decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::Tool);
        match &req.messages[0].content[0] {
            ContentPart::ToolResult { tool_call_id, text, .. } => {
                assert_eq!(tool_call_id, "call1");
                assert_eq!(text, "15C");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn decodes_base64_image_block() {
        let body = json!({
            "model": "claude-3-opus",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}},
                ],
            }],
        });
        let req = AnthropicDialect.decode(body.to_string().as_bytes()).unwrap();
        match &req.messages[0].content[0] {
            ContentPart::Image { source: ImageSource::Base64 { media_type, data_base64 } } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data_base64, "AAAA");
            }
            other => panic!("expected base64 image, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_model() {
        let body = json!({"messages": []});
        assert!(AnthropicDialect.decode(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn ignores_unrecognized_block_type() {
        let body = json!({
            "model": "claude-3-opus",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "some_future_block", "whatever": 1},
                    {"type": "text", "text": "hi"},
                ],
            }],
        });
        let req = AnthropicDialect.decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.messages[0].content.len(), 1);
    }

    #[test]
    fn encodes_thinking_then_text_under_one_block_then_done() {
        let mut state = StreamEncodeState::default();
        let mut frames = Vec::new();
        frames.extend(encode_stream_delta(
            &StreamDelta::Thinking(ContentPart::text("let me think")),
            &mut state,
        ));
        frames.extend(encode_stream_delta(&StreamDelta::Content(ContentPart::text("42")), &mut state));
        frames.extend(encode_stream_delta(
            &StreamDelta::Done { finish_reason: FinishReason::Stop, usage: Some(TokenUsage::new(7, 3)) },
            &mut state,
        ));

        let text = String::from_utf8(frames).unwrap();
        assert_eq!(text.matches("content_block_start").count(), 1);
        assert_eq!(text.matches("content_block_stop").count(), 1);
        assert!(text.contains("thinking_delta"));
        assert!(text.contains("text_delta"));
        assert!(text.contains("\"stop_reason\":\"end_turn\""));
        assert!(text.contains("message_stop"));
    }

    #[test]
    fn encodes_tool_use_delta_in_its_own_block() {
        let mut state = StreamEncodeState::default();
        let frames = encode_stream_delta(
            &StreamDelta::ToolUse(ContentPart::ToolUse {
                tool_call_id: "call1".into(),
                tool_name: "get_weather".into(),
                input: json!({"city": "Tokyo"}),
            }),
            &mut state,
        );
        let text = String::from_utf8(frames).unwrap();
        assert!(text.contains("tool_use"));
        assert!(text.contains("input_json_delta"));
        assert!(matches!(state.open_block, Some(OpenBlock::Tool { .. })));
    }

    #[test]
    fn sequential_blocks_get_distinct_indices() {
        let mut state = StreamEncodeState::default();
        let mut frames = Vec::new();
        frames.extend(encode_stream_delta(&StreamDelta::Content(ContentPart::text("a")), &mut state));
        frames.extend(encode_stream_delta(
            &StreamDelta::ToolUse(ContentPart::ToolUse {
                tool_call_id: "call1".into(),
                tool_name: "get_weather".into(),
                input: json!({"city": "Tokyo"}),
            }),
            &mut state,
        ));
        frames.extend(encode_stream_delta(&StreamDelta::Content(ContentPart::text("b")), &mut state));

        let text = String::from_utf8(frames).unwrap();
        assert!(text.contains("\"index\":0"));
        assert!(text.contains("\"index\":1"));
        assert!(text.contains("\"index\":2"));
    }
}
