//! Canned canonical requests/deltas for tests across dialect, provider, and
//! pipeline crates.

use chatgate_core::model::{
    ChatRequest, ContentPart, FinishReason, GenerationParams, Message, Role, StreamDelta, TokenUsage,
};

/// A minimal single-turn chat request: one user message, no tools.
pub fn sample_chat_request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        system: None,
        messages: vec![Message::text(Role::User, "Hello!")],
        tools: vec![],
        tool_choice: None,
        disable_parallel_tool_calls: false,
        stream: false,
        params: GenerationParams {
            max_tokens: Some(256),
            ..GenerationParams::default()
        },
        response_format: None,
        thinking: None,
    }
}

/// A request with a prior tool_use/tool_result exchange, matching the
/// gateway's end-to-end scenario 3 (spec §8): assistant calls `get_weather`,
/// a tool message answers "15°C".
pub fn sample_tool_round_trip_request(model: &str) -> ChatRequest {
    let mut request = sample_chat_request(model);
    request.messages = vec![
        Message::text(Role::User, "What's the weather in Tokyo?"),
        Message::new(
            Role::Assistant,
            vec![ContentPart::ToolUse {
                tool_call_id: "abc".to_string(),
                tool_name: "get_weather".to_string(),
                input: serde_json::json!({"city": "Tokyo"}),
            }],
        )
        .expect("non-empty content"),
        Message::new(
            Role::Tool,
            vec![ContentPart::ToolResult {
                tool_call_id: "abc".to_string(),
                text: "15°C".to_string(),
                is_error: false,
            }],
        )
        .expect("non-empty content"),
    ];
    request
}

/// The canonical delta sequence from spec §8 scenario 4/5: a thinking
/// fragment, a content fragment, then `done` with usage.
pub fn sample_delta_sequence() -> Vec<StreamDelta> {
    vec![
        StreamDelta::Thinking(ContentPart::text("let me think")),
        StreamDelta::Content(ContentPart::text("42")),
        StreamDelta::Done {
            finish_reason: FinishReason::Stop,
            usage: Some(TokenUsage::new(7, 3)),
        },
    ]
}
