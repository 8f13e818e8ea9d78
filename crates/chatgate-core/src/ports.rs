//! Trait objects the core wires together: the dialect-codec and
//! provider-adapter seams (spec §4.1-4.2), and the abstract external
//! collaborator ports the pipeline consumes (spec §6.3).
//!
//! Living here rather than in the dialect/provider crates keeps those
//! crates depending on `chatgate-core` (for the canonical [`model`] types)
//! without a cyclic dependency back from core to them — the same shape as
//! the teacher's `llm::LlmProvider` trait sitting in the core crate while
//! `llm::openai`/`llm::anthropic` are the concrete implementations.

use std::sync::Arc;

use chatgate_config::{ProviderInstance, ProviderKind};

use crate::model::{ChatRequest, ChatResponse, StreamDelta};
use crate::BoxFuture;

/// Errors decoding a vendor-dialect request body (spec §4.1).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing required field {0:?}")]
    MissingField(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// A vendor-dialect codec: decodes a client request into the canonical
/// representation, and encodes canonical responses/deltas back into that
/// vendor's wire format (spec §4.1). Decode/encode are synchronous — no I/O
/// is involved, unlike the provider adapters below.
pub trait DialectCodec: Send + Sync {
    fn format_name(&self) -> &'static str;
    fn decode(&self, body: &[u8]) -> Result<ChatRequest, DecodeError>;
    fn encode_response(&self, resp: &ChatResponse) -> Vec<u8>;
    /// May return an empty `Vec` for ignorable deltas (spec §4.1). `state`
    /// is owned by the caller for the lifetime of one stream (see
    /// [`StreamEncodeState`]) — dialect A's framing is delta-local and
    /// ignores it; dialect B's typed SSE events need it to know when a
    /// `content_block_start`/`content_block_stop` pair must be emitted
    /// around a run of same-kind deltas.
    fn encode_stream_delta(&self, delta: &StreamDelta, state: &mut StreamEncodeState) -> Vec<u8>;
    /// Bytes written once after the last delta on a successful stream (e.g.
    /// dialect A's `data: [DONE]\n\n`; dialect B emits its terminal frames
    /// as ordinary deltas and needs none here).
    fn stream_terminator(&self) -> &'static [u8];
}

/// Which content block, if any, a dialect-B-style codec currently has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBlock {
    Text { index: u32 },
    Tool { index: u32, id: String },
}

/// Per-stream mutable state threaded through [`DialectCodec::encode_stream_delta`]
/// for the lifetime of a single streaming request. One instance lives on
/// the pipeline's forwarding loop stack frame, so concurrent streams never
/// share one even though the codec trait object itself is shared process-wide.
#[derive(Debug, Default)]
pub struct StreamEncodeState {
    pub open_block: Option<OpenBlock>,
    /// Index the *next* opened block should use. Bumped every time a block
    /// closes so a stream with several sequential blocks (text, tool, text,
    /// ...) gets distinct indices rather than every block claiming `0`.
    pub next_index: u32,
}

/// Failure taxonomy surfaced by provider adapters (spec §4.2).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream overloaded")]
    Overloaded { retry_after_secs: Option<u64> },
    #[error("upstream error {status}: {message}")]
    UpstreamError { status: u16, message: String },
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication with upstream failed: {0}")]
    Auth(String),
}

/// Streaming/tool/vision support flags a caller can check before dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
}

/// A concrete upstream LLM provider adapter: canonical request in, canonical
/// response/delta-stream out (spec §4.2).
///
/// `chat_stream` returns `(receiver, provider_name)` on success — per the
/// Open Question resolved in spec §9/DESIGN.md, threading the provider name
/// back explicitly so the pipeline's accounting step always has it without
/// re-deriving it from the router.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn capabilities(&self) -> ProviderCapabilities;

    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ProviderError>>;

    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<(tokio::sync::mpsc::Receiver<StreamDelta>, String), ProviderError>>;

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>>;
}

/// An authenticated client identity resolved from a request's API key.
#[derive(Debug, Clone)]
pub struct AuthSubject {
    pub subject_id: String,
    pub api_key_id: String,
}

/// Errors from `AuthPort::resolve_key`.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no API key present in request")]
    Missing,
    #[error("API key is invalid or revoked")]
    Invalid,
    #[error("internal error resolving API key: {0}")]
    Internal(String),
}

/// Generic failure for `WalletPort` operations (spec §6.3 "any error bubbles
/// as Internal").
#[derive(Debug, thiserror::Error)]
#[error("port error: {0}")]
pub struct PortError(pub String);

/// Resolves a raw API key (from `Authorization: Bearer` or `x-api-key`,
/// spec §6.1) into accounting identifiers. Out-of-scope collaborator (spec
/// §1/§6); the core only calls through this trait.
pub trait AuthPort: Send + Sync {
    fn resolve_key(&self, key: &str) -> BoxFuture<'_, Result<AuthSubject, AuthError>>;
}

/// Balance admission check and asynchronous cost application (spec §6.3).
pub trait WalletPort: Send + Sync {
    fn has_balance(&self, subject_id: &str) -> BoxFuture<'_, Result<bool, PortError>>;

    fn charge(
        &self,
        subject_id: &str,
        api_key_id: &str,
        amount_micros: u64,
        model: &str,
    ) -> BoxFuture<'_, Result<(), PortError>>;
}

/// Per-1M-token prompt/completion pricing for a model. Fails open to
/// `(0, 0)` on lookup error (spec §6.3) — callers never see an `Err` here.
pub trait RatePort: Send + Sync {
    /// Returns `(prompt_price_per_1m, completion_price_per_1m)`, in the same
    /// currency-minor-unit the `WalletPort` charges in.
    fn rates_for(&self, model: &str) -> BoxFuture<'_, (u64, u64)>;
}

/// How a streaming (or non-streaming) request ended, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    ClientClosed,
    UpstreamError,
}

/// One accounting record emitted exactly once per admitted request (spec
/// §3.3 invariant 6, §8 P7).
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub subject_id: Option<String>,
    pub api_key_id: Option<String>,
    pub model: String,
    pub provider_name: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub outcome: RequestOutcome,
    pub latency_ms: u64,
}

/// Fire-and-forget event sink (spec §6.3).
pub trait UsagePort: Send + Sync {
    fn log_request(&self, record: UsageRecord) -> BoxFuture<'_, ()>;
}

/// Builds a live [`LlmProvider`] for a configured [`ProviderInstance`].
///
/// The core crate cannot depend on `chatgate-provider-openai`/`-anthropic`
/// directly (they depend on it, for the canonical model types), so the
/// binary crate (`chatgate-cli`) supplies one implementation that matches a
/// provider's `kind` to the concrete adapter and hands the pipeline a
/// trait object — the same inversion the teacher achieves by having
/// `llm::openai`/`llm::anthropic` both implement the single `LlmProvider`
/// trait defined in `llm::provider`.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, provider: &ProviderInstance) -> Arc<dyn LlmProvider>;
}
