//! The streaming request pipeline: admission, decode, route, dispatch,
//! streamed-delta forwarding, cancellation, and deferred usage accounting
//! (spec §4.5).
//!
//! Grounded in the teacher's `ipc/server.rs` handler shape (`State`
//! extraction, async handlers returning a response) and `daemon.rs`'s
//! broadcast-based shutdown — generalized here to per-request cancellation:
//! rather than a process-wide broadcast, a dropped output channel (the
//! client disconnecting the HTTP response body) is itself the cancellation
//! signal the forwarding loop observes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chatgate_config::ConfigSnapshot;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::lb::LoadBalancerRegistry;
use crate::model::{ChatRequest, StreamDelta};
use crate::ports::{
    AuthError, AuthPort, AuthSubject, DialectCodec, ProviderError, ProviderFactory, RatePort,
    RequestOutcome, StreamEncodeState, UsagePort, UsageRecord, WalletPort,
};
use crate::router::Router;

/// Per-request lifecycle (spec §4.5's closing state-machine paragraph).
/// Tracked only for diagnostics/tracing — the transitions themselves are
/// implicit in `Pipeline::handle`'s control flow, not a separate state enum
/// threaded through every function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Initial,
    Admitted,
    Dispatched,
    Streaming,
    Terminal,
}

/// What `Pipeline::handle` hands back to the HTTP layer once a request has
/// cleared admission, decoding, and routing.
pub enum PipelineOutcome {
    /// A complete, already-encoded response body (non-streaming path).
    Complete(Vec<u8>),
    /// A channel of already-encoded dialect frames (streaming path). The
    /// HTTP layer turns this into a chunked `text/event-stream` body;
    /// dropping the receiving end is how a client disconnect propagates
    /// back into the forwarding loop as a cancellation signal.
    Streaming(mpsc::Receiver<Vec<u8>>),
}

/// The glue component described in spec §4.5: resolves a decoded request to
/// a provider, dispatches it, forwards the result to the client in the
/// caller's dialect, and emits exactly one usage-accounting event no matter
/// how the request ends.
pub struct Pipeline {
    snapshot_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    lb_registry: Arc<LoadBalancerRegistry>,
    provider_factory: Arc<dyn ProviderFactory>,
    auth: Arc<dyn AuthPort>,
    wallet: Arc<dyn WalletPort>,
    rates: Arc<dyn RatePort>,
    usage: Arc<dyn UsagePort>,
}

impl Pipeline {
    pub fn new(
        snapshot_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        lb_registry: Arc<LoadBalancerRegistry>,
        provider_factory: Arc<dyn ProviderFactory>,
        auth: Arc<dyn AuthPort>,
        wallet: Arc<dyn WalletPort>,
        rates: Arc<dyn RatePort>,
        usage: Arc<dyn UsagePort>,
    ) -> Self {
        Self {
            snapshot_rx,
            lb_registry,
            provider_factory,
            auth,
            wallet,
            rates,
            usage,
        }
    }

    /// Drive one request through admission, decode, route, and dispatch
    /// (spec §4.5 steps 1-4). `raw_key` is whatever was extracted from
    /// `Authorization: Bearer` or `x-api-key` by the HTTP layer — the core
    /// is indifferent to which header carried it (spec §6.1).
    pub async fn handle(
        &self,
        codec: Arc<dyn DialectCodec>,
        body: &[u8],
        raw_key: Option<&str>,
    ) -> Result<PipelineOutcome, GatewayError> {
        let started = Instant::now();
        debug!(phase = ?RequestPhase::Initial, "request received");

        let subject = self
            .auth
            .resolve_key(raw_key.unwrap_or(""))
            .await
            .map_err(|e| match e {
                AuthError::Missing | AuthError::Invalid => GatewayError::Authentication(e.to_string()),
                AuthError::Internal(msg) => GatewayError::Internal(msg),
            })?;

        let has_balance = self
            .wallet
            .has_balance(&subject.subject_id)
            .await
            .map_err(|e| GatewayError::Internal(e.0))?;
        if !has_balance {
            return Err(GatewayError::InsufficientBalance);
        }
        debug!(phase = ?RequestPhase::Admitted, subject = %subject.subject_id, "admitted");

        let mut request = codec
            .decode(body)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        request
            .validate()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        let snapshot = self.snapshot_rx.borrow().clone();
        let router = Router::new(snapshot, self.lb_registry.clone());
        let resolved = router
            .resolve(&request.model)
            .map_err(|e| GatewayError::NotFound(e.to_string()))?;
        request.model = resolved.upstream_model.clone();

        let provider = self.provider_factory.build(&resolved.provider);
        debug!(
            phase = ?RequestPhase::Dispatched,
            provider = provider.name(),
            model = %request.model,
            "routed"
        );

        if request.stream {
            self.dispatch_streaming(codec, provider, request, subject, started).await
        } else {
            self.dispatch_non_streaming(codec, provider, request, subject, started).await
        }
    }

    async fn dispatch_non_streaming(
        &self,
        codec: Arc<dyn DialectCodec>,
        provider: Arc<dyn crate::ports::LlmProvider>,
        request: ChatRequest,
        subject: AuthSubject,
        started: Instant,
    ) -> Result<PipelineOutcome, GatewayError> {
        let model = request.model.clone();
        let provider_name = provider.name().to_string();

        match provider.chat(request).await {
            Ok(response) => {
                let body = codec.encode_response(&response);
                let (prompt_tokens, completion_tokens) = response
                    .usage
                    .map(|u| (u.prompt_tokens, u.completion_tokens))
                    .unwrap_or((0, 0));
                self.spawn_accounting(
                    subject,
                    model,
                    Some(provider_name),
                    prompt_tokens,
                    completion_tokens,
                    RequestOutcome::Success,
                    started,
                );
                Ok(PipelineOutcome::Complete(body))
            }
            Err(err) => {
                self.spawn_accounting(
                    subject,
                    model,
                    Some(provider_name),
                    0,
                    0,
                    RequestOutcome::UpstreamError,
                    started,
                );
                Err(map_provider_error(err))
            }
        }
    }

    async fn dispatch_streaming(
        &self,
        codec: Arc<dyn DialectCodec>,
        provider: Arc<dyn crate::ports::LlmProvider>,
        request: ChatRequest,
        subject: AuthSubject,
        started: Instant,
    ) -> Result<PipelineOutcome, GatewayError> {
        let model = request.model.clone();
        let (mut delta_rx, provider_name) = provider
            .chat_stream(request)
            .await
            .map_err(map_provider_error)?;
        debug!(phase = ?RequestPhase::Streaming, provider = %provider_name, "stream dispatched");

        // Bounded per spec §5/§9 (8-128 slots; 100 is the "typical" value
        // named in the concurrency section).
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(100);

        let usage = self.usage.clone();
        let wallet = self.wallet.clone();
        let rates = self.rates.clone();
        let terminator = codec.stream_terminator().to_vec();

        tokio::spawn(async move {
            let mut prompt_tokens = 0u32;
            let mut completion_tokens = 0u32;
            let mut outcome = RequestOutcome::Success;
            let mut encode_state = StreamEncodeState::default();

            loop {
                match delta_rx.recv().await {
                    Some(delta) => {
                        if let StreamDelta::Done { usage: Some(u), .. } = &delta {
                            prompt_tokens = u.prompt_tokens;
                            completion_tokens = u.completion_tokens;
                        } else if let Some(bump) = output_token_heuristic(&delta) {
                            completion_tokens += bump;
                        }
                        let is_done = matches!(delta, StreamDelta::Done { .. });
                        let encoded = codec.encode_stream_delta(&delta, &mut encode_state);

                        if !encoded.is_empty() && out_tx.send(encoded).await.is_err() {
                            // Client disconnected: §5 cancellation semantics
                            // — stop within one delta, no `done` emitted,
                            // account with partial counters.
                            outcome = RequestOutcome::ClientClosed;
                            break;
                        }
                        if is_done {
                            if !terminator.is_empty() {
                                let _ = out_tx.send(terminator.clone()).await;
                            }
                            break;
                        }
                    }
                    None => {
                        // Producer closed the channel without a `done`
                        // delta: an upstream failure mid-stream.
                        outcome = RequestOutcome::UpstreamError;
                        break;
                    }
                }
            }
            drop(out_tx);
            debug!(phase = ?RequestPhase::Terminal, outcome = ?outcome, "stream forwarding ended");

            run_accounting(
                usage,
                wallet,
                rates,
                subject,
                model,
                Some(provider_name),
                prompt_tokens,
                completion_tokens,
                outcome,
                started,
            )
            .await;
        });

        Ok(PipelineOutcome::Streaming(out_rx))
    }

    /// The routing table currently in effect, for read-only surfaces like
    /// `GET /v1/models` that need to enumerate configured models without
    /// going through `resolve()`.
    pub fn current_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    fn spawn_accounting(
        &self,
        subject: AuthSubject,
        model: String,
        provider_name: Option<String>,
        prompt_tokens: u32,
        completion_tokens: u32,
        outcome: RequestOutcome,
        started: Instant,
    ) {
        let usage = self.usage.clone();
        let wallet = self.wallet.clone();
        let rates = self.rates.clone();
        tokio::spawn(async move {
            run_accounting(
                usage,
                wallet,
                rates,
                subject,
                model,
                provider_name,
                prompt_tokens,
                completion_tokens,
                outcome,
                started,
            )
            .await;
        });
    }
}

/// Emits exactly one [`UsageRecord`] for the request it was spawned for
/// (spec §3.3 invariant 6, §8 P7), running on its own detached 10s timeout
/// so a client cancellation of the *request* future cannot also cancel
/// *this* task (spec §9 "Deferred accounting in a detached context").
#[allow(clippy::too_many_arguments)]
async fn run_accounting(
    usage: Arc<dyn UsagePort>,
    wallet: Arc<dyn WalletPort>,
    rates: Arc<dyn RatePort>,
    subject: AuthSubject,
    model: String,
    provider_name: Option<String>,
    prompt_tokens: u32,
    completion_tokens: u32,
    outcome: RequestOutcome,
    started: Instant,
) {
    let fut = async {
        let (prompt_price, completion_price) = rates.rates_for(&model).await;
        let amount_micros = (prompt_tokens as u64 * prompt_price
            + completion_tokens as u64 * completion_price)
            / 1_000_000;
        if amount_micros > 0 {
            if let Err(e) = wallet
                .charge(&subject.subject_id, &subject.api_key_id, amount_micros, &model)
                .await
            {
                warn!(error = %e, "cost charge failed, degrading to zero-cost");
            }
        }
        usage
            .log_request(UsageRecord {
                subject_id: Some(subject.subject_id),
                api_key_id: Some(subject.api_key_id),
                model,
                provider_name,
                prompt_tokens,
                completion_tokens,
                outcome,
                latency_ms: started.elapsed().as_millis() as u64,
            })
            .await;
    };

    if tokio::time::timeout(Duration::from_secs(10), fut).await.is_err() {
        warn!("usage accounting task timed out after 10s");
    }
}

/// Heuristic placeholder token count for streamed text/thinking fragments
/// when the upstream never reports real usage (spec §4.5/§9): one token per
/// non-empty fragment. Deliberately coarse — never used when a `Done` delta
/// carries real usage.
fn output_token_heuristic(delta: &StreamDelta) -> Option<u32> {
    match delta {
        StreamDelta::Content(part) | StreamDelta::Thinking(part) => {
            part.as_text().filter(|t| !t.is_empty()).map(|_| 1)
        }
        _ => None,
    }
}

fn map_provider_error(err: ProviderError) -> GatewayError {
    match err {
        ProviderError::Timeout => GatewayError::UpstreamTimeout,
        ProviderError::Overloaded { .. } => GatewayError::UpstreamOverloaded,
        ProviderError::UpstreamError { status, message } => {
            GatewayError::UpstreamError(format!("upstream returned {status}: {message}"))
        }
        ProviderError::Decode(msg) => GatewayError::UpstreamError(format!("decode error: {msg}")),
        ProviderError::Transport(msg) => GatewayError::UpstreamError(format!("transport error: {msg}")),
        ProviderError::Auth(msg) => GatewayError::UpstreamError(format!("upstream auth error: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_config::{AppConfig, ProviderConfig};
    use chatgate_test_utils::fixtures::{sample_chat_request, sample_delta_sequence};
    use chatgate_test_utils::mocks::{
        MockAuthPort, MockProvider, MockRatePort, MockUsagePort, MockWalletPort, SingleProviderFactory,
    };

    fn snapshot_with_default_provider(kind: &str) -> Arc<ConfigSnapshot> {
        let mut config = AppConfig::default();
        config.providers.push(ProviderConfig {
            name: "mock".to_string(),
            kind: kind.to_string(),
            base_url: "https://example.invalid".to_string(),
            credential_env: None,
            credential_inline: Some("test".to_string()),
            timeout_secs: 30,
            enabled: true,
            is_default: true,
        });
        Arc::new(config.build_snapshot().expect("valid snapshot"))
    }

    fn test_pipeline(
        provider: Arc<dyn crate::ports::LlmProvider>,
        wallet_balance: bool,
    ) -> (Pipeline, Arc<MockUsagePort>) {
        let snapshot = snapshot_with_default_provider("upstream-a");
        let (_tx, rx) = watch::channel(snapshot);
        let usage = Arc::new(MockUsagePort::default());
        let pipeline = Pipeline::new(
            rx,
            Arc::new(LoadBalancerRegistry::new()),
            Arc::new(SingleProviderFactory(provider)),
            Arc::new(MockAuthPort),
            Arc::new(MockWalletPort::with_balance(wallet_balance)),
            Arc::new(MockRatePort::default()),
            usage.clone(),
        );
        (pipeline, usage)
    }

    struct EchoCodec;

    impl DialectCodec for EchoCodec {
        fn format_name(&self) -> &'static str {
            "echo"
        }
        fn decode(&self, body: &[u8]) -> Result<ChatRequest, crate::ports::DecodeError> {
            let model = std::str::from_utf8(body).unwrap_or("gpt-4o").to_string();
            Ok(sample_chat_request(if model.is_empty() { "gpt-4o" } else { &model }))
        }
        fn encode_response(&self, resp: &crate::model::ChatResponse) -> Vec<u8> {
            resp.id.clone().into_bytes()
        }
        fn encode_stream_delta(&self, delta: &StreamDelta, _state: &mut crate::ports::StreamEncodeState) -> Vec<u8> {
            match delta {
                StreamDelta::Content(part) => part.as_text().unwrap_or("").as_bytes().to_vec(),
                StreamDelta::Thinking(part) => part.as_text().unwrap_or("").as_bytes().to_vec(),
                StreamDelta::Done { .. } => b"DONE".to_vec(),
                StreamDelta::ToolUse(_) => Vec::new(),
            }
        }
        fn stream_terminator(&self) -> &'static [u8] {
            b"[TERM]"
        }
    }

    #[tokio::test]
    async fn rejects_admission_without_balance() {
        let provider = Arc::new(MockProvider::new("mock", chatgate_config::ProviderKind::UpstreamA));
        let (pipeline, _usage) = test_pipeline(provider, false);
        let err = pipeline
            .handle(Arc::new(EchoCodec), b"gpt-4o", Some("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance));
    }

    #[tokio::test]
    async fn rejects_missing_auth() {
        let provider = Arc::new(MockProvider::new("mock", chatgate_config::ProviderKind::UpstreamA));
        let (pipeline, _usage) = test_pipeline(provider, true);
        let err = pipeline
            .handle(Arc::new(EchoCodec), b"gpt-4o", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[tokio::test]
    async fn non_streaming_returns_complete_and_logs_usage_once() {
        let provider = Arc::new(MockProvider::new("mock", chatgate_config::ProviderKind::UpstreamA));
        let (pipeline, usage) = test_pipeline(provider, true);
        let outcome = pipeline
            .handle(Arc::new(EchoCodec), b"gpt-4o", Some("k"))
            .await
            .expect("admitted");
        match outcome {
            PipelineOutcome::Complete(body) => assert_eq!(body, b"mock-response"),
            PipelineOutcome::Streaming(_) => panic!("expected non-streaming outcome"),
        }
        // accounting is fire-and-forget; give the spawned task a turn.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(usage.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn streaming_forwards_deltas_and_terminates_exactly_once() {
        let provider = Arc::new(
            MockProvider::new("mock", chatgate_config::ProviderKind::UpstreamA)
                .with_deltas(sample_delta_sequence()),
        );
        let (pipeline, usage) = test_pipeline(provider, true);

        struct StreamingEchoCodec;
        impl DialectCodec for StreamingEchoCodec {
            fn format_name(&self) -> &'static str {
                "echo-stream"
            }
            fn decode(&self, _body: &[u8]) -> Result<ChatRequest, crate::ports::DecodeError> {
                let mut r = sample_chat_request("gpt-4o");
                r.stream = true;
                Ok(r)
            }
            fn encode_response(&self, resp: &crate::model::ChatResponse) -> Vec<u8> {
                resp.id.clone().into_bytes()
            }
            fn encode_stream_delta(&self, delta: &StreamDelta, _state: &mut crate::ports::StreamEncodeState) -> Vec<u8> {
                match delta {
                    StreamDelta::Content(part) => part.as_text().unwrap_or("").as_bytes().to_vec(),
                    StreamDelta::Thinking(part) => part.as_text().unwrap_or("").as_bytes().to_vec(),
                    StreamDelta::Done { .. } => b"DONE".to_vec(),
                    StreamDelta::ToolUse(_) => Vec::new(),
                }
            }
            fn stream_terminator(&self) -> &'static [u8] {
                b"[TERM]"
            }
        }

        let outcome = pipeline
            .handle(Arc::new(StreamingEchoCodec), b"", Some("k"))
            .await
            .expect("admitted");
        let mut rx = match outcome {
            PipelineOutcome::Streaming(rx) => rx,
            PipelineOutcome::Complete(_) => panic!("expected streaming outcome"),
        };

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames.last().map(Vec::as_slice), Some(b"[TERM]".as_slice()));
        assert_eq!(frames[frames.len() - 2], b"DONE");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(usage.records.lock().unwrap().len(), 1);
    }
}
