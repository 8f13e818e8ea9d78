//! Mock port/provider implementations used across pipeline, router, and
//! dialect tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chatgate_config::ProviderKind;
use chatgate_core::model::{ChatRequest, ChatResponse, FinishReason, StreamDelta, TokenUsage};
use chatgate_core::ports::{
    AuthError, AuthPort, AuthSubject, PortError, ProviderCapabilities, ProviderError, RatePort,
    UsagePort, UsageRecord, LlmProvider, WalletPort,
};
use chatgate_core::BoxFuture;

/// Always resolves `key` to a fixed subject, unless `key` is empty.
pub struct MockAuthPort;

impl AuthPort for MockAuthPort {
    fn resolve_key(&self, key: &str) -> BoxFuture<'_, Result<AuthSubject, AuthError>> {
        let key = key.to_string();
        Box::pin(async move {
            if key.is_empty() {
                return Err(AuthError::Missing);
            }
            Ok(AuthSubject {
                subject_id: format!("subject-{key}"),
                api_key_id: format!("key-{key}"),
            })
        })
    }
}

/// Reports a fixed balance and records every charge it is asked to apply.
pub struct MockWalletPort {
    pub has_balance: bool,
    pub charges: Mutex<Vec<(String, String, u64, String)>>,
}

impl MockWalletPort {
    pub fn with_balance(has_balance: bool) -> Self {
        Self {
            has_balance,
            charges: Mutex::new(Vec::new()),
        }
    }
}

impl WalletPort for MockWalletPort {
    fn has_balance(&self, _subject_id: &str) -> BoxFuture<'_, Result<bool, PortError>> {
        let has_balance = self.has_balance;
        Box::pin(async move { Ok(has_balance) })
    }

    fn charge(
        &self,
        subject_id: &str,
        api_key_id: &str,
        amount_micros: u64,
        model: &str,
    ) -> BoxFuture<'_, Result<(), PortError>> {
        self.charges.lock().expect("mock wallet lock poisoned").push((
            subject_id.to_string(),
            api_key_id.to_string(),
            amount_micros,
            model.to_string(),
        ));
        Box::pin(async move { Ok(()) })
    }
}

/// Fixed-rate pricing for every model.
pub struct MockRatePort {
    pub prompt_price: u64,
    pub completion_price: u64,
}

impl Default for MockRatePort {
    fn default() -> Self {
        Self {
            prompt_price: 0,
            completion_price: 0,
        }
    }
}

impl RatePort for MockRatePort {
    fn rates_for(&self, _model: &str) -> BoxFuture<'_, (u64, u64)> {
        let rates = (self.prompt_price, self.completion_price);
        Box::pin(async move { rates })
    }
}

/// Records every [`UsageRecord`] handed to it, for assertions like P7
/// ("exactly one accounting event per admitted request").
#[derive(Default)]
pub struct MockUsagePort {
    pub records: Mutex<Vec<UsageRecord>>,
}

impl UsagePort for MockUsagePort {
    fn log_request(&self, record: UsageRecord) -> BoxFuture<'_, ()> {
        self.records.lock().expect("mock usage lock poisoned").push(record);
        Box::pin(async move {})
    }
}

/// A fake upstream provider that replays a fixed canonical response or
/// delta sequence, counting how many times it was invoked.
pub struct MockProvider {
    pub provider_name: String,
    pub kind: ProviderKind,
    pub response: ChatResponse,
    pub deltas: Vec<StreamDelta>,
    pub chat_calls: AtomicU32,
    pub stream_calls: AtomicU32,
}

impl MockProvider {
    pub fn new(name: &str, kind: ProviderKind) -> Self {
        Self {
            provider_name: name.to_string(),
            kind,
            response: ChatResponse {
                id: "mock-response".to_string(),
                model: "mock-model".to_string(),
                content: vec![chatgate_core::model::ContentPart::text("mock reply")],
                finish_reason: FinishReason::Stop,
                usage: Some(TokenUsage::new(5, 2)),
                provider_name: name.to_string(),
            },
            deltas: vec![StreamDelta::Done {
                finish_reason: FinishReason::Stop,
                usage: Some(TokenUsage::new(5, 2)),
            }],
            chat_calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
        }
    }

    pub fn with_deltas(mut self, deltas: Vec<StreamDelta>) -> Self {
        self.deltas = deltas;
        self
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            tools: true,
            vision: true,
        }
    }

    fn chat(&self, _request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse, ProviderError>> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }

    fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> BoxFuture<'_, Result<(tokio::sync::mpsc::Receiver<StreamDelta>, String), ProviderError>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let deltas = self.deltas.clone();
        let name = self.provider_name.clone();
        Box::pin(async move {
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            tokio::spawn(async move {
                for delta in deltas {
                    if tx.send(delta).await.is_err() {
                        break;
                    }
                }
            });
            Ok((rx, name))
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
        Box::pin(async move { Ok(vec!["mock-model".to_string()]) })
    }
}

/// A [`chatgate_core::ports::ProviderFactory`] that always returns the same
/// pre-built provider, regardless of the `ProviderInstance` passed in.
pub struct SingleProviderFactory(pub Arc<dyn LlmProvider>);

impl chatgate_core::ports::ProviderFactory for SingleProviderFactory {
    fn build(&self, _provider: &chatgate_config::ProviderInstance) -> Arc<dyn LlmProvider> {
        self.0.clone()
    }
}
