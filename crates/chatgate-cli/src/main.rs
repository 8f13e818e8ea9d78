#![deny(unsafe_code)]

//! Chat gateway CLI — binds the dialect codecs and provider adapters to
//! `chatgate-core`'s pipeline and HTTP surface, and drives config
//! load/reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatgate_config::{AppConfig, ConfigSnapshot, ProviderInstance, ProviderKind};
use chatgate_core::lb::LoadBalancerRegistry;
use chatgate_core::pipeline::Pipeline;
use chatgate_core::ports::{
    AuthError, AuthPort, AuthSubject, LlmProvider, PortError, ProviderFactory, RatePort, UsagePort,
    UsageRecord, WalletPort,
};
use chatgate_core::server::{self, ServerState, ShutdownSignal};
use chatgate_core::BoxFuture;
use chatgate_dialect_anthropic::AnthropicDialect;
use chatgate_dialect_openai::OpenAiDialect;
use chatgate_provider_anthropic::AnthropicProvider;
use chatgate_provider_openai::OpenAiProvider;

/// Chat gateway — protocol-translating reverse proxy for LLM chat APIs.
#[derive(Parser)]
#[command(name = "chatgate", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "chatgate.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway's HTTP server.
    Serve,

    /// Parse and validate the configuration file without starting the server.
    ValidateConfig,

    /// Print the resolved routing table (providers, routes, LB groups).
    Routes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Serve => cmd_serve(&cli.config).await?,
        Commands::ValidateConfig => cmd_validate_config(&cli.config).await?,
        Commands::Routes => cmd_routes(&cli.config).await?,
    }

    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path).await.context("loading configuration")
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

async fn cmd_validate_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let snapshot = config.build_snapshot().context("building routing snapshot")?;
    println!(
        "configuration at '{}' is valid: {} provider(s), {} exact route(s), {} prefix route(s), {} LB group(s)",
        config_path.display(),
        snapshot.providers.len(),
        snapshot.exact_routes.len(),
        snapshot.prefix_routes.len(),
        snapshot.lb_groups.len(),
    );
    Ok(())
}

async fn cmd_routes(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let snapshot = config.build_snapshot().context("building routing snapshot")?;

    println!("providers:");
    let mut names: Vec<_> = snapshot.providers.keys().cloned().collect();
    names.sort();
    for name in names {
        let p = &snapshot.providers[&name];
        println!(
            "  {name} [{kind:?}]{default} -> {url}",
            name = p.name,
            kind = p.kind,
            default = if p.is_default { " (default)" } else { "" },
            url = p.base_url,
        );
    }

    println!("exact routes:");
    for (model, (provider, actual)) in &snapshot.exact_routes {
        match actual {
            Some(actual) => println!("  {model} -> {provider} (as {actual})"),
            None => println!("  {model} -> {provider}"),
        }
    }

    println!("prefix routes (evaluation order):");
    for rule in &snapshot.prefix_routes {
        println!("  {rule:?}");
    }

    println!("LB groups:");
    for (pattern, group) in &snapshot.lb_groups {
        println!("  {pattern} [{:?}]: {:?}", group.strategy, group.members);
    }

    Ok(())
}

async fn cmd_serve(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let listen_addr = config.server.listen_addr.clone();
    let listen_port = config.server.listen_port;
    let snapshot = Arc::new(config.build_snapshot().context("building initial routing snapshot")?);

    let (snapshot_tx, snapshot_rx) = tokio::sync::watch::channel(snapshot);

    let pipeline = Arc::new(Pipeline::new(
        snapshot_rx,
        Arc::new(LoadBalancerRegistry::new()),
        Arc::new(LiveProviderFactory),
        Arc::new(NoopAuthPort),
        Arc::new(AlwaysFundedWalletPort),
        Arc::new(ZeroRatePort),
        Arc::new(TracingUsagePort),
    ));

    let state = Arc::new(ServerState {
        pipeline,
        dialect_a: Arc::new(OpenAiDialect),
        dialect_b: Arc::new(AnthropicDialect),
        started_at: Instant::now(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<ShutdownSignal>(1);
    spawn_reload_listener(config_path.to_path_buf(), snapshot_tx);
    spawn_shutdown_listener(shutdown_tx);

    server::serve(&listen_addr, listen_port, state, shutdown_rx)
        .await
        .context("http server error")
}

/// Rebuilds the config snapshot and swaps it into the pipeline's `watch`
/// channel on `SIGHUP` (spec §6.3 `ConfigPort.load()` "invoked ... on
/// explicit reload trigger"); in-flight requests keep the snapshot `Arc`
/// they already captured (spec §3.3 invariant 3).
fn spawn_reload_listener(
    config_path: PathBuf,
    snapshot_tx: tokio::sync::watch::Sender<Arc<ConfigSnapshot>>,
) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGHUP handler, config reload disabled");
                    return;
                }
            };
            loop {
                sighup.recv().await;
                info!(path = %config_path.display(), "reload signal received");
                match AppConfig::load(&config_path).await.and_then(|c| c.build_snapshot()) {
                    Ok(snapshot) => {
                        let _ = snapshot_tx.send(Arc::new(snapshot));
                        info!("config reloaded");
                    }
                    Err(e) => warn!(error = %e, "config reload failed, keeping previous snapshot"),
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (config_path, snapshot_tx);
            warn!("config reload via SIGHUP is only supported on unix platforms");
        }
    });
}

fn spawn_shutdown_listener(shutdown_tx: tokio::sync::broadcast::Sender<ShutdownSignal>) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, shutting down");
        let _ = shutdown_tx.send(ShutdownSignal);
    });
}

/// Matches a configured provider's [`ProviderKind`] to its concrete adapter
/// (spec §4.2) — the inversion point `chatgate-core::ports::ProviderFactory`
/// documents: this binary is the only place allowed to depend on both
/// `chatgate-core` and the provider crates.
struct LiveProviderFactory;

impl ProviderFactory for LiveProviderFactory {
    fn build(&self, provider: &ProviderInstance) -> Arc<dyn LlmProvider> {
        match provider.kind {
            ProviderKind::UpstreamA => Arc::new(OpenAiProvider::new(provider)),
            ProviderKind::UpstreamB => Arc::new(AnthropicProvider::new(provider)),
        }
    }
}

/// Placeholder [`AuthPort`] until a real credential-issuance collaborator
/// (spec §1, out of scope for this repo) is wired in: treats any non-empty
/// key as valid, using the key itself as both the subject and API-key id.
struct NoopAuthPort;

impl AuthPort for NoopAuthPort {
    fn resolve_key(&self, key: &str) -> BoxFuture<'_, Result<AuthSubject, AuthError>> {
        let key = key.to_string();
        Box::pin(async move {
            if key.is_empty() {
                return Err(AuthError::Missing);
            }
            Ok(AuthSubject {
                subject_id: key.clone(),
                api_key_id: key,
            })
        })
    }
}

/// Placeholder [`WalletPort`] until a real billing collaborator (spec §1,
/// out of scope) is wired in: admits every request and logs charges instead
/// of applying them.
struct AlwaysFundedWalletPort;

impl WalletPort for AlwaysFundedWalletPort {
    fn has_balance(&self, _subject_id: &str) -> BoxFuture<'_, Result<bool, PortError>> {
        Box::pin(async move { Ok(true) })
    }

    fn charge(
        &self,
        subject_id: &str,
        api_key_id: &str,
        amount_micros: u64,
        model: &str,
    ) -> BoxFuture<'_, Result<(), PortError>> {
        tracing::debug!(subject_id, api_key_id, amount_micros, model, "charge (no wallet backend configured)");
        Box::pin(async move { Ok(()) })
    }
}

/// Placeholder [`RatePort`] until a real pricing collaborator (spec §1, out
/// of scope) is wired in: fails open to zero cost per spec §6.3.
struct ZeroRatePort;

impl RatePort for ZeroRatePort {
    fn rates_for(&self, _model: &str) -> BoxFuture<'_, (u64, u64)> {
        Box::pin(async move { (0, 0) })
    }
}

/// Placeholder [`UsagePort`] until a real event sink (spec §1, out of
/// scope) is wired in: logs the record at `info` level.
struct TracingUsagePort;

impl UsagePort for TracingUsagePort {
    fn log_request(&self, record: UsageRecord) -> BoxFuture<'_, ()> {
        info!(
            subject_id = ?record.subject_id,
            model = %record.model,
            provider = ?record.provider_name,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            outcome = ?record.outcome,
            latency_ms = record.latency_ms,
            "usage"
        );
        Box::pin(async move {})
    }
}
