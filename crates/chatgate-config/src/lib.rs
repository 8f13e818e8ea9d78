#![deny(unsafe_code)]

//! Configuration loading, validation, and routing-snapshot construction for
//! the chat gateway.
//!
//! Loads a TOML configuration file and validates it against the expected
//! schema. [`AppConfig`] is the on-disk shape; [`ConfigSnapshot`] (in the
//! [`snapshot`] module) is the immutable, query-ready routing table built
//! from it.

/// The immutable routing snapshot consumed by the router and pipeline.
pub mod snapshot;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use snapshot::{ConfigSnapshot, LbGroup, LbMember, LbStrategy, ProviderInstance, ProviderKind, RouteRule};

/// Errors that can occur while loading, parsing, or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level, on-disk application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub routes: RoutesConfig,

    #[serde(default)]
    pub lb_groups: Vec<LbGroupConfig>,
}

/// Client-facing listen address configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single configured upstream provider, as expressed in TOML.
///
/// ```toml
/// [[providers]]
/// name = "openai-main"
/// kind = "upstream-a"
/// base_url = "https://api.openai.com/v1"
/// credential_env = "OPENAI_API_KEY"
/// is_default = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: String,
    pub base_url: String,
    /// Name of the environment variable holding the credential. Mutually
    /// exclusive with `credential_inline`; credential issuance itself is an
    /// out-of-scope concern (spec §1) consumed only as a config-supplied
    /// string here.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub credential_inline: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_default: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Exact and prefix routing rules as expressed in TOML.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    #[serde(default)]
    pub exact: Vec<ExactRouteConfig>,
    #[serde(default)]
    pub prefix: Vec<PrefixRouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactRouteConfig {
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub actual_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixRouteConfig {
    pub prefix: String,
    pub provider: String,
    #[serde(default)]
    pub priority: i64,
}

/// A load-balancing group as expressed in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbGroupConfig {
    pub model_pattern: String,
    pub strategy: String,
    pub members: Vec<LbMemberConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbMemberConfig {
    pub provider: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i64,
}

fn default_weight() -> u32 {
    1
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_port == 0 {
            return Err(ConfigError::Validation(
                "server.listen_port must be non-zero".to_string(),
            ));
        }
        if self.server.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "server.listen_addr must not be empty".to_string(),
            ));
        }

        let valid_kinds = ["upstream-a", "upstream-b"];
        let mut seen_names = std::collections::HashSet::new();
        let mut default_seen: HashMap<&str, usize> = HashMap::new();
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "providers[{i}].name must not be empty"
                )));
            }
            if !seen_names.insert(provider.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "providers[{i}].name {:?} is duplicated",
                    provider.name
                )));
            }
            if !valid_kinds.contains(&provider.kind.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "providers[{i}].kind must be one of {:?}, got {:?}",
                    valid_kinds, provider.kind
                )));
            }
            if provider.credential_env.is_none() && provider.credential_inline.is_none() {
                return Err(ConfigError::Validation(format!(
                    "providers[{i}] must set credential_env or credential_inline"
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "providers[{i}].timeout_secs must be non-zero"
                )));
            }
            if provider.is_default {
                *default_seen.entry(provider.kind.as_str()).or_insert(0) += 1;
            }
        }
        if let Some((kind, _)) = default_seen.iter().find(|(_, &n)| n > 1) {
            return Err(ConfigError::Validation(format!(
                "at most one default provider is allowed per kind, got {} for kind {:?}",
                default_seen[kind], kind
            )));
        }

        for route in &self.routes.exact {
            if !seen_names.contains(&route.provider) {
                return Err(ConfigError::Validation(format!(
                    "routes.exact[{:?}] references unknown provider {:?}",
                    route.model, route.provider
                )));
            }
        }
        for route in &self.routes.prefix {
            if !seen_names.contains(&route.provider) {
                return Err(ConfigError::Validation(format!(
                    "routes.prefix[{:?}] references unknown provider {:?}",
                    route.prefix, route.provider
                )));
            }
        }
        for (i, group) in self.lb_groups.iter().enumerate() {
            let valid_strategies = ["round-robin", "random", "weighted", "failover"];
            if !valid_strategies.contains(&group.strategy.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "lb_groups[{i}].strategy must be one of {:?}, got {:?}",
                    valid_strategies, group.strategy
                )));
            }
            if group.members.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "lb_groups[{i}] must have at least one member"
                )));
            }
            for member in &group.members {
                if !seen_names.contains(&member.provider) {
                    return Err(ConfigError::Validation(format!(
                        "lb_groups[{i}] references unknown provider {:?}",
                        member.provider
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build a [`ConfigSnapshot`] from the loaded configuration.
    ///
    /// Credentials are resolved from the environment at this point (never
    /// stored verbatim in `AppConfig` beyond the env-var name), so the
    /// snapshot is self-contained for the lifetime it's handed out under.
    pub fn build_snapshot(&self) -> Result<ConfigSnapshot, ConfigError> {
        let mut providers = HashMap::new();
        for p in &self.providers {
            let kind = match p.kind.as_str() {
                "upstream-a" => ProviderKind::UpstreamA,
                "upstream-b" => ProviderKind::UpstreamB,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "unknown provider kind {other:?}"
                    )));
                }
            };
            let credential = if let Some(inline) = &p.credential_inline {
                inline.clone()
            } else if let Some(env) = &p.credential_env {
                std::env::var(env).map_err(|_| {
                    ConfigError::Validation(format!(
                        "provider {:?}: environment variable {env:?} is not set",
                        p.name
                    ))
                })?
            } else {
                unreachable!("validate() rejects providers without a credential source")
            };
            providers.insert(
                p.name.clone(),
                ProviderInstance {
                    name: p.name.clone(),
                    kind,
                    credential,
                    base_url: p.base_url.clone(),
                    timeout_secs: p.timeout_secs,
                    enabled: p.enabled,
                    is_default: p.is_default,
                },
            );
        }

        let mut exact_routes = HashMap::new();
        for r in &self.routes.exact {
            exact_routes.insert(r.model.clone(), (r.provider.clone(), r.actual_model.clone()));
        }

        let prefix_routes = self
            .routes
            .prefix
            .iter()
            .map(|r| RouteRule::Prefix {
                pattern: r.prefix.clone(),
                provider: r.provider.clone(),
                priority: r.priority,
            })
            .collect();

        let mut lb_groups = HashMap::new();
        for g in &self.lb_groups {
            let strategy = match g.strategy.as_str() {
                "round-robin" => LbStrategy::RoundRobin,
                "random" => LbStrategy::Random,
                "weighted" => LbStrategy::Weighted,
                "failover" => LbStrategy::Failover,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "unknown lb strategy {other:?}"
                    )));
                }
            };
            let members = g
                .members
                .iter()
                .map(|m| LbMember {
                    provider: m.provider.clone(),
                    weight: m.weight,
                    priority: m.priority,
                })
                .collect();
            lb_groups.insert(
                g.model_pattern.clone(),
                LbGroup {
                    model_pattern: g.model_pattern.clone(),
                    strategy,
                    members,
                },
            );
        }

        Ok(ConfigSnapshot::build(
            providers,
            exact_routes,
            prefix_routes,
            lb_groups,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        [server]
        listen_addr = "127.0.0.1"
        listen_port = 8080

        [[providers]]
        name = "openai-main"
        kind = "upstream-a"
        base_url = "https://api.openai.com/v1"
        credential_inline = "sk-test"
        is_default = true

        [[providers]]
        name = "claude-main"
        kind = "upstream-b"
        base_url = "https://api.anthropic.com"
        credential_inline = "sk-ant-test"
        is_default = true

        [[routes.exact]]
        model = "gpt-4o"
        provider = "openai-main"
        actual_model = "gpt-4o-2024-08-06"
        "#
    }

    #[test]
    fn parses_minimal_config() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.server.listen_port, 8080);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn parses_full_sample() {
        let config = AppConfig::parse(sample_toml()).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.routes.exact.len(), 1);
    }

    #[test]
    fn rejects_zero_port() {
        let err = AppConfig::parse("[server]\nlisten_port = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let toml = r#"
        [[providers]]
        name = "dup"
        kind = "upstream-a"
        base_url = "https://x"
        credential_inline = "k"

        [[providers]]
        name = "dup"
        kind = "upstream-b"
        base_url = "https://y"
        credential_inline = "k"
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_two_defaults_for_same_kind() {
        let toml = r#"
        [[providers]]
        name = "openai-main"
        kind = "upstream-a"
        base_url = "https://x"
        credential_inline = "k"
        is_default = true

        [[providers]]
        name = "openai-secondary"
        kind = "upstream-a"
        base_url = "https://y"
        credential_inline = "k"
        is_default = true
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_route_to_unknown_provider() {
        let toml = r#"
        [[routes.exact]]
        model = "gpt-4o"
        provider = "nonexistent"
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_missing_credential() {
        let toml = r#"
        [[providers]]
        name = "x"
        kind = "upstream-a"
        base_url = "https://x"
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn build_snapshot_resolves_inline_credentials_and_defaults() {
        let config = AppConfig::parse(sample_toml()).unwrap();
        let snapshot = config.build_snapshot().unwrap();
        assert_eq!(snapshot.providers.len(), 2);
        assert_eq!(
            snapshot.type_defaults.get(&ProviderKind::UpstreamA),
            Some(&"openai-main".to_string())
        );
        assert_eq!(
            snapshot.exact_routes.get("gpt-4o"),
            Some(&("openai-main".to_string(), Some("gpt-4o-2024-08-06".to_string())))
        );
    }

    #[tokio::test]
    async fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatgate.toml");
        tokio::fs::write(&path, sample_toml()).await.unwrap();
        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.providers.len(), 2);
    }

    #[tokio::test]
    async fn load_missing_file_is_io_error() {
        let err = AppConfig::load(Path::new("/nonexistent/chatgate.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn parse_invalid_toml_is_parse_error() {
        let err = AppConfig::parse("not = [valid").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
