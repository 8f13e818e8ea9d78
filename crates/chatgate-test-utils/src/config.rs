//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised `AppConfig` values without
//! repeating TOML boilerplate across crate boundaries.

use chatgate_config::{AppConfig, ExactRouteConfig, LbGroupConfig, LbMemberConfig, PrefixRouteConfig, ProviderConfig};

/// Fluent builder for [`AppConfig`] in tests.
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn listen_addr(mut self, addr: &str) -> Self {
        self.config.server.listen_addr = addr.to_string();
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.server.listen_port = port;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    /// Add a provider with an inline credential (avoids touching the
    /// process environment from test code).
    pub fn provider(mut self, name: &str, kind: &str, base_url: &str, is_default: bool) -> Self {
        self.config.providers.push(ProviderConfig {
            name: name.to_string(),
            kind: kind.to_string(),
            base_url: base_url.to_string(),
            credential_env: None,
            credential_inline: Some("test-credential".to_string()),
            timeout_secs: 30,
            enabled: true,
            is_default,
        });
        self
    }

    pub fn exact_route(mut self, model: &str, provider: &str, actual_model: Option<&str>) -> Self {
        self.config.routes.exact.push(ExactRouteConfig {
            model: model.to_string(),
            provider: provider.to_string(),
            actual_model: actual_model.map(String::from),
        });
        self
    }

    pub fn prefix_route(mut self, prefix: &str, provider: &str, priority: i64) -> Self {
        self.config.routes.prefix.push(PrefixRouteConfig {
            prefix: prefix.to_string(),
            provider: provider.to_string(),
            priority,
        });
        self
    }

    pub fn lb_group(mut self, model_pattern: &str, strategy: &str, members: Vec<(&str, u32, i64)>) -> Self {
        self.config.lb_groups.push(LbGroupConfig {
            model_pattern: model_pattern.to_string(),
            strategy: strategy.to_string(),
            members: members
                .into_iter()
                .map(|(provider, weight, priority)| LbMemberConfig {
                    provider: provider.to_string(),
                    weight,
                    priority,
                })
                .collect(),
        });
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_valid_config() {
        let config = TestConfigBuilder::new()
            .provider("openai-main", "upstream-a", "https://api.openai.com/v1", true)
            .provider("claude-main", "upstream-b", "https://api.anthropic.com", true)
            .exact_route("gpt-4o", "openai-main", Some("gpt-4o-2024-08-06"))
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 2);
    }
}
