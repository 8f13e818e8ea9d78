//! The immutable routing snapshot built from a loaded [`AppConfig`](crate::AppConfig).
//!
//! A [`ConfigSnapshot`] never changes after construction. A config reload
//! builds an entirely new snapshot and the caller swaps a single `Arc`
//! pointer (see `chatgate_core::pipeline` for the watch-channel swap); no
//! field of an in-flight snapshot is ever mutated.

use std::collections::HashMap;

/// Which upstream wire family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// OpenAI-style chat-completions wire.
    UpstreamA,
    /// Anthropic-style messages wire.
    UpstreamB,
}

impl ProviderKind {
    /// Infer a kind from a model identifier when no route names one
    /// explicitly, per the gateway's kind-default resolution tier.
    pub fn infer_from_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("claude") {
            ProviderKind::UpstreamB
        } else {
            ProviderKind::UpstreamA
        }
    }
}

/// A concrete configured upstream endpoint.
///
/// Owned by the snapshot; its lifetime is the snapshot's lifetime (§3.2).
#[derive(Debug, Clone)]
pub struct ProviderInstance {
    pub name: String,
    pub kind: ProviderKind,
    pub credential: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub enabled: bool,
    pub is_default: bool,
}

/// A routing rule, keyed either exactly or by prefix.
#[derive(Debug, Clone)]
pub enum RouteRule {
    Exact {
        pattern: String,
        provider: String,
        actual_model: Option<String>,
    },
    Prefix {
        pattern: String,
        provider: String,
        priority: i64,
    },
}

/// Load-balancing strategy selector for an [`LbGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    RoundRobin,
    Random,
    Weighted,
    Failover,
}

/// One member of a load-balancing group.
#[derive(Debug, Clone)]
pub struct LbMember {
    pub provider: String,
    pub weight: u32,
    pub priority: i64,
}

/// A set of providers sharing a model name, balanced by a strategy.
#[derive(Debug, Clone)]
pub struct LbGroup {
    pub model_pattern: String,
    pub strategy: LbStrategy,
    pub members: Vec<LbMember>,
}

/// The routing table resolved from configuration, as described in spec §6.4.
///
/// Prefix routes are stored pre-sorted by (priority descending, then
/// pattern length descending) at construction time — there is no dirty
/// flag or rebuild step because the snapshot is immutable for its whole
/// lifetime; a reload builds a fresh snapshot rather than mutating this one.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub providers: HashMap<String, ProviderInstance>,
    pub type_defaults: HashMap<ProviderKind, String>,
    pub exact_routes: HashMap<String, (String, Option<String>)>,
    pub prefix_routes: Vec<RouteRule>,
    pub lb_groups: HashMap<String, LbGroup>,
}

impl ConfigSnapshot {
    /// Build a snapshot from raw parts, sorting prefix routes once.
    pub fn build(
        providers: HashMap<String, ProviderInstance>,
        exact_routes: HashMap<String, (String, Option<String>)>,
        mut prefix_routes: Vec<RouteRule>,
        lb_groups: HashMap<String, LbGroup>,
    ) -> Self {
        prefix_routes.sort_by(|a, b| {
            let (pa, la) = prefix_sort_key(a);
            let (pb, lb) = prefix_sort_key(b);
            pb.cmp(&pa).then(lb.cmp(&la))
        });

        let mut type_defaults = HashMap::new();
        for provider in providers.values() {
            if provider.is_default {
                // AppConfig::validate rejects more than one default per
                // kind, so this insert never arbitrates between candidates.
                type_defaults.insert(provider.kind, provider.name.clone());
            }
        }

        Self {
            providers,
            type_defaults,
            exact_routes,
            prefix_routes,
            lb_groups,
        }
    }
}

fn prefix_sort_key(rule: &RouteRule) -> (i64, usize) {
    match rule {
        RouteRule::Prefix {
            pattern, priority, ..
        } => (*priority, pattern.len()),
        RouteRule::Exact { .. } => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_routes_sort_priority_then_length() {
        let routes = vec![
            RouteRule::Prefix {
                pattern: "deepseek-".into(),
                provider: "sf".into(),
                priority: 0,
            },
            RouteRule::Prefix {
                pattern: "deepseek-r1-".into(),
                provider: "premium".into(),
                priority: 0,
            },
        ];
        let snap = ConfigSnapshot::build(HashMap::new(), HashMap::new(), routes, HashMap::new());
        let first = &snap.prefix_routes[0];
        match first {
            RouteRule::Prefix { provider, .. } => assert_eq!(provider, "premium"),
            _ => panic!("expected prefix rule"),
        }
    }

    #[test]
    fn higher_priority_wins_regardless_of_length() {
        let routes = vec![
            RouteRule::Prefix {
                pattern: "deepseek-r1-chat-long-prefix".into(),
                provider: "low".into(),
                priority: 0,
            },
            RouteRule::Prefix {
                pattern: "deepseek-".into(),
                provider: "high".into(),
                priority: 10,
            },
        ];
        let snap = ConfigSnapshot::build(HashMap::new(), HashMap::new(), routes, HashMap::new());
        match &snap.prefix_routes[0] {
            RouteRule::Prefix { provider, .. } => assert_eq!(provider, "high"),
            _ => panic!("expected prefix rule"),
        }
    }

    #[test]
    fn exactly_one_default_per_kind() {
        let mut providers = HashMap::new();
        providers.insert(
            "openai-main".to_string(),
            ProviderInstance {
                name: "openai-main".into(),
                kind: ProviderKind::UpstreamA,
                credential: "k".into(),
                base_url: "https://api.openai.com/v1".into(),
                timeout_secs: 30,
                enabled: true,
                is_default: true,
            },
        );
        providers.insert(
            "claude-main".to_string(),
            ProviderInstance {
                name: "claude-main".into(),
                kind: ProviderKind::UpstreamB,
                credential: "k".into(),
                base_url: "https://api.anthropic.com".into(),
                timeout_secs: 30,
                enabled: true,
                is_default: true,
            },
        );
        let snap = ConfigSnapshot::build(providers, HashMap::new(), Vec::new(), HashMap::new());
        assert_eq!(
            snap.type_defaults.get(&ProviderKind::UpstreamA),
            Some(&"openai-main".to_string())
        );
        assert_eq!(
            snap.type_defaults.get(&ProviderKind::UpstreamB),
            Some(&"claude-main".to_string())
        );
    }

    #[test]
    fn infer_kind_from_model_prefix() {
        assert_eq!(
            ProviderKind::infer_from_model("claude-3-5-sonnet"),
            ProviderKind::UpstreamB
        );
        assert_eq!(ProviderKind::infer_from_model("gpt-4o"), ProviderKind::UpstreamA);
        assert_eq!(
            ProviderKind::infer_from_model("o1-preview"),
            ProviderKind::UpstreamA
        );
        assert_eq!(
            ProviderKind::infer_from_model("some-other-model"),
            ProviderKind::UpstreamA
        );
    }
}
