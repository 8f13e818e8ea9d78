//! Model-to-provider resolution (spec §4.3).
//!
//! Grounded on `chatgate-config`'s `ConfigSnapshot`, whose prefix routes are
//! pre-sorted by (priority descending, then pattern length descending) at
//! snapshot construction time — the same ordering a priority-sorted rule
//! engine would compute on demand, just computed once up front since the
//! snapshot never mutates.

use std::sync::Arc;

use chatgate_config::{ConfigSnapshot, ProviderInstance, ProviderKind, RouteRule};

use crate::lb::{LbError, LoadBalancerRegistry};

/// The outcome of resolving a model string against a snapshot.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub provider: Arc<ProviderInstance>,
    pub upstream_model: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RouterError {
    #[error("no provider configured for model {0:?}")]
    ProviderNotFound(String),
}

/// Resolves a canonical model string to a concrete provider instance.
pub struct Router {
    snapshot: Arc<ConfigSnapshot>,
    lb_registry: Arc<LoadBalancerRegistry>,
}

impl Router {
    pub fn new(snapshot: Arc<ConfigSnapshot>, lb_registry: Arc<LoadBalancerRegistry>) -> Self {
        Self {
            snapshot,
            lb_registry,
        }
    }

    /// Resolve `model` per the four-tier order in spec §4.3: exact route,
    /// then LB group, then longest/highest-priority prefix rule, then the
    /// snapshot's kind default.
    pub fn resolve(&self, model: &str) -> Result<Resolved, RouterError> {
        if let Some((provider_name, actual_model)) = self.snapshot.exact_routes.get(model) {
            let provider = self.provider(provider_name)?;
            let upstream_model = actual_model.clone().unwrap_or_else(|| model.to_string());
            return Ok(Resolved {
                provider,
                upstream_model,
            });
        }

        if let Some(group) = self.snapshot.lb_groups.get(model) {
            let provider_name = self
                .lb_registry
                .select(group)
                .map_err(|_: LbError| RouterError::ProviderNotFound(model.to_string()))?;
            let provider = self.provider(&provider_name)?;
            return Ok(Resolved {
                provider,
                upstream_model: model.to_string(),
            });
        }

        let lower = model.to_ascii_lowercase();
        for rule in &self.snapshot.prefix_routes {
            if let RouteRule::Prefix {
                pattern, provider, ..
            } = rule
            {
                if lower.starts_with(&pattern.to_ascii_lowercase()) {
                    let provider = self.provider(provider)?;
                    return Ok(Resolved {
                        provider,
                        upstream_model: model.to_string(),
                    });
                }
            }
        }

        let kind = ProviderKind::infer_from_model(model);
        let provider_name = self
            .snapshot
            .type_defaults
            .get(&kind)
            .ok_or_else(|| RouterError::ProviderNotFound(model.to_string()))?;
        let provider = self.provider(provider_name)?;
        Ok(Resolved {
            provider,
            upstream_model: model.to_string(),
        })
    }

    fn provider(&self, name: &str) -> Result<Arc<ProviderInstance>, RouterError> {
        self.snapshot
            .providers
            .get(name)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| RouterError::ProviderNotFound(name.to_string()))
    }
}
