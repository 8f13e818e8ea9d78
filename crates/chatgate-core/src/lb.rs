//! Load-balancing primitives shared by LB groups (spec §4.4).
//!
//! All four strategies share the capability set `{Select, ReportSuccess,
//! ReportFailure, UpdateNodes}`. Per spec §5, node-list/failed-set state is
//! guarded by a single `std::sync::RwLock` — the teacher's code reaches for
//! plain `std::sync` primitives rather than `parking_lot` throughout, and
//! contention here is not a concern (selection is O(nodes), groups are
//! small).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chatgate_config::{LbGroup, LbMember, LbStrategy};
use rand::Rng;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LbError {
    #[error("no available node in load-balancing group")]
    NoAvailable,
}

/// Shared behavior every load-balancing strategy implements.
pub trait LoadBalancer: Send + Sync {
    /// Choose a provider name from `members`.
    fn select(&self, members: &[LbMember]) -> Result<String, LbError>;
    fn report_success(&self, provider: &str);
    fn report_failure(&self, provider: &str);
}

/// Atomic monotonic counter modulo node count. Non-blocking.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, members: &[LbMember]) -> Result<String, LbError> {
        if members.is_empty() {
            return Err(LbError::NoAvailable);
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize % members.len();
        Ok(members[idx].provider.clone())
    }

    fn report_success(&self, _provider: &str) {}
    fn report_failure(&self, _provider: &str) {}
}

/// Uniform random selection. Ignores success/failure reports.
#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn select(&self, members: &[LbMember]) -> Result<String, LbError> {
        if members.is_empty() {
            return Err(LbError::NoAvailable);
        }
        let idx = rand::thread_rng().gen_range(0..members.len());
        Ok(members[idx].provider.clone())
    }

    fn report_success(&self, _provider: &str) {}
    fn report_failure(&self, _provider: &str) {}
}

/// Draws `r` in `[0, Σweights)` and walks the weight prefix sum, returning
/// the first node whose cumulative weight exceeds `r`. `Σweights = 0` is
/// `NoAvailable` (spec §4.4).
#[derive(Debug, Default)]
pub struct Weighted;

impl LoadBalancer for Weighted {
    fn select(&self, members: &[LbMember]) -> Result<String, LbError> {
        let total: u64 = members.iter().map(|m| m.weight as u64).sum();
        if total == 0 {
            return Err(LbError::NoAvailable);
        }
        let r = rand::thread_rng().gen_range(0..total);
        let mut cumulative = 0u64;
        for member in members {
            cumulative += member.weight as u64;
            if r < cumulative {
                return Ok(member.provider.clone());
            }
        }
        // Unreachable given r < total, but fall back to the last member
        // rather than panicking on a float/rounding surprise.
        Ok(members.last().expect("members non-empty: total > 0").provider.clone())
    }

    fn report_success(&self, _provider: &str) {}
    fn report_failure(&self, _provider: &str) {}
}

/// Maintains a set of nodes currently marked failed. `Select` scans members
/// in input order and returns the first non-failed one; if all are failed,
/// returns the first member anyway (last-resort, spec §4.4).
#[derive(Debug, Default)]
pub struct Failover {
    failed: RwLock<std::collections::HashSet<String>>,
}

impl Failover {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for Failover {
    fn select(&self, members: &[LbMember]) -> Result<String, LbError> {
        if members.is_empty() {
            return Err(LbError::NoAvailable);
        }
        let failed = self.failed.read().expect("failover lock poisoned");
        for member in members {
            if !failed.contains(&member.provider) {
                return Ok(member.provider.clone());
            }
        }
        Ok(members[0].provider.clone())
    }

    fn report_success(&self, provider: &str) {
        self.failed
            .write()
            .expect("failover lock poisoned")
            .remove(provider);
    }

    fn report_failure(&self, provider: &str) {
        self.failed
            .write()
            .expect("failover lock poisoned")
            .insert(provider.to_string());
    }
}

fn strategy_impl(strategy: LbStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        LbStrategy::RoundRobin => Box::new(RoundRobin::new()),
        LbStrategy::Random => Box::new(Random),
        LbStrategy::Weighted => Box::new(Weighted),
        LbStrategy::Failover => Box::new(Failover::new()),
    }
}

/// Owns one [`LoadBalancer`] instance per LB group name, keyed by
/// `model_pattern`, so round-robin counters and failover state persist
/// across requests for the lifetime of the registry (not per-request, and
/// not per-snapshot — a config reload that keeps the same group name keeps
/// its balancer state).
#[derive(Default)]
pub struct LoadBalancerRegistry {
    balancers: RwLock<HashMap<String, Box<dyn LoadBalancer>>>,
}

impl LoadBalancerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a provider name for the given group, lazily constructing the
    /// strategy implementation for that group's pattern on first use.
    pub fn select(&self, group: &LbGroup) -> Result<String, LbError> {
        {
            let balancers = self.balancers.read().expect("registry lock poisoned");
            if let Some(lb) = balancers.get(&group.model_pattern) {
                return lb.select(&group.members);
            }
        }
        let mut balancers = self.balancers.write().expect("registry lock poisoned");
        let lb = balancers
            .entry(group.model_pattern.clone())
            .or_insert_with(|| strategy_impl(group.strategy));
        lb.select(&group.members)
    }

    pub fn report_success(&self, group_pattern: &str, provider: &str) {
        if let Some(lb) = self
            .balancers
            .read()
            .expect("registry lock poisoned")
            .get(group_pattern)
        {
            lb.report_success(provider);
        }
    }

    pub fn report_failure(&self, group_pattern: &str, provider: &str) {
        if let Some(lb) = self
            .balancers
            .read()
            .expect("registry lock poisoned")
            .get(group_pattern)
        {
            lb.report_failure(provider);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[(&str, u32)]) -> Vec<LbMember> {
        names
            .iter()
            .map(|(name, weight)| LbMember {
                provider: name.to_string(),
                weight: *weight,
                priority: 0,
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_members() {
        let lb = RoundRobin::new();
        let members = members(&[("a", 1), ("b", 1), ("c", 1)]);
        let picks: Vec<_> = (0..6).map(|_| lb.select(&members).unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn weighted_zero_total_is_unavailable() {
        let lb = Weighted;
        let members = members(&[("a", 0), ("b", 0)]);
        assert_eq!(lb.select(&members), Err(LbError::NoAvailable));
    }

    #[test]
    fn weighted_distribution_converges_to_weights() {
        let lb = Weighted;
        let members = members(&[("a", 1), ("b", 3)]);
        let n = 10_000;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..n {
            let pick = lb.select(&members).unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        let a_ratio = *counts.get("a").unwrap_or(&0) as f64 / n as f64;
        // Expected ~0.25; allow generous slack for a statistical test.
        assert!((a_ratio - 0.25).abs() < 0.05, "a_ratio={a_ratio}");
    }

    #[test]
    fn failover_returns_first_non_failed() {
        let lb = Failover::new();
        let members = members(&[("a", 1), ("b", 1)]);
        lb.report_failure("a");
        assert_eq!(lb.select(&members).unwrap(), "b");
        lb.report_success("a");
        assert_eq!(lb.select(&members).unwrap(), "a");
    }

    #[test]
    fn failover_falls_back_to_first_when_all_failed() {
        let lb = Failover::new();
        let members = members(&[("a", 1), ("b", 1)]);
        lb.report_failure("a");
        lb.report_failure("b");
        assert_eq!(lb.select(&members).unwrap(), "a");
    }

    #[test]
    fn registry_persists_state_across_selects() {
        let registry = LoadBalancerRegistry::new();
        let group = LbGroup {
            model_pattern: "shared-model".to_string(),
            strategy: LbStrategy::Failover,
            members: members(&[("a", 1), ("b", 1)]),
        };
        registry.select(&group).unwrap();
        registry.report_failure("shared-model", "a");
        assert_eq!(registry.select(&group).unwrap(), "b");
    }
}
