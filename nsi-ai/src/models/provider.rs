//! Provider profile as exposed to monitoring

use serde::{Deserialize, Serialize};

use crate::gateway::circuit_breaker::BreakerSnapshot;
use crate::gateway::ranker::ProviderStats;
use crate::gateway::rate_limiter::RateLimitBudget;

/// One AI provider with its live state
///
/// Assembled on demand from the ranker, breaker and limiter, which each own a disjoint
/// part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    pub model: String,
    /// Configured priority (lower first)
    pub priority: u32,
    /// 1-based position in the current ranking
    pub rank: usize,
    pub stats: ProviderStats,
    pub rate_limit: RateLimitBudget,
    pub circuit: BreakerSnapshot,
}
