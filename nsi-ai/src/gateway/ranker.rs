//! Provider priority ranking
//!
//! Keeps an exponentially weighted latency average, success ratio and request count per
//! provider. Measured providers are ordered by success rate (descending), then latency
//! (ascending); providers without measurements follow in configured priority order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

use nsi_common::events::{EventBus, NsiEvent};

/// Rolling statistics of one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// `successes / total_requests`, 0 when unmeasured
    pub success_rate: f64,
    /// Exponentially weighted latency, `None` when unmeasured
    pub avg_latency_ms: Option<f64>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ProviderStats {
    pub fn is_measured(&self) -> bool {
        self.total_requests > 0
    }
}

#[derive(Debug)]
struct RankerInner {
    stats: HashMap<String, ProviderStats>,
    ranking: Vec<String>,
}

#[derive(Debug)]
pub struct ProviderRanker {
    /// Configured priority per provider (lower first)
    priorities: HashMap<String, u32>,
    alpha: f64,
    inner: Mutex<RankerInner>,
    event_bus: Option<EventBus>,
}

impl ProviderRanker {
    /// `providers` are `(name, configured priority)` pairs
    pub fn new(providers: &[(String, u32)], alpha: f64, event_bus: Option<EventBus>) -> Self {
        let priorities: HashMap<String, u32> = providers.iter().cloned().collect();
        let stats = providers
            .iter()
            .map(|(name, _)| (name.clone(), ProviderStats::default()))
            .collect();
        let ranker = Self {
            priorities,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            inner: Mutex::new(RankerInner {
                stats,
                ranking: Vec::new(),
            }),
            event_bus,
        };
        {
            let mut inner = ranker.lock();
            let ranking = ranker.compute_ranking(&inner.stats);
            inner.ranking = ranking;
        }
        ranker
    }

    fn lock(&self) -> MutexGuard<'_, RankerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one attempt; re-ranks and broadcasts when the order changed
    pub fn record(&self, provider: &str, latency: Duration, success: bool) {
        let mut inner = self.lock();
        let Some(stats) = inner.stats.get_mut(provider) else {
            tracing::debug!(provider, "Ignoring measurement for unknown provider");
            return;
        };

        let latency_ms = latency.as_secs_f64() * 1000.0;
        stats.total_requests += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.success_rate = stats.successes as f64 / stats.total_requests as f64;
        stats.avg_latency_ms = Some(match stats.avg_latency_ms {
            Some(avg) => self.alpha * latency_ms + (1.0 - self.alpha) * avg,
            None => latency_ms,
        });
        stats.last_request_at = Some(Utc::now());

        let ranking = self.compute_ranking(&inner.stats);
        if ranking != inner.ranking {
            info!(ranking = ?ranking, "Provider ranking changed");
            inner.ranking = ranking.clone();
            drop(inner);
            self.broadcast(ranking);
        }
    }

    /// Providers in priority order
    pub fn ranking(&self) -> Vec<String> {
        self.lock().ranking.clone()
    }

    pub fn stats(&self, provider: &str) -> Option<ProviderStats> {
        self.lock().stats.get(provider).cloned()
    }

    pub fn all_stats(&self) -> HashMap<String, ProviderStats> {
        self.lock().stats.clone()
    }

    pub fn priority(&self, provider: &str) -> u32 {
        self.priorities.get(provider).copied().unwrap_or(u32::MAX)
    }

    /// Recompute and broadcast the order unconditionally (after a benchmark run)
    pub fn rerank(&self) -> Vec<String> {
        let mut inner = self.lock();
        let ranking = self.compute_ranking(&inner.stats);
        inner.ranking = ranking.clone();
        drop(inner);
        info!(ranking = ?ranking, "Providers re-ranked");
        self.broadcast(ranking.clone());
        ranking
    }

    fn broadcast(&self, ranking: Vec<String>) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(NsiEvent::ProvidersRanked {
                ranking,
                timestamp: Utc::now(),
            });
        }
    }

    fn compute_ranking(&self, stats: &HashMap<String, ProviderStats>) -> Vec<String> {
        let mut names: Vec<&String> = stats.keys().collect();
        names.sort_by(|a, b| self.compare(a, &stats[*a], b, &stats[*b]));
        names.into_iter().cloned().collect()
    }

    fn compare(&self, name_a: &str, a: &ProviderStats, name_b: &str, b: &ProviderStats) -> Ordering {
        let by_priority = || {
            self.priority(name_a)
                .cmp(&self.priority(name_b))
                .then_with(|| name_a.cmp(name_b))
        };
        match (a.is_measured(), b.is_measured()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => by_priority(),
            (true, true) => b
                .success_rate
                .total_cmp(&a.success_rate)
                .then_with(|| {
                    let la = a.avg_latency_ms.unwrap_or(f64::MAX);
                    let lb = b.avg_latency_ms.unwrap_or(f64::MAX);
                    la.total_cmp(&lb)
                })
                .then_with(by_priority),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranker() -> ProviderRanker {
        ProviderRanker::new(
            &[("A".to_string(), 2), ("B".to_string(), 1)],
            0.3,
            None,
        )
    }

    #[test]
    fn test_unmeasured_follow_configured_priority() {
        assert_eq!(ranker().ranking(), vec!["B", "A"]);
    }

    #[test]
    fn test_success_rate_beats_latency() {
        let r = ranker();
        // A: 95% success at 50ms, B: 60% success at 200ms
        for i in 0..20 {
            r.record("A", Duration::from_millis(50), i != 0);
        }
        for i in 0..10 {
            r.record("B", Duration::from_millis(200), i < 6);
        }
        assert_eq!(r.ranking(), vec!["A", "B"]);
        let a = r.stats("A").unwrap();
        assert_eq!(a.total_requests, 20);
        assert!((a.success_rate - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_latency_breaks_ties() {
        let r = ranker();
        r.record("A", Duration::from_millis(50), true);
        r.record("B", Duration::from_millis(300), true);
        assert_eq!(r.ranking(), vec!["A", "B"]);
    }

    #[test]
    fn test_measured_before_unmeasured() {
        let r = ranker();
        r.record("A", Duration::from_millis(900), false);
        assert_eq!(r.ranking(), vec!["A", "B"]);
    }

    #[test]
    fn test_ewma_latency() {
        let r = ranker();
        r.record("A", Duration::from_millis(100), true);
        r.record("A", Duration::from_millis(200), true);
        let avg = r.stats("A").unwrap().avg_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_ranking_change_is_broadcast() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let r = ProviderRanker::new(
            &[("A".to_string(), 2), ("B".to_string(), 1)],
            0.3,
            Some(bus.clone()),
        );
        r.record("A", Duration::from_millis(10), true);
        match rx.recv().await.unwrap() {
            NsiEvent::ProvidersRanked { ranking, .. } => assert_eq!(ranking, vec!["A", "B"]),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
