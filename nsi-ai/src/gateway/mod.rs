//! AI classification gateway
//!
//! Uniform classification across interchangeable providers. Each call goes to the
//! highest-ranked provider whose circuit admits it and whose rate limiter yields a
//! token; failures are recorded against that provider and the next one is tried, up
//! to `max_retries` attempts. Every attempt feeds the ranker.
//!
//! With a fan-out [`AggregationStrategy`] every provider that can be called right away
//! answers the same batch concurrently and the answers are combined per request.

pub mod batch_processor;
pub mod benchmark;
pub mod circuit_breaker;
pub mod ranker;
pub mod rate_limiter;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use nsi_common::config::{AggregationStrategy, CacheSettings, CircuitBreakerSettings, GatewaySettings};
use nsi_common::events::EventBus;

use crate::models::{ProviderProfile, RecordCategory};
use crate::providers::{AiProvider, ClassificationRequest, ProviderAnswer, ProviderError};
use crate::similarity::{normalize_code, normalize_text};

pub use batch_processor::{BatchProcessor, BatchStats};
pub use benchmark::{BenchmarkReport, ProviderBenchmark};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use ranker::{ProviderRanker, ProviderStats};
pub use rate_limiter::{ProviderRateLimiter, RateLimitBudget};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("All providers exhausted after {attempts} attempts{}", error_suffix(.last_error))]
    ProviderExhausted {
        attempts: usize,
        last_error: Option<String>,
        /// Every provider circuit was open when the call gave up
        all_circuits_open: bool,
    },

    #[error("Rate limit exceeded for {provider} after waiting {waited_ms} ms")]
    RateLimitExceeded { provider: String, waited_ms: u64 },

    #[error("No AI providers configured")]
    NoProviders,

    #[error("Batch processor is shut down")]
    BatchProcessorClosed,
}

fn error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|e| format!(": {}", e))
        .unwrap_or_default()
}

/// One provider's answer, kept next to the chosen one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderVote {
    pub provider: String,
    pub code: String,
    pub name: String,
    pub confidence: f64,
}

/// Classification returned by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayAnswer {
    pub request_id: Uuid,
    pub code: String,
    pub name: String,
    pub confidence: f64,
    /// Provider name, suffixed with ` (cached)` for memoised answers
    pub provider_used: String,
    pub cached: bool,
    pub reasoning: Option<String>,
    /// Providers that agreed with this answer (`majority_vote` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub votes: Option<usize>,
    /// Every provider's answer in ranking order (`all_results` only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<ProviderVote>,
}

/// Provider handed to the gateway at build time
pub struct ProviderRegistration {
    pub provider: Arc<dyn AiProvider>,
    pub priority: u32,
    pub requests_per_minute: u32,
    pub burst: u32,
}

/// One provider with the state guarding it
pub(crate) struct ProviderSlot {
    pub(crate) provider: Arc<dyn AiProvider>,
    pub(crate) priority: u32,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) limiter: ProviderRateLimiter,
}

#[derive(Debug, Clone)]
struct MemoEntry {
    provider: String,
    code: String,
    name: String,
    confidence: f64,
}

type MemoKey = (RecordCategory, String);

type Outcomes = HashMap<Uuid, Result<GatewayAnswer, GatewayError>>;

enum Selection {
    Ready(Arc<ProviderSlot>),
    RateLimited(GatewayError),
    Exhausted,
}

pub struct AiGateway {
    slots: HashMap<String, Arc<ProviderSlot>>,
    ranker: Arc<ProviderRanker>,
    settings: GatewaySettings,
    memo: Cache<MemoKey, MemoEntry>,
}

impl AiGateway {
    pub fn new(
        registrations: Vec<ProviderRegistration>,
        settings: GatewaySettings,
        breaker_settings: &CircuitBreakerSettings,
        cache_settings: &CacheSettings,
        event_bus: Option<EventBus>,
    ) -> Self {
        let priorities: Vec<(String, u32)> = registrations
            .iter()
            .map(|r| (r.provider.name().to_string(), r.priority))
            .collect();
        let ranker = Arc::new(ProviderRanker::new(
            &priorities,
            settings.latency_ewma_alpha,
            event_bus.clone(),
        ));

        let slots = registrations
            .into_iter()
            .map(|r| {
                let name = r.provider.name().to_string();
                let slot = ProviderSlot {
                    breaker: CircuitBreaker::new(name.clone(), breaker_settings, event_bus.clone()),
                    limiter: ProviderRateLimiter::new(name.clone(), r.requests_per_minute, r.burst),
                    priority: r.priority,
                    provider: r.provider,
                };
                (name, Arc::new(slot))
            })
            .collect();

        Self {
            slots,
            ranker,
            memo: Cache::builder()
                .max_capacity(cache_settings.ai_answer_capacity as u64)
                .time_to_live(Duration::from_secs(cache_settings.ai_answer_ttl_secs))
                .build(),
            settings,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.slots.len()
    }

    pub fn ranker(&self) -> &Arc<ProviderRanker> {
        &self.ranker
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub(crate) fn slot(&self, name: &str) -> Option<&Arc<ProviderSlot>> {
        self.slots.get(name)
    }

    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.slots.get(provider).map(|s| &s.breaker)
    }

    /// True when there is no provider or every circuit refuses calls
    pub fn all_circuits_open(&self) -> bool {
        self.slots.values().all(|s| !s.breaker.can_proceed())
    }

    /// Classify one item
    pub async fn classify(&self, request: ClassificationRequest) -> Result<GatewayAnswer, GatewayError> {
        let id = request.id;
        let mut results = self.classify_batch(vec![request]).await;
        results.remove(&id).unwrap_or(Err(GatewayError::NoProviders))
    }

    /// Classify many items, using as few provider calls as possible
    ///
    /// The returned map holds one entry per request id.
    pub async fn classify_batch(&self, requests: Vec<ClassificationRequest>) -> Outcomes {
        let mut results = HashMap::with_capacity(requests.len());
        let mut pending = Vec::with_capacity(requests.len());

        for request in requests {
            match self.memo_lookup(&request).await {
                Some(answer) => {
                    results.insert(request.id, Ok(answer));
                }
                None => pending.push(request),
            }
        }
        if pending.is_empty() {
            return results;
        }
        if self.slots.is_empty() {
            for request in pending {
                results.insert(request.id, Err(GatewayError::NoProviders));
            }
            return results;
        }

        if self.settings.aggregation_strategy.fans_out() {
            self.dispatch_all(pending, &mut results).await;
        } else {
            self.dispatch_in_turn(pending, &mut results).await;
        }
        results
    }

    /// One provider at a time until every request is answered or attempts run out
    async fn dispatch_in_turn(&self, mut pending: Vec<ClassificationRequest>, results: &mut Outcomes) {
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;
        let mut rate_limited: Option<GatewayError> = None;

        while !pending.is_empty() && attempts < self.settings.max_retries {
            let slot = match self.select(&tried).await {
                Selection::Ready(slot) => slot,
                Selection::RateLimited(err) => {
                    rate_limited = Some(err);
                    break;
                }
                Selection::Exhausted => break,
            };
            let name = slot.provider.name().to_string();
            tried.insert(name.clone());
            attempts += 1;

            match self.call(&slot, &pending).await {
                Ok(answers) => {
                    let mut by_id: HashMap<Uuid, ProviderAnswer> =
                        answers.into_iter().map(|a| (a.id, a)).collect();
                    let mut answered = Vec::new();
                    pending.retain(|request| match by_id.remove(&request.id) {
                        Some(answer) => {
                            answered.push((Self::memo_key(request), to_gateway_answer(answer, &name)));
                            false
                        }
                        None => true,
                    });
                    for (key, answer) in answered {
                        self.memo_store(key, &answer).await;
                        results.insert(answer.request_id, Ok(answer));
                    }
                    if !pending.is_empty() {
                        last_error = Some(format!("{} left {} items unanswered", name, pending.len()));
                    }
                }
                Err(err) => {
                    last_error = Some(format!("{}: {}", name, err));
                }
            }
        }

        if pending.is_empty() {
            return;
        }
        // Waiting for a token ended the attempts: the caller may retry later
        let error = rate_limited.unwrap_or_else(|| GatewayError::ProviderExhausted {
            attempts,
            last_error,
            all_circuits_open: self.all_circuits_open(),
        });
        for request in pending {
            results.insert(request.id, Err(error.clone()));
        }
    }

    /// Every provider callable now answers the whole batch; answers are aggregated
    async fn dispatch_all(&self, pending: Vec<ClassificationRequest>, results: &mut Outcomes) {
        let strategy = self.settings.aggregation_strategy;
        let mut tried: HashSet<String> = HashSet::new();
        let mut slots = Vec::new();

        match self.select(&tried).await {
            Selection::Ready(slot) => {
                tried.insert(slot.provider.name().to_string());
                slots.push(slot);
            }
            Selection::RateLimited(err) => {
                for request in pending {
                    results.insert(request.id, Err(err.clone()));
                }
                return;
            }
            Selection::Exhausted => {}
        }
        if !slots.is_empty() {
            while let (Some(slot), _) = self.scan(&tried) {
                tried.insert(slot.provider.name().to_string());
                slots.push(slot);
            }
        }
        debug!(strategy = ?strategy, providers = slots.len(), items = pending.len(), "Fan-out dispatch");

        let outcomes = join_all(slots.iter().map(|slot| self.call(slot, &pending))).await;

        let mut last_error: Option<String> = None;
        let mut answered: Vec<(String, HashMap<Uuid, ProviderAnswer>)> = Vec::new();
        for (slot, outcome) in slots.iter().zip(outcomes) {
            let name = slot.provider.name().to_string();
            match outcome {
                Ok(answers) => answered.push((name, answers.into_iter().map(|a| (a.id, a)).collect())),
                Err(err) => last_error = Some(format!("{}: {}", name, err)),
            }
        }

        let attempts = slots.len();
        for request in pending {
            let votes: Vec<(String, ProviderAnswer)> = answered
                .iter_mut()
                .filter_map(|(name, answers)| answers.remove(&request.id).map(|a| (name.clone(), a)))
                .collect();
            match aggregate(strategy, votes) {
                Some(answer) => {
                    self.memo_store(Self::memo_key(&request), &answer).await;
                    results.insert(request.id, Ok(answer));
                }
                None => {
                    let error = GatewayError::ProviderExhausted {
                        attempts,
                        last_error: last_error.clone(),
                        all_circuits_open: self.all_circuits_open(),
                    };
                    results.insert(request.id, Err(error));
                }
            }
        }
    }

    /// One admitted provider call; the outcome feeds the breaker and the ranker
    async fn call(
        &self,
        slot: &ProviderSlot,
        requests: &[ClassificationRequest],
    ) -> Result<Vec<ProviderAnswer>, ProviderError> {
        let name = slot.provider.name();
        let call_timeout = Duration::from_millis(self.settings.call_timeout_ms);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(call_timeout, slot.provider.classify_batch(requests)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.settings.call_timeout_ms)),
        };
        let latency = started.elapsed();

        match &outcome {
            Ok(answers) => {
                slot.breaker.record_success();
                self.ranker.record(name, latency, true);
                debug!(
                    provider = %name,
                    items = requests.len(),
                    answered = answers.len(),
                    latency_ms = latency.as_millis() as u64,
                    "Provider call succeeded"
                );
            }
            Err(err) => {
                slot.breaker.record_failure();
                self.ranker.record(name, latency, false);
                warn!(
                    provider = %name,
                    error = %err,
                    transient = err.is_transient(),
                    "Provider call failed"
                );
            }
        }
        outcome
    }

    /// Highest-ranked untried provider callable right now, and the first throttled one
    ///
    /// A returned ready slot holds a breaker admission and a rate-limit token.
    fn scan(&self, tried: &HashSet<String>) -> (Option<Arc<ProviderSlot>>, Option<Arc<ProviderSlot>>) {
        let mut throttled: Option<Arc<ProviderSlot>> = None;

        for name in self.ranker.ranking() {
            if tried.contains(&name) {
                continue;
            }
            let Some(slot) = self.slots.get(&name) else {
                continue;
            };
            if !slot.breaker.try_acquire() {
                debug!(provider = %name, "Circuit open, skipping provider");
                continue;
            }
            if slot.limiter.try_acquire() {
                return (Some(slot.clone()), throttled);
            }
            slot.breaker.release();
            if throttled.is_none() {
                throttled = Some(slot.clone());
            }
        }
        (None, throttled)
    }

    /// Highest-ranked untried provider with an admitting circuit and a token
    ///
    /// Providers with a token available now are preferred; if every admitting provider
    /// is throttled, the best one is waited for up to `rate_limit_wait_ms`.
    async fn select(&self, tried: &HashSet<String>) -> Selection {
        let slot = match self.scan(tried) {
            (Some(ready), _) => return Selection::Ready(ready),
            (None, Some(throttled)) => throttled,
            (None, None) => return Selection::Exhausted,
        };
        if !slot.breaker.try_acquire() {
            return Selection::Exhausted;
        }
        let max_wait = Duration::from_millis(self.settings.rate_limit_wait_ms);
        match slot.limiter.acquire(max_wait).await {
            Ok(()) => Selection::Ready(slot),
            Err(err) => {
                slot.breaker.release();
                warn!(provider = %slot.provider.name(), error = %err, "Rate limit wait expired");
                Selection::RateLimited(err)
            }
        }
    }

    fn memo_key(request: &ClassificationRequest) -> MemoKey {
        (request.category, normalize_text(&request.name))
    }

    async fn memo_lookup(&self, request: &ClassificationRequest) -> Option<GatewayAnswer> {
        let entry = self.memo.get(&Self::memo_key(request)).await?;
        Some(GatewayAnswer {
            request_id: request.id,
            code: entry.code,
            name: entry.name,
            confidence: entry.confidence,
            provider_used: format!("{} (cached)", entry.provider),
            cached: true,
            reasoning: None,
            votes: None,
            alternatives: Vec::new(),
        })
    }

    async fn memo_store(&self, key: MemoKey, answer: &GatewayAnswer) {
        self.memo
            .insert(
                key,
                MemoEntry {
                    provider: answer.provider_used.clone(),
                    code: answer.code.clone(),
                    name: answer.name.clone(),
                    confidence: answer.confidence,
                },
            )
            .await;
    }

    /// Drop every memoised answer
    pub fn clear_memo(&self) {
        self.memo.invalidate_all();
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.ranker
            .ranking()
            .iter()
            .filter_map(|name| self.slots.get(name))
            .map(|slot| slot.breaker.snapshot())
            .collect()
    }

    /// Provider profiles in ranking order
    pub fn profiles(&self) -> Vec<ProviderProfile> {
        self.ranker
            .ranking()
            .iter()
            .enumerate()
            .filter_map(|(idx, name)| {
                let slot = self.slots.get(name)?;
                Some(ProviderProfile {
                    name: name.clone(),
                    model: slot.provider.model().to_string(),
                    priority: slot.priority,
                    rank: idx + 1,
                    stats: self.ranker.stats(name).unwrap_or_default(),
                    rate_limit: slot.limiter.budget(),
                    circuit: slot.breaker.snapshot(),
                })
            })
            .collect()
    }

    /// Slots in configured priority order (benchmark runs ignore the live ranking)
    pub(crate) fn slots_by_priority(&self) -> Vec<Arc<ProviderSlot>> {
        let mut slots: Vec<Arc<ProviderSlot>> = self.slots.values().cloned().collect();
        slots.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.provider.name().cmp(b.provider.name()))
        });
        slots
    }
}

fn to_gateway_answer(answer: ProviderAnswer, provider: &str) -> GatewayAnswer {
    GatewayAnswer {
        request_id: answer.id,
        code: answer.code,
        name: answer.name,
        confidence: answer.confidence,
        provider_used: provider.to_string(),
        cached: false,
        reasoning: answer.reasoning,
        votes: None,
        alternatives: Vec::new(),
    }
}

/// Combine per-provider answers for one request (given in ranking order)
///
/// Majority votes group answers by normalized code and label; on a tie the group seen
/// first wins. Highest confidence keeps the earlier answer on a tie.
fn aggregate(strategy: AggregationStrategy, votes: Vec<(String, ProviderAnswer)>) -> Option<GatewayAnswer> {
    if votes.is_empty() {
        return None;
    }

    let mut agreeing = None;
    let chosen = match strategy {
        AggregationStrategy::FirstSuccess | AggregationStrategy::AllResults => 0,
        AggregationStrategy::HighestConfidence => (1..votes.len()).fold(0, |best, idx| {
            if votes[idx].1.confidence > votes[best].1.confidence {
                idx
            } else {
                best
            }
        }),
        AggregationStrategy::MajorityVote => {
            let keys: Vec<(String, String)> = votes
                .iter()
                .map(|(_, a)| (normalize_code(&a.code), normalize_text(&a.name)))
                .collect();
            let count = |idx: usize| keys.iter().filter(|k| **k == keys[idx]).count();
            let winner = (1..keys.len()).fold(0, |best, idx| if count(idx) > count(best) { idx } else { best });
            agreeing = Some(count(winner));
            winner
        }
    };

    let alternatives = if strategy == AggregationStrategy::AllResults {
        votes
            .iter()
            .map(|(provider, a)| ProviderVote {
                provider: provider.clone(),
                code: a.code.clone(),
                name: a.name.clone(),
                confidence: a.confidence,
            })
            .collect()
    } else {
        Vec::new()
    };

    let (provider, answer) = votes.into_iter().nth(chosen)?;
    let mut answer = to_gateway_answer(answer, &provider);
    answer.votes = agreeing;
    answer.alternatives = alternatives;
    Some(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with a fixed code, or fails every call
    struct FixedProvider {
        name: &'static str,
        fail: bool,
        code: String,
        confidence: f64,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                code: format!("{}-code", name),
                confidence: 0.9,
                calls: AtomicUsize::new(0),
            })
        }

        fn answering(name: &'static str, code: &str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                code: code.to_string(),
                confidence,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AiProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn classify_batch(
            &self,
            requests: &[ClassificationRequest],
        ) -> Result<Vec<ProviderAnswer>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Http {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(requests
                .iter()
                .map(|r| ProviderAnswer {
                    id: r.id,
                    code: self.code.clone(),
                    name: "label".to_string(),
                    confidence: self.confidence,
                    reasoning: None,
                })
                .collect())
        }
    }

    fn registration(provider: Arc<FixedProvider>, priority: u32) -> ProviderRegistration {
        ProviderRegistration {
            provider,
            priority,
            requests_per_minute: 6000,
            burst: 100,
        }
    }

    fn gateway(providers: Vec<(Arc<FixedProvider>, u32)>) -> AiGateway {
        gateway_with(
            providers.into_iter().map(|(p, priority)| registration(p, priority)).collect(),
            GatewaySettings::default(),
        )
    }

    fn gateway_with(registrations: Vec<ProviderRegistration>, settings: GatewaySettings) -> AiGateway {
        AiGateway::new(
            registrations,
            settings,
            &CircuitBreakerSettings {
                failure_threshold: 2,
                cooldown_ms: 60_000,
                half_open_max_calls: 1,
            },
            &CacheSettings::default(),
            None,
        )
    }

    fn request(name: &str) -> ClassificationRequest {
        ClassificationRequest::new(RecordCategory::Nomenclature, name, None)
    }

    #[tokio::test]
    async fn test_failover_to_next_provider() {
        let a = FixedProvider::new("A", true);
        let b = FixedProvider::new("B", false);
        let gw = gateway(vec![(a.clone(), 1), (b.clone(), 2)]);

        let answer = gw.classify(request("Болт")).await.unwrap();
        assert_eq!(answer.provider_used, "B");
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.ranker().stats("A").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_memoised_answer_skips_dispatch() {
        let a = FixedProvider::new("A", false);
        let gw = gateway(vec![(a.clone(), 1)]);

        gw.classify(request("Гайка М10")).await.unwrap();
        let cached = gw.classify(request("  гайка  м10 ")).await.unwrap();
        assert!(cached.cached);
        assert_eq!(cached.provider_used, "A (cached)");
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_open_circuits() {
        let a = FixedProvider::new("A", true);
        let gw = gateway(vec![(a.clone(), 1)]);

        // Threshold 2: second failure opens the circuit
        for _ in 0..2 {
            assert!(gw.classify(request("x")).await.is_err());
        }
        let err = gw.classify(request("y")).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::ProviderExhausted {
                attempts: 0,
                last_error: None,
                all_circuits_open: true
            }
        );
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let gw = gateway(Vec::new());
        assert_eq!(gw.classify(request("x")).await.unwrap_err(), GatewayError::NoProviders);
    }

    #[test]
    fn test_profiles_follow_ranking() {
        let gw = gateway(vec![
            (FixedProvider::new("A", false), 5),
            (FixedProvider::new("B", false), 1),
        ]);
        let profiles = gw.profiles();
        assert_eq!(profiles[0].name, "B");
        assert_eq!(profiles[0].rank, 1);
        assert_eq!(profiles[1].circuit.state, CircuitState::Closed);
        assert_eq!(profiles[1].rate_limit.burst, 100);
    }

    #[tokio::test]
    async fn test_rate_limit_after_failover_is_reported() {
        let a = FixedProvider::new("A", true);
        let b = FixedProvider::new("B", false);
        let gw = gateway_with(
            vec![
                registration(a.clone(), 1),
                ProviderRegistration {
                    provider: b.clone(),
                    priority: 2,
                    requests_per_minute: 1,
                    burst: 1,
                },
            ],
            GatewaySettings {
                rate_limit_wait_ms: 20,
                ..Default::default()
            },
        );

        // A fails, B answers and spends its only token
        assert_eq!(gw.classify(request("Болт")).await.unwrap().provider_used, "B");

        // A fails again, B cannot get a token in time
        let err = gw.classify(request("Гайка")).await.unwrap_err();
        assert!(
            matches!(err, GatewayError::RateLimitExceeded { ref provider, .. } if provider == "B"),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    fn vote(provider: &str, code: &str, name: &str, confidence: f64) -> (String, ProviderAnswer) {
        (
            provider.to_string(),
            ProviderAnswer {
                id: Uuid::nil(),
                code: code.to_string(),
                name: name.to_string(),
                confidence,
                reasoning: None,
            },
        )
    }

    #[test]
    fn test_majority_vote_groups_equal_answers() {
        let answer = aggregate(
            AggregationStrategy::MajorityVote,
            vec![
                vote("A", "25.94.12", "Гайки", 0.95),
                vote("B", "25.94.11", "Болты", 0.6),
                vote("C", "25.94.11 ", "болты", 0.7),
            ],
        )
        .unwrap();
        assert_eq!(answer.provider_used, "B");
        assert_eq!(answer.code, "25.94.11");
        assert_eq!(answer.votes, Some(2));
        assert!(answer.alternatives.is_empty());
    }

    #[test]
    fn test_majority_tie_keeps_best_ranked() {
        let answer = aggregate(
            AggregationStrategy::MajorityVote,
            vec![vote("A", "1", "x", 0.5), vote("B", "2", "y", 0.9)],
        )
        .unwrap();
        assert_eq!(answer.provider_used, "A");
        assert_eq!(answer.votes, Some(1));
    }

    #[test]
    fn test_highest_confidence_and_all_results() {
        let votes = vec![
            vote("A", "1", "x", 0.5),
            vote("B", "2", "y", 0.9),
            vote("C", "3", "z", 0.9),
        ];
        let best = aggregate(AggregationStrategy::HighestConfidence, votes.clone()).unwrap();
        assert_eq!(best.provider_used, "B");
        assert!(best.votes.is_none());

        let all = aggregate(AggregationStrategy::AllResults, votes).unwrap();
        assert_eq!(all.provider_used, "A");
        let providers: Vec<&str> = all.alternatives.iter().map(|v| v.provider.as_str()).collect();
        assert_eq!(providers, vec!["A", "B", "C"]);

        assert!(aggregate(AggregationStrategy::FirstSuccess, Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_fan_out_calls_every_available_provider() {
        let a = FixedProvider::answering("A", "25.94.11", 0.6);
        let b = FixedProvider::new("B", true);
        let c = FixedProvider::answering("C", "25.94.12", 0.8);
        let gw = gateway_with(
            vec![registration(a.clone(), 1), registration(b.clone(), 2), registration(c.clone(), 3)],
            GatewaySettings {
                aggregation_strategy: AggregationStrategy::HighestConfidence,
                ..Default::default()
            },
        );

        let answer = gw.classify(request("Гайка М8")).await.unwrap();
        assert_eq!(answer.provider_used, "C");
        assert_eq!(answer.code, "25.94.12");
        for provider in [&a, &b, &c] {
            assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        }
        assert_eq!(gw.ranker().stats("B").unwrap().failures, 1);

        // The aggregated answer is memoised like any other
        let cached = gw.classify(request("гайка м8")).await.unwrap();
        assert_eq!(cached.provider_used, "C (cached)");
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_with_every_provider_failing() {
        let gw = gateway_with(
            vec![
                registration(FixedProvider::new("A", true), 1),
                registration(FixedProvider::new("B", true), 2),
            ],
            GatewaySettings {
                aggregation_strategy: AggregationStrategy::MajorityVote,
                ..Default::default()
            },
        );
        match gw.classify(request("Шайба")).await.unwrap_err() {
            GatewayError::ProviderExhausted {
                attempts,
                last_error,
                all_circuits_open,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.is_some());
                assert!(!all_circuits_open);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
