//! Gateway integration tests: breaker routing, ranking, request batching

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{registration, ScriptedProvider};
use nsi_ai::gateway::{
    AiGateway, BatchProcessor, CircuitState, GatewayError, ProviderBenchmark, ProviderRegistration,
};
use nsi_ai::models::RecordCategory;
use nsi_ai::providers::ClassificationRequest;
use nsi_common::config::{BatchSettings, CacheSettings, CircuitBreakerSettings, GatewaySettings};
use nsi_common::events::{EventBus, NsiEvent};

fn breaker_settings(failure_threshold: u32) -> CircuitBreakerSettings {
    CircuitBreakerSettings {
        failure_threshold,
        cooldown_ms: 60_000,
        half_open_max_calls: 1,
    }
}

fn gateway(
    providers: Vec<(Arc<ScriptedProvider>, u32)>,
    failure_threshold: u32,
    event_bus: Option<EventBus>,
) -> AiGateway {
    gateway_from(
        providers
            .into_iter()
            .map(|(p, priority)| registration(p, priority))
            .collect(),
        breaker_settings(failure_threshold),
        event_bus,
    )
}

fn gateway_from(
    registrations: Vec<ProviderRegistration>,
    breaker: CircuitBreakerSettings,
    event_bus: Option<EventBus>,
) -> AiGateway {
    AiGateway::new(
        registrations,
        GatewaySettings {
            rate_limit_wait_ms: 50,
            ..Default::default()
        },
        &breaker,
        &CacheSettings::default(),
        event_bus,
    )
}

fn request(name: &str) -> ClassificationRequest {
    ClassificationRequest::new(RecordCategory::Nomenclature, name, None)
}

#[tokio::test]
async fn test_open_circuit_is_never_dispatched() {
    let primary = Arc::new(ScriptedProvider::new("Primary").failing());
    let secondary = Arc::new(ScriptedProvider::new("Secondary"));
    let gateway = gateway(vec![(primary.clone(), 1), (secondary.clone(), 2)], 1, None);

    // First call: primary fails (circuit opens), secondary answers
    let answer = gateway.classify(request("Болт М10")).await.unwrap();
    assert_eq!(answer.provider_used, "Secondary");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(gateway.breaker("Primary").unwrap().state(), CircuitState::Open);

    // Further calls skip the open circuit entirely
    for name in ["Гайка М10", "Шайба 10", "Винт М6"] {
        let answer = gateway.classify(request(name)).await.unwrap();
        assert_eq!(answer.provider_used, "Secondary");
    }
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 4);

    let snapshots = gateway.breaker_snapshots();
    let primary_snapshot = snapshots.iter().find(|s| s.provider == "Primary").unwrap();
    assert!(!primary_snapshot.can_proceed);
    assert_eq!(primary_snapshot.total_failures, 1);
}

#[tokio::test]
async fn test_all_circuits_open_reports_exhaustion() {
    let only = Arc::new(ScriptedProvider::new("Only").failing());
    let gateway = gateway(vec![(only.clone(), 1)], 1, None);

    let first = gateway.classify(request("Кабель ВВГ")).await.unwrap_err();
    assert!(matches!(first, GatewayError::ProviderExhausted { attempts: 1, .. }));

    let second = gateway.classify(request("Кабель ПВС")).await.unwrap_err();
    match second {
        GatewayError::ProviderExhausted {
            attempts,
            all_circuits_open,
            ..
        } => {
            assert_eq!(attempts, 0);
            assert!(all_circuits_open);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(only.call_count(), 1);
}

#[tokio::test]
async fn test_memoised_answer_skips_dispatch() {
    let provider = Arc::new(ScriptedProvider::new("Alpha").answer("болт", "25.94.11", "Болты", 0.95));
    let gateway = gateway(vec![(provider.clone(), 1)], 5, None);

    let first = gateway.classify(request("Болт  М10")).await.unwrap();
    assert!(!first.cached);
    let second = gateway.classify(request("болт м10")).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.provider_used, "Alpha (cached)");
    assert_eq!(second.code, "25.94.11");
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn test_benchmark_ranks_reliable_provider_first() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();

    // Scenario A: the configured favourite fails every sample request
    let flaky = Arc::new(ScriptedProvider::new("Flaky").failing());
    let steady = Arc::new(ScriptedProvider::new("Steady"));
    let gateway = Arc::new(gateway(
        vec![(flaky.clone(), 1), (steady.clone(), 2)],
        10,
        Some(bus.clone()),
    ));
    assert_eq!(gateway.ranker().ranking(), vec!["Flaky", "Steady"]);

    let reports = ProviderBenchmark::new(gateway.clone()).run(3).await;
    assert_eq!(reports.len(), 2);
    let flaky_report = reports.iter().find(|r| r.provider == "Flaky").unwrap();
    assert_eq!(flaky_report.requests, 3);
    assert_eq!(flaky_report.successes, 0);
    let steady_report = reports.iter().find(|r| r.provider == "Steady").unwrap();
    assert_eq!(steady_report.success_rate, 1.0);

    assert_eq!(gateway.ranker().ranking(), vec!["Steady", "Flaky"]);
    let profiles = gateway.profiles();
    assert_eq!(profiles[0].name, "Steady");
    assert_eq!(profiles[0].rank, 1);

    let mut ranked = None;
    while let Ok(event) = rx.try_recv() {
        if let NsiEvent::ProvidersRanked { ranking, .. } = event {
            ranked = Some(ranking);
        }
    }
    assert_eq!(ranked.unwrap(), vec!["Steady", "Flaky"]);

    // Scenario B: the flaky provider recovers and the ranking is driven by live calls
    flaky.set_failing(false);
    let answer = gateway.classify(request("Перчатки нитриловые")).await.unwrap();
    assert_eq!(answer.provider_used, "Steady");
}

#[tokio::test]
async fn test_batch_processor_collapses_concurrent_requests() {
    let provider = Arc::new(ScriptedProvider::new("Batcher"));
    let gateway = Arc::new(gateway(vec![(provider.clone(), 1)], 5, None));
    let processor = Arc::new(BatchProcessor::start(
        gateway,
        BatchSettings {
            max_batch_size: 5,
            max_wait_ms: 200,
        },
    ));

    let names = ["Болт", "Гайка", "Шайба", "Винт", "Шуруп"];
    let submissions = names.iter().map(|name| {
        let processor = processor.clone();
        let request = request(name);
        async move { processor.submit(request).await }
    });
    let answers = futures::future::join_all(submissions).await;
    assert!(answers.iter().all(|a| a.is_ok()));

    assert_eq!(provider.call_count(), 1);
    assert_eq!(provider.calls()[0].len(), 5);

    let stats = processor.stats();
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.total_items, 5);
    assert_eq!(stats.api_calls_saved, 4);
    assert_eq!(stats.queue_size, 0);

    processor.shutdown().await;
    let closed = processor.submit(request("После остановки")).await;
    assert_eq!(closed, Err(GatewayError::BatchProcessorClosed));
}

#[tokio::test]
async fn test_throttled_fallback_provider_reports_rate_limit() {
    let primary = Arc::new(ScriptedProvider::new("Primary").failing());
    let secondary = Arc::new(ScriptedProvider::new("Secondary"));
    let gateway = gateway_from(
        vec![
            registration(primary.clone(), 1),
            ProviderRegistration {
                provider: secondary.clone(),
                priority: 2,
                requests_per_minute: 1,
                burst: 1,
            },
        ],
        breaker_settings(5),
        None,
    );

    let answer = gateway.classify(request("Болт М12")).await.unwrap();
    assert_eq!(answer.provider_used, "Secondary");

    // Primary fails once more; Secondary has no token left within the wait
    let err = gateway.classify(request("Гайка М12")).await.unwrap_err();
    match err {
        GatewayError::RateLimitExceeded { provider, waited_ms } => {
            assert_eq!(provider, "Secondary");
            assert!(waited_ms >= 40);
        }
        other => panic!("expected a rate-limit error, got {other:?}"),
    }
    assert_eq!(primary.call_count(), 2);
    assert_eq!(secondary.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_routes_to_backup_until_cooldown_expires() {
    let fast = Arc::new(ScriptedProvider::new("A"));
    let slow = Arc::new(ScriptedProvider::new("B"));
    let gateway = gateway_from(
        vec![registration(fast.clone(), 1), registration(slow.clone(), 2)],
        CircuitBreakerSettings {
            failure_threshold: 10,
            cooldown_ms: 30_000,
            half_open_max_calls: 1,
        },
        None,
    );

    // Track record: A reliable and fast, B less so
    let ranker = gateway.ranker();
    for _ in 0..90 {
        ranker.record("A", Duration::from_millis(50), true);
    }
    for n in 0..10 {
        ranker.record("B", Duration::from_millis(200), n < 6);
    }
    assert_eq!(ranker.ranking(), vec!["A", "B"]);

    let mut n = 0;
    let mut next_request = || {
        n += 1;
        request(&format!("Болт М{}", n))
    };

    // Ten consecutive failures of A, each one failing over to B
    fast.set_failing(true);
    for _ in 0..10 {
        let answer = gateway.classify(next_request()).await.unwrap();
        assert_eq!(answer.provider_used, "B");
    }
    assert_eq!(fast.call_count(), 10);
    assert_eq!(gateway.breaker("A").unwrap().state(), CircuitState::Open);
    assert_eq!(ranker.ranking()[0], "A");

    // Open: A is skipped outright
    tokio::time::advance(Duration::from_millis(29_000)).await;
    let answer = gateway.classify(next_request()).await.unwrap();
    assert_eq!(answer.provider_used, "B");
    assert_eq!(fast.call_count(), 10);

    // Cooldown over: exactly one trial goes to A; it fails and the circuit reopens
    tokio::time::advance(Duration::from_millis(1_001)).await;
    let answer = gateway.classify(next_request()).await.unwrap();
    assert_eq!(answer.provider_used, "B");
    assert_eq!(fast.call_count(), 11);
    assert_eq!(gateway.breaker("A").unwrap().state(), CircuitState::Open);

    gateway.classify(next_request()).await.unwrap();
    assert_eq!(fast.call_count(), 11);

    // Next cooldown: A has recovered, the trial succeeds and A serves again
    tokio::time::advance(Duration::from_millis(30_001)).await;
    fast.set_failing(false);
    let answer = gateway.classify(next_request()).await.unwrap();
    assert_eq!(answer.provider_used, "A");
    assert_eq!(fast.call_count(), 12);
    assert_eq!(gateway.breaker("A").unwrap().state(), CircuitState::Closed);

    let answer = gateway.classify(next_request()).await.unwrap();
    assert_eq!(answer.provider_used, "A");
}
