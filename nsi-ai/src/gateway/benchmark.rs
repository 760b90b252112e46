//! Provider benchmark runs
//!
//! Sends a fixed set of sample classifications to every provider outside the live
//! workload, feeds the measurements into the ranker and re-ranks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::AiGateway;
use crate::models::RecordCategory;
use crate::providers::{ClassificationRequest, ProviderError};

const SAMPLES: [(RecordCategory, &str); 4] = [
    (RecordCategory::Nomenclature, "Болт М10х30 оцинкованный ГОСТ 7798-70"),
    (RecordCategory::Nomenclature, "Перчатки нитриловые неопудренные"),
    (RecordCategory::Nomenclature, "Кабель ВВГнг-LS 3х2.5"),
    (RecordCategory::Counterparty, "ООО Ромашка"),
];

/// Measurements for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub provider: String,
    pub requests: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    /// Why probing stopped early (open circuit, rate limit)
    pub skipped_reason: Option<String>,
}

pub struct ProviderBenchmark {
    gateway: Arc<AiGateway>,
}

impl ProviderBenchmark {
    pub fn new(gateway: Arc<AiGateway>) -> Self {
        Self { gateway }
    }

    /// Classify `samples` requests with every provider; returns per-provider results in configured order
    pub async fn run(&self, samples: usize) -> Vec<BenchmarkReport> {
        let settings = self.gateway.settings().clone();
        let call_timeout = Duration::from_millis(settings.call_timeout_ms);
        let max_wait = Duration::from_millis(settings.rate_limit_wait_ms);
        let mut reports = Vec::new();

        for slot in self.gateway.slots_by_priority() {
            let name = slot.provider.name().to_string();
            let mut requests = 0u64;
            let mut successes = 0u64;
            let mut total_latency_ms = 0.0;
            let mut skipped_reason = None;

            for n in 0..samples {
                if !slot.breaker.try_acquire() {
                    skipped_reason = Some("circuit open".to_string());
                    break;
                }
                if let Err(e) = slot.limiter.acquire(max_wait).await {
                    slot.breaker.release();
                    skipped_reason = Some(e.to_string());
                    break;
                }

                let (category, text) = SAMPLES[n % SAMPLES.len()];
                let sample = ClassificationRequest::new(category, text, None);
                let started = Instant::now();
                let outcome = match tokio::time::timeout(
                    call_timeout,
                    slot.provider.classify_batch(std::slice::from_ref(&sample)),
                )
                .await
                {
                    Ok(Ok(answers)) if answers.iter().any(|a| a.id == sample.id) => Ok(()),
                    Ok(Ok(_)) => Err(ProviderError::MalformedResponse("sample unanswered".to_string())),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ProviderError::Timeout(settings.call_timeout_ms)),
                };
                let latency = started.elapsed();

                requests += 1;
                total_latency_ms += latency.as_secs_f64() * 1000.0;
                match outcome {
                    Ok(()) => {
                        successes += 1;
                        slot.breaker.record_success();
                        self.gateway.ranker().record(&name, latency, true);
                    }
                    Err(e) => {
                        warn!(provider = %name, error = %e, "Benchmark sample failed");
                        slot.breaker.record_failure();
                        self.gateway.ranker().record(&name, latency, false);
                    }
                }
            }

            info!(provider = %name, requests, successes, "Benchmark finished for provider");
            reports.push(BenchmarkReport {
                provider: name,
                requests,
                successes,
                success_rate: if requests == 0 {
                    0.0
                } else {
                    successes as f64 / requests as f64
                },
                avg_latency_ms: (requests > 0).then(|| total_latency_ms / requests as f64),
                skipped_reason,
            });
        }

        self.gateway.ranker().rerank();
        reports
    }
}
