//! Service wiring
//!
//! Two-phase build: [`ContainerBuilder::build`] first resolves everything that needs
//! I/O (provider API keys), then constructs the components bottom-up. Nothing reads
//! configuration after the container exists.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use nsi_common::config::TomlConfig;
use nsi_common::events::EventBus;
use nsi_common::{Error, Result};

use crate::config::resolve_all_api_keys;
use crate::gateway::{AiGateway, BatchProcessor, ProviderBenchmark, ProviderRegistration};
use crate::matchers::{BenchmarkMatcher, ReferenceMatcherSet};
use crate::pipeline::{CheckpointManager, ClassificationPipeline, JobManager};
use crate::providers::ChatCompletionProvider;
use crate::quality::QualityAnalyzer;
use crate::repository::Repositories;
use crate::similarity::SimilarityEngine;

pub struct ContainerBuilder {
    config: TomlConfig,
    repositories: Repositories,
    event_bus: EventBus,
    injected: Vec<ProviderRegistration>,
    configured_providers: bool,
}

impl ContainerBuilder {
    pub fn new(config: TomlConfig, repositories: Repositories, event_bus: EventBus) -> Self {
        Self {
            config,
            repositories,
            event_bus,
            injected: Vec::new(),
            configured_providers: true,
        }
    }

    /// Register an in-process provider next to the configured ones
    pub fn with_provider(mut self, registration: ProviderRegistration) -> Self {
        self.injected.push(registration);
        self
    }

    /// Skip the `[[providers]]` entries of the config (tests)
    pub fn without_configured_providers(mut self) -> Self {
        self.configured_providers = false;
        self
    }

    /// Build every service; must run inside a tokio runtime
    pub async fn build(self) -> Result<ServiceContainer> {
        let Self {
            config,
            repositories,
            event_bus,
            injected,
            configured_providers,
        } = self;

        // Phase 1: everything that touches storage or the environment
        let keys = if configured_providers {
            resolve_all_api_keys(repositories.settings.as_ref(), &config.providers).await?
        } else {
            Default::default()
        };

        // Phase 2: pure construction
        let call_timeout = Duration::from_millis(config.gateway.call_timeout_ms);
        let mut registrations = Vec::new();
        if configured_providers {
            for settings in config.enabled_providers() {
                let api_key = keys.get(&settings.name).cloned().flatten();
                let provider = ChatCompletionProvider::new(
                    settings.name.clone(),
                    &settings.base_url,
                    settings.model.clone(),
                    api_key,
                    call_timeout,
                )
                .map_err(|e| Error::Config(format!("provider {}: {}", settings.name, e)))?;

                registrations.push(ProviderRegistration {
                    provider: Arc::new(provider),
                    priority: settings.priority,
                    requests_per_minute: settings.requests_per_minute,
                    burst: settings.burst,
                });
            }
        }
        registrations.extend(injected);

        let mut names = std::collections::HashSet::new();
        for registration in &registrations {
            if !names.insert(registration.provider.name().to_string()) {
                return Err(Error::Config(format!(
                    "duplicate provider name: {}",
                    registration.provider.name()
                )));
            }
        }
        let provider_count = registrations.len();

        let similarity = Arc::new(SimilarityEngine::new(config.similarity.clone()));
        let gateway = Arc::new(AiGateway::new(
            registrations,
            config.gateway.clone(),
            &config.circuit_breaker,
            &config.cache,
            Some(event_bus.clone()),
        ));
        let batch_processor = Arc::new(BatchProcessor::start(gateway.clone(), config.batch.clone()));
        let provider_benchmark = Arc::new(ProviderBenchmark::new(gateway.clone()));

        let reference_ttl = Duration::from_secs(config.cache.reference_ttl_secs);
        let references = Arc::new(ReferenceMatcherSet::new(
            repositories.references.clone(),
            similarity.clone(),
            config.pipeline.reference_name_threshold,
            config.pipeline.parent_code_confidence,
            reference_ttl,
        ));
        let benchmarks = Arc::new(BenchmarkMatcher::new(
            repositories.benchmarks.clone(),
            similarity.clone(),
            config.pipeline.benchmark_threshold,
            reference_ttl,
        ));

        let checkpoints = Arc::new(CheckpointManager::new(repositories.checkpoints.clone()));
        let pipeline = Arc::new(ClassificationPipeline::new(
            config.pipeline.clone(),
            references.clone(),
            benchmarks.clone(),
            batch_processor.clone(),
            &repositories,
            checkpoints.clone(),
            event_bus.clone(),
        ));
        let jobs = Arc::new(JobManager::new(pipeline.clone(), &repositories));

        let quality = Arc::new(QualityAnalyzer::new(
            repositories.results.clone(),
            similarity.clone(),
            config.pipeline.manual_review_threshold,
            Duration::from_secs(config.cache.report_ttl_secs),
        ));

        info!(
            providers = provider_count,
            workers = config.pipeline.workers,
            batch_size = config.pipeline.checkpoint_batch_size,
            "Service container built"
        );

        Ok(ServiceContainer {
            config,
            repositories,
            event_bus,
            similarity,
            gateway,
            batch_processor,
            provider_benchmark,
            references,
            benchmarks,
            checkpoints,
            pipeline,
            jobs,
            quality,
        })
    }
}

/// Every long-lived service, built once at startup
pub struct ServiceContainer {
    pub config: TomlConfig,
    pub repositories: Repositories,
    pub event_bus: EventBus,
    pub similarity: Arc<SimilarityEngine>,
    pub gateway: Arc<AiGateway>,
    pub batch_processor: Arc<BatchProcessor>,
    pub provider_benchmark: Arc<ProviderBenchmark>,
    pub references: Arc<ReferenceMatcherSet>,
    pub benchmarks: Arc<BenchmarkMatcher>,
    pub checkpoints: Arc<CheckpointManager>,
    pub pipeline: Arc<ClassificationPipeline>,
    pub jobs: Arc<JobManager>,
    pub quality: Arc<QualityAnalyzer>,
}

impl ServiceContainer {
    /// Drop cached reference tables, benchmarks and reports after an import
    pub fn invalidate_caches(&self) {
        self.references.invalidate();
        self.benchmarks.invalidate();
        self.quality.invalidate();
    }

    /// Stop running jobs (checkpointing them), then drain the batch processor
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
        self.batch_processor.shutdown().await;
        info!("Services stopped");
    }
}
