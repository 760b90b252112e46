//! Shared fixtures for nsi-ai integration tests
//!
//! Scripted in-process providers stand in for network providers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use nsi_ai::db::{init_memory_pool, SqliteStore};
use nsi_ai::gateway::ProviderRegistration;
use nsi_ai::models::{NewSourceRecord, RecordCategory};
use nsi_ai::providers::{AiProvider, ClassificationRequest, ProviderAnswer, ProviderError};
use nsi_ai::repository::Repositories;
use nsi_ai::{ContainerBuilder, ServiceContainer};
use nsi_common::config::TomlConfig;
use nsi_common::events::EventBus;

/// Provider answering from a script
pub struct ScriptedProvider {
    name: String,
    /// Lowercase name substring → (code, label, confidence)
    answers: HashMap<String, (String, String, f64)>,
    default_confidence: f64,
    failing: AtomicBool,
    /// Requests whose name contains this never get an answer
    hang_on: Option<String>,
    /// Signalled when a hanging request arrives
    pub hung: Arc<Notify>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            answers: HashMap::new(),
            default_confidence: 0.9,
            failing: AtomicBool::new(false),
            hang_on: None,
            hung: Arc::new(Notify::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn answer(mut self, needle: &str, code: &str, label: &str, confidence: f64) -> Self {
        self.answers.insert(
            needle.to_lowercase(),
            (code.to_string(), label.to_string(), confidence),
        );
        self
    }

    pub fn default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = confidence;
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn hang_on(mut self, needle: &str) -> Self {
        self.hang_on = Some(needle.to_lowercase());
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Names sent per outbound call
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every name this provider was asked about
    pub fn seen_names(&self) -> Vec<String> {
        self.calls().into_iter().flatten().collect()
    }

    fn answer_for(&self, request: &ClassificationRequest) -> ProviderAnswer {
        let lowered = request.name.to_lowercase();
        let scripted = self
            .answers
            .iter()
            .find(|(needle, _)| lowered.contains(needle.as_str()))
            .map(|(_, answer)| answer.clone());
        let (code, name, confidence) = scripted.unwrap_or_else(|| {
            (
                "99.99.99".to_string(),
                "Прочее".to_string(),
                self.default_confidence,
            )
        });
        ProviderAnswer {
            id: request.id,
            code,
            name,
            confidence,
            reasoning: None,
        }
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn classify_batch(
        &self,
        requests: &[ClassificationRequest],
    ) -> Result<Vec<ProviderAnswer>, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(requests.iter().map(|r| r.name.clone()).collect());

        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Http {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        if let Some(needle) = &self.hang_on {
            if requests.iter().any(|r| r.name.to_lowercase().contains(needle)) {
                self.hung.notify_one();
                std::future::pending::<()>().await;
            }
        }
        Ok(requests.iter().map(|r| self.answer_for(r)).collect())
    }
}

pub fn registration(provider: Arc<ScriptedProvider>, priority: u32) -> ProviderRegistration {
    ProviderRegistration {
        provider,
        priority,
        requests_per_minute: 6_000,
        burst: 100,
    }
}

/// Defaults tuned for fast tests
pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.pipeline.workers = 2;
    config.pipeline.checkpoint_batch_size = 5;
    config.batch.max_batch_size = 10;
    config.batch.max_wait_ms = 10;
    config.gateway.rate_limit_wait_ms = 50;
    config.gateway.call_timeout_ms = 2_000;
    config.circuit_breaker.cooldown_ms = 60_000;
    config
}

pub async fn memory_repositories() -> Repositories {
    let pool = init_memory_pool().await.unwrap();
    Repositories::from_store(Arc::new(SqliteStore::new(pool)))
}

pub async fn build_container(
    config: TomlConfig,
    repositories: Repositories,
    providers: Vec<ProviderRegistration>,
) -> Arc<ServiceContainer> {
    let builder = providers.into_iter().fold(
        ContainerBuilder::new(config, repositories, EventBus::new(1024)).without_configured_providers(),
        |builder, registration| builder.with_provider(registration),
    );
    Arc::new(builder.build().await.unwrap())
}

pub fn nomenclature(name: &str, code: Option<&str>) -> NewSourceRecord {
    NewSourceRecord {
        source_table: "erp_items".to_string(),
        category: RecordCategory::Nomenclature,
        raw_name: name.to_string(),
        raw_code: code.map(str::to_string),
    }
}

pub fn counterparty(name: &str, inn: Option<&str>) -> NewSourceRecord {
    NewSourceRecord {
        source_table: "erp_partners".to_string(),
        category: RecordCategory::Counterparty,
        raw_name: name.to_string(),
        raw_code: inn.map(str::to_string),
    }
}

pub async fn seed(container: &ServiceContainer, records: &[NewSourceRecord]) -> Vec<i64> {
    container
        .repositories
        .records
        .insert_source_records(records)
        .await
        .unwrap()
}
