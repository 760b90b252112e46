//! Stage 3: match against curator-approved benchmarks

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use nsi_common::Result;

use super::{MatchCandidate, MatchOutcome};
use crate::models::{Benchmark, ResolutionMethod};
use crate::pipeline::PreparedItem;
use crate::repository::BenchmarkRepository;
use crate::similarity::{normalize_text, SimilarityEngine};

#[derive(Debug)]
struct IndexedBenchmark {
    normalized_name: String,
    benchmark: Benchmark,
}

pub struct BenchmarkMatcher {
    repository: Arc<dyn BenchmarkRepository>,
    engine: Arc<SimilarityEngine>,
    threshold: f64,
    cache: Cache<(), Arc<Vec<IndexedBenchmark>>>,
}

impl BenchmarkMatcher {
    pub fn new(
        repository: Arc<dyn BenchmarkRepository>,
        engine: Arc<SimilarityEngine>,
        threshold: f64,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            engine,
            threshold,
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    async fn benchmarks(&self) -> Result<Arc<Vec<IndexedBenchmark>>> {
        let benchmarks = self
            .cache
            .try_get_with((), async {
                let benchmarks = self.repository.load_approved_benchmarks().await?;
                tracing::debug!(count = benchmarks.len(), "Benchmarks loaded");
                Ok::<_, nsi_common::Error>(Arc::new(
                    benchmarks
                        .into_iter()
                        .map(|benchmark| IndexedBenchmark {
                            normalized_name: normalize_text(&benchmark.name),
                            benchmark,
                        })
                        .collect(),
                ))
            })
            .await?;
        Ok(benchmarks)
    }

    /// Most similar approved benchmark of the same category
    pub async fn best_match(&self, item: &PreparedItem) -> Result<MatchOutcome> {
        if item.normalized_name.is_empty() {
            return Ok(MatchOutcome::Rejected(None));
        }
        let benchmarks = self.benchmarks().await?;

        let mut best: Option<(&IndexedBenchmark, f64)> = None;
        for indexed in benchmarks
            .iter()
            .filter(|b| b.benchmark.category == item.category)
        {
            let score = self
                .engine
                .normalized_similarity(&item.normalized_name, &indexed.normalized_name);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((indexed, score));
            }
        }

        let candidate = best.map(|(indexed, score)| MatchCandidate {
            method: ResolutionMethod::Benchmark,
            code: indexed.benchmark.code.clone(),
            name: indexed.benchmark.label.clone(),
            reference_table: None,
            matched_reference_id: format!("benchmark:{}", indexed.benchmark.id),
            score,
            parent_of: None,
        });
        Ok(MatchOutcome::from_best(candidate, self.threshold))
    }

    /// Drop cached benchmarks (after curators add new ones)
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_pool, SqliteStore};
    use crate::models::{NewBenchmark, PipelineStage, QualityLevel, RecordCategory};
    use crate::pipeline::preprocess::prepare;

    async fn matcher_with(benchmarks: &[NewBenchmark]) -> BenchmarkMatcher {
        let store = Arc::new(SqliteStore::new(init_memory_pool().await.unwrap()));
        store.upsert_benchmarks(benchmarks).await.unwrap();
        BenchmarkMatcher::new(
            store,
            Arc::new(SimilarityEngine::default()),
            0.9,
            Duration::from_secs(60),
        )
    }

    fn bench(category: RecordCategory, name: &str, code: &str) -> NewBenchmark {
        NewBenchmark {
            category,
            name: name.to_string(),
            code: code.to_string(),
            label: "Болты".to_string(),
            approved: true,
        }
    }

    #[tokio::test]
    async fn test_equal_name_resolves_as_benchmark() {
        let matcher =
            matcher_with(&[bench(RecordCategory::Nomenclature, "Болт М10х40", "25.94.11")]).await;
        let item = prepare(RecordCategory::Nomenclature, "болт  м10х40", None).unwrap();

        let outcome = matcher.best_match(&item).await.unwrap();
        let MatchOutcome::Accepted(candidate) = outcome else {
            panic!("expected accepted benchmark");
        };
        assert!(candidate.matched_reference_id.starts_with("benchmark:"));
        let resolution = candidate.into_resolution();
        assert_eq!(resolution.stage_reached, PipelineStage::BenchmarkMatch);
        assert_eq!(resolution.quality_level(), QualityLevel::Benchmark);
    }

    #[tokio::test]
    async fn test_other_category_ignored() {
        let matcher =
            matcher_with(&[bench(RecordCategory::Counterparty, "Болт М10х40", "25.94.11")]).await;
        let item = prepare(RecordCategory::Nomenclature, "Болт М10х40", None).unwrap();
        assert_eq!(matcher.best_match(&item).await.unwrap(), MatchOutcome::Rejected(None));
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_new_benchmarks() {
        let store = Arc::new(SqliteStore::new(init_memory_pool().await.unwrap()));
        let matcher = BenchmarkMatcher::new(
            store.clone(),
            Arc::new(SimilarityEngine::default()),
            0.9,
            Duration::from_secs(3600),
        );
        let item = prepare(RecordCategory::Nomenclature, "Гайка М8", None).unwrap();
        assert!(!matcher.best_match(&item).await.unwrap().is_accepted());

        store
            .upsert_benchmarks(&[bench(RecordCategory::Nomenclature, "Гайка М8", "25.94.12")])
            .await
            .unwrap();
        // Still cached
        assert!(!matcher.best_match(&item).await.unwrap().is_accepted());
        matcher.invalidate();
        assert!(matcher.best_match(&item).await.unwrap().is_accepted());
    }
}
