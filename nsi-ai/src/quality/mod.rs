//! Quality analyzer
//!
//! Builds a [`QualityReport`] from the stored results of a scope: counts per quality
//! level, near-duplicate groups, rule violations and improvement suggestions. Reports
//! are cached per scope for `report_ttl_secs`.

pub mod rules;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;

use nsi_common::Result;

use crate::models::{
    DuplicateGroup, LevelCounts, QualityLevel, QualityReport, QualityScope, RecordCategory,
    ResolutionMethod, RuleViolation, Suggestion,
};
use crate::repository::{ResultRepository, ResultWithRecord};
use crate::similarity::{normalize_text, DuplicateCandidate, SimilarityEngine};

use rules::QualityRule;

/// Distinct scopes kept in the report cache
const MAX_CACHED_REPORTS: u64 = 256;

pub struct QualityAnalyzer {
    results: Arc<dyn ResultRepository>,
    engine: Arc<SimilarityEngine>,
    rules: Vec<Box<dyn QualityRule>>,
    cache: Cache<QualityScope, Arc<QualityReport>>,
}

impl QualityAnalyzer {
    pub fn new(
        results: Arc<dyn ResultRepository>,
        engine: Arc<SimilarityEngine>,
        manual_review_threshold: f64,
        ttl: Duration,
    ) -> Self {
        let rules = rules::default_rules(engine.as_ref().clone(), manual_review_threshold);
        Self {
            results,
            engine,
            rules,
            cache: Cache::builder()
                .max_capacity(MAX_CACHED_REPORTS)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Report for a scope, served from cache while fresh
    pub async fn report(&self, scope: &QualityScope) -> Result<Arc<QualityReport>> {
        let report = self
            .cache
            .try_get_with(scope.clone(), async {
                let rows = self.results.load_results(scope).await?;
                let report = self.build(scope.clone(), &rows);
                tracing::info!(
                    job_id = ?scope.job_id,
                    category = ?scope.category,
                    records = report.total_records,
                    duplicate_groups = report.duplicate_groups.len(),
                    violations = report.violations.len(),
                    "Quality report generated"
                );
                Ok::<_, nsi_common::Error>(Arc::new(report))
            })
            .await?;
        Ok(report)
    }

    /// Drop cached reports (new results were written)
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }

    /// Pure report construction from loaded rows
    pub fn build(&self, scope: QualityScope, rows: &[ResultWithRecord]) -> QualityReport {
        let mut by_level = LevelCounts::default();
        let mut manual_review_count = 0;
        let mut confidence_sum = 0.0;
        let mut confidence_count = 0u64;

        for row in rows {
            match row.result.quality_level {
                QualityLevel::Basic => by_level.basic += 1,
                QualityLevel::AiEnhanced => by_level.ai_enhanced += 1,
                QualityLevel::Benchmark => by_level.benchmark += 1,
            }
            if row.result.manual_review {
                manual_review_count += 1;
            }
            if let Some(confidence) = row.result.confidence {
                confidence_sum += confidence;
                confidence_count += 1;
            }
        }

        let duplicate_groups = self.duplicate_groups(rows);

        let mut violations: Vec<RuleViolation> = Vec::new();
        for row in rows {
            for rule in &self.rules {
                rule.check(row, &mut violations);
            }
        }
        violations.extend(rules::inconsistent_classifications(rows));
        violations.sort_by(|a, b| {
            a.record_id
                .cmp(&b.record_id)
                .then_with(|| b.severity.cmp(&a.severity))
        });

        let suggestions = suggestions(rows, &duplicate_groups, manual_review_count);

        QualityReport {
            scope,
            generated_at: Utc::now(),
            total_records: rows.len() as u64,
            by_level,
            manual_review_count,
            average_confidence: (confidence_count > 0)
                .then(|| confidence_sum / confidence_count as f64),
            duplicate_groups,
            violations,
            suggestions,
        }
    }

    /// Duplicate groups within each category, numbered across the whole report
    fn duplicate_groups(&self, rows: &[ResultWithRecord]) -> Vec<DuplicateGroup> {
        let mut by_category: BTreeMap<RecordCategory, Vec<DuplicateCandidate>> = BTreeMap::new();
        for row in rows {
            if row.result.is_input_error() {
                continue;
            }
            by_category
                .entry(row.category)
                .or_default()
                .push(DuplicateCandidate {
                    record_id: row.result.record_id,
                    name: row.raw_name.clone(),
                    code: row.raw_code.clone(),
                    confidence: row.result.confidence,
                });
        }

        let mut groups: Vec<DuplicateGroup> = by_category
            .values()
            .flat_map(|candidates| self.engine.group_duplicates(candidates))
            .collect();
        groups.sort_by_key(|g| g.record_ids[0]);
        for (n, group) in groups.iter_mut().enumerate() {
            group.group_id = n + 1;
        }
        groups
    }
}

fn suggestions(
    rows: &[ResultWithRecord],
    duplicate_groups: &[DuplicateGroup],
    manual_review_count: u64,
) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();

    // Names repeatedly left to the AI stage are benchmark candidates
    let mut ai_names: BTreeMap<(RecordCategory, String), Vec<i64>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.result.method == ResolutionMethod::Ai) {
        let name = normalize_text(&row.raw_name);
        if !name.is_empty() {
            ai_names
                .entry((row.category, name))
                .or_default()
                .push(row.result.record_id);
        }
    }
    for ((category, name), record_ids) in ai_names {
        if record_ids.len() >= 2 {
            suggestions.push(Suggestion {
                kind: "add_benchmark".to_string(),
                message: format!(
                    "'{}' ({}) was resolved by AI {} times; consider adding it as a benchmark",
                    name,
                    category,
                    record_ids.len()
                ),
                record_ids,
            });
        }
    }

    for group in duplicate_groups {
        suggestions.push(Suggestion {
            kind: "merge_duplicates".to_string(),
            message: format!(
                "{} records look like duplicates (similarity {:.2}); merge into record {}",
                group.record_ids.len(),
                group.similarity,
                group.master_record_id
            ),
            record_ids: group.record_ids.clone(),
        });
    }

    let fallback_ids: Vec<i64> = rows
        .iter()
        .filter(|r| r.result.method == ResolutionMethod::Fallback)
        .map(|r| r.result.record_id)
        .collect();
    if !fallback_ids.is_empty() {
        suggestions.push(Suggestion {
            kind: "extend_references".to_string(),
            message: format!(
                "{} records only had weak reference candidates; extend the reference tables",
                fallback_ids.len()
            ),
            record_ids: fallback_ids,
        });
    }

    if manual_review_count > 0 {
        suggestions.push(Suggestion {
            kind: "review_manual".to_string(),
            message: format!("{} records are waiting for manual review", manual_review_count),
            record_ids: rows
                .iter()
                .filter(|r| r.result.manual_review)
                .map(|r| r.result.record_id)
                .collect(),
        });
    }

    // Providers used, for operators comparing answer sources
    let mut providers: HashMap<&str, u64> = HashMap::new();
    for row in rows {
        if let Some(provider) = row.result.provider_used.as_deref() {
            *providers.entry(provider.trim_end_matches(" (cached)")).or_default() += 1;
        }
    }
    if providers.len() > 1 {
        let mut counts: Vec<(&str, u64)> = providers.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let summary: Vec<String> = counts.iter().map(|(p, n)| format!("{} ({})", p, n)).collect();
        suggestions.push(Suggestion {
            kind: "compare_providers".to_string(),
            message: format!("answers came from several providers: {}", summary.join(", ")),
            record_ids: Vec::new(),
        });
    }

    suggestions
}
