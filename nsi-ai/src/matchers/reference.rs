//! Stage 2: reference classifier lookup
//!
//! Exact code first, then fuzzy name, table by table in [`ReferenceTable::PRIORITY`]
//! order. The first table with an accepted match wins.
//!
//! A name match below threshold is widened to its nearest ancestor in the code
//! hierarchy; the broader entry is what the pipeline falls back to when AI cannot
//! classify the record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use nsi_common::Result;

use super::{better, MatchCandidate, MatchOutcome};
use crate::models::{RecordCategory, ReferenceEntry, ReferenceTable, ResolutionMethod};
use crate::pipeline::PreparedItem;
use crate::repository::ReferenceRepository;
use crate::similarity::{normalize_code, normalize_text, SimilarityEngine};

/// In-memory index of one reference table
#[derive(Debug)]
pub struct ReferenceMatcher {
    table: ReferenceTable,
    entries: Vec<ReferenceEntry>,
    by_code: HashMap<String, usize>,
    /// Normalized names, parallel to `entries`
    names: Vec<String>,
}

impl ReferenceMatcher {
    pub fn new(table: ReferenceTable, entries: Vec<ReferenceEntry>) -> Self {
        let mut by_code = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            by_code.entry(normalize_code(&entry.code)).or_insert(idx);
        }
        let names = entries.iter().map(|e| normalize_text(&e.name)).collect();
        Self {
            table,
            entries,
            by_code,
            names,
        }
    }

    pub fn table(&self) -> ReferenceTable {
        self.table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn candidate(&self, idx: usize, score: f64) -> MatchCandidate {
        let entry = &self.entries[idx];
        MatchCandidate {
            method: ResolutionMethod::Reference,
            code: entry.code.clone(),
            name: entry.name.clone(),
            reference_table: Some(self.table),
            matched_reference_id: entry.code.clone(),
            score,
            parent_of: None,
        }
    }

    /// Nearest ancestor of an entry present in this table
    ///
    /// An explicit `parent_code` is tried first, then levels are stripped from the
    /// dotted code one at a time.
    fn ancestor(&self, idx: usize) -> Option<usize> {
        let entry = &self.entries[idx];
        let mut next = entry
            .parent_code
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .or_else(|| parent_code(&entry.code))
            .map(str::to_string);

        while let Some(code) = next {
            match self.by_code.get(&normalize_code(&code)) {
                Some(&found) if found != idx => return Some(found),
                _ => next = parent_code(&code).map(str::to_string),
            }
        }
        None
    }

    /// Broader entry standing in for a below-threshold leaf match
    ///
    /// Scores `confidence`, or the leaf score when that is lower.
    pub fn widen(&self, leaf: &MatchCandidate, confidence: f64) -> Option<MatchCandidate> {
        let idx = *self.by_code.get(&normalize_code(&leaf.code))?;
        let parent = self.ancestor(idx)?;
        let mut candidate = self.candidate(parent, leaf.score.min(confidence));
        candidate.parent_of = Some(leaf.code.clone());
        Some(candidate)
    }

    /// Exact code match (confidence 1.0)
    pub fn match_code(&self, code: &str) -> Option<MatchCandidate> {
        let key = normalize_code(code);
        if key.is_empty() {
            return None;
        }
        self.by_code.get(&key).map(|&idx| self.candidate(idx, 1.0))
    }

    /// Highest-scoring entry by name, whatever its score
    pub fn best_name_match(
        &self,
        engine: &SimilarityEngine,
        normalized_name: &str,
    ) -> Option<MatchCandidate> {
        if normalized_name.is_empty() {
            return None;
        }
        let mut best: Option<(usize, f64)> = None;
        for (idx, name) in self.names.iter().enumerate() {
            let score = engine.normalized_similarity(normalized_name, name);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
                if score >= 1.0 {
                    break;
                }
            }
        }
        best.map(|(idx, score)| self.candidate(idx, score))
    }

    /// Code lookup, then name lookup against `threshold`
    pub fn lookup(
        &self,
        engine: &SimilarityEngine,
        item: &PreparedItem,
        threshold: f64,
    ) -> MatchOutcome {
        if let Some(hit) = item.code.as_deref().and_then(|c| self.match_code(c)) {
            return MatchOutcome::Accepted(hit);
        }
        MatchOutcome::from_best(self.best_name_match(engine, &item.normalized_name), threshold)
    }
}

/// Parent of a dotted hierarchical code (`27.32.11` has parent `27.32`)
///
/// Codes with fewer than three levels, or with an empty level, have none.
pub fn parent_code(code: &str) -> Option<&str> {
    let code = code.trim();
    let levels = code.split('.').count();
    if levels < 3 || code.split('.').any(|level| level.trim().is_empty()) {
        return None;
    }
    code.rfind('.').map(|idx| &code[..idx])
}

/// Reference tables consulted for a record category, in priority order
pub fn tables_for(category: RecordCategory) -> &'static [ReferenceTable] {
    match category {
        RecordCategory::Nomenclature => &ReferenceTable::PRIORITY,
        RecordCategory::Counterparty => &[ReferenceTable::Manufacturer],
    }
}

/// All reference tables behind a moka TTL cache
pub struct ReferenceMatcherSet {
    repository: Arc<dyn ReferenceRepository>,
    engine: Arc<SimilarityEngine>,
    name_threshold: f64,
    /// Score given to a parent entry replacing a weak leaf match
    parent_confidence: f64,
    cache: Cache<ReferenceTable, Arc<ReferenceMatcher>>,
}

impl ReferenceMatcherSet {
    pub fn new(
        repository: Arc<dyn ReferenceRepository>,
        engine: Arc<SimilarityEngine>,
        name_threshold: f64,
        parent_confidence: f64,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            engine,
            name_threshold,
            parent_confidence,
            cache: Cache::builder()
                .max_capacity(ReferenceTable::PRIORITY.len() as u64)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Matcher for one table, loaded from the repository on a cache miss
    pub async fn matcher(&self, table: ReferenceTable) -> Result<Arc<ReferenceMatcher>> {
        let matcher = self
            .cache
            .try_get_with(table, async {
                let entries = self.repository.load_reference_table(table).await?;
                tracing::debug!(table = %table, entries = entries.len(), "Reference table loaded");
                Ok::<_, nsi_common::Error>(Arc::new(ReferenceMatcher::new(table, entries)))
            })
            .await?;
        Ok(matcher)
    }

    /// Look the item up in every applicable table
    ///
    /// An exact code hit in any table beats fuzzy name matches; otherwise the first
    /// table (priority order) with an accepted name match wins. A rejected outcome
    /// carries the best widened candidate across tables.
    pub async fn lookup(&self, item: &PreparedItem) -> Result<MatchOutcome> {
        let tables = tables_for(item.category);
        let mut matchers = Vec::with_capacity(tables.len());
        for &table in tables {
            matchers.push(self.matcher(table).await?);
        }

        if let Some(code) = item.code.as_deref() {
            if let Some(hit) = matchers.iter().find_map(|m| m.match_code(code)) {
                return Ok(MatchOutcome::Accepted(hit));
            }
        }

        let mut best_rejected = None;
        for matcher in &matchers {
            match MatchOutcome::from_best(
                matcher.best_name_match(&self.engine, &item.normalized_name),
                self.name_threshold,
            ) {
                accepted @ MatchOutcome::Accepted(_) => return Ok(accepted),
                MatchOutcome::Rejected(candidate) => {
                    let candidate = candidate.map(|leaf| match matcher.widen(&leaf, self.parent_confidence) {
                        Some(parent) => {
                            tracing::debug!(
                                table = %matcher.table(),
                                leaf = %leaf.code,
                                parent = %parent.code,
                                leaf_score = leaf.score,
                                "Weak reference match widened to parent code"
                            );
                            parent
                        }
                        None => leaf,
                    });
                    best_rejected = better(best_rejected, candidate);
                }
            }
        }
        Ok(MatchOutcome::Rejected(best_rejected))
    }

    /// Drop cached tables (after an import)
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}
