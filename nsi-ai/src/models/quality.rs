//! Quality report types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RecordCategory;

/// Near-duplicate records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: usize,
    /// Sorted ascending
    pub record_ids: Vec<i64>,
    /// Mean similarity of the pairs that linked the group
    pub similarity: f64,
    /// Member chosen to survive a merge
    pub master_record_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolation {
    /// Rule identifier (`missing_name`, `invalid_inn`, ...)
    pub rule: String,
    pub record_id: i64,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Suggestion identifier (`add_benchmark`, `merge_duplicates`, ...)
    pub kind: String,
    pub message: String,
    pub record_ids: Vec<i64>,
}

/// Result counts per quality level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelCounts {
    pub basic: u64,
    pub ai_enhanced: u64,
    pub benchmark: u64,
}

/// What a report covers; empty scope means every stored result
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualityScope {
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub category: Option<RecordCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub scope: QualityScope,
    pub generated_at: DateTime<Utc>,
    pub total_records: u64,
    pub by_level: LevelCounts,
    pub manual_review_count: u64,
    pub average_confidence: Option<f64>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub violations: Vec<RuleViolation>,
    pub suggestions: Vec<Suggestion>,
}
