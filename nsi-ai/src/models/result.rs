//! Classification outcomes
//!
//! A record passes the stages in [`PipelineStage`] order and stops at the first one
//! that resolves it. The outcome is a [`Resolution`]; inside a job it is persisted as a
//! [`ClassificationResult`] keyed by `(job_id, record_id)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ReferenceTable;

/// How a record was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    /// Malformed input or no candidate at all
    None,
    Reference,
    Benchmark,
    Ai,
    /// Best below-threshold candidate, used when AI was unavailable
    Fallback,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::None => "none",
            ResolutionMethod::Reference => "reference",
            ResolutionMethod::Benchmark => "benchmark",
            ResolutionMethod::Ai => "ai",
            ResolutionMethod::Fallback => "fallback",
        }
    }

    /// Quality level implied by the method
    pub fn quality_level(&self) -> QualityLevel {
        match self {
            ResolutionMethod::Benchmark => QualityLevel::Benchmark,
            ResolutionMethod::Ai => QualityLevel::AiEnhanced,
            ResolutionMethod::Reference | ResolutionMethod::Fallback | ResolutionMethod::None => {
                QualityLevel::Basic
            }
        }
    }
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ResolutionMethod::None),
            "reference" => Ok(ResolutionMethod::Reference),
            "benchmark" => Ok(ResolutionMethod::Benchmark),
            "ai" => Ok(ResolutionMethod::Ai),
            "fallback" => Ok(ResolutionMethod::Fallback),
            other => Err(format!("unknown resolution method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    /// Reference-only (or unresolved)
    Basic,
    AiEnhanced,
    /// Matched against curated ground truth
    Benchmark,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Basic => "basic",
            QualityLevel::AiEnhanced => "ai_enhanced",
            QualityLevel::Benchmark => "benchmark",
        }
    }
}

impl FromStr for QualityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(QualityLevel::Basic),
            "ai_enhanced" => Ok(QualityLevel::AiEnhanced),
            "benchmark" => Ok(QualityLevel::Benchmark),
            other => Err(format!("unknown quality level: {}", other)),
        }
    }
}

/// Ordered pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Preprocess,
    ReferenceLookup,
    BenchmarkMatch,
    AiClassification,
    ConfidenceThreshold,
    Persistence,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Preprocess,
        PipelineStage::ReferenceLookup,
        PipelineStage::BenchmarkMatch,
        PipelineStage::AiClassification,
        PipelineStage::ConfidenceThreshold,
        PipelineStage::Persistence,
    ];

    /// 1-based stage number
    pub fn number(&self) -> u8 {
        match self {
            PipelineStage::Preprocess => 1,
            PipelineStage::ReferenceLookup => 2,
            PipelineStage::BenchmarkMatch => 3,
            PipelineStage::AiClassification => 4,
            PipelineStage::ConfidenceThreshold => 5,
            PipelineStage::Persistence => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Preprocess => "preprocess",
            PipelineStage::ReferenceLookup => "reference_lookup",
            PipelineStage::BenchmarkMatch => "benchmark_match",
            PipelineStage::AiClassification => "ai_classification",
            PipelineStage::ConfidenceThreshold => "confidence_threshold",
            PipelineStage::Persistence => "persistence",
        }
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown pipeline stage: {}", s))
    }
}

/// Outcome of classifying one item, before it is tied to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Stage that produced the decision
    pub stage_reached: PipelineStage,
    pub method: ResolutionMethod,
    /// Resolved classification code
    pub category_code: Option<String>,
    /// Resolved classification label
    pub category_name: Option<String>,
    /// Matched reference table (reference and fallback-from-reference only)
    pub reference_table: Option<ReferenceTable>,
    /// Reference code or `benchmark:<id>` of the matched entry
    pub matched_reference_id: Option<String>,
    /// Set whenever `method != none`
    pub confidence: Option<f64>,
    pub manual_review: bool,
    pub provider_used: Option<String>,
    /// InputError reason or exhaustion cause
    pub error: Option<String>,
}

impl Resolution {
    /// Unresolvable input; never retried
    pub fn input_error(reason: impl Into<String>) -> Self {
        Self {
            stage_reached: PipelineStage::Preprocess,
            method: ResolutionMethod::None,
            category_code: None,
            category_name: None,
            reference_table: None,
            matched_reference_id: None,
            confidence: None,
            manual_review: true,
            provider_used: None,
            error: Some(reason.into()),
        }
    }

    /// No stage produced any candidate
    pub fn unresolved(stage_reached: PipelineStage, reason: impl Into<String>) -> Self {
        Self {
            stage_reached,
            ..Self::input_error(reason)
        }
    }

    pub fn quality_level(&self) -> QualityLevel {
        self.method.quality_level()
    }

    /// True for malformed records
    pub fn is_input_error(&self) -> bool {
        self.method == ResolutionMethod::None && self.stage_reached == PipelineStage::Preprocess
    }

    /// Confidence is present exactly when a method resolved the record, and within [0, 1]
    pub fn is_consistent(&self) -> bool {
        match (self.method, self.confidence) {
            (ResolutionMethod::None, None) => true,
            (ResolutionMethod::None, Some(_)) => false,
            (_, Some(c)) => (0.0..=1.0).contains(&c),
            (_, None) => false,
        }
    }

    /// Attach the resolution to a job record
    pub fn into_result(self, job_id: Uuid, record_id: i64) -> ClassificationResult {
        ClassificationResult {
            job_id,
            record_id,
            quality_level: self.quality_level(),
            stage_reached: self.stage_reached,
            method: self.method,
            category_code: self.category_code,
            category_name: self.category_name,
            reference_table: self.reference_table,
            matched_reference_id: self.matched_reference_id,
            confidence: self.confidence,
            manual_review: self.manual_review,
            provider_used: self.provider_used,
            error: self.error,
            created_at: Utc::now(),
        }
    }
}

/// Persisted terminal result (one per record per job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub job_id: Uuid,
    pub record_id: i64,
    pub stage_reached: PipelineStage,
    pub method: ResolutionMethod,
    pub category_code: Option<String>,
    pub category_name: Option<String>,
    pub reference_table: Option<ReferenceTable>,
    pub matched_reference_id: Option<String>,
    pub confidence: Option<f64>,
    pub quality_level: QualityLevel,
    pub manual_review: bool,
    pub provider_used: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ClassificationResult {
    pub fn is_input_error(&self) -> bool {
        self.method == ResolutionMethod::None && self.stage_reached == PipelineStage::Preprocess
    }
}
