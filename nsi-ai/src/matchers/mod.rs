//! Deterministic matching stages (reference lookup and benchmark match)
//!
//! Both matchers return a [`MatchOutcome`]: an accepted candidate above the stage
//! threshold, or the best rejected candidate which the pipeline keeps as a fallback
//! when the AI stage cannot help.

pub mod benchmark;
pub mod reference;

pub use benchmark::BenchmarkMatcher;
pub use reference::{parent_code, ReferenceMatcher, ReferenceMatcherSet};

use crate::models::{PipelineStage, ReferenceTable, Resolution, ResolutionMethod};

/// Best entry found by a matcher
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub method: ResolutionMethod,
    pub code: String,
    pub name: String,
    pub reference_table: Option<ReferenceTable>,
    /// Reference code or `benchmark:<id>`
    pub matched_reference_id: String,
    pub score: f64,
    /// Leaf code this broader reference entry stands in for
    pub parent_of: Option<String>,
}

impl MatchCandidate {
    fn stage(&self) -> PipelineStage {
        match self.method {
            ResolutionMethod::Benchmark => PipelineStage::BenchmarkMatch,
            _ => PipelineStage::ReferenceLookup,
        }
    }

    /// Resolution for a candidate that passed its stage threshold
    pub fn into_resolution(self) -> Resolution {
        Resolution {
            stage_reached: self.stage(),
            method: self.method,
            category_code: Some(self.code),
            category_name: Some(self.name),
            reference_table: self.reference_table,
            matched_reference_id: Some(self.matched_reference_id),
            confidence: Some(self.score.clamp(0.0, 1.0)),
            manual_review: false,
            provider_used: None,
            error: None,
        }
    }

    /// Resolution for a below-threshold candidate used because AI was unavailable
    pub fn into_fallback(self, reason: impl Into<String>) -> Resolution {
        let reason = reason.into();
        let error = match &self.parent_of {
            Some(leaf) => format!("{}; parent code used for weak match {}", reason, leaf),
            None => reason,
        };
        Resolution {
            stage_reached: PipelineStage::ConfidenceThreshold,
            method: ResolutionMethod::Fallback,
            manual_review: true,
            error: Some(error),
            ..self.into_resolution()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Accepted(MatchCandidate),
    /// Nothing passed the threshold; carries the best candidate seen, if any
    Rejected(Option<MatchCandidate>),
}

impl MatchOutcome {
    pub(crate) fn from_best(best: Option<MatchCandidate>, threshold: f64) -> Self {
        match best {
            Some(candidate) if candidate.score >= threshold => MatchOutcome::Accepted(candidate),
            other => MatchOutcome::Rejected(other),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, MatchOutcome::Accepted(_))
    }

    /// Candidate regardless of acceptance
    pub fn candidate(&self) -> Option<&MatchCandidate> {
        match self {
            MatchOutcome::Accepted(c) => Some(c),
            MatchOutcome::Rejected(c) => c.as_ref(),
        }
    }

    pub fn into_rejected(self) -> Option<MatchCandidate> {
        match self {
            MatchOutcome::Accepted(_) => None,
            MatchOutcome::Rejected(c) => c,
        }
    }
}

/// Higher score wins; on a tie the earlier candidate stays
pub(crate) fn better(current: Option<MatchCandidate>, next: Option<MatchCandidate>) -> Option<MatchCandidate> {
    match (current, next) {
        (Some(a), Some(b)) => Some(if b.score > a.score { b } else { a }),
        (a, b) => a.or(b),
    }
}
