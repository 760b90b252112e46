//! Per-stage counters for operator visibility
//!
//! A record enters every stage it is routed through: preprocessing, confidence
//! thresholding and persistence always; reference lookup unless the input is
//! malformed; benchmark match and AI classification only while still unresolved.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use nsi_common::time::percent;

use crate::models::{ClassificationResult, PipelineStage, ResolutionMethod};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSummary {
    pub stage_number: u8,
    pub stage: PipelineStage,
    /// Records that left the stage
    pub completed: u64,
    /// Records that entered the stage
    pub total: u64,
    /// `completed / total` in percent
    pub progress: f64,
    /// Mean confidence of the decisions taken at this stage
    pub avg_confidence: Option<f64>,
    pub errors: u64,
    /// Entered but not yet completed
    pub pending: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct StageCounters {
    entered: u64,
    completed: u64,
    errors: u64,
    confidence_sum: f64,
    confidence_count: u64,
}

impl StageCounters {
    fn summary(&self, stage: PipelineStage) -> StageSummary {
        StageSummary {
            stage_number: stage.number(),
            stage,
            completed: self.completed,
            total: self.entered,
            progress: percent(self.completed, self.entered),
            avg_confidence: (self.confidence_count > 0)
                .then(|| self.confidence_sum / self.confidence_count as f64),
            errors: self.errors,
            pending: self.entered.saturating_sub(self.completed),
        }
    }
}

fn index(stage: PipelineStage) -> usize {
    usize::from(stage.number() - 1)
}

/// Live counters of one running job
#[derive(Debug, Default)]
pub struct StageTracker {
    counters: Mutex<[StageCounters; 6]>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, stage: PipelineStage, f: impl FnOnce(&mut StageCounters)) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut counters[index(stage)]);
    }

    pub fn enter(&self, stage: PipelineStage) {
        self.update(stage, |c| c.entered += 1);
    }

    /// Record leaves the stage; `confidence` is set when the stage decided the record
    pub fn complete(&self, stage: PipelineStage, confidence: Option<f64>) {
        self.update(stage, |c| {
            c.completed += 1;
            if let Some(confidence) = confidence {
                c.confidence_sum += confidence;
                c.confidence_count += 1;
            }
        });
    }

    /// Record leaves the stage with an error
    pub fn fail(&self, stage: PipelineStage) {
        self.update(stage, |c| {
            c.completed += 1;
            c.errors += 1;
        });
    }

    /// Record leaves the stage without completing it (requeued or interrupted)
    pub fn abandon(&self, stage: PipelineStage) {
        self.update(stage, |c| c.entered = c.entered.saturating_sub(1));
    }

    pub fn summaries(&self) -> Vec<StageSummary> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        PipelineStage::ALL
            .iter()
            .map(|&stage| counters[index(stage)].summary(stage))
            .collect()
    }

    /// Rebuild the counters of a finished (or not running) job from its results
    pub fn from_results(results: &[ClassificationResult]) -> Self {
        let tracker = Self::new();
        for result in results {
            tracker.replay(result);
        }
        tracker
    }

    fn replay(&self, result: &ClassificationResult) {
        use PipelineStage::*;

        let pass = |stage: PipelineStage, confidence: Option<f64>| {
            self.enter(stage);
            self.complete(stage, confidence);
        };
        let fail = |stage: PipelineStage| {
            self.enter(stage);
            self.fail(stage);
        };

        if result.is_input_error() {
            fail(Preprocess);
            pass(Persistence, None);
            return;
        }

        pass(Preprocess, None);
        match result.method {
            ResolutionMethod::Reference => pass(ReferenceLookup, result.confidence),
            ResolutionMethod::Benchmark => {
                pass(ReferenceLookup, None);
                pass(BenchmarkMatch, result.confidence);
            }
            ResolutionMethod::Ai => {
                pass(ReferenceLookup, None);
                pass(BenchmarkMatch, None);
                pass(AiClassification, result.confidence);
            }
            ResolutionMethod::Fallback | ResolutionMethod::None => {
                pass(ReferenceLookup, None);
                pass(BenchmarkMatch, None);
                fail(AiClassification);
            }
        }
        pass(ConfidenceThreshold, result.confidence);
        pass(Persistence, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resolution;
    use uuid::Uuid;

    fn reference_result(confidence: f64) -> ClassificationResult {
        Resolution {
            stage_reached: PipelineStage::ReferenceLookup,
            method: ResolutionMethod::Reference,
            category_code: Some("25.94".to_string()),
            category_name: Some("Крепеж".to_string()),
            reference_table: None,
            matched_reference_id: Some("25.94".to_string()),
            confidence: Some(confidence),
            manual_review: false,
            provider_used: None,
            error: None,
        }
        .into_result(Uuid::new_v4(), 1)
    }

    #[test]
    fn test_live_counters() {
        let tracker = StageTracker::new();
        tracker.enter(PipelineStage::Preprocess);
        tracker.enter(PipelineStage::Preprocess);
        tracker.complete(PipelineStage::Preprocess, None);

        let summaries = tracker.summaries();
        assert_eq!(summaries.len(), 6);
        let first = &summaries[0];
        assert_eq!(first.stage_number, 1);
        assert_eq!(first.total, 2);
        assert_eq!(first.pending, 1);
        assert_eq!(first.progress, 50.0);
        assert!(first.avg_confidence.is_none());
    }

    #[test]
    fn test_replay_of_results() {
        let mut results = vec![reference_result(1.0), reference_result(0.9)];
        results.push(Resolution::input_error("empty").into_result(Uuid::new_v4(), 3));

        let summaries = StageTracker::from_results(&results).summaries();
        assert_eq!(summaries[0].total, 3);
        assert_eq!(summaries[0].errors, 1);
        assert_eq!(summaries[1].completed, 2);
        assert!((summaries[1].avg_confidence.unwrap() - 0.95).abs() < 1e-9);
        assert_eq!(summaries[2].total, 0);
        assert_eq!(summaries[5].completed, 3);
    }
}
