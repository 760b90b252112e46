//! Data models for nsi-ai

pub mod job;
pub mod provider;
pub mod quality;
pub mod record;
pub mod reference;
pub mod result;

pub use job::{BatchJob, Checkpoint, JobStatus, JobStatusSnapshot, SourceSelector};
pub use provider::ProviderProfile;
pub use quality::{
    DuplicateGroup, LevelCounts, QualityReport, QualityScope, RuleViolation, Severity, Suggestion,
};
pub use record::{NewSourceRecord, NormalizationRecord, RawItem, RecordCategory};
pub use reference::{Benchmark, NewBenchmark, ReferenceEntry, ReferenceTable};
pub use result::{ClassificationResult, PipelineStage, QualityLevel, Resolution, ResolutionMethod};
