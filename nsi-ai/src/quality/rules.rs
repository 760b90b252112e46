//! Data-quality rules
//!
//! Each rule inspects one stored result together with its source row and appends
//! violations. Rules are stateless; cross-record checks live in
//! [`inconsistent_classifications`].

use std::collections::HashMap;

use crate::models::{RecordCategory, ResolutionMethod, RuleViolation, Severity};
use crate::repository::ResultWithRecord;
use crate::similarity::{normalize_text, SimilarityEngine};

/// Name similarity below which a code hit is considered suspicious
pub const INCONSISTENT_NAME_THRESHOLD: f64 = 0.3;

pub trait QualityRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, row: &ResultWithRecord, violations: &mut Vec<RuleViolation>);
}

fn violation(rule: &str, row: &ResultWithRecord, severity: Severity, message: String) -> RuleViolation {
    RuleViolation {
        rule: rule.to_string(),
        record_id: row.result.record_id,
        severity,
        message,
    }
}

/// Name always; taxpayer number for counterparties; resolved code for resolved results
pub struct MissingMandatoryFields;

impl QualityRule for MissingMandatoryFields {
    fn name(&self) -> &'static str {
        "missing_fields"
    }

    fn check(&self, row: &ResultWithRecord, violations: &mut Vec<RuleViolation>) {
        if row.raw_name.trim().is_empty() {
            violations.push(violation(
                "missing_name",
                row,
                Severity::Warning,
                "record has no name".to_string(),
            ));
        }
        let code_missing = row.raw_code.as_deref().map_or(true, |c| c.trim().is_empty());
        if row.category == RecordCategory::Counterparty && code_missing {
            violations.push(violation(
                "missing_inn",
                row,
                Severity::Warning,
                "counterparty has no taxpayer number".to_string(),
            ));
        }
        if row.result.method == ResolutionMethod::None {
            let reason = row.result.error.as_deref().unwrap_or("no candidate found");
            violations.push(violation(
                "unresolved",
                row,
                Severity::Error,
                format!("record could not be classified: {}", reason),
            ));
        } else if row.result.category_code.is_none() {
            violations.push(violation(
                "missing_category",
                row,
                Severity::Error,
                format!("{} result carries no category code", row.result.method.as_str()),
            ));
        }
    }
}

/// Exact code hit whose reference name has nothing in common with the record name
pub struct InconsistentCodeName {
    engine: SimilarityEngine,
}

impl InconsistentCodeName {
    pub fn new(engine: SimilarityEngine) -> Self {
        Self { engine }
    }
}

impl QualityRule for InconsistentCodeName {
    fn name(&self) -> &'static str {
        "inconsistent_code_name"
    }

    fn check(&self, row: &ResultWithRecord, violations: &mut Vec<RuleViolation>) {
        let result = &row.result;
        if result.method != ResolutionMethod::Reference || result.confidence != Some(1.0) {
            return;
        }
        let (Some(reference_name), false) = (&result.category_name, row.raw_name.trim().is_empty())
        else {
            return;
        };
        let score = self.engine.name_similarity(&row.raw_name, reference_name);
        if score < INCONSISTENT_NAME_THRESHOLD {
            violations.push(violation(
                self.name(),
                row,
                Severity::Warning,
                format!(
                    "code {} belongs to '{}' but the record is named '{}' (similarity {:.2})",
                    result.category_code.as_deref().unwrap_or_default(),
                    reference_name,
                    row.raw_name,
                    score
                ),
            ));
        }
    }
}

/// Russian taxpayer number (INN) check digits
pub fn is_valid_inn(inn: &str) -> bool {
    const C10: [u32; 9] = [2, 4, 10, 3, 5, 9, 4, 6, 8];
    const C11: [u32; 10] = [7, 2, 4, 10, 3, 5, 9, 4, 6, 8];
    const C12: [u32; 11] = [3, 7, 2, 4, 10, 3, 5, 9, 4, 6, 8];

    let digits: Vec<u32> = match inn.chars().map(|c| c.to_digit(10)).collect::<Option<Vec<_>>>() {
        Some(digits) => digits,
        None => return false,
    };
    let check = |coefficients: &[u32]| -> u32 {
        let sum: u32 = coefficients.iter().zip(&digits).map(|(c, d)| c * d).sum();
        sum % 11 % 10
    };

    match digits.len() {
        10 => check(&C10) == digits[9],
        12 => check(&C11) == digits[10] && check(&C12) == digits[11],
        _ => false,
    }
}

pub struct InvalidInn;

impl QualityRule for InvalidInn {
    fn name(&self) -> &'static str {
        "invalid_inn"
    }

    fn check(&self, row: &ResultWithRecord, violations: &mut Vec<RuleViolation>) {
        if row.category != RecordCategory::Counterparty {
            return;
        }
        let Some(code) = row.raw_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
            return;
        };
        if !is_valid_inn(code) {
            violations.push(violation(
                self.name(),
                row,
                Severity::Error,
                format!("'{}' is not a valid taxpayer number", code),
            ));
        }
    }
}

/// Resolved below the manual-review threshold
pub struct LowConfidence {
    threshold: f64,
}

impl LowConfidence {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl QualityRule for LowConfidence {
    fn name(&self) -> &'static str {
        "low_confidence"
    }

    fn check(&self, row: &ResultWithRecord, violations: &mut Vec<RuleViolation>) {
        if let Some(confidence) = row.result.confidence {
            if confidence < self.threshold {
                violations.push(violation(
                    self.name(),
                    row,
                    Severity::Info,
                    format!(
                        "{} result with confidence {:.2} needs review",
                        row.result.method.as_str(),
                        confidence
                    ),
                ));
            }
        }
    }
}

/// Records with the same normalized name resolved to different category codes
pub fn inconsistent_classifications(rows: &[ResultWithRecord]) -> Vec<RuleViolation> {
    let mut by_name: HashMap<(RecordCategory, String), Vec<&ResultWithRecord>> = HashMap::new();
    for row in rows {
        if row.result.category_code.is_none() {
            continue;
        }
        let key = normalize_text(&row.raw_name);
        if key.is_empty() {
            continue;
        }
        by_name.entry((row.category, key)).or_default().push(row);
    }

    let mut violations = Vec::new();
    for members in by_name.values() {
        let first_code = &members[0].result.category_code;
        if members.iter().all(|m| &m.result.category_code == first_code) {
            continue;
        }
        let codes: Vec<&str> = members
            .iter()
            .filter_map(|m| m.result.category_code.as_deref())
            .collect();
        for member in members {
            violations.push(violation(
                "inconsistent_classification",
                member,
                Severity::Warning,
                format!("same name classified as {}", codes.join(", ")),
            ));
        }
    }
    violations.sort_by_key(|v| v.record_id);
    violations
}

/// The fixed rule set
pub fn default_rules(engine: SimilarityEngine, manual_review_threshold: f64) -> Vec<Box<dyn QualityRule>> {
    vec![
        Box::new(MissingMandatoryFields),
        Box::new(InconsistentCodeName::new(engine)),
        Box::new(InvalidInn),
        Box::new(LowConfidence::new(manual_review_threshold)),
    ]
}
