//! Hybrid similarity scoring
//!
//! One scalar in [0, 1] for two records:
//! 1. equal non-empty codes score 1.0
//! 2. otherwise Jaccard overlap of normalized word tokens
//! 3. when the token overlap is below the fallback threshold, normalized Levenshtein
//!    similarity of the normalized names is consulted and the higher score wins
//!
//! Both steps are symmetric, so `similarity(a, b) == similarity(b, a)`.

pub mod duplicates;

use std::collections::HashSet;

use nsi_common::config::SimilaritySettings;

pub use duplicates::DuplicateCandidate;

/// Name and optional code of something being compared
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparable<'a> {
    pub name: &'a str,
    pub code: Option<&'a str>,
}

impl<'a> Comparable<'a> {
    pub fn new(name: &'a str, code: Option<&'a str>) -> Self {
        Self { name, code }
    }

    pub fn name(name: &'a str) -> Self {
        Self { name, code: None }
    }
}

/// Lowercase, fold `ё` into `е`, turn punctuation into spaces and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'ё' => 'е',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Codes compare without whitespace and case
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Both codes present, non-empty and equal after normalization
pub fn codes_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            let a = normalize_code(a);
            !a.is_empty() && a == normalize_code(b)
        }
        _ => false,
    }
}

fn token_set(normalized: &str) -> HashSet<&str> {
    normalized.split(' ').filter(|t| !t.is_empty()).collect()
}

/// Jaccard index of two token sets; two empty sets are identical, one empty set matches nothing
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    match (set_a.is_empty(), set_b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    intersection as f64 / union as f64
}

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    settings: SimilaritySettings,
}

impl SimilarityEngine {
    pub fn new(settings: SimilaritySettings) -> Self {
        Self { settings }
    }

    pub fn duplicate_threshold(&self) -> f64 {
        self.settings.duplicate_threshold
    }

    /// Hybrid score of two records
    pub fn similarity(&self, a: Comparable<'_>, b: Comparable<'_>) -> f64 {
        if codes_match(a.code, b.code) {
            return 1.0;
        }
        self.name_similarity(a.name, b.name)
    }

    /// Score of two raw names (normalization included)
    pub fn name_similarity(&self, a: &str, b: &str) -> f64 {
        self.normalized_similarity(&normalize_text(a), &normalize_text(b))
    }

    /// Score of two names that already went through [`normalize_text`]
    pub fn normalized_similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let token_score = jaccard(a, b);
        if token_score >= self.settings.token_fallback_threshold {
            return token_score;
        }
        let edit_score = strsim::normalized_levenshtein(a, b);
        token_score.max(edit_score).clamp(0.0, 1.0)
    }

    /// Group near-duplicates (see [`duplicates::group_duplicates`])
    pub fn group_duplicates(
        &self,
        items: &[DuplicateCandidate],
    ) -> Vec<crate::models::DuplicateGroup> {
        duplicates::group_duplicates(self, items)
    }
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(SimilaritySettings::default())
    }
}
