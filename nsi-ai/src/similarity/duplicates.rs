//! Duplicate grouping
//!
//! Single-linkage clustering: two records whose score reaches the duplicate threshold
//! end up in the same group, as do records linked through a chain of such pairs.

use std::collections::BTreeMap;

use super::{codes_match, normalize_text, SimilarityEngine};
use crate::models::DuplicateGroup;

/// Record offered for duplicate detection
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCandidate {
    pub record_id: i64,
    pub name: String,
    pub code: Option<String>,
    /// Confidence of the record's classification, used to pick the master record
    pub confidence: Option<f64>,
}

/// Disjoint-set forest over candidate indices
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Cluster candidates into duplicate groups of two or more records
///
/// Groups are ordered by their smallest record id; ids inside a group are ascending.
pub fn group_duplicates(
    engine: &SimilarityEngine,
    items: &[DuplicateCandidate],
) -> Vec<DuplicateGroup> {
    let threshold = engine.duplicate_threshold();
    let normalized: Vec<String> = items.iter().map(|c| normalize_text(&c.name)).collect();
    let mut sets = UnionFind::new(items.len());
    // (sum, count) of linking scores per pair's left index; folded into roots afterwards
    let mut links: Vec<(usize, f64)> = Vec::new();

    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let score = pair_score(engine, &items[i], &items[j], &normalized[i], &normalized[j]);
            if score >= threshold {
                sets.union(i, j);
                links.push((i, score));
            }
        }
    }

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..items.len() {
        let root = sets.find(i);
        members.entry(root).or_default().push(i);
    }

    let mut scores: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for (i, score) in links {
        let root = sets.find(i);
        let entry = scores.entry(root).or_insert((0.0, 0));
        entry.0 += score;
        entry.1 += 1;
    }

    let mut groups: Vec<DuplicateGroup> = members
        .into_iter()
        .filter(|(_, idx)| idx.len() > 1)
        .map(|(root, idx)| {
            let (sum, count) = scores.get(&root).copied().unwrap_or((0.0, 0));
            let mut record_ids: Vec<i64> = idx.iter().map(|&i| items[i].record_id).collect();
            record_ids.sort_unstable();
            DuplicateGroup {
                group_id: 0,
                master_record_id: select_master(idx.iter().map(|&i| &items[i])),
                similarity: if count > 0 { sum / count as f64 } else { 0.0 },
                record_ids,
            }
        })
        .collect();

    groups.sort_by_key(|g| g.record_ids[0]);
    for (n, group) in groups.iter_mut().enumerate() {
        group.group_id = n + 1;
    }
    groups
}

fn pair_score(
    engine: &SimilarityEngine,
    a: &DuplicateCandidate,
    b: &DuplicateCandidate,
    norm_a: &str,
    norm_b: &str,
) -> f64 {
    if codes_match(a.code.as_deref(), b.code.as_deref()) {
        return 1.0;
    }
    engine.normalized_similarity(norm_a, norm_b)
}

/// Highest confidence wins, then a present code, then the lowest id
fn select_master<'a>(members: impl Iterator<Item = &'a DuplicateCandidate>) -> i64 {
    members
        .max_by(|a, b| {
            let conf_a = a.confidence.unwrap_or(-1.0);
            let conf_b = b.confidence.unwrap_or(-1.0);
            conf_a
                .total_cmp(&conf_b)
                .then_with(|| a.code.is_some().cmp(&b.code.is_some()))
                .then_with(|| b.record_id.cmp(&a.record_id))
        })
        .map(|c| c.record_id)
        .unwrap_or_default()
}
