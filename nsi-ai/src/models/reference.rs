//! Reference classifier entries and curated benchmarks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::RecordCategory;

/// Authoritative reference classifier table
///
/// Declaration order is the lookup priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceTable {
    /// Product classification codes (OKPD2)
    Okpd2,
    /// Customs codes (TN VED)
    Tnved,
    /// Technical-standard references (GOST)
    Gost,
    /// Manufacturer registry
    Manufacturer,
}

impl ReferenceTable {
    /// All tables in lookup priority order
    pub const PRIORITY: [ReferenceTable; 4] = [
        ReferenceTable::Okpd2,
        ReferenceTable::Tnved,
        ReferenceTable::Gost,
        ReferenceTable::Manufacturer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceTable::Okpd2 => "okpd2",
            ReferenceTable::Tnved => "tnved",
            ReferenceTable::Gost => "gost",
            ReferenceTable::Manufacturer => "manufacturer",
        }
    }
}

impl fmt::Display for ReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "okpd2" => Ok(ReferenceTable::Okpd2),
            "tnved" => Ok(ReferenceTable::Tnved),
            "gost" => Ok(ReferenceTable::Gost),
            "manufacturer" => Ok(ReferenceTable::Manufacturer),
            other => Err(format!("unknown reference table: {}", other)),
        }
    }
}

/// One entry of a reference classifier (code unique within its table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub table: ReferenceTable,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub parent_code: Option<String>,
}

/// Curator-approved exemplar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: i64,
    pub category: RecordCategory,
    /// Exemplar name as entered by the curator
    pub name: String,
    /// Ground-truth classification code
    pub code: String,
    /// Ground-truth classification label
    pub label: String,
    pub approved: bool,
}

/// Benchmark submitted by a curator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBenchmark {
    pub category: RecordCategory,
    pub name: String,
    pub code: String,
    pub label: String,
    #[serde(default = "default_approved")]
    pub approved: bool,
}

fn default_approved() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_matches_declaration_order() {
        let mut sorted = ReferenceTable::PRIORITY;
        sorted.sort();
        assert_eq!(sorted, ReferenceTable::PRIORITY);
        assert_eq!(ReferenceTable::PRIORITY[0], ReferenceTable::Okpd2);
    }

    #[test]
    fn test_table_roundtrip() {
        for table in ReferenceTable::PRIORITY {
            assert_eq!(table.as_str().parse::<ReferenceTable>().unwrap(), table);
        }
    }
}
