//! Raw records under normalization

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Source category of an imported row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordCategory {
    /// Catalog item (goods, services, materials)
    Nomenclature,
    /// Business entity (supplier, customer)
    Counterparty,
}

impl RecordCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordCategory::Nomenclature => "nomenclature",
            RecordCategory::Counterparty => "counterparty",
        }
    }
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nomenclature" => Ok(RecordCategory::Nomenclature),
            "counterparty" => Ok(RecordCategory::Counterparty),
            other => Err(format!("unknown record category: {}", other)),
        }
    }
}

/// Record as seen by a job
///
/// Immutable once read; workers write results separately keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRecord {
    /// Source row id
    pub id: i64,
    /// Owning job
    pub job_id: Uuid,
    /// Position of the record in the job's stable processing order
    pub seq: u64,
    pub category: RecordCategory,
    /// Table the row was imported from
    pub source_table: String,
    pub raw_name: String,
    pub raw_code: Option<String>,
}

/// Row submitted by an importer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSourceRecord {
    pub source_table: String,
    pub category: RecordCategory,
    pub raw_name: String,
    #[serde(default)]
    pub raw_code: Option<String>,
}

/// Ad hoc item for a one-off classification call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default = "default_category")]
    pub category: RecordCategory,
}

fn default_category() -> RecordCategory {
    RecordCategory::Nomenclature
}
