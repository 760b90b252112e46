//! Stage 1: input validation and text cleanup

use crate::models::{NormalizationRecord, RawItem, RecordCategory};
use crate::similarity::normalize_text;

/// Item after preprocessing, ready for the matching stages
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedItem {
    pub category: RecordCategory,
    /// Name with whitespace collapsed, original case kept (sent to AI providers)
    pub name: String,
    /// Lowercased, punctuation-free form used for matching
    pub normalized_name: String,
    pub code: Option<String>,
}

/// Reason an item cannot be processed at all
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("record has neither a name nor a code")]
    Empty,
    #[error("record contains undecodable characters")]
    BadEncoding,
    #[error("record contains control characters")]
    ControlCharacters,
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn check_text(value: &str) -> Result<(), InputError> {
    if value.contains('\u{FFFD}') {
        return Err(InputError::BadEncoding);
    }
    // Tabs and newlines are ordinary whitespace in imported data
    if value
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(InputError::ControlCharacters);
    }
    Ok(())
}

/// Normalize whitespace/case/encoding of a raw name and code
pub fn prepare(
    category: RecordCategory,
    name: &str,
    code: Option<&str>,
) -> Result<PreparedItem, InputError> {
    check_text(name)?;
    if let Some(code) = code {
        check_text(code)?;
    }

    let name = collapse_whitespace(name);
    let code = code.map(collapse_whitespace).filter(|c| !c.is_empty());
    if name.is_empty() && code.is_none() {
        return Err(InputError::Empty);
    }

    Ok(PreparedItem {
        category,
        normalized_name: normalize_text(&name),
        name,
        code,
    })
}

pub fn prepare_record(record: &NormalizationRecord) -> Result<PreparedItem, InputError> {
    prepare(record.category, &record.raw_name, record.raw_code.as_deref())
}

pub fn prepare_raw(item: &RawItem) -> Result<PreparedItem, InputError> {
    prepare(item.category, &item.name, item.code.as_deref())
}
