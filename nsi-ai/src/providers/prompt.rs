//! Prompt construction and answer parsing for chat-completion models

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ClassificationRequest, ProviderAnswer, ProviderError};
use crate::models::RecordCategory;

const SYSTEM_PROMPT: &str = "You classify Russian catalog records. \
Nomenclature items get an OKPD2 product classification code; counterparties get the \
OKVED code of their main activity. Answer with JSON only: an array containing one object \
per input item, {\"id\": <input id>, \"code\": <classification code>, \
\"name\": <classification label>, \"confidence\": <number 0..1>, \"reasoning\": <short text>}. \
Do not add text outside the JSON.";

pub fn system_prompt() -> &'static str {
    SYSTEM_PROMPT
}

/// User message listing the items to classify
pub fn user_prompt(requests: &[ClassificationRequest]) -> String {
    let items: Vec<Value> = requests
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "category": category_hint(r.category),
                "name": r.name,
                "code": r.code,
            })
        })
        .collect();
    format!(
        "Classify these {} items:\n{}",
        requests.len(),
        Value::Array(items)
    )
}

fn category_hint(category: RecordCategory) -> &'static str {
    match category {
        RecordCategory::Nomenclature => "nomenclature (product or service)",
        RecordCategory::Counterparty => "counterparty (organization)",
    }
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Remove a surrounding Markdown code fence (```json ... ```)
pub fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse model output into answers for the given requests
///
/// Accepts an array, a single object or an object wrapping an array under
/// `results`/`items`. Answers with unknown ids are dropped; a lone answer without an
/// id is attributed to a lone request.
pub fn parse_answers(
    content: &str,
    requests: &[ClassificationRequest],
) -> Result<Vec<ProviderAnswer>, ProviderError> {
    let body = strip_code_fence(content);
    let value: Value = serde_json::from_str(body)
        .or_else(|_| extract_json(body))
        .map_err(|e| ProviderError::MalformedResponse(format!("not JSON: {}", e)))?;

    let raw_items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("items")) {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(map)],
        },
        other => {
            return Err(ProviderError::MalformedResponse(format!(
                "expected array or object, got {}",
                other
            )))
        }
    };

    let mut answers = Vec::with_capacity(raw_items.len());
    for item in raw_items {
        let raw: RawAnswer = match serde_json::from_value(item) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparsable answer item");
                continue;
            }
        };

        let id = match raw.id.as_ref().and_then(value_to_string) {
            Some(id) => match Uuid::parse_str(&id) {
                Ok(id) if requests.iter().any(|r| r.id == id) => id,
                _ => continue,
            },
            None if requests.len() == 1 => requests[0].id,
            None => continue,
        };

        let Some(code) = raw.code.as_ref().and_then(value_to_string) else {
            continue;
        };
        if code.trim().is_empty() {
            continue;
        }

        answers.push(ProviderAnswer {
            id,
            code: code.trim().to_string(),
            name: raw.name.unwrap_or_default().trim().to_string(),
            confidence: normalize_confidence(raw.confidence.unwrap_or(0.0)),
            reasoning: raw.reasoning.filter(|r| !r.trim().is_empty()),
        });
    }

    if answers.is_empty() && !requests.is_empty() {
        return Err(ProviderError::MalformedResponse(
            "no usable answers in response".to_string(),
        ));
    }
    Ok(answers)
}

/// JSON embedded in surrounding prose
fn extract_json(body: &str) -> Result<Value, serde_json::Error> {
    let start = body.find(|c: char| c == '[' || c == '{').unwrap_or(0);
    let end = body
        .rfind(|c: char| c == ']' || c == '}')
        .map(|i| i + 1)
        .unwrap_or(body.len());
    serde_json::from_str(body.get(start..end).unwrap_or(body))
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Models sometimes answer in percent
fn normalize_confidence(raw: f64) -> f64 {
    let value = if raw > 1.0 && raw <= 100.0 { raw / 100.0 } else { raw };
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
