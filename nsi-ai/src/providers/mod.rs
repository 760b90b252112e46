//! AI classification providers
//!
//! Every provider sits behind [`AiProvider`]; the gateway never sees a wire format.
//! One call classifies a batch of requests and returns answers tagged with the
//! request correlation id.

pub mod chat_completion;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::RecordCategory;

pub use chat_completion::ChatCompletionProvider;

/// Provider call errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Provider call timed out after {0} ms")]
    Timeout(u64),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider disabled: {0}")]
    Disabled(String),
}

impl ProviderError {
    /// Timeouts, 5xx, 429 and transport errors may succeed on another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Transport(_) => true,
            ProviderError::Http { status, .. } => *status >= 500 || *status == 429,
            ProviderError::MalformedResponse(_) | ProviderError::Disabled(_) => false,
        }
    }
}

/// One item to classify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    /// Correlation id echoed back in the answer
    pub id: Uuid,
    pub category: RecordCategory,
    /// Preprocessed name
    pub name: String,
    pub code: Option<String>,
}

impl ClassificationRequest {
    pub fn new(category: RecordCategory, name: impl Into<String>, code: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            name: name.into(),
            code,
        }
    }
}

/// Provider answer for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAnswer {
    pub id: Uuid,
    /// Classification code chosen by the model
    pub code: String,
    /// Classification label
    pub name: String,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: Option<String>,
}

/// An AI classification backend
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str {
        ""
    }

    /// Classify all requests in one outbound call
    ///
    /// Answers may come back in any order; requests without an answer are simply
    /// missing from the result.
    async fn classify_batch(
        &self,
        requests: &[ClassificationRequest],
    ) -> Result<Vec<ProviderAnswer>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout(15_000).is_transient());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Http { status: 429, body: String::new() }.is_transient());
        assert!(!ProviderError::Http { status: 401, body: String::new() }.is_transient());
        assert!(!ProviderError::MalformedResponse("x".into()).is_transient());
    }
}
