//! OpenAI-compatible chat-completions provider
//!
//! OpenRouter, Arliai, the HuggingFace router and Eden AI all accept
//! `POST {base_url}/chat/completions` with a bearer key, so one adapter covers them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::prompt::{parse_answers, system_prompt, user_prompt};
use super::{AiProvider, ClassificationRequest, ProviderAnswer, ProviderError};

const USER_AGENT: &str = concat!("nsi-ai/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for one configured provider
pub struct ChatCompletionProvider {
    name: String,
    model: String,
    endpoint: String,
    api_key: Option<String>,
    timeout_ms: u64,
    http_client: reqwest::Client,
}

impl ChatCompletionProvider {
    /// `timeout` is a transport-level backstop; the gateway enforces the per-call deadline
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            model: model.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout_ms: timeout.as_millis() as u64,
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AiProvider for ChatCompletionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn classify_batch(
        &self,
        requests: &[ClassificationRequest],
    ) -> Result<Vec<ProviderAnswer>, ProviderError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let user = user_prompt(requests);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
        };

        tracing::debug!(
            provider = %self.name,
            model = %self.model,
            items = requests.len(),
            "Dispatching chat completion"
        );

        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout_ms)
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::MalformedResponse("empty choices".to_string()))?;

        parse_answers(&content, requests)
    }
}
