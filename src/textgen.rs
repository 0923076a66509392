use crate::errors::{AppError, AppResult};
use crate::settings::TextGenSettings;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Text-generation collaborator. `complete` returns the raw model text,
/// which callers expect to contain exactly one JSON object; parsing and
/// schema validation stay with the insight engine.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &str) -> AppResult<String>;
}

/// Provider speaking the OpenAI-compatible chat-completions protocol.
/// Throttling and server errors surface as `Unavailable` so callers can
/// tell a busy provider from a broken response.
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| AppError::Internal(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            model,
            api_key,
        })
    }

    pub fn from_settings(settings: &TextGenSettings) -> AppResult<Self> {
        let api_key = std::env::var(&settings.api_key_env).ok();
        Self::new(
            settings.base_url.clone(),
            settings.model.clone(),
            api_key,
            settings.timeout_secs,
        )
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn complete(&self, prompt: &str) -> AppResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request_body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a productivity coach. Respond with a single valid JSON object and nothing else."
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.3,
            "response_format": { "type": "json_object" }
        });

        tracing::debug!(model = %self.model, "requesting completion");

        let mut request = self.client.post(&url).json(&request_body);
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Unavailable(format!(
                "text generation returned {status}: {detail}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "text generation returned {status}: {detail}"
            )));
        }

        #[derive(Deserialize)]
        struct CompletionResponse {
            choices: Vec<CompletionChoice>,
        }
        #[derive(Deserialize)]
        struct CompletionChoice {
            message: CompletionMessage,
        }
        #[derive(Deserialize)]
        struct CompletionMessage {
            content: String,
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|err| AppError::ModelOutput(format!("malformed completion envelope: {err}")))?;

        completion
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::ModelOutput("completion has no choices".to_string()))
    }
}

fn classify_transport_error(error: reqwest::Error) -> AppError {
    if error.is_timeout() || error.is_connect() {
        AppError::Unavailable(error.to_string())
    } else {
        AppError::Internal(error.to_string())
    }
}
