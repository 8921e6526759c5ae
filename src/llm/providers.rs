use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::{ChatProvider, CompletionOptions, Message, Role};

const MODEL_ACCESS_MARKER: &str = "does not exist or you do not have access to it";

/// Failure kinds callers branch on when choosing a user-facing message.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Model access error: {0}")]
    ModelAccess(String),

    #[error("OpenAI API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("OpenAI returned an empty response")]
    EmptyResponse,

    #[error("Missing {0} configuration")]
    MissingConfig(String),
}

impl ProviderError {
    fn from_body(status: u16, body: String) -> Self {
        if body.contains(MODEL_ACCESS_MARKER) {
            ProviderError::ModelAccess(body)
        } else {
            ProviderError::Api { status, body }
        }
    }
}

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIProvider {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn format_messages(&self, messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[Message], options: CompletionOptions) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": self.format_messages(messages),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens
        });

        debug!("OpenAI request to {} ({} messages)", self.model, messages.len());

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_body(status.as_u16(), body).into());
        }

        let response_body: Value = response.json().await?;

        if let Some(error) = response_body.get("error") {
            return Err(ProviderError::from_body(status.as_u16(), error.to_string()).into());
        }

        let content = response_body["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .unwrap_or("");

        if content.trim().is_empty() {
            return Err(ProviderError::EmptyResponse.into());
        }

        debug!("OpenAI response of {} chars", content.len());
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> CompletionOptions {
        CompletionOptions {
            temperature: 0.7,
            max_tokens: 1000,
        }
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-3.5-turbo", "max_tokens": 1000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Gravity pulls."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new("sk-test", &server.uri(), "gpt-3.5-turbo").unwrap();
        let text = provider
            .complete(&[Message::user("Why do apples fall?")], options())
            .await
            .unwrap();
        assert_eq!(text, "Gravity pulls.");
    }

    #[tokio::test]
    async fn model_access_errors_are_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {
                    "message": "The model `gpt-9` does not exist or you do not have access to it."
                }
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new("sk-test", &server.uri(), "gpt-9").unwrap();
        let err = provider
            .complete(&[Message::user("hi")], options())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::ModelAccess(_))
        ));
    }

    #[tokio::test]
    async fn server_errors_and_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": ""}}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new("sk-test", &server.uri(), "gpt-3.5-turbo").unwrap();

        let err = provider.complete(&[], options()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::Api { status: 500, .. })
        ));

        let err = provider.complete(&[], options()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::EmptyResponse)
        ));
    }
}
