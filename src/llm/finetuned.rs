//! Client for a text-generation endpoint serving a model fine-tuned on Manim scenes.
//!
//! The request body follows the Hugging Face inference format. Custom endpoints
//! answer in several shapes, all of which are accepted.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct FineTunedProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl FineTunedProvider {
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(str::to_string),
        })
    }
}

#[async_trait]
impl TextGenerator for FineTunedProvider {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": 2000,
                "temperature": 0.3,
                "return_full_text": false
            }
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            debug!("Fine-tuned model error body: {}", text);
            anyhow::bail!("Fine-tuned model API error: {}", status.as_u16());
        }

        let result: Value = response.json().await?;
        let code = parse_generated_text(&result);
        if code.trim().is_empty() {
            anyhow::bail!("Empty response from fine-tuned model");
        }

        Ok(code)
    }
}

/// Accepts `"..."`, `[{"generated_text": ...}]`, `{"generated_text": ...}` or `{"output": ...}`.
pub fn parse_generated_text(result: &Value) -> String {
    let text = match result {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items
            .first()
            .and_then(|item| item.get("generated_text"))
            .and_then(Value::as_str),
        Value::Object(_) => result
            .get("generated_text")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| result.get("output").and_then(Value::as_str)),
        _ => None,
    };
    text.unwrap_or_default().to_string()
}
