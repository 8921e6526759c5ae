//! LLM access: chat completion, embeddings and the fine-tuned code model.

pub mod embeddings;
pub mod finetuned;
pub mod providers;

pub use embeddings::{
    EmbeddingProvider, OpenAIEmbeddingProvider, cosine_similarity, deserialize_embedding,
    hash_text, normalize_embedding, serialize_embedding,
};
pub use finetuned::{FineTunedProvider, TextGenerator};
pub use providers::{OpenAIProvider, ProviderError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn model(&self) -> &str;

    /// Returns the content of the first choice. Empty content is an error.
    async fn complete(&self, messages: &[Message], options: CompletionOptions) -> Result<String>;
}

fn openai_config(config: &Config) -> Result<&crate::config::OpenAIConfig> {
    config
        .providers
        .openai
        .as_ref()
        .filter(|c| !c.api_key.is_empty() && !c.api_key.starts_with('$'))
        .ok_or_else(|| ProviderError::MissingConfig("OPENAI_API_KEY".to_string()).into())
}

pub fn create_chat_provider(model: &str, config: &Config) -> Result<Arc<dyn ChatProvider>> {
    let openai = openai_config(config)?;
    Ok(Arc::new(OpenAIProvider::new(
        &openai.api_key,
        &openai.base_url,
        model,
    )?))
}

pub fn create_embedding_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let openai = openai_config(config)?;
    Ok(Arc::new(OpenAIEmbeddingProvider::new(
        &openai.api_key,
        &openai.base_url,
        &config.cache.embedding_model,
    )?))
}

/// None unless fine-tuned mode is on and an endpoint is configured.
pub fn create_finetuned_provider(config: &Config) -> Result<Option<Arc<dyn TextGenerator>>> {
    if !config.animation.use_finetuned_model {
        return Ok(None);
    }

    match config.providers.finetuned {
        Some(ref ft) => Ok(Some(Arc::new(FineTunedProvider::new(
            &ft.endpoint,
            ft.api_key.as_deref(),
        )?))),
        None => {
            tracing::warn!("use_finetuned_model is set but no fine-tuned endpoint is configured");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenAIConfig;

    #[test]
    fn missing_key_is_a_config_error() {
        let config = Config::default();
        let err = create_chat_provider("gpt-3.5-turbo", &config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::MissingConfig(_))
        ));
    }

    #[test]
    fn unexpanded_key_counts_as_missing() {
        let mut config = Config::default();
        config.providers.openai = Some(OpenAIConfig {
            api_key: "${OPENAI_API_KEY}".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        });
        assert!(create_embedding_provider(&config).is_err());
    }

    #[test]
    fn finetuned_provider_requires_flag() {
        let mut config = Config::default();
        config.providers.finetuned = Some(crate::config::FineTunedConfig {
            endpoint: "http://localhost:9/generate".to_string(),
            api_key: None,
        });
        assert!(create_finetuned_provider(&config).unwrap().is_none());

        config.animation.use_finetuned_model = true;
        assert!(create_finetuned_provider(&config).unwrap().is_some());
    }
}
