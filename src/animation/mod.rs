//! Animation orchestration: eligibility, cache, per-step code generation,
//! rendering and status bookkeeping for one chat message.

pub mod cache;
pub mod codegen;
pub mod renderer;
pub mod sanitize;

pub use cache::{CacheHit, SimilarityCache};
pub use codegen::{CodeGenerator, CodeSource, StepCode};
pub use renderer::{HealthReport, RenderClient, RenderError};

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::llm;
use crate::status::AnimationStatus;
use crate::store::{AnimationUrl, ChatMessage, Store};

const MIN_EXPLANATION_CHARS: usize = 50;

const FILLER_PHRASES: [&str; 6] = [
    "I'll help you",
    "Is there anything else",
    "Let me know if you need",
    "Don't hesitate to ask",
    "Great progress",
    "Let's continue",
];

#[derive(Debug, Clone, PartialEq)]
pub enum AnimationOutcome {
    Completed {
        urls: Vec<AnimationUrl>,
        cached: bool,
    },
    Skipped {
        reason: String,
    },
    Error {
        reason: String,
        urls: Vec<AnimationUrl>,
    },
}

impl AnimationOutcome {
    pub fn status(&self) -> AnimationStatus {
        match self {
            AnimationOutcome::Completed { .. } => AnimationStatus::Completed,
            AnimationOutcome::Skipped { .. } => AnimationStatus::Skipped,
            AnimationOutcome::Error { .. } => AnimationStatus::Error,
        }
    }
}

/// Why an explanation does not deserve an animation, if it doesn't.
pub fn ineligibility_reason(explanation: &str) -> Option<&'static str> {
    if explanation.chars().count() < MIN_EXPLANATION_CHARS {
        return Some("Explanation too short for an animation");
    }
    if FILLER_PHRASES.iter().any(|p| explanation.contains(p)) {
        return Some("No animation required");
    }
    None
}

pub struct AnimationService {
    store: Store,
    codegen: CodeGenerator,
    renderer: RenderClient,
    cache: SimilarityCache,
    single_step: bool,
    filter_trivial: bool,
}

impl AnimationService {
    pub fn new(
        store: Store,
        codegen: CodeGenerator,
        renderer: RenderClient,
        cache: SimilarityCache,
        config: &Config,
    ) -> Self {
        Self {
            store,
            codegen,
            renderer,
            cache,
            single_step: config.animation.use_finetuned_model,
            filter_trivial: config.animation.filter_trivial,
        }
    }

    /// Wire up providers, renderer and cache from configuration.
    pub fn from_config(config: &Config, store: Store) -> Result<Self> {
        let chat = llm::create_chat_provider(&config.animation.code_model, config)?;
        let finetuned = llm::create_finetuned_provider(config)?;
        let embedder = if config.cache.enabled {
            Some(llm::create_embedding_provider(config)?)
        } else {
            None
        };

        Ok(Self::new(
            store.clone(),
            CodeGenerator::new(chat, finetuned, &config.animation),
            RenderClient::new(&config.renderer)?,
            SimilarityCache::new(store, embedder, &config.cache),
            config,
        ))
    }

    /// Claim the message and generate in a detached task. Returns once claimed.
    pub fn start(self: &Arc<Self>, message_id: &str) -> Result<()> {
        self.store.claim(message_id)?;
        info!("Animation generation started for {}", message_id);

        let service = Arc::clone(self);
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.run_claimed(&message_id).await {
                error!("Background animation for {} failed: {:#}", message_id, e);
                service.mark_failed(&message_id, &format!("{:#}", e));
            }
        });

        Ok(())
    }

    /// Claim and generate in the foreground.
    pub async fn generate_now(&self, message_id: &str) -> Result<AnimationOutcome> {
        self.store.claim(message_id)?;
        match self.run_claimed(message_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.mark_failed(message_id, &format!("{:#}", e));
                Err(e)
            }
        }
    }

    fn mark_failed(&self, message_id: &str, reason: &str) {
        let urls = [AnimationUrl {
            step: 0,
            url: self.renderer.placeholder_url().to_string(),
        }];
        if let Err(e) = self
            .store
            .fail(message_id, AnimationStatus::Failed, reason, &urls)
        {
            warn!("Could not mark {} failed: {:#}", message_id, e);
        }
    }

    fn finish_with_error(
        &self,
        message_id: &str,
        reason: &str,
        urls: Vec<AnimationUrl>,
    ) -> Result<AnimationOutcome> {
        warn!("Animation for {} ended in error: {}", message_id, reason);
        self.store
            .fail(message_id, AnimationStatus::Error, reason, &urls)?;
        Ok(AnimationOutcome::Error {
            reason: reason.to_string(),
            urls,
        })
    }

    /// Generate for a message already in `processing`.
    pub async fn run_claimed(&self, message_id: &str) -> Result<AnimationOutcome> {
        let message = self.store.require_message(message_id)?;

        if message.ai_response.explanation.trim().is_empty() {
            return self.finish_with_error(
                message_id,
                "Invalid message structure: missing AI response or explanation",
                Vec::new(),
            );
        }

        if self.filter_trivial
            && let Some(reason) = ineligibility_reason(&message.ai_response.explanation)
        {
            info!("Skipping animation for {}: {}", message_id, reason);
            self.store.skip(message_id, reason)?;
            return Ok(AnimationOutcome::Skipped {
                reason: reason.to_string(),
            });
        }

        if let Some(hit) = self.cache.find_similar(&message.ai_response).await {
            self.store.complete(message_id, &hit.urls)?;
            return Ok(AnimationOutcome::Completed {
                urls: hit.urls,
                cached: true,
            });
        }

        let codes = if self.single_step {
            self.codegen
                .generate_single(
                    &message.ai_response.explanation,
                    &message.ai_response.animation,
                )
                .await
        } else {
            if message.ai_response.chunks.is_empty() {
                return self.finish_with_error(
                    message_id,
                    "Invalid message structure: missing chunks array",
                    Vec::new(),
                );
            }
            self.codegen
                .generate_steps(&message.ai_response.chunks, &message.ai_response.animation)
                .await
        };

        let (urls, rendered) = self.render_steps(&message, &codes).await;

        if rendered == 0 {
            return self.finish_with_error(message_id, "No animation steps were rendered", urls);
        }

        let first_code = codes.first().map(|c| c.code.as_str()).unwrap_or_default();
        self.cache
            .store(&message.ai_response, first_code, &urls)
            .await;

        self.store.complete(message_id, &urls)?;
        info!(
            "Animation for {} completed: {}/{} steps rendered",
            message_id,
            rendered,
            urls.len()
        );

        Ok(AnimationOutcome::Completed {
            urls,
            cached: false,
        })
    }

    /// Render every step in order; failed steps get the placeholder.
    /// Returns the URLs and how many steps actually rendered.
    async fn render_steps(
        &self,
        message: &ChatMessage,
        codes: &[StepCode],
    ) -> (Vec<AnimationUrl>, usize) {
        let health = self.renderer.health_check().await;
        if !health.healthy {
            warn!(
                "Manim service health check failed ({}), attempting to render anyway",
                health.detail
            );
        }

        let mut urls = Vec::with_capacity(codes.len());
        let mut rendered = 0;

        for step_code in codes {
            let code = sanitize::add_safeguards(&sanitize::ensure_color_definitions(
                &step_code.code,
            ));

            if let Err(e) = self
                .store
                .save_step_code(&message.id, step_code.step, &code)
            {
                warn!("Could not store code for step {}: {:#}", step_code.step, e);
            }

            let url = match self
                .renderer
                .execute(&code, &message.id, Some(step_code.step))
                .await
            {
                Ok(url) => {
                    debug!("Step {} rendered at {}", step_code.step, url);
                    rendered += 1;
                    url
                }
                Err(e) => {
                    warn!("Step {} failed to render: {}", step_code.step, e);
                    self.renderer.placeholder_url().to_string()
                }
            };

            urls.push(AnimationUrl {
                step: step_code.step,
                url,
            });
        }

        (urls, rendered)
    }
}
