//! Question answering: history, completion, chunking and animation dispatch.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::animation::AnimationService;
use crate::chunker::process_text_into_chunks;
use crate::config::Config;
use crate::llm::{self, ChatProvider, CompletionOptions, Message, ProviderError};
use crate::status::AnimationStatus;
use crate::store::{AiResponse, NewMessage, Store};

const SYSTEM_PROMPT: &str = "You are an educational assistant that explains concepts \
clearly and step by step. \
Break down complex topics into simple, visual explanations. \
For mathematical concepts, include appropriate equations. \
Provide explanations that can be turned into animations.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Query is required")]
    EmptyQuery,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "generateAnimation")]
    pub generate_animation: bool,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    pub message_id: String,
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub existing: bool,
    pub animation_status: AnimationStatus,
}

/// How generation is started for messages that want an animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Detached task; the request returns immediately.
    Background,
    /// Awaited before returning, for one-shot processes.
    Inline,
}

pub struct ChatService {
    store: Store,
    chat: Arc<dyn ChatProvider>,
    animation: Option<Arc<AnimationService>>,
    options: CompletionOptions,
    history_limit: usize,
    skip_chunking: bool,
    dispatch: Dispatch,
}

impl ChatService {
    pub fn new(
        store: Store,
        chat: Arc<dyn ChatProvider>,
        animation: Option<Arc<AnimationService>>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            chat,
            animation,
            options: CompletionOptions {
                temperature: config.chat.temperature,
                max_tokens: config.chat.max_tokens,
            },
            history_limit: config.chat.history_limit,
            skip_chunking: config.animation.use_finetuned_model,
            dispatch: Dispatch::Background,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Store,
        animation: Option<Arc<AnimationService>>,
    ) -> Result<Self> {
        let chat = llm::create_chat_provider(&config.chat.model, config)?;
        Ok(Self::new(store, chat, animation, config))
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub async fn process_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyQuery.into());
        }
        let session_id = request.session_id.as_deref().filter(|s| !s.is_empty());

        if let Some(session_id) = session_id
            && let Some(existing) = self.store.find_message_by_query(session_id, query)?
        {
            info!("Duplicate query in session {}, reusing {}", session_id, existing.id);

            let mut status = existing.animation_status;
            if request.generate_animation
                && status != AnimationStatus::Completed
                && existing.animation_urls.is_empty()
            {
                if status.can_requeue() {
                    self.store.requeue(&existing.id)?;
                    status = AnimationStatus::Pending;
                }
                if status == AnimationStatus::Pending {
                    status = self.dispatch_animation(&existing.id).await;
                }
            }

            return Ok(QueryResponse {
                success: true,
                message_id: existing.id,
                session_id: existing.session_id,
                explanation: None,
                existing: true,
                animation_status: status,
            });
        }

        let session = match session_id {
            Some(id) => self
                .store
                .ensure_session(id, query, request.user_id.as_deref())?,
            None => self
                .store
                .create_session(query, request.user_id.as_deref())?,
        };

        let mut messages = vec![Message::system(SYSTEM_PROMPT)];
        for exchange in self.store.recent_exchanges(&session.id, self.history_limit)? {
            messages.push(Message::user(exchange.user_query));
            messages.push(Message::assistant(exchange.explanation));
        }
        messages.push(Message::user(query));
        debug!(
            "Sending {} messages to {} for session {}",
            messages.len(),
            self.chat.model(),
            session.id
        );

        let explanation = self.chat.complete(&messages, self.options).await?;
        let chunks = process_text_into_chunks(&explanation, self.skip_chunking);

        let initial_status = if request.generate_animation {
            AnimationStatus::Pending
        } else {
            AnimationStatus::Disabled
        };
        let message = self.store.insert_message(NewMessage {
            session_id: Some(session.id.clone()),
            user_query: query.to_string(),
            ai_response: AiResponse::new(explanation.clone(), chunks),
            animation_status: initial_status,
        })?;

        let status = if request.generate_animation {
            self.dispatch_animation(&message.id).await
        } else {
            initial_status
        };

        Ok(QueryResponse {
            success: true,
            message_id: message.id,
            session_id: Some(session.id),
            explanation: Some(explanation),
            existing: false,
            animation_status: status,
        })
    }

    /// Start generation and report the status the caller should see.
    /// Failures to start are logged, never returned.
    async fn dispatch_animation(&self, message_id: &str) -> AnimationStatus {
        let Some(ref animation) = self.animation else {
            warn!("Animation requested for {} but no animation service is configured", message_id);
            return AnimationStatus::Pending;
        };

        match self.dispatch {
            Dispatch::Background => match animation.start(message_id) {
                Ok(()) => AnimationStatus::Processing,
                Err(e) => {
                    warn!("Could not start animation for {}: {:#}", message_id, e);
                    self.current_status(message_id)
                }
            },
            Dispatch::Inline => match animation.generate_now(message_id).await {
                Ok(outcome) => outcome.status(),
                Err(e) => {
                    warn!("Animation for {} failed: {:#}", message_id, e);
                    self.current_status(message_id)
                }
            },
        }
    }

    fn current_status(&self, message_id: &str) -> AnimationStatus {
        self.store
            .get_message(message_id)
            .ok()
            .flatten()
            .map(|m| m.animation_status)
            .unwrap_or(AnimationStatus::Failed)
    }
}

/// Message safe to show an end user for a failed query.
pub fn user_facing_error(err: &anyhow::Error) -> &'static str {
    if let Some(provider) = err.downcast_ref::<ProviderError>() {
        return match provider {
            ProviderError::ModelAccess(_) => {
                "The system is currently using a model that's not available. \
                 The administrator has been notified."
            }
            ProviderError::MissingConfig(_) => {
                "The system is missing some configuration. The administrator has been notified."
            }
            ProviderError::Api { .. } | ProviderError::EmptyResponse => {
                "There was an issue connecting to our AI service. \
                 Please try again in a few moments."
            }
        };
    }
    if err.downcast_ref::<ChatError>().is_some() {
        return "Query is required";
    }
    "Sorry, I couldn't process your request. Please try again."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::codegen::tests::ScriptedChat;
    use crate::animation::tests::{LONG_EXPLANATION, service_with, test_config};
    use crate::llm::Role;
    use wiremock::MockServer;

    fn service(store: &Store, chat: Arc<ScriptedChat>) -> ChatService {
        ChatService::new(store.clone(), chat, None, &Config::default())
    }

    fn request(query: &str, session_id: Option<&str>, animate: bool) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            session_id: session_id.map(str::to_string),
            generate_animation: animate,
            user_id: None,
        }
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let chat = service(&store, ScriptedChat::new(vec![]));
        let err = chat.process_query(request("   ", None, false)).await.unwrap_err();
        assert!(err.downcast_ref::<ChatError>().is_some());
        assert_eq!(user_facing_error(&err), "Query is required");
    }

    #[tokio::test]
    async fn new_query_creates_session_and_disabled_message() {
        let store = Store::open_in_memory().unwrap();
        let scripted = ScriptedChat::new(vec![Ok("Gravity pulls.\n\n$F = ma$".to_string())]);
        let chat = service(&store, scripted.clone());

        let response = chat
            .process_query(request("What is gravity?", None, false))
            .await
            .unwrap();

        assert!(!response.existing);
        assert_eq!(response.animation_status, AnimationStatus::Disabled);
        assert_eq!(response.explanation.as_deref(), Some("Gravity pulls.\n\n$F = ma$"));

        let session = store
            .get_session(response.session_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(session.title, "What is gravity?");

        let message = store.require_message(&response.message_id).unwrap();
        assert_eq!(message.ai_response.chunks.len(), 2);

        let prompts = scripted.prompts.lock().unwrap();
        assert_eq!(prompts[0].len(), 2);
        assert_eq!(prompts[0][0].role, Role::System);
    }

    #[tokio::test]
    async fn history_is_sent_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        let scripted = ScriptedChat::new(vec![
            Ok("First answer.".into()),
            Ok("Second answer.".into()),
        ]);
        let chat = service(&store, scripted.clone());

        let first = chat
            .process_query(request("First?", Some("s1"), false))
            .await
            .unwrap();
        assert_eq!(first.session_id.as_deref(), Some("s1"));
        chat.process_query(request("Second?", Some("s1"), false))
            .await
            .unwrap();

        let prompts = scripted.prompts.lock().unwrap();
        let second: Vec<&str> = prompts[1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&second[1..], &["First?", "First answer.", "Second?"]);
    }

    #[tokio::test]
    async fn history_is_capped_by_exchange_count() {
        let store = Store::open_in_memory().unwrap();
        let scripted = ScriptedChat::new(vec![
            Ok("A1.".into()),
            Ok("A2.".into()),
            Ok("A3.".into()),
        ]);
        let mut config = Config::default();
        config.chat.history_limit = 1;
        let chat = ChatService::new(store.clone(), scripted.clone(), None, &config);

        for query in ["Q1?", "Q2?", "Q3?"] {
            chat.process_query(request(query, Some("s1"), false))
                .await
                .unwrap();
        }

        let prompts = scripted.prompts.lock().unwrap();
        let third: Vec<&str> = prompts[2].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&third[1..], &["Q2?", "A2.", "Q3?"]);
    }

    #[tokio::test]
    async fn duplicate_query_short_circuits() {
        let store = Store::open_in_memory().unwrap();
        let scripted = ScriptedChat::new(vec![Ok("Once.".into())]);
        let chat = service(&store, scripted.clone());

        let first = chat
            .process_query(request("Why?", Some("s1"), false))
            .await
            .unwrap();
        let again = chat
            .process_query(request("Why?", Some("s1"), false))
            .await
            .unwrap();

        assert!(again.existing);
        assert_eq!(again.message_id, first.message_id);
        assert!(again.explanation.is_none());
        assert_eq!(scripted.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_with_animation_requeues_and_runs() {
        let server = MockServer::start().await;
        let store = Store::open_in_memory().unwrap();
        let config = test_config(&server.uri());
        let animation = Arc::new(service_with(&store, ScriptedChat::new(vec![]), &config));
        let chat = ChatService::new(
            store.clone(),
            ScriptedChat::new(vec![Ok("Short reply.".into())]),
            Some(animation),
            &config,
        )
        .with_dispatch(Dispatch::Inline);

        let first = chat
            .process_query(request("Hi", Some("s1"), false))
            .await
            .unwrap();
        assert_eq!(first.animation_status, AnimationStatus::Disabled);

        let again = chat
            .process_query(request("Hi", Some("s1"), true))
            .await
            .unwrap();
        assert!(again.existing);
        assert_eq!(again.animation_status, AnimationStatus::Skipped);
        assert_eq!(
            store.require_message(&first.message_id).unwrap().animation_status,
            AnimationStatus::Skipped
        );
    }

    #[tokio::test]
    async fn animated_query_starts_pending_message() {
        let server = MockServer::start().await;
        let store = Store::open_in_memory().unwrap();
        let config = test_config(&server.uri());
        let animation = Arc::new(service_with(&store, ScriptedChat::new(vec![]), &config));
        let chat = ChatService::new(
            store.clone(),
            ScriptedChat::new(vec![Ok(format!("{} I'll help you.", LONG_EXPLANATION))]),
            Some(animation),
            &config,
        );

        let response = chat
            .process_query(request("Explain gravity", None, true))
            .await
            .unwrap();
        assert_eq!(response.animation_status, AnimationStatus::Processing);
    }

    #[tokio::test]
    async fn animation_without_service_stays_pending() {
        let store = Store::open_in_memory().unwrap();
        let chat = service(&store, ScriptedChat::new(vec![Ok("Answer.".into())]));
        let response = chat
            .process_query(request("Q", None, true))
            .await
            .unwrap();
        assert_eq!(response.animation_status, AnimationStatus::Pending);
    }

    #[test]
    fn provider_errors_map_to_friendly_text() {
        let err: anyhow::Error = ProviderError::ModelAccess("gpt-9".into()).into();
        assert!(user_facing_error(&err).contains("model that's not available"));

        let err: anyhow::Error = ProviderError::MissingConfig("OPENAI_API_KEY".into()).into();
        assert!(user_facing_error(&err).contains("missing some configuration"));

        let err: anyhow::Error = ProviderError::Api { status: 500, body: "x".into() }.into();
        assert!(user_facing_error(&err).contains("AI service"));

        assert!(user_facing_error(&anyhow::anyhow!("disk full")).starts_with("Sorry"));
    }

    #[test]
    fn request_accepts_camel_case() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"query":"q","sessionId":"s","generateAnimation":true,"userId":"u"}"#,
        )
        .unwrap();
        assert_eq!(request.session_id.as_deref(), Some("s"));
        assert!(request.generate_animation);
        assert_eq!(request.user_id.as_deref(), Some("u"));
    }
}
