//! HTTP server for Visun
//!
//! Chat queries, animation jobs and session management over JSON. Animation
//! jobs run as detached tasks; clients poll `/api/animation-status`.

use anyhow::Result;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::animation::{AnimationService, RenderClient};
use crate::chat::{ChatError, ChatService, QueryRequest, user_facing_error};
use crate::config::Config;
use crate::llm::ProviderError;
use crate::store::{Store, StoreError};

pub struct Server {
    config: Config,
    state: Arc<AppState>,
}

pub struct AppState {
    pub store: Store,
    pub chat: Option<ChatService>,
    pub animation: Option<Arc<AnimationService>>,
    pub renderer: RenderClient,
}

impl AppState {
    /// Build services from configuration. Missing provider credentials leave
    /// the chat and animation services unset; their routes then answer 500.
    pub fn from_config(config: &Config, store: Store) -> Result<Self> {
        let animation = match AnimationService::from_config(config, store.clone()) {
            Ok(service) => Some(Arc::new(service)),
            Err(e) => {
                warn!("Animation service unavailable: {:#}", e);
                None
            }
        };

        let chat = match ChatService::from_config(config, store.clone(), animation.clone()) {
            Ok(service) => Some(service),
            Err(e) => {
                warn!("Chat service unavailable: {:#}", e);
                None
            }
        };

        Ok(Self {
            store,
            chat,
            animation,
            renderer: RenderClient::new(&config.renderer)?,
        })
    }
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let store = Store::open(&config.database_path())?;
        let state = Arc::new(AppState::from_config(config, store)?);
        Ok(Self {
            config: config.clone(),
            state,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr =
            format!("{}:{}", self.config.server.bind, self.config.server.port).parse()?;

        info!("Starting HTTP server on http://{}", addr);
        info!("Rendering service at {}", self.state.renderer.base_url());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router(self.state.clone())).await?;

        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(health_check))
        .route("/api/chat", post(chat))
        .route("/api/generate-animation", post(generate_animation))
        .route("/api/animation-status", get(animation_status_query))
        .route("/api/animation-status/{message_id}", get(animation_status_path))
        .route("/api/execute-manim", post(execute_manim))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{session_id}", delete(delete_session))
        .route(
            "/api/sessions/{session_id}/messages",
            get(get_session_messages),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// Error response type
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"success": false, "error": self.1}))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        let status = match e.downcast_ref::<StoreError>() {
            Some(StoreError::MessageNotFound(_) | StoreError::SessionNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            Some(StoreError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            None if e.downcast_ref::<ChatError>().is_some() => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError(status, e.to_string())
    }
}

fn missing_config(what: &str) -> AppError {
    let err: anyhow::Error = ProviderError::MissingConfig(what.to_string()).into();
    AppError(
        StatusCode::INTERNAL_SERVER_ERROR,
        user_facing_error(&err).to_string(),
    )
}

fn required(value: Option<String>, message: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError(StatusCode::BAD_REQUEST, message.to_string()))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Visun API is healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn chat(State(state): State<Arc<AppState>>, Json(request): Json<QueryRequest>) -> Response {
    let Some(ref chat) = state.chat else {
        return missing_config("OPENAI_API_KEY").into_response();
    };

    match chat.process_query(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) if e.downcast_ref::<ChatError>().is_some() => AppError::from(e).into_response(),
        Err(e) => {
            warn!("Chat query failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": user_facing_error(&e),
                    "details": format!("{:#}", e),
                })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct MessageIdBody {
    #[serde(default, alias = "messageId")]
    message_id: Option<String>,
}

async fn generate_animation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MessageIdBody>,
) -> Result<Response, AppError> {
    let message_id = required(body.message_id, "Missing messageId parameter")?;
    let Some(ref animation) = state.animation else {
        return Err(missing_config("OPENAI_API_KEY"));
    };

    animation.start(&message_id)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Animation generation started",
            "messageId": message_id,
        })),
    )
        .into_response())
}

fn animation_status(
    state: &AppState,
    message_id: &str,
) -> Result<Json<serde_json::Value>, AppError> {
    let message = state.store.require_message(message_id)?;
    Ok(Json(json!({
        "success": true,
        "status": message.animation_status,
        "url": message.primary_url(),
        "urls": message.animation_urls,
        "error": message.animation_error,
    })))
}

async fn animation_status_query(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageIdBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let message_id = required(query.message_id, "Missing messageId parameter")?;
    animation_status(&state, &message_id)
}

async fn animation_status_path(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    animation_status(&state, &message_id)
}

#[derive(Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "messageId")]
    message_id: Option<String>,
    #[serde(default)]
    step: Option<u32>,
}

async fn execute_manim(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> Response {
    let placeholder = state.renderer.placeholder_url();
    let (Some(code), Some(message_id)) = (
        body.code.filter(|c| !c.trim().is_empty()),
        body.message_id.filter(|m| !m.trim().is_empty()),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Missing required parameters: code or messageId",
                "url": placeholder,
            })),
        )
            .into_response();
    };

    let health = state.renderer.health_check().await;
    if !health.healthy {
        warn!("Manim service health check failed: {}", health.detail);
    }

    match state.renderer.execute(&code, &message_id, body.step).await {
        Ok(url) => Json(json!({"success": true, "url": url})).into_response(),
        Err(e) => {
            warn!("Render proxy for {} failed: {}", message_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": format!("Failed to execute Manim: {}", e),
                    "url": placeholder,
                })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct UserQuery {
    #[serde(default, alias = "userId")]
    user_id: Option<String>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = state.store.list_sessions(query.user_id.as_deref())?;
    Ok(Json(json!({"success": true, "sessions": sessions})))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    #[serde(default, alias = "firstMessage")]
    first_message: Option<String>,
    #[serde(default, alias = "userId")]
    user_id: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, AppError> {
    let first_message = required(body.first_message, "Missing first_message parameter")?;
    let session = state
        .store
        .create_session(first_message.trim(), body.user_id.as_deref())?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "session": session})),
    )
        .into_response())
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.delete_session(&session_id)?;
    Ok(Json(json!({"success": true, "deleted": true, "session_id": session_id})))
}

async fn get_session_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.store.get_session(&session_id)?.is_none() {
        return Err(AppError(
            StatusCode::NOT_FOUND,
            "Session not found".to_string(),
        ));
    }
    let messages = state.store.list_messages(&session_id)?;
    Ok(Json(json!({
        "success": true,
        "session_id": session_id,
        "messages": messages,
    })))
}
