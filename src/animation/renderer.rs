//! HTTP client for the external Manim rendering service.
//!
//! `POST {base}/execute-manim` with `{code, messageId, step}` answers
//! `{success, url, error?}`. Rendering can take minutes, so requests carry a
//! long timeout and server-side failures are retried with a growing delay.

use reqwest::{Client, Response, StatusCode, Url, redirect};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;

const HEALTH_PATHS: [&str; 3] = ["/", "/health", "/status"];

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Manim service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Manim service error ({status}) after {attempts} attempts: {body}")]
    Server {
        status: u16,
        body: String,
        attempts: u32,
    },

    #[error("Could not reach Manim service after {attempts} attempts: {message}")]
    Transport { message: String, attempts: u32 },

    #[error("{0}")]
    Service(String),

    #[error("No URL returned from Manim service")]
    MissingUrl,

    #[error("Failed to parse Manim service response: {0}")]
    InvalidResponse(String),
}

impl RenderError {
    fn is_retryable(&self) -> bool {
        matches!(self, RenderError::Server { .. } | RenderError::Transport { .. })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest<'a> {
    code: &'a str,
    message_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    /// Path that answered, when healthy
    pub path: Option<&'static str>,
    pub detail: String,
}

#[derive(Clone)]
pub struct RenderClient {
    client: Client,
    base_url: String,
    execute_path: String,
    request_timeout: Duration,
    health_timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    placeholder_url: String,
}

impl RenderClient {
    pub fn new(config: &RendererConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            execute_path: config.execute_path.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            health_timeout: Duration::from_secs(config.health_timeout_secs),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            placeholder_url: config.placeholder_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn placeholder_url(&self) -> &str {
        &self.placeholder_url
    }

    fn execute_url(&self) -> String {
        format!("{}{}", self.base_url, self.execute_path)
    }

    /// Try the well-known paths in order. Any 2xx, 3xx or 404 means the
    /// service is up.
    pub async fn health_check(&self) -> HealthReport {
        let mut detail = String::new();

        for path in HEALTH_PATHS {
            let url = format!("{}{}", self.base_url, path);
            match self
                .client
                .get(&url)
                .timeout(self.health_timeout)
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success()
                        || status.is_redirection()
                        || status == StatusCode::NOT_FOUND
                    {
                        debug!("Manim service healthy at {} ({})", url, status);
                        return HealthReport {
                            healthy: true,
                            path: Some(path),
                            detail: status.to_string(),
                        };
                    }
                    detail = format!("{} returned {}", url, status);
                }
                Err(e) => detail = format!("{}: {}", url, e),
            }
        }

        HealthReport {
            healthy: false,
            path: None,
            detail,
        }
    }

    /// POST once, following a single redirect by re-posting the same body.
    async fn post_once(&self, url: &str, body: &ExecuteRequest<'_>) -> reqwest::Result<Response> {
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;

        if !response.status().is_redirection() {
            return Ok(response);
        }

        let target = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| response.url().join(loc).ok());

        match target {
            Some(target) => {
                info!("Following redirect to {}", target);
                self.post_to(target, body).await
            }
            None => Ok(response),
        }
    }

    async fn post_to(&self, url: Url, body: &ExecuteRequest<'_>) -> reqwest::Result<Response> {
        self.client
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
    }

    async fn attempt(
        &self,
        url: &str,
        body: &ExecuteRequest<'_>,
        attempts: u32,
    ) -> Result<String, RenderError> {
        let response = self
            .post_once(url, body)
            .await
            .map_err(|e| RenderError::Transport {
                message: e.to_string(),
                attempts,
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenderError::Server {
                status: status.as_u16(),
                body,
                attempts,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| RenderError::InvalidResponse(e.to_string()))?;
        let result: ExecuteResponse = serde_json::from_str(&text)
            .map_err(|e| RenderError::InvalidResponse(e.to_string()))?;

        if result.success == Some(false) {
            return Err(RenderError::Service(
                result
                    .error
                    .unwrap_or_else(|| "Unknown error from Manim service".to_string()),
            ));
        }

        result
            .url
            .filter(|u| !u.is_empty())
            .ok_or(RenderError::MissingUrl)
    }

    /// Render one scene and return the video URL.
    ///
    /// 4xx responses and bad bodies fail immediately; 5xx and transport errors
    /// are retried up to `max_retries` times, sleeping `backoff_base * n`
    /// before retry n.
    pub async fn execute(
        &self,
        code: &str,
        message_id: &str,
        step: Option<u32>,
    ) -> Result<String, RenderError> {
        let url = self.execute_url();
        let body = ExecuteRequest {
            code,
            message_id,
            step,
        };

        let mut retry = 0;
        loop {
            match self.attempt(&url, &body, retry + 1).await {
                Ok(video_url) => return Ok(video_url),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.backoff_base * retry;
                    warn!(
                        "Render of {} step {:?} failed ({}), retry {}/{} in {:?}",
                        message_id, step, e, retry, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
