use anyhow::Result;
use clap::Args;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::store::{ChatMessage, Store};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_LIMIT: Duration = Duration::from_secs(600);

#[derive(Args)]
pub struct StatusArgs {
    /// Message to inspect
    pub message_id: String,

    /// Poll until the animation reaches a terminal status
    #[arg(short, long)]
    pub watch: bool,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: StatusArgs, config: &Config) -> Result<()> {
    let store = Store::open(&config.database_path())?;

    let message = if args.watch {
        poll_until_terminal(&store, &args.message_id, POLL_INTERVAL, POLL_LIMIT).await?
    } else {
        store.require_message(&args.message_id)?
    };

    match args.format.as_str() {
        "json" => {
            let output = serde_json::json!({
                "success": true,
                "status": message.animation_status,
                "url": message.primary_url(),
                "urls": message.animation_urls,
                "error": message.animation_error,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            println!("Status: {}", message.animation_status);
            for url in &message.animation_urls {
                println!("  step {}: {}", url.step, url.url);
            }
            if let Some(ref error) = message.animation_error {
                println!("Error: {}", error);
            }
        }
    }

    Ok(())
}

/// Re-read the message every `interval` until its status is terminal or
/// `limit` has elapsed; returns the last state seen either way.
pub async fn poll_until_terminal(
    store: &Store,
    message_id: &str,
    interval: Duration,
    limit: Duration,
) -> Result<ChatMessage> {
    let started = tokio::time::Instant::now();
    loop {
        let message = store.require_message(message_id)?;
        if message.animation_status.is_terminal() || started.elapsed() >= limit {
            return Ok(message);
        }
        debug!("{} is {}, polling again", message_id, message.animation_status);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::AnimationStatus;
    use crate::store::{AiResponse, AnimationUrl, NewMessage};

    fn insert(store: &Store) -> ChatMessage {
        store
            .insert_message(NewMessage {
                session_id: None,
                user_query: "q".into(),
                ai_response: AiResponse::new("a", vec![]),
                animation_status: AnimationStatus::Pending,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn stops_on_terminal_status() {
        let store = Store::open_in_memory().unwrap();
        let message = insert(&store);
        store.claim(&message.id).unwrap();

        let writer = store.clone();
        let id = message.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer
                .complete(&id, &[AnimationUrl { step: 1, url: "u".into() }])
                .unwrap();
        });

        let seen = poll_until_terminal(
            &store,
            &message.id,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(seen.animation_status, AnimationStatus::Completed);
    }

    #[tokio::test]
    async fn gives_up_after_limit() {
        let store = Store::open_in_memory().unwrap();
        let message = insert(&store);

        let seen = poll_until_terminal(
            &store,
            &message.id,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_eq!(seen.animation_status, AnimationStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_message_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        assert!(
            poll_until_terminal(&store, "nope", Duration::from_millis(1), Duration::ZERO)
                .await
                .is_err()
        );
    }
}
