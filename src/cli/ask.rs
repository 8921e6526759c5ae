use anyhow::Result;
use clap::Args;
use std::sync::Arc;

use crate::animation::AnimationService;
use crate::chat::{ChatService, Dispatch, QueryRequest};
use crate::config::Config;
use crate::store::Store;

#[derive(Args)]
pub struct AskArgs {
    /// The question to explain
    pub question: String,

    /// Continue an existing session
    #[arg(short, long)]
    pub session: Option<String>,

    /// Generate the animation before exiting
    #[arg(short, long)]
    pub animate: bool,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: AskArgs, config: &Config) -> Result<()> {
    let store = Store::open(&config.database_path())?;

    let animation = if args.animate {
        Some(Arc::new(AnimationService::from_config(config, store.clone())?))
    } else {
        None
    };

    // A detached task would die with the process.
    let chat = ChatService::from_config(config, store.clone(), animation)?
        .with_dispatch(Dispatch::Inline);

    let response = chat
        .process_query(QueryRequest {
            query: args.question.clone(),
            session_id: args.session,
            generate_animation: args.animate,
            user_id: None,
        })
        .await?;

    let message = store.require_message(&response.message_id)?;

    match args.format.as_str() {
        "json" => {
            let output = serde_json::json!({
                "question": args.question,
                "response": response,
                "animation_urls": message.animation_urls,
                "animation_error": message.animation_error,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            if response.existing {
                println!("(already answered in this session)");
            }
            println!("{}", message.ai_response.explanation);
            println!();
            println!("Message: {}", response.message_id);
            if let Some(ref session_id) = response.session_id {
                println!("Session: {}", session_id);
            }
            if args.animate {
                println!("Animation: {}", message.animation_status);
                for url in &message.animation_urls {
                    println!("  step {}: {}", url.step, url.url);
                }
                if let Some(ref error) = message.animation_error {
                    println!("  error: {}", error);
                }
            }
        }
    }

    Ok(())
}
