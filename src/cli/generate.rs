use anyhow::Result;
use clap::Args;

use crate::animation::{AnimationOutcome, AnimationService};
use crate::config::Config;
use crate::store::Store;

#[derive(Args)]
pub struct GenerateArgs {
    /// Message to animate
    pub message_id: String,
}

pub async fn run(args: GenerateArgs, config: &Config) -> Result<()> {
    let store = Store::open(&config.database_path())?;
    let service = AnimationService::from_config(config, store)?;

    match service.generate_now(&args.message_id).await? {
        AnimationOutcome::Completed { urls, cached } => {
            println!(
                "Completed{}",
                if cached { " (reused cached animation)" } else { "" }
            );
            for url in urls {
                println!("  step {}: {}", url.step, url.url);
            }
        }
        AnimationOutcome::Skipped { reason } => println!("Skipped: {}", reason),
        AnimationOutcome::Error { reason, urls } => {
            println!("Error: {}", reason);
            for url in urls {
                println!("  step {}: {}", url.step, url.url);
            }
        }
    }

    Ok(())
}
