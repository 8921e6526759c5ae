use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::store::{Store, schema};

#[derive(Args)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommands,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Create the database and all tables
    Init,

    /// Apply pending schema migrations
    Migrate,

    /// Show row counts and schema version
    Stats,
}

pub async fn run(args: DbArgs, config: &Config) -> Result<()> {
    let path = config.database_path();

    match args.command {
        DbCommands::Init => {
            let existed = path.exists();
            let store = Store::open(&path)?;
            println!(
                "{} database at {} (schema v{})",
                if existed { "Found" } else { "Created" },
                path.display(),
                store.schema_version()?
            );
        }
        DbCommands::Migrate => {
            let store = Store::open(&path)?;
            let applied = store.migrate()?;
            if applied.is_empty() {
                println!("Schema is up to date (v{})", schema::latest_version());
            } else {
                for version in applied {
                    println!("Applied migration v{}", version);
                }
            }
        }
        DbCommands::Stats => {
            let stats = Store::open(&path)?.stats()?;
            println!("Database:       {}", path.display());
            println!("Schema version: {}", stats.schema_version);
            println!("Sessions:       {}", stats.sessions);
            println!("Messages:       {}", stats.messages);
            for (status, count) in &stats.by_status {
                println!("  {:<12} {}", status, count);
            }
            println!("Cache entries:  {}", stats.cache_entries);
            println!("Step code rows: {}", stats.code_rows);
        }
    }

    Ok(())
}
