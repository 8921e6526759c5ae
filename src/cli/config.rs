use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::load_config;
use crate::config::DEFAULT_CONFIG_TEMPLATE;
use crate::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., chat.model)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., renderer.base_url)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config_path, &format),
        ConfigCommands::Get { key } => get_config(config_path, &key),
        ConfigCommands::Set { key, value } => set_config(config_path, &key, &value),
        ConfigCommands::Path => show_path(config_path),
        ConfigCommands::Init { force } => init_config(config_path, force),
    }
}

fn config_file(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(p) => Ok(PathBuf::from(shellexpand::tilde(p).to_string())),
        None => Ok(Paths::resolve()?.config_file()),
    }
}

fn show_config(config_path: Option<&str>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(config_path: Option<&str>, key: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(config_path: Option<&str>, key: &str, value: &str) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.set_value(key, value)?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn show_path(config_path: Option<&str>) -> Result<()> {
    println!("{}", config_file(config_path)?.display());
    Ok(())
}

fn init_config(config_path: Option<&str>, force: bool) -> Result<()> {
    let path = config_file(config_path)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}
