pub mod ask;
pub mod config;
pub mod db;
pub mod generate;
pub mod paths;
pub mod render_test;
pub mod serve;
pub mod status;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "visun")]
#[command(
    author,
    version,
    about = "Explains concepts with an LLM and renders step-by-step Manim animations"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "VISUN_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API server
    Serve(serve::ServeArgs),

    /// Ask a single question
    Ask(ask::AskArgs),

    /// Show the animation status of a message
    Status(status::StatusArgs),

    /// Generate the animation for a message in the foreground
    Generate(generate::GenerateArgs),

    /// Check the rendering service and render a test scene
    RenderTest(render_test::RenderTestArgs),

    /// Database administration
    Db(db::DbArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Load from `--config` when given, else the default location.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    Config::load_from(path.map(Path::new))
}
