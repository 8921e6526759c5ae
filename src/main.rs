use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use visun::cli::{self, Cli, Commands};
use visun::config::LoggingConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

/// `RUST_LOG` wins over the config level; `-v` forces debug.
fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) {
    let level = match logging {
        _ if verbose => "debug",
        Some(l) => l.level.as_str(),
        None => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if logging.is_some_and(|l| l.json) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn async_main(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    // `config` and `paths` must not create the config file as a side effect.
    let config = match cli.command {
        Commands::Config(_) | Commands::Paths => None,
        _ => Some(cli::load_config(config_path)),
    };
    init_logging(
        cli.verbose,
        config.as_ref().and_then(|c| c.as_ref().ok()).map(|c| &c.logging),
    );
    let config = || config.unwrap_or_else(|| cli::load_config(config_path));

    match cli.command {
        Commands::Serve(args) => cli::serve::run(args, config()?).await,
        Commands::Ask(args) => cli::ask::run(args, &config()?).await,
        Commands::Status(args) => cli::status::run(args, &config()?).await,
        Commands::Generate(args) => cli::generate::run(args, &config()?).await,
        Commands::RenderTest(args) => cli::render_test::run(args, &config()?).await,
        Commands::Db(args) => cli::db::run(args, &config()?).await,
        Commands::Config(args) => cli::config::run(args, config_path).await,
        Commands::Paths => cli::paths::run(),
    }
}
