mod cli;
mod config;
mod error;
mod mapping;
mod model;
mod providers;
mod sync;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::Args;
use config::RunConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("{}", cli::version_line());
        return Ok(());
    }

    init_logging(args.debug);
    debug!("debug logging enabled");

    // Load config file, then resolve flags > env > file once
    let file_config = config::load_config(&args.config_path())?;
    let run_config = RunConfig::resolve(&args.overrides(), &file_config, &|key: &str| {
        std::env::var(key).ok()
    })
    .context("Invalid configuration")?;

    cli::execute(run_config).await
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("info,snyk_to_azure_boards=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
