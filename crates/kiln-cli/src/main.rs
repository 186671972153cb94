//! Kiln CLI - inspect hardware, scan model directories and run generations

mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG still wins when set
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    let format = cli.output;

    match cli.command {
        Commands::Info => commands::info::run(config, format).await,
        Commands::Monitor { count, interval_ms } => {
            commands::monitor::run(config, format, count, interval_ms).await
        }
        Commands::Models {
            dir,
            recursive,
            checksum,
        } => commands::models::run(&dir, recursive, checksum, format).await,
        Commands::Generate { model, prompt, run } => {
            commands::generate::run(config, format, &model, &prompt, &run).await
        }
        Commands::Chat {
            model,
            messages,
            system,
            run,
        } => commands::chat::run(config, format, &model, system, messages, &run).await,
    }
}
