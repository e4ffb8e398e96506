//! Image Pipeline CLI - fetch, prefetch and inspect cached images
//!
//! Command-line front end for the staged image pipeline.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;
mod parser;

use commands::fetch::FetchCommand;
use commands::prefetch::PrefetchCommand;
use commands::stats::StatsCommand;

#[derive(Parser)]
#[command(
    name = "imagepipe",
    version,
    about = "Fetch and decode images through memory, disk and network caches",
    after_help = "EXAMPLES:\n  \
                  # Decode an image and save it as PNG\n  \
                  imagepipe fetch https://example.com/cat.jpg --output ./out\n\n  \
                  # Resize, rotate and fetch twice to see the bitmap cache hit\n  \
                  imagepipe fetch --resize 320x240 --rotate 90 --repeat 2 photo.png\n\n  \
                  # Warm the disk cache\n  \
                  imagepipe prefetch --to disk https://example.com/a.png https://example.com/b.png\n\n  \
                  # Show cache statistics using a config file\n  \
                  imagepipe --config pipeline.yaml stats"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Pipeline configuration (YAML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch images and print where each result came from
    Fetch(FetchCommand),

    /// Fill the disk or bitmap cache
    Prefetch(PrefetchCommand),

    /// Print cache statistics
    Stats(StatsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Fetch(cmd) => cmd.execute(config).await,
        Commands::Prefetch(cmd) => cmd.execute(config).await,
        Commands::Stats(cmd) => cmd.execute(config).await,
    }
}
