//! Tokenpack CLI - sequence packing and LoRA job hand-off
//!
//! This CLI provides a `tpk` command that packs tokenized datasets into
//! fixed-size training blocks and submits LoRA fine-tuning jobs to a
//! distributed launcher.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{datasets, pack, train, CliContext, DatasetsCommand, PackCommand, TrainCommand};

/// Tokenpack CLI - sequence packing for LoRA fine-tuning
#[derive(Parser, Debug)]
#[command(
    name = "tpk",
    author,
    version,
    about = "Tokenpack - pack tokenized datasets and launch LoRA fine-tuning",
    long_about = "Tokenpack (tpk) concatenates tokenized records and slices them into fixed-size\nblocks for causal language model training, then hands packed datasets to a training runtime."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); defaults to the config file, then info
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Workspace directory (defaults to the current directory)
    #[arg(short = 'w', long, global = true)]
    workspace: Option<PathBuf>,

    /// Configuration file (merged over discovered config files)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack a tokenized dataset into fixed-size blocks
    ///
    /// Concatenates every record field, slices it into `block_size` blocks,
    /// adds a `labels` copy of the primary field and writes the result with a
    /// checksummed manifest.
    Pack(PackCommand),

    /// Inspect packed datasets
    #[command(subcommand)]
    Datasets(DatasetsCommand),

    /// Submit a LoRA fine-tuning job over a packed dataset
    Train(TrainCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let workspace_root = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let config = config::load_config(&workspace_root, args.config.as_deref())?;

    // Initialize tracing
    let log_level = args.log_level.or_else(|| config.log_level.clone()).unwrap_or_else(|| "info".to_string());
    let level = match log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so `--json` output stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let ctx = CliContext { workspace_root, config };

    match args.command {
        Command::Pack(command) => pack::execute(&ctx, command).await?,
        Command::Datasets(command) => datasets::execute(&ctx, command).await?,
        Command::Train(command) => train::execute(&ctx, command).await?,
    }

    Ok(())
}
