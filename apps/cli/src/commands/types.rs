//! Command type definitions shared between main.rs and tests.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyArg {
    /// Pack the whole dataset as one stream
    Global,
    /// Pack every `--batch-records` records independently
    PerBatch,
}

#[derive(Args, Debug, Clone)]
pub struct PackCommand {
    /// Pre-tokenized JSONL file (one `{field: [ids]}` object per line)
    #[arg(long, conflicts_with = "text")]
    pub tokenized: Option<PathBuf>,

    /// Text files or directories to tokenize
    #[arg(long, num_args = 1..)]
    pub text: Vec<PathBuf>,

    /// Hugging Face tokenizer.json for `--text` inputs (overrides config)
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Tokens per block (overrides config)
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Batch-boundary policy (overrides config)
    #[arg(long, value_enum)]
    pub policy: Option<PolicyArg>,

    /// Records per batch for the per-batch policy
    #[arg(long)]
    pub batch_records: Option<usize>,

    /// Field holding the token ids
    #[arg(long)]
    pub primary_field: Option<String>,

    /// Reject records whose fields differ in length
    #[arg(long)]
    pub strict: bool,

    /// Keep a copy of the tokenized records next to the packed columns
    #[arg(long)]
    pub keep_tokenized: bool,

    /// Output directory (defaults to the workspace dataset store); must be local
    #[arg(short, long)]
    pub output: Option<String>,

    /// Output the manifest as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DatasetsCommand {
    /// List packed datasets in the workspace
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show and verify one packed dataset
    Show {
        /// `packed:<id>` reference or dataset directory
        dataset: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TrainCommand {
    /// Packed dataset: `packed:<id>`, a directory, or a remote URI (e.g. s3://...)
    #[arg(long)]
    pub dataset: String,

    /// Base model identifier
    #[arg(long)]
    pub model: String,

    /// Model provider
    #[arg(long, default_value = "huggingface")]
    pub provider: String,

    #[arg(long)]
    pub epochs: Option<u32>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub batch_size: Option<u32>,

    #[arg(long)]
    pub gradient_accumulation_steps: Option<u32>,

    #[arg(long)]
    pub lora_r: Option<u32>,

    #[arg(long)]
    pub lora_alpha: Option<u32>,

    #[arg(long)]
    pub lora_dropout: Option<f64>,

    #[arg(long)]
    pub max_steps: Option<u64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Train in fp32 instead of bf16
    #[arg(long)]
    pub no_bf16: bool,

    #[arg(long)]
    pub no_gradient_checkpointing: bool,

    /// Processes per node (overrides config)
    #[arg(long)]
    pub nproc_per_node: Option<u32>,

    /// Number of nodes (overrides config)
    #[arg(long)]
    pub nnodes: Option<u32>,

    /// Launcher program (overrides config)
    #[arg(long)]
    pub launcher: Option<String>,

    /// Training script (overrides config)
    #[arg(long)]
    pub script: Option<String>,

    /// Do not pass `--nnodes`/`--nproc_per_node` to the launcher
    #[arg(long)]
    pub no_distributed: bool,

    /// Where the runtime writes adapters
    #[arg(long)]
    pub output_dir: Option<String>,

    /// Extra environment for the training process (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Print the launch command without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_key_val(value: &str) -> Result<(String, String), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{value}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{value}'"));
    }
    Ok((key.to_string(), val.to_string()))
}
