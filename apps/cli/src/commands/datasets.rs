//! Packed dataset listing and inspection.

use super::CliContext;
use crate::commands::types::DatasetsCommand;
use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use tokenpack_training::{discover_packed_datasets, read_packed_dataset, resolve_packed_dataset};

pub async fn execute(ctx: &CliContext, command: DatasetsCommand) -> Result<()> {
    match command {
        DatasetsCommand::List { json } => list_datasets(ctx, json).await,
        DatasetsCommand::Show { dataset, json } => show_dataset(ctx, &dataset, json).await,
    }
}

async fn list_datasets(ctx: &CliContext, json_output: bool) -> Result<()> {
    let entries = discover_packed_datasets(&ctx.workspace_root).context("Failed to discover packed datasets")?;

    if json_output {
        let out: Vec<_> = entries
            .into_iter()
            .map(|e| {
                json!({
                    "ref": e.dataset_ref,
                    "path": e.path,
                    "created_at": e.manifest.created_at,
                    "block_size": e.manifest.block_size,
                    "blocks": e.manifest.blocks,
                    "dropped_tokens": e.manifest.stats.dropped_tokens,
                    "source_dataset_id": e.manifest.source_dataset_id.0,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Packed Datasets ({})", entries.len()).bold().cyan());
    println!();

    if entries.is_empty() {
        println!("  {}", "No packed datasets found for this workspace.".dimmed());
        println!();
        println!("  {}", "Tip: run `tpk pack --tokenized <file.jsonl>` to create one.".dimmed());
        return Ok(());
    }

    println!("{:<26} {:>8} {:>10} {}", "Ref", "Block", "Blocks", "Created");
    println!("{}", "─".repeat(72));
    for e in entries {
        println!(
            "{:<26} {:>8} {:>10} {}",
            e.dataset_ref.cyan(),
            e.manifest.block_size,
            e.manifest.blocks,
            e.manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

async fn show_dataset(ctx: &CliContext, dataset: &str, json_output: bool) -> Result<()> {
    let dir = if dataset.starts_with("packed:") {
        resolve_packed_dataset(&ctx.workspace_root, dataset)?
    } else {
        PathBuf::from(dataset)
    };

    // Loading verifies column checksums and block shapes.
    let (packed, manifest) = read_packed_dataset(&dir)
        .with_context(|| format!("Failed to load packed dataset at {}", dir.display()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Packed dataset {}", manifest.packed_id).bold().cyan());
    println!("  Path:           {}", dir.display().to_string().dimmed());
    println!("  Source dataset: {}", manifest.source_dataset_id.0.dimmed());
    println!("  Policy:         {:?}", manifest.policy);
    println!("  Block size:     {}", packed.block_size());
    println!("  Blocks:         {}", packed.num_blocks());
    println!("  Fields:         {}", manifest.fields.join(", "));
    println!(
        "  Tokens:         {} total, {} retained, {} dropped",
        manifest.stats.total_tokens, manifest.stats.retained_tokens, manifest.stats.dropped_tokens
    );
    println!("  {}", "Checksums verified".green());
    println!();
    Ok(())
}
