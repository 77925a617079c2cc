//! Pack command implementation.

use super::CliContext;
use crate::commands::types::{PackCommand, PolicyArg};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use tokenpack_training::packing::DEFAULT_BATCH_RECORDS;
use tokenpack_training::{
    build_dataset, compute_packed_id, pack_dataset, packed_dataset_ref, write_packed_dataset, DatasetBuildOptions,
    DatasetLocation, DatasetSource, HfTokenizer, PackedDatasetMeta, PackingPolicy, ProgressEvent, ProgressSink,
    StdoutProgressSink, Tokenizer,
};

pub async fn execute(ctx: &CliContext, command: PackCommand) -> Result<()> {
    let mut options = ctx.config.packing.options.clone();
    if let Some(block_size) = command.block_size {
        options.block_size = block_size;
    }
    if let Some(field) = command.primary_field {
        options.primary_field = field;
    }
    if command.strict {
        options.strict_field_lengths = true;
    }
    let policy = resolve_policy(ctx.config.packing.policy, command.policy, command.batch_records);

    // Reject bad options before touching the dataset.
    options.validate().context("Invalid packing options")?;
    policy.validate().context("Invalid packing policy")?;

    // Only local directories can be written.
    let output = match command.output.as_deref().map(DatasetLocation::parse) {
        Some(DatasetLocation::Remote(uri)) => {
            bail!("Cannot write packed datasets to remote location {uri}; pass a local --output directory and upload it separately")
        }
        Some(DatasetLocation::Local(dir)) => Some(dir),
        None => None,
    };

    let source = if let Some(path) = command.tokenized {
        DatasetSource::TokenizedJsonl { path }
    } else if !command.text.is_empty() {
        DatasetSource::TextFiles { paths: command.text }
    } else {
        bail!("Nothing to pack: pass --tokenized <file.jsonl> or --text <path>...");
    };

    let tokenizer = match &source {
        DatasetSource::TextFiles { .. } => {
            let Some(path) = command.tokenizer.or_else(|| ctx.config.packing.tokenizer.clone()) else {
                bail!("--text needs the model's tokenizer: pass --tokenizer <tokenizer.json> or set [packing] tokenizer");
            };
            let tokenizer = HfTokenizer::from_file(&path)
                .with_context(|| format!("Failed to load tokenizer {}", path.display()))?;
            Some(tokenizer)
        }
        DatasetSource::TokenizedJsonl { .. } => None,
    };

    let build_options = DatasetBuildOptions {
        primary_field: options.primary_field.clone(),
        strict_field_lengths: options.strict_field_lengths,
        ..Default::default()
    };
    let (batch, dataset_id) = build_dataset(&source, tokenizer.as_ref().map(|t| t as &dyn Tokenizer), &build_options)
        .context("Failed to load dataset")?;

    let (packed, stats) = pack_dataset(&batch, &options, policy).context("Failed to pack dataset")?;
    let packed_id = compute_packed_id(&dataset_id, &options, policy)?;

    let dir = match output {
        Some(dir) => dir,
        None => ctx.layout().ensure_dataset_dir(&packed_id)?,
    };
    let meta = PackedDatasetMeta { source_dataset_id: dataset_id, stats, policy };
    let manifest = write_packed_dataset(&dir, &packed_id, &packed, &meta, command.keep_tokenized.then_some(&batch))
        .with_context(|| format!("Failed to write packed dataset to {}", dir.display()))?;

    if command.json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    StdoutProgressSink.on_event(ProgressEvent::Packed { packed_id: packed_id.clone(), stats });

    println!();
    println!("{}", "Packed dataset written".bold().green());
    println!("  Ref:        {}", packed_dataset_ref(&packed_id).cyan());
    println!("  Path:       {}", dir.display().to_string().dimmed());
    println!("  Block size: {}", manifest.block_size);
    println!("  Blocks:     {}", manifest.blocks);
    println!("  Fields:     {}", manifest.fields.join(", "));
    if stats.dropped_tokens > 0 {
        println!(
            "  {}",
            format!(
                "Dropped {} trailing tokens that did not fill a block ({} retained).",
                stats.dropped_tokens, stats.retained_tokens
            )
            .yellow()
        );
    }
    println!();
    Ok(())
}

fn resolve_policy(configured: PackingPolicy, requested: Option<PolicyArg>, batch_records: Option<usize>) -> PackingPolicy {
    let configured_records = match configured {
        PackingPolicy::PerBatch { batch_records } => batch_records,
        PackingPolicy::Global => DEFAULT_BATCH_RECORDS,
    };
    let records = batch_records.unwrap_or(configured_records);

    match requested {
        Some(PolicyArg::Global) => PackingPolicy::Global,
        Some(PolicyArg::PerBatch) => PackingPolicy::PerBatch { batch_records: records },
        None => match configured {
            PackingPolicy::Global => PackingPolicy::Global,
            PackingPolicy::PerBatch { .. } => PackingPolicy::PerBatch { batch_records: records },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_policy_precedence() {
        assert_eq!(resolve_policy(PackingPolicy::Global, None, Some(5)), PackingPolicy::Global);
        assert_eq!(
            resolve_policy(PackingPolicy::Global, Some(PolicyArg::PerBatch), None),
            PackingPolicy::PerBatch { batch_records: DEFAULT_BATCH_RECORDS }
        );
        assert_eq!(
            resolve_policy(PackingPolicy::PerBatch { batch_records: 10 }, None, Some(3)),
            PackingPolicy::PerBatch { batch_records: 3 }
        );
        assert_eq!(
            resolve_policy(PackingPolicy::PerBatch { batch_records: 10 }, Some(PolicyArg::Global), None),
            PackingPolicy::Global
        );
    }
}
