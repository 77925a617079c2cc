use crate::dataset::{compute_dataset_id, validate_dataset, DatasetId, DatasetSource, TokenizedBatch, TokenizedRecord};
use crate::error::{TrainingError, TrainingResult};
use crate::tokenizer::Tokenizer;
use ignore::WalkBuilder;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DatasetBuildOptions {
    pub primary_field: String,
    pub strict_field_lengths: bool,
    pub max_files: usize,
    pub max_records: usize,
    pub max_bytes_per_file: u64,
    pub min_chars_per_file: usize,
    pub include_extensions: Vec<&'static str>,
}

impl Default for DatasetBuildOptions {
    fn default() -> Self {
        Self {
            primary_field: crate::packing::DEFAULT_PRIMARY_FIELD.to_string(),
            strict_field_lengths: false,
            max_files: 10_000,
            max_records: usize::MAX,
            max_bytes_per_file: 64_000_000, // 64MB
            min_chars_per_file: 1,
            include_extensions: vec!["txt", "md", "jsonl", "json", "rs", "py", "toml"],
        }
    }
}

/// Load a tokenized dataset from a `DatasetSource`.
///
/// `text_files` sources go through `tokenizer` and fail without one; pre-tokenized
/// JSONL is read as is.
pub fn build_dataset(
    source: &DatasetSource,
    tokenizer: Option<&dyn Tokenizer>,
    options: &DatasetBuildOptions,
) -> TrainingResult<(TokenizedBatch, DatasetId)> {
    let batch = match source {
        DatasetSource::TokenizedJsonl { path } => read_tokenized_jsonl(path, options)?,
        DatasetSource::TextFiles { paths } => {
            let tokenizer = tokenizer.ok_or_else(|| {
                TrainingError::InvalidConfig("text inputs need a tokenizer (tokenizer.json)".to_string())
            })?;
            build_from_paths(paths, tokenizer, options)?
        }
    };

    validate_dataset(&batch, &options.primary_field, options.strict_field_lengths)?;
    let id = compute_dataset_id(&batch)?;
    debug!(dataset_id = %id, records = batch.num_records(), "built tokenized dataset");
    Ok((batch, id))
}

pub fn write_tokenized_jsonl(path: &Path, batch: &TokenizedBatch) -> TrainingResult<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for idx in 0..batch.num_records() {
        if let Some(record) = batch.record(idx) {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(())
}

pub fn read_tokenized_jsonl(path: &Path, options: &DatasetBuildOptions) -> TrainingResult<TokenizedBatch> {
    let file = std::fs::File::open(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to open {}: {e}", path.display()))
    })?;
    let mut batch = TokenizedBatch::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: TokenizedRecord = serde_json::from_str(line).map_err(|e| {
            TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        batch.push_record(record).map_err(|e| {
            TrainingError::Dataset(format!("jsonl line {}: {}", idx + 1, e))
        })?;
        if batch.num_records() >= options.max_records {
            break;
        }
    }

    Ok(batch)
}

fn build_from_paths(paths: &[PathBuf], tokenizer: &dyn Tokenizer, options: &DatasetBuildOptions) -> TrainingResult<TokenizedBatch> {
    if paths.is_empty() {
        return Err(TrainingError::Dataset("text file paths must not be empty".to_string()));
    }

    let mut files = Vec::new();
    for p in paths {
        if !p.exists() {
            return Err(TrainingError::Dataset(format!("path does not exist: {}", p.display())));
        }
        if p.is_dir() {
            files.extend(collect_text_files(p, options.max_files, options));
        } else {
            files.push(p.clone());
        }
    }

    // De-dup and cap
    files.sort();
    files.dedup();
    files.truncate(options.max_files);

    let mut batch = TokenizedBatch::new();
    for path in &files {
        if batch.num_records() >= options.max_records {
            break;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };

        let content = content.replace("\r\n", "\n");
        if content.chars().count() < options.min_chars_per_file {
            continue;
        }

        batch.push_record(tokenizer.encode_record(&content, &options.primary_field)?)?;
    }

    if batch.is_empty() {
        return Err(TrainingError::Dataset("no records produced (inputs too small or filtered out)".to_string()));
    }

    Ok(batch)
}

fn collect_text_files(root: &Path, max_files: usize, options: &DatasetBuildOptions) -> Vec<PathBuf> {
    let mut files = Vec::new();

    // Use ignore crate for .gitignore support and standard exclusions
    let mut builder = WalkBuilder::new(root);
    builder.follow_links(false);
    builder.add_custom_ignore_filename(".tpkignore");

    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };

        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }

        let path = entry.path();
        if !is_allowed_extension(path, &options.include_extensions) {
            continue;
        }

        // Skip large files
        if let Ok(md) = path.metadata() {
            if md.len() > options.max_bytes_per_file {
                continue;
            }
        }

        files.push(path.to_path_buf());
        if files.len() >= max_files {
            break;
        }
    }

    files
}

fn is_allowed_extension(path: &Path, allowed: &[&'static str]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_lowercase();
    allowed.iter().any(|a| *a == ext)
}
