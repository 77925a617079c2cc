//! Columnar persistence for packed datasets.
//!
//! A packed dataset directory holds `columns/<field>.jsonl` (one block per
//! line) and a `packed_manifest.json` recording shape, token accounting and a
//! sha256 per column.

use crate::artifacts::{make_artifact, verify_artifact, ArtifactKind, PackedDatasetManifest, PACKED_MANIFEST_FILE};
use crate::builders::write_tokenized_jsonl;
use crate::dataset::{DatasetId, TokenizedBatch};
use crate::error::{TrainingError, TrainingResult};
use crate::packing::{Block, PackOptions, PackStats, PackedBatch, PackingPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const COLUMNS_DIR: &str = "columns";
const TOKENIZED_FILE: &str = "tokenized.jsonl";

/// Where a packed dataset lives: a local directory or a remote object-storage URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "location", rename_all = "snake_case")]
pub enum DatasetLocation {
    Local(PathBuf),
    Remote(String),
}

impl DatasetLocation {
    /// `scheme://...` strings are remote URIs, everything else is a local path.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.split_once("://") {
            Some((scheme, rest))
                if !scheme.is_empty()
                    && !rest.is_empty()
                    && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') =>
            {
                Self::Remote(value.to_string())
            }
            _ => Self::Local(PathBuf::from(value)),
        }
    }

    #[must_use]
    pub fn as_local(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            Self::Remote(_) => None,
        }
    }
}

impl std::fmt::Display for DatasetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => path.display().fmt(f),
            Self::Remote(uri) => uri.fmt(f),
        }
    }
}

/// Provenance recorded alongside the packed columns.
#[derive(Debug, Clone)]
pub struct PackedDatasetMeta {
    pub source_dataset_id: DatasetId,
    pub stats: PackStats,
    pub policy: PackingPolicy,
}

/// Identifier of a packed dataset: its source content plus how it was packed.
pub fn compute_packed_id(source: &DatasetId, options: &PackOptions, policy: PackingPolicy) -> TrainingResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(source.0.as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_vec(options)?);
    hasher.update(b"\n");
    hasher.update(serde_json::to_vec(&policy)?);
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..16].to_string())
}

/// Persist `packed` into `dir`, optionally with a copy of the tokenized input.
pub fn write_packed_dataset(
    dir: &Path,
    packed_id: &str,
    packed: &PackedBatch,
    meta: &PackedDatasetMeta,
    tokenized: Option<&TokenizedBatch>,
) -> TrainingResult<PackedDatasetManifest> {
    std::fs::create_dir_all(dir.join(COLUMNS_DIR))?;

    let mut artifacts = Vec::new();
    for (field, blocks) in packed.columns() {
        validate_field_name(field)?;
        let rel = PathBuf::from(COLUMNS_DIR).join(format!("{field}.jsonl"));
        write_column(&dir.join(&rel), blocks)?;
        artifacts.push(make_artifact(ArtifactKind::Column, Some(field.clone()), dir, rel)?);
    }

    if let Some(batch) = tokenized {
        let rel = PathBuf::from(TOKENIZED_FILE);
        write_tokenized_jsonl(&dir.join(&rel), batch)?;
        artifacts.push(make_artifact(ArtifactKind::TokenizedJsonl, None, dir, rel)?);
    }

    let manifest = PackedDatasetManifest {
        packed_id: packed_id.to_string(),
        source_dataset_id: meta.source_dataset_id.clone(),
        created_at: chrono::Utc::now(),
        block_size: packed.block_size(),
        primary_field: packed.primary_field().to_string(),
        labels_field: packed.labels_field().to_string(),
        fields: packed.fields().map(str::to_string).collect(),
        blocks: packed.num_blocks() as u64,
        stats: meta.stats,
        policy: meta.policy,
        artifacts,
    };

    let json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(dir.join(PACKED_MANIFEST_FILE), json)?;

    info!(
        packed_id,
        path = %dir.display(),
        blocks = manifest.blocks,
        fields = manifest.fields.len(),
        "wrote packed dataset"
    );
    Ok(manifest)
}

pub fn read_packed_manifest(dir: &Path) -> TrainingResult<PackedDatasetManifest> {
    let path = dir.join(PACKED_MANIFEST_FILE);
    let bytes = std::fs::read(&path).map_err(|e| {
        TrainingError::Artifact(format!("cannot read manifest {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Load a packed dataset, verifying every column checksum and the block shape.
pub fn read_packed_dataset(dir: &Path) -> TrainingResult<(PackedBatch, PackedDatasetManifest)> {
    let manifest = read_packed_manifest(dir)?;

    let mut columns = BTreeMap::new();
    for field in &manifest.fields {
        let artifact = manifest.column_artifact(field).ok_or_else(|| {
            TrainingError::Artifact(format!("manifest has no column artifact for '{field}'"))
        })?;
        verify_artifact(dir, artifact)?;
        columns.insert(field.clone(), read_column(&dir.join(&artifact.path))?);
    }

    let packed = PackedBatch::from_parts(
        manifest.block_size,
        manifest.primary_field.clone(),
        manifest.labels_field.clone(),
        columns,
    )?;
    if packed.num_blocks() as u64 != manifest.blocks {
        return Err(TrainingError::Artifact(format!(
            "manifest declares {} blocks but columns hold {}",
            manifest.blocks,
            packed.num_blocks()
        )));
    }

    Ok((packed, manifest))
}

fn write_column(path: &Path, blocks: &[Block]) -> TrainingResult<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for block in blocks {
        serde_json::to_writer(&mut out, block)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn read_column(path: &Path) -> TrainingResult<Vec<Block>> {
    let file = std::fs::File::open(path)?;
    let mut blocks = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let block: Block = serde_json::from_str(&line).map_err(|e| {
            TrainingError::Artifact(format!("{} line {}: {e}", path.display(), idx + 1))
        })?;
        blocks.push(block);
    }
    Ok(blocks)
}

fn validate_field_name(field: &str) -> TrainingResult<()> {
    let ok = !field.is_empty()
        && !field.starts_with('.')
        && field.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(TrainingError::Artifact(format!("field name '{field}' cannot be used as a column file name")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TokenizedRecord;
    use crate::packing::pack_batch;
    use tempfile::TempDir;

    fn packed_fixture() -> (TokenizedBatch, PackedBatch, PackStats) {
        let mut record = TokenizedRecord::new();
        record.insert("input_ids".to_string(), (0..10).collect());
        record.insert("attention_mask".to_string(), vec![1; 10]);
        let batch = TokenizedBatch::from_records(vec![record]).unwrap();
        let (packed, stats) = pack_batch(&batch, &PackOptions::with_block_size(4)).unwrap();
        (batch, packed, stats)
    }

    fn meta(stats: PackStats) -> PackedDatasetMeta {
        PackedDatasetMeta {
            source_dataset_id: DatasetId("abc".to_string()),
            stats,
            policy: PackingPolicy::Global,
        }
    }

    #[test]
    fn test_write_then_read_packed_dataset() {
        let temp = TempDir::new().unwrap();
        let (batch, packed, stats) = packed_fixture();

        let manifest = write_packed_dataset(temp.path(), "p1", &packed, &meta(stats), Some(&batch)).unwrap();
        assert_eq!(manifest.blocks, 2);
        assert_eq!(manifest.stats.dropped_tokens, 2);
        assert_eq!(manifest.fields, vec!["attention_mask", "input_ids", "labels"]);
        assert!(temp.path().join("columns/labels.jsonl").exists());
        assert!(temp.path().join(TOKENIZED_FILE).exists());

        let (loaded, loaded_manifest) = read_packed_dataset(temp.path()).unwrap();
        assert_eq!(loaded, packed);
        assert_eq!(loaded_manifest, manifest);
    }

    #[test]
    fn test_read_detects_tampered_column() {
        let temp = TempDir::new().unwrap();
        let (_, packed, stats) = packed_fixture();
        write_packed_dataset(temp.path(), "p1", &packed, &meta(stats), None).unwrap();

        std::fs::write(temp.path().join("columns/labels.jsonl"), "[9,9,9,9]\n[9,9,9,9]\n").unwrap();
        let err = read_packed_dataset(temp.path()).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_zero_block_dataset_roundtrips() {
        let temp = TempDir::new().unwrap();
        let mut record = TokenizedRecord::new();
        record.insert("input_ids".to_string(), vec![1, 2]);
        let batch = TokenizedBatch::from_records(vec![record]).unwrap();
        let (packed, stats) = pack_batch(&batch, &PackOptions::default()).unwrap();

        write_packed_dataset(temp.path(), "empty", &packed, &meta(stats), None).unwrap();
        let (loaded, manifest) = read_packed_dataset(temp.path()).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(manifest.stats.dropped_tokens, 2);
    }

    #[test]
    fn test_rejects_field_names_that_escape_the_directory() {
        assert!(validate_field_name("../evil").is_err());
        assert!(validate_field_name("input_ids").is_ok());
    }

    #[test]
    fn test_packed_id_depends_on_block_size() {
        let source = DatasetId("abc".to_string());
        let a = compute_packed_id(&source, &PackOptions::with_block_size(4), PackingPolicy::Global).unwrap();
        let b = compute_packed_id(&source, &PackOptions::with_block_size(8), PackingPolicy::Global).unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_dataset_location_parse() {
        assert_eq!(
            DatasetLocation::parse("s3://bucket/prefix"),
            DatasetLocation::Remote("s3://bucket/prefix".to_string())
        );
        assert_eq!(
            DatasetLocation::parse("data/packed"),
            DatasetLocation::Local(PathBuf::from("data/packed"))
        );
        assert!(DatasetLocation::parse("/abs/path").as_local().is_some());
    }
}
