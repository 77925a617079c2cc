use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::packing::{PackStats, PackingPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const PACKED_MANIFEST_FILE: &str = "packed_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// One packed field, one block per line.
    Column,
    /// Copy of the tokenized records the blocks were packed from.
    TokenizedJsonl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedArtifact {
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Relative to the directory holding the manifest.
    pub path: PathBuf,
    pub sha256: String,
}

/// Manifest describing a packed dataset directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedDatasetManifest {
    pub packed_id: String,
    pub source_dataset_id: DatasetId,
    pub created_at: DateTime<Utc>,
    pub block_size: usize,
    pub primary_field: String,
    pub labels_field: String,
    pub fields: Vec<String>,
    pub blocks: u64,
    #[serde(default)]
    pub stats: PackStats,
    #[serde(default)]
    pub policy: PackingPolicy,
    pub artifacts: Vec<PackedArtifact>,
}

impl PackedDatasetManifest {
    #[must_use]
    pub fn column_artifact(&self, field: &str) -> Option<&PackedArtifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Column && a.field.as_deref() == Some(field))
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the artifact at `root.join(rel_path)` and record it under `rel_path`.
pub fn make_artifact(kind: ArtifactKind, field: Option<String>, root: &Path, rel_path: PathBuf) -> TrainingResult<PackedArtifact> {
    let full = root.join(&rel_path);
    if !full.exists() {
        return Err(TrainingError::Artifact(format!(
            "artifact path does not exist: {}",
            full.display()
        )));
    }

    let hash = sha256_file(&full)?;
    Ok(PackedArtifact { kind, field, path: rel_path, sha256: hash })
}

/// Re-hash an artifact and compare it with the recorded digest.
pub fn verify_artifact(root: &Path, artifact: &PackedArtifact) -> TrainingResult<()> {
    let full = root.join(&artifact.path);
    let actual = sha256_file(&full)
        .map_err(|e| TrainingError::Artifact(format!("cannot read {}: {e}", full.display())))?;
    if actual != artifact.sha256 {
        return Err(TrainingError::Artifact(format!(
            "checksum mismatch for {}: expected {}, found {actual}",
            artifact.path.display(),
            artifact.sha256
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_make_and_verify_artifact() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("col.jsonl"), "[1,2]\n").unwrap();

        let artifact = make_artifact(ArtifactKind::Column, Some("input_ids".to_string()), temp.path(), PathBuf::from("col.jsonl")).unwrap();
        assert_eq!(artifact.sha256.len(), 64);
        verify_artifact(temp.path(), &artifact).unwrap();

        std::fs::write(temp.path().join("col.jsonl"), "[1,3]\n").unwrap();
        assert!(verify_artifact(temp.path(), &artifact).is_err());
    }

    #[test]
    fn test_make_artifact_requires_existing_path() {
        let temp = TempDir::new().unwrap();
        assert!(make_artifact(ArtifactKind::Column, None, temp.path(), PathBuf::from("missing")).is_err());
    }
}
