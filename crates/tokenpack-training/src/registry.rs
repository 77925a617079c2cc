use crate::artifacts::{PackedDatasetManifest, PACKED_MANIFEST_FILE};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::PackLayout;
use crate::storage::read_packed_manifest;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A packed dataset discovered in a workspace.
#[derive(Debug, Clone)]
pub struct PackedDatasetEntry {
    /// Reference accepted by the CLI (e.g. `packed:<id>`).
    pub dataset_ref: String,
    pub path: PathBuf,
    pub manifest: PackedDatasetManifest,
}

#[must_use]
pub fn packed_dataset_ref(packed_id: &str) -> String {
    format!("packed:{packed_id}")
}

/// Discover packed datasets by scanning `.tokenpack/datasets/*/packed_manifest.json`.
///
/// Directories with unreadable manifests are skipped with a warning. Entries
/// are ordered by creation time.
pub fn discover_packed_datasets(workspace_root: &Path) -> TrainingResult<Vec<PackedDatasetEntry>> {
    let layout = PackLayout::for_workspace_root(workspace_root);
    let mut out = Vec::new();

    let dir = match std::fs::read_dir(layout.datasets_dir()) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in dir {
        let entry = entry?;
        let dataset_dir = entry.path();
        if !dataset_dir.join(PACKED_MANIFEST_FILE).is_file() {
            continue;
        }
        let manifest = match read_packed_manifest(&dataset_dir) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %dataset_dir.display(), error = %e, "skipping unreadable packed dataset");
                continue;
            }
        };

        out.push(PackedDatasetEntry {
            dataset_ref: packed_dataset_ref(&manifest.packed_id),
            path: dataset_dir,
            manifest,
        });
    }

    out.sort_by(|a, b| a.manifest.created_at.cmp(&b.manifest.created_at));
    Ok(out)
}

/// Resolve a `packed:<id>` reference into the dataset directory.
pub fn resolve_packed_dataset(workspace_root: &Path, dataset_ref: &str) -> TrainingResult<PathBuf> {
    let packed_id = dataset_ref
        .strip_prefix("packed:")
        .filter(|id| !id.is_empty() && !id.contains(['/', '\\']) && *id != "..")
        .ok_or_else(|| TrainingError::InvalidSpec(format!("invalid packed dataset reference: {dataset_ref}")))?;

    let dir = PackLayout::for_workspace_root(workspace_root).dataset_dir(packed_id);
    if !dir.join(PACKED_MANIFEST_FILE).is_file() {
        return Err(TrainingError::InvalidSpec(format!(
            "packed dataset not found (missing manifest): {dataset_ref}"
        )));
    }
    Ok(dir)
}
