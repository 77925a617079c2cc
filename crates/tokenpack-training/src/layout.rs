use crate::error::TrainingResult;
use crate::job::TrainingJobId;
use std::path::{Path, PathBuf};

/// Filesystem layout for packed datasets and job records inside a workspace.
///
/// Default layout is under `.tokenpack/{datasets,jobs}/<id>/...`
#[derive(Debug, Clone)]
pub struct PackLayout {
    root: PathBuf,
}

impl PackLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn for_workspace_root(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(".tokenpack"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn datasets_dir(&self) -> PathBuf {
        self.root.join("datasets")
    }

    #[must_use]
    pub fn dataset_dir(&self, packed_id: &str) -> PathBuf {
        self.datasets_dir().join(packed_id)
    }

    #[must_use]
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &TrainingJobId) -> PathBuf {
        self.jobs_dir().join(job_id.0.as_str())
    }

    #[must_use]
    pub fn job_record_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    pub fn ensure_dataset_dir(&self, packed_id: &str) -> TrainingResult<PathBuf> {
        let dir = self.dataset_dir(packed_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn ensure_job_dir(&self, job_id: &TrainingJobId) -> TrainingResult<()> {
        std::fs::create_dir_all(self.job_dir(job_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = PackLayout::for_workspace_root(temp.path());
        let id = TrainingJobId("job-1".to_string());

        assert!(layout.root().ends_with(".tokenpack"));
        assert!(layout.dataset_dir("abc").ends_with("datasets/abc"));
        assert!(layout.job_record_path(&id).ends_with("jobs/job-1/job.json"));

        let dir = layout.ensure_dataset_dir("abc").unwrap();
        assert!(dir.is_dir());
    }
}
