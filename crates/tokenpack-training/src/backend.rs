//! Seam to the external training runtime.
//!
//! Model training, gradient sharding and cloud provisioning all live behind
//! [`TrainingBackend`]; this crate only hands over a packed dataset location
//! and a job spec, then tracks the job through its [`JobHandle`].

use crate::error::TrainingResult;
use crate::job::{TrainingJobId, TrainingJobSpec};
use crate::storage::DatasetLocation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Terminated,
}

/// How a submitted job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { code: Option<i32> },
    Terminated,
}

impl JobOutcome {
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Succeeded => JobStatus::Succeeded,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Terminated => JobStatus::Terminated,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { code: Some(code) } => write!(f, "failed (exit code {code})"),
            Self::Failed { code: None } => f.write_str("failed (killed by signal)"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

#[async_trait]
pub trait JobHandle: Send + Sync {
    fn job_id(&self) -> &TrainingJobId;

    /// Block until the job ends. Calling again returns the recorded outcome.
    async fn wait(&self) -> TrainingResult<JobOutcome>;

    /// Stop the job. A no-op once the job has ended.
    async fn terminate(&self) -> TrainingResult<()>;

    fn status(&self) -> JobStatus;
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn id(&self) -> &'static str;

    async fn submit_training_job(
        &self,
        dataset: &DatasetLocation,
        job: &TrainingJobSpec,
    ) -> TrainingResult<Box<dyn JobHandle>>;
}
