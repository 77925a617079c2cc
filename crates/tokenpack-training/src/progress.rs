use crate::backend::JobOutcome;
use crate::job::TrainingJobId;
use crate::packing::PackStats;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Message { message: String },
    Packed { packed_id: String, stats: PackStats },
    Submitted { job_id: TrainingJobId },
    Finished { job_id: TrainingJobId, outcome: JobOutcome },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message { message } => println!("[tpk] {message}"),
            ProgressEvent::Packed { packed_id, stats } => println!(
                "[tpk:{packed_id}] packed {} blocks, dropped {} of {} tokens",
                stats.blocks, stats.dropped_tokens, stats.total_tokens
            ),
            ProgressEvent::Submitted { job_id } => println!("[train:{job_id}] submitted"),
            ProgressEvent::Finished { job_id, outcome } => println!("[train:{job_id}] finished: {outcome}"),
        }
    }
}

/// Sends progress to `tracing` instead of stdout.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message { message } => info!("{message}"),
            ProgressEvent::Packed { packed_id, stats } => info!(
                packed_id = %packed_id,
                blocks = stats.blocks,
                dropped_tokens = stats.dropped_tokens,
                "packed"
            ),
            ProgressEvent::Submitted { job_id } => info!(%job_id, "training job submitted"),
            ProgressEvent::Finished { job_id, outcome } => info!(%job_id, %outcome, "training job finished"),
        }
    }
}
