//! Tokenpack Training
//!
//! Data preparation and job hand-off for LoRA fine-tuning:
//! - Loading tokenized datasets (`TokenizedBatch`, `DatasetSource`)
//! - Packing records into fixed-size causal-LM blocks (`SequencePacker`)
//! - Persisting packed datasets with checksummed manifests
//! - Submitting jobs to an external training runtime (`TrainingBackend`)

pub mod artifacts;
pub mod backend;
pub mod builders;
pub mod config;
pub mod dataset;
pub mod error;
pub mod job;
pub mod launcher;
pub mod layout;
pub mod packing;
pub mod progress;
pub mod registry;
pub mod storage;
pub mod tokenizer;

pub use artifacts::{ArtifactKind, PackedArtifact, PackedDatasetManifest};
pub use backend::{JobHandle, JobOutcome, JobStatus, TrainingBackend};
pub use builders::{build_dataset, read_tokenized_jsonl, write_tokenized_jsonl, DatasetBuildOptions};
pub use config::{ConfigLayer, PackingConfig, PipelineConfig, TrainingConfig};
pub use dataset::{DatasetId, DatasetSource, TokenId, TokenizedBatch, TokenizedRecord};
pub use error::{TrainingError, TrainingResult};
pub use job::{LoraHyperParams, ModelSpec, TrainingJobId, TrainingJobSpec, TrainingResources};
pub use launcher::{LaunchCommand, LauncherBackend, LauncherConfig};
pub use layout::PackLayout;
pub use packing::{
    pack_batch, pack_batches, pack_dataset, Block, PackOptions, PackStats, PackedBatch, PackingPolicy, SequencePacker,
    StreamingPacker,
};
pub use progress::{ProgressEvent, ProgressSink, StdoutProgressSink, TracingProgressSink};
pub use registry::{discover_packed_datasets, packed_dataset_ref, resolve_packed_dataset, PackedDatasetEntry};
pub use storage::{
    compute_packed_id, read_packed_dataset, read_packed_manifest, write_packed_dataset, DatasetLocation,
    PackedDatasetMeta,
};
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
