//! Command implementations for the tokenpack CLI.

pub mod datasets;
pub mod pack;
pub mod train;
pub mod types;

pub use types::{DatasetsCommand, PackCommand, TrainCommand};

use std::path::PathBuf;
use tokenpack_training::{PackLayout, PipelineConfig};

/// Resolved workspace and configuration shared by every command.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub workspace_root: PathBuf,
    pub config: PipelineConfig,
}

impl CliContext {
    pub fn layout(&self) -> PackLayout {
        PackLayout::for_workspace_root(&self.workspace_root)
    }
}
