//! Pipeline configuration file support.
//!
//! Everything the packer and the training backend need is carried in an
//! explicit [`PipelineConfig`]; nothing is read from process-wide state.

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingResources;
use crate::launcher::LauncherConfig;
use crate::packing::{PackOptions, PackingPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One configuration file as written: only the keys it sets are `Some`.
///
/// Layers merge so that any value a later file sets wins, including values
/// equal to the defaults. Defaults are filled in by [`ConfigLayer::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub packing: PackingLayer,

    #[serde(default)]
    pub training: TrainingLayer,

    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PackingLayer {
    pub block_size: Option<usize>,
    pub primary_field: Option<String>,
    pub labels_field: Option<String>,
    pub strict_field_lengths: Option<bool>,
    pub policy: Option<PackingPolicy>,
    pub tokenizer: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TrainingLayer {
    #[serde(default)]
    pub launcher: LauncherLayer,

    #[serde(default)]
    pub resources: ResourcesLayer,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LauncherLayer {
    pub program: Option<String>,
    pub script: Option<String>,
    pub distributed: Option<bool>,
    pub extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResourcesLayer {
    pub nnodes: Option<u32>,
    pub nproc_per_node: Option<u32>,
}

fn overlay<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

fn apply<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        target.clone_from(v);
    }
}

impl ConfigLayer {
    /// Parse one TOML file without filling defaults.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| TrainingError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Merge a later layer into this one; every key `other` sets wins.
    pub fn merge(&mut self, other: &Self) {
        let (mine, theirs) = (&mut self.packing, &other.packing);
        overlay(&mut mine.block_size, &theirs.block_size);
        overlay(&mut mine.primary_field, &theirs.primary_field);
        overlay(&mut mine.labels_field, &theirs.labels_field);
        overlay(&mut mine.strict_field_lengths, &theirs.strict_field_lengths);
        overlay(&mut mine.policy, &theirs.policy);
        overlay(&mut mine.tokenizer, &theirs.tokenizer);

        let (mine, theirs) = (&mut self.training.launcher, &other.training.launcher);
        overlay(&mut mine.program, &theirs.program);
        overlay(&mut mine.script, &theirs.script);
        overlay(&mut mine.distributed, &theirs.distributed);
        overlay(&mut mine.extra_args, &theirs.extra_args);

        let (mine, theirs) = (&mut self.training.resources, &other.training.resources);
        overlay(&mut mine.nnodes, &theirs.nnodes);
        overlay(&mut mine.nproc_per_node, &theirs.nproc_per_node);

        self.training.env.extend(other.training.env.clone());
        overlay(&mut self.log_level, &other.log_level);
    }

    /// Fill unset keys with defaults and validate the result.
    pub fn resolve(&self) -> TrainingResult<PipelineConfig> {
        let mut config = PipelineConfig::default();

        let (options, packing) = (&mut config.packing.options, &self.packing);
        apply(&mut options.block_size, &packing.block_size);
        apply(&mut options.primary_field, &packing.primary_field);
        apply(&mut options.labels_field, &packing.labels_field);
        apply(&mut options.strict_field_lengths, &packing.strict_field_lengths);
        apply(&mut config.packing.policy, &packing.policy);
        config.packing.tokenizer.clone_from(&packing.tokenizer);

        let (launcher, layer) = (&mut config.training.launcher, &self.training.launcher);
        apply(&mut launcher.program, &layer.program);
        apply(&mut launcher.script, &layer.script);
        apply(&mut launcher.distributed, &layer.distributed);
        apply(&mut launcher.extra_args, &layer.extra_args);

        let (resources, layer) = (&mut config.training.resources, &self.training.resources);
        apply(&mut resources.nnodes, &layer.nnodes);
        apply(&mut resources.nproc_per_node, &layer.nproc_per_node);

        config.training.env.clone_from(&self.training.env);
        config.log_level.clone_from(&self.log_level);

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub packing: PackingConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackingConfig {
    #[serde(flatten)]
    pub options: PackOptions,

    #[serde(default)]
    pub policy: PackingPolicy,

    /// Hugging Face `tokenizer.json` used for text inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub resources: TrainingResources,

    /// Environment for the training process (e.g. NCCL/EFA transport tuning).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl PipelineConfig {
    /// Load and validate a single TOML file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        ConfigLayer::load_from_file(path)?.resolve()
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> TrainingResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TrainingError::InvalidConfig(format!("failed to serialize: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        self.packing.options.validate()?;
        self.packing.policy.validate()?;
        if self.training.launcher.program.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("training.launcher.program is required".to_string()));
        }
        if self.training.resources.nnodes == 0 || self.training.resources.nproc_per_node == 0 {
            return Err(TrainingError::InvalidConfig("training.resources must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Get default global configuration file path.
    #[must_use]
    pub fn default_global_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".tokenpack").join("config.toml"))
    }

    /// Get default local configuration file path.
    #[must_use]
    pub fn default_local_path(dir: &Path) -> PathBuf {
        dir.join(".tokenpack.toml")
    }

    /// Read `~/.tokenpack/config.toml` then `<dir>/.tokenpack.toml` into one layer.
    ///
    /// Missing files are skipped; unreadable or unparsable ones are errors.
    pub fn discover_layer(dir: &Path) -> TrainingResult<ConfigLayer> {
        let mut layer = ConfigLayer::default();

        let candidates = Self::default_global_path()
            .into_iter()
            .chain(std::iter::once(Self::default_local_path(dir)));
        for path in candidates {
            if path.is_file() {
                layer.merge(&ConfigLayer::load_from_file(&path)?);
            }
        }

        Ok(layer)
    }

    /// Discover, merge and resolve configuration files, local overriding global.
    pub fn discover_and_load(dir: &Path) -> TrainingResult<Self> {
        Self::discover_layer(dir)?.resolve()
    }
}
