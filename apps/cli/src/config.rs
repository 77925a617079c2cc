//! CLI configuration loading and merging.

use anyhow::{Context, Result};
use std::path::Path;
use tokenpack_training::{ConfigLayer, PipelineConfig};

/// Load and merge pipeline configuration.
///
/// Configuration precedence:
/// 1. CLI arguments (applied per command)
/// 2. Explicit `--config` file
/// 3. Local config file (<workspace>/.tokenpack.toml)
/// 4. Global config file (~/.tokenpack/config.toml)
/// 5. Defaults
pub fn load_config(workspace_root: &Path, explicit: Option<&Path>) -> Result<PipelineConfig> {
    let mut layer = PipelineConfig::discover_layer(workspace_root).context("Failed to load configuration")?;

    if let Some(path) = explicit {
        let loaded = ConfigLayer::load_from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        layer.merge(&loaded);
    }

    layer.resolve().context("Invalid configuration")
}
