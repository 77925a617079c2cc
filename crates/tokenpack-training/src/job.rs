use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Base model to adapt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Where the weights come from (e.g., "huggingface", "local")
    pub provider: String,
    /// Model ID/name (provider-specific)
    pub model_id: String,
}

/// LoRA fine-tuning hyperparameters handed to the training runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraHyperParams {
    pub seed: u64,
    pub epochs: u32,
    pub learning_rate: f64,
    pub per_device_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub lora_r: u32,
    pub lora_alpha: u32,
    pub lora_dropout: f64,
    pub bf16: bool,
    pub gradient_checkpointing: bool,
    #[serde(default)]
    pub max_steps: Option<u64>,
}

impl Default for LoraHyperParams {
    fn default() -> Self {
        Self {
            seed: 42,
            epochs: 1,
            learning_rate: 2e-4,
            per_device_batch_size: 1,
            gradient_accumulation_steps: 1,
            lora_r: 8,
            lora_alpha: 16,
            lora_dropout: 0.05,
            bf16: true,
            gradient_checkpointing: true,
            max_steps: None,
        }
    }
}

impl LoraHyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidSpec("epochs must be >= 1".to_string()));
        }
        if !(self.learning_rate.is_finite()) || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidSpec("learning_rate must be > 0".to_string()));
        }
        if self.per_device_batch_size == 0 {
            return Err(TrainingError::InvalidSpec("per_device_batch_size must be >= 1".to_string()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TrainingError::InvalidSpec("gradient_accumulation_steps must be >= 1".to_string()));
        }
        if self.lora_r == 0 {
            return Err(TrainingError::InvalidSpec("lora_r must be >= 1".to_string()));
        }
        if self.lora_alpha == 0 {
            return Err(TrainingError::InvalidSpec("lora_alpha must be >= 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(TrainingError::InvalidSpec("lora_dropout must be in [0, 1)".to_string()));
        }
        if self.max_steps == Some(0) {
            return Err(TrainingError::InvalidSpec("max_steps must be >= 1 when set".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingResources {
    pub nnodes: u32,
    pub nproc_per_node: u32,
}

impl Default for TrainingResources {
    fn default() -> Self {
        Self { nnodes: 1, nproc_per_node: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJobSpec {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub base_model: ModelSpec,
    pub hyperparams: LoraHyperParams,
    pub resources: TrainingResources,
    /// Environment applied to the training process only (e.g. transport tuning).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Where the runtime writes adapters/checkpoints, if not its own default.
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl TrainingJobSpec {
    #[must_use]
    pub fn new(base_model: ModelSpec) -> Self {
        Self {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            base_model,
            hyperparams: LoraHyperParams::default(),
            resources: TrainingResources::default(),
            env: BTreeMap::new(),
            output_dir: None,
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.base_model.provider.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("base_model.provider is required".to_string()));
        }
        if self.base_model.model_id.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("base_model.model_id is required".to_string()));
        }
        if self.resources.nnodes == 0 || self.resources.nproc_per_node == 0 {
            return Err(TrainingError::InvalidSpec("nnodes and nproc_per_node must be >= 1".to_string()));
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(TrainingError::InvalidSpec(format!("invalid environment variable name: '{key}'")));
        }
        self.hyperparams.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelSpec {
        ModelSpec { provider: "huggingface".to_string(), model_id: "meta-llama/Llama-2-7b-hf".to_string() }
    }

    #[test]
    fn test_job_spec_validate_requires_base_model_fields() {
        let spec = TrainingJobSpec::new(ModelSpec { provider: "".to_string(), model_id: "".to_string() });
        assert!(spec.validate().is_err());
        assert!(TrainingJobSpec::new(model()).validate().is_ok());
    }

    #[test]
    fn test_hyperparams_reject_out_of_range_values() {
        let bad = [
            LoraHyperParams { epochs: 0, ..Default::default() },
            LoraHyperParams { learning_rate: f64::NAN, ..Default::default() },
            LoraHyperParams { learning_rate: -1.0, ..Default::default() },
            LoraHyperParams { lora_r: 0, ..Default::default() },
            LoraHyperParams { lora_dropout: 1.0, ..Default::default() },
            LoraHyperParams { max_steps: Some(0), ..Default::default() },
        ];
        for params in bad {
            assert!(params.validate().is_err(), "{params:?}");
        }
        assert!(LoraHyperParams::default().validate().is_ok());
    }

    #[test]
    fn test_env_names_are_checked() {
        let mut spec = TrainingJobSpec::new(model());
        spec.env.insert("NCCL_DEBUG".to_string(), "INFO".to_string());
        assert!(spec.validate().is_ok());
        spec.env.insert("A=B".to_string(), "x".to_string());
        assert!(spec.validate().is_err());
    }
}
