//! Training command implementation.

use super::CliContext;
use crate::commands::types::TrainCommand;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde_json::json;
use tokenpack_training::{
    resolve_packed_dataset, DatasetLocation, JobOutcome, LauncherBackend, ModelSpec, ProgressEvent, ProgressSink,
    StdoutProgressSink, TrainingBackend, TrainingJobSpec,
};
use tracing::warn;

pub async fn execute(ctx: &CliContext, command: TrainCommand) -> Result<()> {
    let dataset = resolve_dataset(ctx, &command.dataset)?;
    let spec = build_job_spec(ctx, &command);
    spec.validate().context("Invalid training job")?;

    let mut launcher = ctx.config.training.launcher.clone();
    if let Some(program) = &command.launcher {
        launcher.program.clone_from(program);
    }
    if let Some(script) = &command.script {
        launcher.script.clone_from(script);
    }
    if command.no_distributed {
        launcher.distributed = false;
    }
    let backend = LauncherBackend::new(launcher, ctx.layout());

    if command.dry_run {
        let launch = backend.build_command(&dataset, &spec);
        if command.json {
            let out = json!({
                "job_id": spec.job_id,
                "dataset": dataset.to_string(),
                "command": launch,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!("{launch}");
        }
        return Ok(());
    }

    let handle = backend
        .submit_training_job(&dataset, &spec)
        .await
        .context("Failed to submit training job")?;
    let job_id = handle.job_id().clone();
    if !command.json {
        StdoutProgressSink.on_event(ProgressEvent::Submitted { job_id: job_id.clone() });
    }

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome: JobOutcome = tokio::select! {
        outcome = &mut wait => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%job_id, "interrupted, terminating training job");
            handle.terminate().await?;
            wait.await?
        }
    };

    if command.json {
        let out = json!({
            "job_id": job_id,
            "dataset": dataset.to_string(),
            "outcome": outcome,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        StdoutProgressSink.on_event(ProgressEvent::Finished { job_id: job_id.clone(), outcome: outcome.clone() });
        let record = ctx.layout().job_record_path(&job_id);
        println!("  Job record: {}", record.display().to_string().dimmed());
    }

    if !outcome.is_success() {
        bail!("Training job {job_id} did not succeed: {outcome}");
    }
    Ok(())
}

fn resolve_dataset(ctx: &CliContext, dataset: &str) -> Result<DatasetLocation> {
    if dataset.starts_with("packed:") {
        let dir = resolve_packed_dataset(&ctx.workspace_root, dataset)
            .with_context(|| format!("Unknown packed dataset '{dataset}'. Run `tpk datasets list`."))?;
        return Ok(DatasetLocation::Local(dir));
    }
    Ok(DatasetLocation::parse(dataset))
}

fn build_job_spec(ctx: &CliContext, command: &TrainCommand) -> TrainingJobSpec {
    let mut spec = TrainingJobSpec::new(ModelSpec {
        provider: command.provider.clone(),
        model_id: command.model.clone(),
    });

    let hp = &mut spec.hyperparams;
    if let Some(v) = command.epochs {
        hp.epochs = v;
    }
    if let Some(v) = command.learning_rate {
        hp.learning_rate = v;
    }
    if let Some(v) = command.batch_size {
        hp.per_device_batch_size = v;
    }
    if let Some(v) = command.gradient_accumulation_steps {
        hp.gradient_accumulation_steps = v;
    }
    if let Some(v) = command.lora_r {
        hp.lora_r = v;
    }
    if let Some(v) = command.lora_alpha {
        hp.lora_alpha = v;
    }
    if let Some(v) = command.lora_dropout {
        hp.lora_dropout = v;
    }
    if let Some(v) = command.seed {
        hp.seed = v;
    }
    hp.max_steps = command.max_steps;
    hp.bf16 = !command.no_bf16;
    hp.gradient_checkpointing = !command.no_gradient_checkpointing;

    spec.resources = ctx.config.training.resources.clone();
    if let Some(v) = command.nnodes {
        spec.resources.nnodes = v;
    }
    if let Some(v) = command.nproc_per_node {
        spec.resources.nproc_per_node = v;
    }

    spec.env = ctx.config.training.env.clone();
    spec.env.extend(command.env.iter().cloned());
    spec.output_dir = command.output_dir.clone();
    spec
}
