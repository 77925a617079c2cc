//! Local distributed-launcher backend.
//!
//! Runs a launcher program such as `torchrun` with the LoRA training script
//! and flags assembled from the job spec. The job's environment map is applied
//! to the child process only.

use crate::backend::{JobHandle, JobOutcome, JobStatus, TrainingBackend};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingJobId, TrainingJobSpec};
use crate::layout::PackLayout;
use crate::storage::DatasetLocation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_script")]
    pub script: String,
    /// Emit `--nnodes`/`--nproc_per_node` before the script.
    #[serde(default = "default_distributed")]
    pub distributed: bool,
    /// Appended verbatim after the generated flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_program() -> String {
    "torchrun".to_string()
}

fn default_script() -> String {
    "train_lora.py".to_string()
}

fn default_distributed() -> bool {
    true
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: default_script(),
            distributed: true,
            extra_args: Vec::new(),
        }
    }
}

/// A fully assembled launcher invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={} ", shell_quote(value))?;
        }
        f.write_str(&shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c)) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// What gets written to `jobs/<job_id>/job.json` on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: TrainingJobSpec,
    pub dataset: DatasetLocation,
    pub command: LaunchCommand,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LauncherBackend {
    config: LauncherConfig,
    layout: PackLayout,
}

impl LauncherBackend {
    #[must_use]
    pub fn new(config: LauncherConfig, layout: PackLayout) -> Self {
        Self { config, layout }
    }

    /// Assemble the launcher invocation for `job` without running it.
    #[must_use]
    pub fn build_command(&self, dataset: &DatasetLocation, job: &TrainingJobSpec) -> LaunchCommand {
        let hp = &job.hyperparams;
        let mut args = Vec::new();

        if self.config.distributed {
            args.extend([
                "--nnodes".to_string(),
                job.resources.nnodes.to_string(),
                "--nproc_per_node".to_string(),
                job.resources.nproc_per_node.to_string(),
            ]);
        }
        args.push(self.config.script.clone());

        let mut flag = |name: &str, value: String| {
            args.push(format!("--{name}"));
            args.push(value);
        };
        flag("model_id", job.base_model.model_id.clone());
        flag("dataset_path", dataset.to_string());
        flag("num_train_epochs", hp.epochs.to_string());
        flag("learning_rate", hp.learning_rate.to_string());
        flag("per_device_train_batch_size", hp.per_device_batch_size.to_string());
        flag("gradient_accumulation_steps", hp.gradient_accumulation_steps.to_string());
        flag("lora_r", hp.lora_r.to_string());
        flag("lora_alpha", hp.lora_alpha.to_string());
        flag("lora_dropout", hp.lora_dropout.to_string());
        flag("seed", hp.seed.to_string());
        if let Some(max_steps) = hp.max_steps {
            flag("max_steps", max_steps.to_string());
        }
        if let Some(output_dir) = &job.output_dir {
            flag("output_dir", output_dir.clone());
        }
        if hp.bf16 {
            args.push("--bf16".to_string());
        }
        if hp.gradient_checkpointing {
            args.push("--gradient_checkpointing".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());

        LaunchCommand { program: self.config.program.clone(), args, env: job.env.clone() }
    }
}

#[async_trait]
impl TrainingBackend for LauncherBackend {
    fn id(&self) -> &'static str {
        "launcher"
    }

    async fn submit_training_job(
        &self,
        dataset: &DatasetLocation,
        job: &TrainingJobSpec,
    ) -> TrainingResult<Box<dyn JobHandle>> {
        job.validate()?;
        if let Some(path) = dataset.as_local() {
            if !path.is_dir() {
                return Err(TrainingError::Backend(format!(
                    "packed dataset directory not found: {}",
                    path.display()
                )));
            }
        }

        let command = self.build_command(dataset, job);
        self.layout.ensure_job_dir(&job.job_id)?;
        let record = JobRecord {
            spec: job.clone(),
            dataset: dataset.clone(),
            command: command.clone(),
            submitted_at: Utc::now(),
        };
        std::fs::write(self.layout.job_record_path(&job.job_id), serde_json::to_string_pretty(&record)?)?;

        let mut launch = Command::new(&command.program);
        launch.args(&command.args).envs(&command.env).stdin(Stdio::null());
        // The launcher leads its own group so its workers can be stopped with it.
        #[cfg(unix)]
        launch.process_group(0);
        let child = launch
            .spawn()
            .map_err(|e| TrainingError::Backend(format!("failed to launch '{}': {e}", command.program)))?;

        info!(job_id = %job.job_id, program = %command.program, dataset = %dataset, "launched training job");
        Ok(Box::new(LauncherJobHandle::new(job.job_id.clone(), child)))
    }
}

/// Handle over a launched child process.
///
/// The waiter owns the child while it waits; `terminate` either kills the
/// job directly or, if a waiter holds it, signals the waiter to kill it.
/// Killing covers the launcher's whole process group, so workers it forked
/// go down with it.
pub struct LauncherJobHandle {
    job_id: TrainingJobId,
    process_group: Option<u32>,
    child: tokio::sync::Mutex<Option<Child>>,
    cancel: Notify,
    outcome: Mutex<Option<JobOutcome>>,
}

impl LauncherJobHandle {
    fn new(job_id: TrainingJobId, child: Child) -> Self {
        Self {
            job_id,
            process_group: child.id(),
            child: tokio::sync::Mutex::new(Some(child)),
            cancel: Notify::new(),
            outcome: Mutex::new(None),
        }
    }

    fn recorded_outcome(&self) -> Option<JobOutcome> {
        self.outcome.lock().ok().and_then(|o| o.clone())
    }

    fn record(&self, outcome: &JobOutcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            slot.get_or_insert_with(|| outcome.clone());
        }
    }
}

/// SIGTERM the launcher's process group, then SIGKILL the launcher itself.
async fn kill_job(job_id: &TrainingJobId, child: &mut Child, process_group: Option<u32>) -> TrainingResult<()> {
    if let Some(pgid) = process_group {
        signal_process_group(job_id, pgid).await;
    }
    child.kill().await?;
    Ok(())
}

#[cfg(unix)]
async fn signal_process_group(job_id: &TrainingJobId, pgid: u32) {
    let result = Command::new("kill")
        .args(["-TERM", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(job_id = %job_id, pgid, %status, "failed to signal launcher process group"),
        Err(e) => warn!(job_id = %job_id, pgid, error = %e, "failed to signal launcher process group"),
    }
}

#[cfg(not(unix))]
async fn signal_process_group(_job_id: &TrainingJobId, _pgid: u32) {}

fn outcome_from_status(status: std::process::ExitStatus) -> JobOutcome {
    if status.success() {
        JobOutcome::Succeeded
    } else {
        JobOutcome::Failed { code: status.code() }
    }
}

#[async_trait]
impl JobHandle for LauncherJobHandle {
    fn job_id(&self) -> &TrainingJobId {
        &self.job_id
    }

    async fn wait(&self) -> TrainingResult<JobOutcome> {
        let mut guard = self.child.lock().await;
        if let Some(outcome) = self.recorded_outcome() {
            return Ok(outcome);
        }
        let Some(child) = guard.as_mut() else {
            return Err(TrainingError::Backend(format!("job {} has no running process", self.job_id)));
        };

        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            () = self.cancel.notified() => None,
        };
        let outcome = match exited {
            Some(status) => outcome_from_status(status),
            None => {
                kill_job(&self.job_id, child, self.process_group).await?;
                JobOutcome::Terminated
            }
        };

        *guard = None;
        self.record(&outcome);
        if !outcome.is_success() {
            warn!(job_id = %self.job_id, %outcome, "training job did not succeed");
        }
        Ok(outcome)
    }

    async fn terminate(&self) -> TrainingResult<()> {
        if self.recorded_outcome().is_some() {
            return Ok(());
        }

        match self.child.try_lock() {
            Ok(mut guard) => {
                let outcome = match guard.as_mut() {
                    Some(child) => match child.try_wait()? {
                        Some(status) => outcome_from_status(status),
                        None => {
                            kill_job(&self.job_id, child, self.process_group).await?;
                            JobOutcome::Terminated
                        }
                    },
                    None => JobOutcome::Terminated,
                };
                *guard = None;
                self.record(&outcome);
            }
            Err(_) => self.cancel.notify_one(),
        }

        info!(job_id = %self.job_id, "terminate requested");
        Ok(())
    }

    fn status(&self) -> JobStatus {
        self.recorded_outcome().map_or(JobStatus::Running, |o| o.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ModelSpec;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn job() -> TrainingJobSpec {
        TrainingJobSpec::new(ModelSpec { provider: "huggingface".to_string(), model_id: "tiny-llama".to_string() })
    }

    fn shell_backend(temp: &TempDir, script_body: &str) -> LauncherBackend {
        let script = temp.path().join("train.sh");
        std::fs::write(&script, script_body).unwrap();
        let config = LauncherConfig {
            program: "sh".to_string(),
            script: script.display().to_string(),
            distributed: false,
            extra_args: Vec::new(),
        };
        LauncherBackend::new(config, PackLayout::for_workspace_root(temp.path()))
    }

    fn dataset(temp: &TempDir) -> DatasetLocation {
        let dir = temp.path().join("packed");
        std::fs::create_dir_all(&dir).unwrap();
        DatasetLocation::Local(dir)
    }

    #[test]
    fn test_build_command_assembles_launcher_flags() {
        let backend = LauncherBackend::new(LauncherConfig::default(), PackLayout::new("/tmp/x".into()));
        let mut spec = job();
        spec.resources.nproc_per_node = 8;
        spec.hyperparams.max_steps = Some(100);
        spec.env.insert("NCCL_PROTO".to_string(), "simple".to_string());

        let cmd = backend.build_command(&DatasetLocation::parse("s3://bucket/packed"), &spec);
        assert_eq!(cmd.program, "torchrun");
        assert_eq!(&cmd.args[..5], ["--nnodes", "1", "--nproc_per_node", "8", "train_lora.py"]);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("--dataset_path s3://bucket/packed"));
        assert!(joined.contains("--lora_r 8"));
        assert!(joined.contains("--max_steps 100"));
        assert!(joined.ends_with("--bf16 --gradient_checkpointing"));
        assert!(cmd.to_string().starts_with("NCCL_PROTO=simple torchrun"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-value"), "plain-value");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote(""), "''");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_and_wait_success_writes_job_record() {
        let temp = TempDir::new().unwrap();
        let backend = shell_backend(&temp, "[ \"$TPK_TEST_VAR\" = hello ] && [ \"$2\" = tiny-llama ]\n");
        let mut spec = job();
        spec.env.insert("TPK_TEST_VAR".to_string(), "hello".to_string());

        let handle = backend.submit_training_job(&dataset(&temp), &spec).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Succeeded);
        assert_eq!(handle.status(), JobStatus::Succeeded);
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Succeeded);

        let record_path = PackLayout::for_workspace_root(temp.path()).job_record_path(&spec.job_id);
        let record: JobRecord = serde_json::from_slice(&std::fs::read(record_path).unwrap()).unwrap();
        assert_eq!(record.spec.job_id, spec.job_id);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exit_code_is_reported() {
        let temp = TempDir::new().unwrap();
        let backend = shell_backend(&temp, "exit 3\n");
        let handle = backend.submit_training_job(&dataset(&temp), &job()).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Failed { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_while_waiting() {
        let temp = TempDir::new().unwrap();
        let backend = shell_backend(&temp, "exec sleep 30\n");
        let handle: Arc<dyn JobHandle> =
            Arc::from(backend.submit_training_job(&dataset(&temp), &job()).await.unwrap());

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.status(), JobStatus::Running);

        handle.terminate().await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Terminated);
        assert_eq!(handle.status(), JobStatus::Terminated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_without_waiter() {
        let temp = TempDir::new().unwrap();
        let backend = shell_backend(&temp, "exec sleep 30\n");
        let handle = backend.submit_training_job(&dataset(&temp), &job()).await.unwrap();

        handle.terminate().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Terminated);
        handle.terminate().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        // Zombies count as gone; the state letter follows the command name.
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()) != Some("Z")
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_stops_forked_workers() {
        let temp = TempDir::new().unwrap();
        let pid_file = temp.path().join("worker.pid");
        let backend = shell_backend(&temp, "sleep 30 &\necho $! > \"$TPK_WORKER_PID_FILE\"\nwait\n");
        let mut spec = job();
        spec.env.insert("TPK_WORKER_PID_FILE".to_string(), pid_file.display().to_string());

        let handle = backend.submit_training_job(&dataset(&temp), &spec).await.unwrap();
        let worker = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(pid) = std::fs::read_to_string(&pid_file).ok().and_then(|s| s.trim().parse::<u32>().ok()) {
                    return pid;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(process_alive(worker));

        handle.terminate().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), JobOutcome::Terminated);

        tokio::time::timeout(Duration::from_secs(10), async {
            while process_alive(worker) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker outlived its terminated launcher");
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_local_dataset() {
        let temp = TempDir::new().unwrap();
        let backend = shell_backend(&temp, "exit 0\n");
        let missing = DatasetLocation::Local(temp.path().join("nope"));
        assert!(backend.submit_training_job(&missing, &job()).await.is_err());
    }
}
