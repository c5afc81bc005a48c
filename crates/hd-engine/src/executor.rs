//! Trial execution: parameter files, device assignment, runners and
//! objective extraction.

use async_trait::async_trait;
use hd_optimizer::Trial;
use hd_types::{
    insert_flat, lookup_flat, merge_params, ExperimentConfig, TrialError,
    DEFAULT_TRIAL_TIMEOUT_SECS,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const PARAMS_FILE: &str = "params.json";
pub const RESULTS_FILE: &str = "results.json";
/// Environment variable carrying the assigned device to the trial process.
pub const DEVICE_ENV: &str = "HYPERED_DEVICE_ID";

/// Everything a runner needs to know about one trial. Built per trial and
/// passed explicitly; runners never look anything up elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialContext {
    pub trial_number: usize,
    pub experiment_dir: PathBuf,
    pub trial_dir: PathBuf,
    pub params_path: PathBuf,
    pub results_path: PathBuf,
    pub device_id: usize,
}

impl TrialContext {
    pub fn new(experiment_dir: &Path, trial_number: usize, device_id: usize) -> Self {
        let trial_dir = experiment_dir.join(format!("trial-{trial_number:04}"));
        Self {
            trial_number,
            experiment_dir: experiment_dir.to_path_buf(),
            params_path: trial_dir.join(PARAMS_FILE),
            results_path: trial_dir.join(RESULTS_FILE),
            trial_dir,
            device_id,
        }
    }
}

/// Round-robin device counter.
#[derive(Debug)]
pub struct DeviceAssigner {
    next: AtomicUsize,
    device_count: usize,
}

impl DeviceAssigner {
    pub fn new(device_count: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            device_count: device_count.max(1),
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Next device in `0, 1, .., device_count - 1, 0, ..`.
    pub fn assign_device(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.device_count
    }
}

/// Evaluates one trial whose parameter file has already been written and
/// returns the parsed result document.
#[async_trait]
pub trait TrialRunner: Send + Sync {
    async fn run(&self, ctx: &TrialContext, params: &Value) -> Result<Value, TrialError>;
}

/// Runs a shell command built from a template.
///
/// The shell and everything it forks share a fresh process group, which is
/// killed as a whole when the trial times out or its task is dropped.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    template: String,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            cwd: None,
            timeout: Duration::from_secs(DEFAULT_TRIAL_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Option<Self> {
        let mut runner = Self::new(config.binary.clone()?);
        runner.cwd = config.cwd.clone();
        runner.timeout = Duration::from_secs(config.trial_timeout_secs);
        Some(runner)
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Substitute the trial placeholders into the template.
    pub fn render(&self, ctx: &TrialContext) -> String {
        self.template
            .replace("{params_path}", &ctx.params_path.display().to_string())
            .replace("{results_path}", &ctx.results_path.display().to_string())
            .replace("{experiment_dir}", &ctx.experiment_dir.display().to_string())
            .replace("{device_id}", &ctx.device_id.to_string())
    }
}

#[cfg(unix)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line).process_group(0);
    command
}

#[cfg(windows)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

/// Kills the process group led by a trial's shell when dropped.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The shell exited on its own; leave the group alone.
    fn release(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => debug!(pgid, "killed trial process group"),
        Ok(status) => debug!(pgid, code = ?status.code(), "trial process group already gone"),
        Err(e) => warn!(pgid, error = %e, "failed to kill trial process group"),
    }
}

#[cfg(windows)]
fn kill_group(_pgid: u32) {}

#[async_trait]
impl TrialRunner for CommandRunner {
    async fn run(&self, ctx: &TrialContext, _params: &Value) -> Result<Value, TrialError> {
        let command_line = self.render(ctx);

        // A result left over from an earlier run must not be mistaken for this one.
        match tokio::fs::remove_file(&ctx.results_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut command = shell(&command_line);
        command
            .env(DEVICE_ENV, ctx.device_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        debug!(trial = ctx.trial_number, command = %command_line, "spawning trial process");
        let mut child = command.spawn().map_err(|e| TrialError::Spawn {
            command: command_line.clone(),
            message: e.to_string(),
        })?;
        let group = ProcessGroup::new(child.id());

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => {
                group.release();
                status?
            }
            Err(_) => {
                drop(group);
                if let Err(e) = child.kill().await {
                    warn!(
                        trial = ctx.trial_number,
                        error = %e,
                        "failed to kill timed out trial"
                    );
                }
                return Err(TrialError::Timeout {
                    timeout_seconds: self.timeout.as_secs(),
                });
            }
        };

        if !status.success() {
            return Err(TrialError::NonZeroExit {
                code: status.code(),
            });
        }
        read_results(&ctx.results_path).await
    }
}

/// Evaluates trials with an in-process function. The returned document is
/// also written to the trial's result file.
pub struct FnRunner<F> {
    func: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&Value, &TrialContext) -> Result<Value, String> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> TrialRunner for FnRunner<F>
where
    F: Fn(&Value, &TrialContext) -> Result<Value, String> + Send + Sync,
{
    async fn run(&self, ctx: &TrialContext, params: &Value) -> Result<Value, TrialError> {
        let result = (self.func)(params, ctx).map_err(|message| TrialError::Function { message })?;
        write_json(&ctx.results_path, &result).await?;
        Ok(result)
    }
}

pub async fn read_results(path: &Path) -> Result<Value, TrialError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TrialError::ResultMissing {
                path: path.display().to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&text).map_err(|e| TrialError::ResultUnparsable {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// The finite number stored under the (possibly dotted) objective key.
pub fn extract_objective(result: &Value, key: &str) -> Result<f64, TrialError> {
    let value = lookup_flat(result, key).ok_or_else(|| TrialError::ObjectiveMissing {
        key: key.to_string(),
    })?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TrialError::ObjectiveNotNumeric {
            key: key.to_string(),
            value: value.to_string(),
        })
}

async fn write_json(path: &Path, value: &Value) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(std::io::Error::from)?;
    tokio::fs::write(path, bytes).await
}

/// Materializes trials on disk and hands them to a [`TrialRunner`].
///
/// Shared behind an `Arc` so concurrent trials can run on separate tasks.
pub struct TrialExecutor {
    runner: Arc<dyn TrialRunner>,
    devices: DeviceAssigner,
    experiment_dir: PathBuf,
    objective_key: String,
    fixed: Value,
    device_key: Option<String>,
}

impl TrialExecutor {
    pub fn new(runner: Arc<dyn TrialRunner>, config: &ExperimentConfig) -> Self {
        Self {
            runner,
            devices: DeviceAssigner::new(config.device_count),
            experiment_dir: config.experiment_dir(),
            objective_key: config.objective.key.clone(),
            fixed: config.fixed.clone(),
            device_key: config.device_key.clone(),
        }
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    pub fn assign_device(&self) -> usize {
        self.devices.assign_device()
    }

    /// Assign a device and mark the trial running. Call in trial order so
    /// device ids follow trial numbers.
    pub fn prepare(&self, trial: &mut Trial) -> TrialContext {
        let ctx = TrialContext::new(&self.experiment_dir, trial.number, self.assign_device());
        trial.mark_running(ctx.device_id, ctx.trial_dir.clone());
        ctx
    }

    /// Evaluate a prepared trial. Failures are recorded on the trial, never
    /// returned.
    pub async fn execute(&self, mut trial: Trial, ctx: TrialContext) -> Trial {
        info!(
            trial = trial.number,
            device = ctx.device_id,
            params = ?trial.params,
            "dispatching trial"
        );
        match self.evaluate(&trial, &ctx).await {
            Ok(objective) => {
                trial.mark_succeeded(objective);
                info!(
                    trial = trial.number,
                    objective,
                    seconds = ?trial.duration_seconds(),
                    "trial succeeded"
                );
            }
            Err(err) => {
                trial.mark_failed(&err);
                warn!(
                    trial = trial.number,
                    infrastructure = err.is_infrastructure(),
                    seconds = ?trial.duration_seconds(),
                    error = %err,
                    "trial failed"
                );
            }
        }
        trial
    }

    pub async fn run(&self, mut trial: Trial) -> Trial {
        let ctx = self.prepare(&mut trial);
        self.execute(trial, ctx).await
    }

    async fn evaluate(&self, trial: &Trial, ctx: &TrialContext) -> Result<f64, TrialError> {
        tokio::fs::create_dir_all(&ctx.trial_dir).await?;

        let mut document = merge_params(&self.fixed, &trial.params);
        if let Some(key) = &self.device_key {
            insert_flat(&mut document, key, Value::from(ctx.device_id));
        }
        write_json(&ctx.params_path, &document).await?;

        let result = self.runner.run(ctx, &document).await?;
        extract_objective(&result, &self.objective_key)
    }
}
