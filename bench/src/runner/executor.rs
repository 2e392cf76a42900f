use serde::Deserialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{BenchmarkConfig, LaunchMode};
use crate::grid::SearchParams;
use crate::tuning::Knob;

/// Result file written by the load generator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchOutput {
    /// Requests per second, one sample per reporting window
    #[serde(default)]
    pub rps: Vec<f64>,
    /// Per-request latency samples
    #[serde(default)]
    pub latencies: Vec<f64>,
}

/// Why a benchmark cell produced no usable result.
#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error("failed to prepare benchmark run: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("load generator exited with {status} (log: {})", .log.display())]
    Exit { status: ExitStatus, log: PathBuf },

    #[error("load generator still running after {0:?}; killed")]
    TimedOut(Duration),

    #[error("load generator wrote no result file at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("result file {} is not valid: {reason}", .path.display())]
    InvalidOutput { path: PathBuf, reason: String },

    #[error("result file {} contains no samples", .0.display())]
    EmptyOutput(PathBuf),
}

/// Runs the external search benchmark for one grid cell.
#[derive(Debug, Clone)]
pub struct LoadGenerator {
    config: BenchmarkConfig,
    uri: String,
    collection: String,
    api_key: Option<String>,
}

impl LoadGenerator {
    pub fn new(config: &BenchmarkConfig, uri: &str, collection: &str, api_key: Option<String>) -> Self {
        Self {
            config: config.clone(),
            uri: uri.to_string(),
            collection: collection.to_string(),
            api_key,
        }
    }

    fn tool_flags(&self, params: &SearchParams, json_path: &str) -> Vec<String> {
        let mut flags = vec![
            "--uri".to_string(),
            self.uri.clone(),
            "--collection-name".to_string(),
            self.collection.clone(),
            "--dim".to_string(),
            self.config.dim.to_string(),
            "--skip-create".to_string(),
            "--skip-upload".to_string(),
            "--skip-wait-index".to_string(),
            "--search".to_string(),
            "--parallel".to_string(),
            params.parallel.to_string(),
            "--threads".to_string(),
            params.threads.to_string(),
        ];
        // Auto leaves ef to the server's collection default.
        if let Knob::Value(ef) = params.hnsw_ef {
            flags.push("--search-hnsw-ef".to_string());
            flags.push(ef.to_string());
        }
        flags.extend([
            "--search-limit".to_string(),
            params.search_limit.to_string(),
            "--num-vectors".to_string(),
            self.config.num_vectors.to_string(),
            "--json".to_string(),
            json_path.to_string(),
        ]);
        if let Some(key) = &self.api_key {
            flags.push("--api-key".to_string());
            flags.push(key.clone());
        }
        flags.extend(self.config.extra_args.iter().cloned());
        flags
    }

    /// Container name for the run writing `result_path`, in container mode.
    pub fn container_name(&self, result_path: &Path) -> Option<String> {
        if self.config.launch != LaunchMode::Container {
            return None;
        }
        let stem = result_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
            .collect();
        Some(format!("sweep-{stem}"))
    }

    /// Program and arguments for one invocation writing to `result_path`.
    ///
    /// In container mode the result file's directory is bind-mounted, the
    /// container is named after the cell and the tool receives the
    /// container-side path.
    pub fn command_line(&self, params: &SearchParams, result_path: &Path) -> (String, Vec<String>) {
        match self.config.launch {
            LaunchMode::Direct => (
                self.config.program.clone(),
                self.tool_flags(params, &result_path.to_string_lossy()),
            ),
            LaunchMode::Container => {
                let host_dir = result_path.parent().unwrap_or_else(|| Path::new("."));
                let file_name = result_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let container_dir = self.config.container_results_dir.trim_end_matches('/');

                let mut args = vec!["run".to_string(), "--rm".to_string()];
                if let Some(name) = self.container_name(result_path) {
                    args.push("--name".to_string());
                    args.push(name);
                }
                args.extend(self.config.runtime_args.iter().cloned());
                args.push("-v".to_string());
                args.push(format!("{}:{}", host_dir.display(), container_dir));
                args.push(self.config.image.clone());
                args.extend(self.tool_flags(params, &format!("{container_dir}/{file_name}")));
                (self.config.runtime.clone(), args)
            }
        }
    }

    /// Run the benchmark and parse its result file. Tool output goes to `log_path`.
    pub async fn run(
        &self,
        params: &SearchParams,
        result_path: &Path,
        log_path: &Path,
    ) -> Result<BenchOutput, BenchmarkError> {
        let result_path = absolute(result_path)?;
        let (program, args) = self.command_line(params, &result_path);
        debug!(%program, ?args, "launching load generator");

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(log_path)?;
        let stderr = log.try_clone()?;

        // Killing the runtime client leaves its container running.
        let mut container = self
            .container_name(&result_path)
            .map(|name| ContainerGuard::new(&self.config.runtime, name));
        if let Some(guard) = &container {
            guard.remove().await;
        }

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BenchmarkError::Spawn {
                program: program.clone(),
                source,
            })?;

        let status = match self.config.timeout_secs.map(Duration::from_secs) {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(?limit, "load generator timed out");
                    child.kill().await?;
                    if let Some(guard) = container.take() {
                        guard.remove().await;
                        guard.disarm();
                    }
                    return Err(BenchmarkError::TimedOut(limit));
                }
            },
            None => child.wait().await?,
        };
        if let Some(guard) = container.take() {
            guard.disarm();
        }

        if !status.success() {
            return Err(BenchmarkError::Exit {
                status,
                log: log_path.to_path_buf(),
            });
        }

        let output = read_output(&result_path)?;
        info!(
            rps_samples = output.rps.len(),
            latency_samples = output.latencies.len(),
            "benchmark finished"
        );
        Ok(output)
    }
}

/// Force-removes a named container when dropped before being disarmed.
#[derive(Debug)]
struct ContainerGuard {
    runtime: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: &str, name: String) -> Self {
        Self {
            runtime: runtime.to_string(),
            name,
            armed: true,
        }
    }

    fn remove_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.runtime);
        command
            .args(["rm", "-f", self.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    /// Remove the container and wait for the runtime to confirm.
    async fn remove(&self) {
        match Command::from(self.remove_command()).status().await {
            Ok(status) => debug!(container = %self.name, %status, "container removed"),
            Err(e) => warn!(container = %self.name, error = %e, "failed to remove container"),
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Runs detached; drop happens when the run is cancelled.
        if let Err(e) = self.remove_command().spawn() {
            warn!(container = %self.name, error = %e, "failed to remove container");
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf, BenchmarkError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Parse a load generator result file.
pub fn read_output(path: &Path) -> Result<BenchOutput, BenchmarkError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BenchmarkError::MissingOutput(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let output: BenchOutput =
        serde_json::from_slice(&raw).map_err(|e| BenchmarkError::InvalidOutput {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if output.rps.is_empty() && output.latencies.is_empty() {
        return Err(BenchmarkError::EmptyOutput(path.to_path_buf()));
    }
    Ok(output)
}
