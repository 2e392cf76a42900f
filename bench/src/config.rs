// bench/src/config.rs
//
// Sweep configuration.
//
// Priority order (highest to lowest):
// 1. Command-line overrides (applied by the binary after load())
// 2. Environment variables (SWEEP__SECTION__KEY)
// 3. Config file (YAML/TOML)
// 4. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::client::DEFAULT_SCHEMA_MARKERS;
use crate::grid::GridConfig;
use crate::poll::Poller;

// ============================================================================
// Main Configuration Structure
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    /// Database endpoint (collection control plane, data port, metrics)
    pub database: DatabaseConfig,

    /// Cluster-lifecycle API
    pub cluster: ClusterConfig,

    /// Collection layout used by `prepare`
    pub prepare: PrepareConfig,

    /// Sweep dimensions
    pub grid: GridConfig,

    /// External load generator
    pub benchmark: BenchmarkConfig,

    /// External data loader
    pub loader: LoaderConfig,

    /// Background writes during benchmarks
    pub writes: WritesConfig,

    /// Retry and wait behaviour
    pub polling: PollingConfig,

    /// Output artifacts
    pub output: OutputConfig,

    /// Telemetry capture
    pub telemetry: TelemetryConfig,

    pub logging: LoggingConfig,
}

// ============================================================================
// Remote Endpoints
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Base URL of the database REST API
    pub url: String,

    /// Sent as the `api-key` header when set
    pub api_key: Option<String>,

    /// Collection under test
    pub collection: String,

    /// Path probed to decide whether the data port is serving
    pub readiness_path: String,

    pub request_timeout_secs: u64,

    /// Response body substrings that mark a 400/422 as a malformed request
    pub schema_error_markers: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:6333".to_string(),
            api_key: None,
            collection: "benchmark".to_string(),
            readiness_path: "/readyz".to_string(),
            request_timeout_secs: 60,
            schema_error_markers: DEFAULT_SCHEMA_MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Base URL of the cluster-lifecycle API
    pub url: String,

    pub account_id: String,

    pub cluster_id: String,

    /// Sent as `Authorization: apikey <key>` when set
    pub api_key: Option<String>,

    /// Phase reported once a rollout has finished (compared case-insensitively)
    pub healthy_phase: String,

    pub request_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/api/cluster/v1".to_string(),
            account_id: String::new(),
            cluster_id: String::new(),
            api_key: None,
            healthy_phase: "Healthy".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrepareConfig {
    pub vector_size: usize,

    /// `Cosine`, `Dot`, `Euclid` or `Manhattan`
    pub distance: String,

    pub on_disk: bool,

    pub datatype: String,

    /// Initial threshold; 0 disables indexing during bulk upload
    pub indexing_threshold_kb: u64,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            vector_size: 768,
            distance: "Cosine".to_string(),
            on_disk: false,
            datatype: "float32".to_string(),
            indexing_threshold_kb: 0,
        }
    }
}

// ============================================================================
// External Processes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// `<runtime> run --rm ... <image> <flags>`
    #[default]
    Container,
    /// `<program> <flags>` on the host
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LatencyUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl LatencyUnit {
    pub fn to_millis(&self, value: f64) -> f64 {
        match self {
            LatencyUnit::Seconds => value * 1000.0,
            LatencyUnit::Milliseconds => value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub launch: LaunchMode,

    /// Container runtime binary (container mode)
    pub runtime: String,

    /// Load generator image (container mode)
    pub image: String,

    /// Arguments placed between `run --rm` and the image
    pub runtime_args: Vec<String>,

    /// Where the results directory is mounted inside the container
    pub container_results_dir: String,

    /// Load generator binary (direct mode)
    pub program: String,

    /// URI handed to the load generator; defaults to `database.url`
    pub uri: Option<String>,

    pub dim: usize,

    /// Number of search requests per cell
    pub num_vectors: u64,

    /// Appended after the generated flags
    pub extra_args: Vec<String>,

    /// Kill the load generator after this long; unset waits indefinitely
    pub timeout_secs: Option<u64>,

    /// Unit of the `latencies` samples in the result file
    pub latency_unit: LatencyUnit,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            launch: LaunchMode::Container,
            runtime: "docker".to_string(),
            image: "qdrant/bfb:latest".to_string(),
            runtime_args: vec!["--network".to_string(), "host".to_string()],
            container_results_dir: "/results".to_string(),
            program: "bfb".to_string(),
            uri: None,
            dim: 768,
            num_vectors: 10_000,
            extra_args: Vec::new(),
            timeout_secs: None,
            latency_unit: LatencyUnit::Seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub program: String,

    pub args: Vec<String>,

    /// Extra `KEY=VALUE` pairs for the loader's environment
    pub env: Vec<String>,

    /// Variable that carries the target row count to the loader
    pub target_env: String,

    pub working_dir: Option<PathBuf>,

    /// Row count every grid cell starts from
    pub baseline_rows: u64,

    /// Loader ids are `id_offset + n` for the n-th point (1-based)
    pub id_offset: u64,

    pub delete_batch_size: usize,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["load_data.py".to_string()],
            env: Vec::new(),
            target_env: "LIMIT_POINTS".to_string(),
            working_dir: None,
            baseline_rows: 1_000_000,
            id_offset: 1_000,
            delete_batch_size: 1_000,
            stop_grace_secs: 30,
        }
    }
}

impl LoaderConfig {
    /// Parsed `env` entries.
    pub fn env_pairs(&self) -> Result<Vec<(String, String)>> {
        self.env
            .iter()
            .map(|entry| {
                let (key, value) = entry
                    .split_once('=')
                    .with_context(|| format!("loader.env entry '{entry}' is not KEY=VALUE"))?;
                anyhow::ensure!(!key.trim().is_empty(), "loader.env entry '{entry}' has an empty key");
                Ok((key.trim().to_string(), value.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WritesConfig {
    /// Run the loader in the background while benchmarks execute
    pub enabled: bool,

    /// Rows to write on top of the baseline
    pub extra_rows: u64,
}

impl Default for WritesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extra_rows: 1_000_000,
        }
    }
}

// ============================================================================
// Polling and Retries
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    /// Interval between cluster health probes
    pub health_interval_ms: u64,

    /// Interval between collection status probes
    pub green_interval_ms: u64,

    /// Delay multiplier after each unsuccessful probe (1.0 = fixed interval)
    pub backoff_multiplier: f64,

    pub max_interval_ms: u64,

    /// Give up waiting for cluster health after this long; unset waits forever
    pub health_timeout_secs: Option<u64>,

    /// Give up waiting for green status after this long; unset waits forever
    pub green_timeout_secs: Option<u64>,

    /// Attempts for each control-plane update
    pub retry_attempts: u32,

    pub retry_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 10_000,
            green_interval_ms: 10_000,
            backoff_multiplier: 1.0,
            max_interval_ms: 60_000,
            health_timeout_secs: None,
            green_timeout_secs: None,
            retry_attempts: 5,
            retry_delay_ms: 10_000,
        }
    }
}

impl PollingConfig {
    pub fn health_poller(&self) -> Poller {
        Poller::fixed(Duration::from_millis(self.health_interval_ms))
            .with_backoff(self.backoff_multiplier, Duration::from_millis(self.max_interval_ms))
            .with_timeout(self.health_timeout_secs.map(Duration::from_secs))
    }

    pub fn green_poller(&self) -> Poller {
        Poller::fixed(Duration::from_millis(self.green_interval_ms))
            .with_backoff(self.backoff_multiplier, Duration::from_millis(self.max_interval_ms))
            .with_timeout(self.green_timeout_secs.map(Duration::from_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ============================================================================
// Output and Telemetry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Parent of every run directory
    pub dir: PathBuf,

    /// Skip cells whose metadata already records success
    pub resume: bool,

    /// Draw a progress bar on stderr
    pub progress: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            resume: false,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Directory name for this endpoint's captures
    pub name: String,

    /// Path on the database endpoint
    pub path: String,

    /// File extension for captures
    pub extension: String,
}

impl EndpointConfig {
    fn new(name: &str, path: &str, extension: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            extension: extension.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub interval_ms: u64,

    /// Defaults to `<output.dir>/telemetry`
    pub dir: Option<PathBuf>,

    pub endpoints: Vec<EndpointConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            dir: None,
            endpoints: vec![
                EndpointConfig::new("metrics", "/metrics", "prom"),
                EndpointConfig::new("sys_metrics", "/sys_metrics", "txt"),
                EndpointConfig::new("telemetry", "/telemetry?details_level=3", "json"),
            ],
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: LogLevel,

    /// Log format (json or text)
    pub format: LogFormat,

    /// Log to file (path, or None for stdout only)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format (for log aggregation)
    Json,
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl SweepConfig {
    /// Load configuration with priority chain:
    /// 1. Environment variables (SWEEP__*)
    /// 2. Config file (if provided)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let defaults = Self::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize defaults")?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SWEEP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to build config")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    /// Checks that apply to every command.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.database.url.trim().is_empty(), "database.url cannot be empty");
        anyhow::ensure!(
            !self.database.collection.trim().is_empty(),
            "database.collection cannot be empty"
        );
        anyhow::ensure!(
            self.database.readiness_path.starts_with('/'),
            "database.readiness_path must start with '/', got '{}'",
            self.database.readiness_path
        );
        anyhow::ensure!(
            self.database.request_timeout_secs > 0,
            "database.request_timeout_secs must be > 0"
        );

        anyhow::ensure!(
            (1..=10).contains(&self.polling.retry_attempts),
            "polling.retry_attempts must be in range [1, 10], got {}",
            self.polling.retry_attempts
        );
        anyhow::ensure!(
            self.polling.health_interval_ms > 0 && self.polling.green_interval_ms > 0,
            "polling intervals must be > 0"
        );
        anyhow::ensure!(
            self.polling.backoff_multiplier.is_finite() && self.polling.backoff_multiplier >= 1.0,
            "polling.backoff_multiplier must be a finite value >= 1.0, got {}",
            self.polling.backoff_multiplier
        );

        anyhow::ensure!(
            self.telemetry.interval_ms > 0,
            "telemetry.interval_ms must be > 0"
        );
        for endpoint in &self.telemetry.endpoints {
            anyhow::ensure!(
                !endpoint.name.is_empty() && !endpoint.name.contains('/'),
                "telemetry endpoint name '{}' must be a plain directory name",
                endpoint.name
            );
            anyhow::ensure!(
                endpoint.path.starts_with('/'),
                "telemetry endpoint path '{}' must start with '/'",
                endpoint.path
            );
        }

        self.loader.env_pairs()?;
        Ok(())
    }

    /// Extra checks for commands that drive the sweep.
    pub fn validate_for_sweep(&self) -> Result<()> {
        anyhow::ensure!(
            !self.cluster.account_id.trim().is_empty(),
            "cluster.account_id must be set"
        );
        anyhow::ensure!(
            !self.cluster.cluster_id.trim().is_empty(),
            "cluster.cluster_id must be set"
        );
        anyhow::ensure!(
            !self.cluster.healthy_phase.trim().is_empty(),
            "cluster.healthy_phase cannot be empty"
        );
        anyhow::ensure!(
            !self.loader.program.trim().is_empty(),
            "loader.program cannot be empty"
        );
        anyhow::ensure!(
            !self.loader.target_env.trim().is_empty(),
            "loader.target_env cannot be empty"
        );
        anyhow::ensure!(
            self.loader.delete_batch_size > 0,
            "loader.delete_batch_size must be > 0"
        );
        anyhow::ensure!(self.benchmark.dim > 0, "benchmark.dim must be > 0");
        match self.benchmark.launch {
            LaunchMode::Container => {
                anyhow::ensure!(!self.benchmark.runtime.is_empty(), "benchmark.runtime cannot be empty");
                anyhow::ensure!(!self.benchmark.image.is_empty(), "benchmark.image cannot be empty");
            }
            LaunchMode::Direct => {
                anyhow::ensure!(!self.benchmark.program.is_empty(), "benchmark.program cannot be empty");
            }
        }
        if self.writes.enabled {
            anyhow::ensure!(
                self.writes.extra_rows > 0,
                "writes.extra_rows must be > 0 when background writes are enabled"
            );
        }
        self.grid.validate()
    }

    pub fn telemetry_dir(&self) -> PathBuf {
        self.telemetry
            .dir
            .clone()
            .unwrap_or_else(|| self.output.dir.join("telemetry"))
    }

    pub fn benchmark_uri(&self) -> &str {
        self.benchmark.uri.as_deref().unwrap_or(&self.database.url)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Default configuration as YAML.
///
/// ```bash
/// sweep_bench generate-config yaml > sweep.yaml
/// ```
pub fn generate_example_yaml() -> String {
    let config = SweepConfig::default();
    match serde_yaml::to_string(&config) {
        Ok(serialized) => serialized,
        Err(error) => format!("# failed to serialize default config to YAML: {error}\n"),
    }
}

/// Default configuration as TOML.
pub fn generate_example_toml() -> String {
    let config = SweepConfig::default();
    match toml::to_string_pretty(&config) {
        Ok(serialized) => serialized,
        Err(error) => format!("# failed to serialize default config to TOML: {error}\n"),
    }
}
