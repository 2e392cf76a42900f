use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use sweep_bench::config::{generate_example_toml, generate_example_yaml};
use sweep_bench::logging::init_tracing;
use sweep_bench::runner::{self, GridDriver};
use sweep_bench::{CollectionClient, Knob, SweepConfig, TelemetryCollector, TuningRecord};

#[derive(Parser, Debug)]
#[command(name = "sweep_bench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Parameter-sweep benchmarks against a managed vector-database cluster", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, env = "SWEEP_CONFIG", global = true)]
    config: Option<String>,

    /// Parent directory for run artifacts (overrides output.dir)
    #[arg(short, long, env = "SWEEP_OUTPUT_DIR", global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full grid
    Run {
        /// Log the planned cells and exit without touching the cluster
        #[arg(long)]
        dry_run: bool,

        /// Run directory name under the output dir (default: UTC timestamp)
        #[arg(long)]
        run_name: Option<String>,

        /// Skip cells that already succeeded in this run directory
        #[arg(long)]
        resume: bool,
    },

    /// Apply and verify one tuning record, without benchmarking
    Apply(ApplyArgs),

    /// Create the benchmark collection
    Prepare {
        /// Drop the collection first if it exists
        #[arg(long)]
        recreate: bool,
    },

    /// Capture metrics and telemetry endpoints until interrupted
    Telemetry {
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Capture directory (overrides telemetry.dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Print the default configuration
    GenerateConfig {
        #[arg(value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigFormat {
    Yaml,
    Toml,
}

/// Knobs left unset take the first value of the configured grid.
#[derive(clap::Args, Debug)]
struct ApplyArgs {
    #[arg(long, value_name = "N|auto")]
    optimizer_threads: Option<Knob<u32>>,

    #[arg(long, value_name = "N|auto")]
    indexing_threads: Option<Knob<u32>>,

    #[arg(long, value_name = "N|auto")]
    segment_number: Option<Knob<u32>>,

    #[arg(long, value_name = "KB|auto")]
    max_segment_size_kb: Option<Knob<u64>>,

    #[arg(long, value_name = "KB")]
    indexing_threshold_kb: Option<u64>,

    #[arg(long, value_name = "N|auto", allow_hyphen_values = true)]
    cpu_budget: Option<Knob<i64>>,

    #[arg(long)]
    async_scorer: Option<bool>,
}

impl ApplyArgs {
    fn into_record(self, base: TuningRecord) -> TuningRecord {
        TuningRecord {
            optimizer_threads: self.optimizer_threads.unwrap_or(base.optimizer_threads),
            indexing_threads: self.indexing_threads.unwrap_or(base.indexing_threads),
            segment_number: self.segment_number.unwrap_or(base.segment_number),
            max_segment_size_kb: self.max_segment_size_kb.unwrap_or(base.max_segment_size_kb),
            indexing_threshold_kb: self.indexing_threshold_kb.unwrap_or(base.indexing_threshold_kb),
            cpu_budget: self.cpu_budget.unwrap_or(base.cpu_budget),
            async_scorer: self.async_scorer.unwrap_or(base.async_scorer),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::GenerateConfig { format } = cli.command {
        match format {
            ConfigFormat::Yaml => println!("{}", generate_example_yaml()),
            ConfigFormat::Toml => println!("{}", generate_example_toml()),
        }
        return Ok(());
    }

    // Priority: CLI args > env vars > config file > defaults
    let mut config = SweepConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.output_dir {
        config.output.dir = dir;
    }

    let _guard = init_tracing(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "sweep_bench starting");

    let outcome = match cli.command {
        Command::Run {
            dry_run,
            run_name,
            resume,
        } => run(config, dry_run, run_name, resume).await,
        Command::Apply(args) => apply(config, args).await,
        Command::Prepare { recreate } => prepare(config, recreate).await,
        Command::Telemetry { interval_ms, dir } => telemetry(config, interval_ms, dir).await,
        Command::GenerateConfig { .. } => Ok(()),
    };

    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "sweep_bench failed");
    }
    outcome
}

async fn run(mut config: SweepConfig, dry_run: bool, run_name: Option<String>, resume: bool) -> Result<()> {
    config.output.resume |= resume;
    config.validate_for_sweep()?;

    if dry_run {
        let cells = runner::dry_run(&config.grid);
        info!(cells = cells.len(), "dry run complete");
        return Ok(());
    }

    anyhow::ensure!(
        !config.output.resume || run_name.is_some(),
        "resuming needs --run-name to locate the earlier run directory"
    );
    let run_name = run_name.unwrap_or_else(|| Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    let run_dir = config.output.dir.join(&run_name);

    let driver = GridDriver::new(config, &run_dir)?;
    let report = tokio::select! {
        report = driver.run() => report?,
        _ = shutdown_signal() => anyhow::bail!("interrupted; partial results in {}", run_dir.display()),
    };

    info!(
        run_dir = %run_dir.display(),
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "results written"
    );
    Ok(())
}

async fn apply(config: SweepConfig, args: ApplyArgs) -> Result<()> {
    config.validate_for_sweep()?;
    let base = config
        .grid
        .tuning_records()
        .into_iter()
        .next()
        .unwrap_or_default();
    let record = args.into_record(base);

    let collection = CollectionClient::new(&config.database)?;
    let applier = runner::build_applier(&config, collection)?;
    applier
        .apply(&record)
        .await
        .with_context(|| format!("Failed to apply {record}"))?;
    info!(tuning = %record, "tuning applied and verified");
    Ok(())
}

async fn prepare(config: SweepConfig, recreate: bool) -> Result<()> {
    let client = CollectionClient::new(&config.database)?;
    client
        .create_collection(&config.prepare, recreate)
        .await
        .with_context(|| format!("Failed to create collection '{}'", client.collection()))?;
    info!(
        collection = client.collection(),
        vector_size = config.prepare.vector_size,
        distance = %config.prepare.distance,
        "collection created"
    );
    Ok(())
}

async fn telemetry(config: SweepConfig, interval_ms: Option<u64>, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir.unwrap_or_else(|| config.telemetry_dir());
    let interval = Duration::from_millis(interval_ms.unwrap_or(config.telemetry.interval_ms).max(1));
    let client = CollectionClient::new(&config.database)?;
    let collector = TelemetryCollector::new(client, config.telemetry.endpoints.clone(), dir, interval)?;
    collector.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
