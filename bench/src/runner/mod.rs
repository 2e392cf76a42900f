//! The sweep control loop.
//!
//! For every tuning record: apply and verify it, reset the dataset to the
//! baseline, wait for green, optionally start background writes, then run the
//! search sub-grid one cell at a time. A failed cell is recorded and skipped;
//! anything that leaves the cluster in an unknown state aborts the run.

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

pub mod executor;
pub mod loader;
pub mod warmup;

pub use executor::{BenchOutput, BenchmarkError, LoadGenerator};
pub use loader::{BackgroundLoader, DataLoader, LoadTarget, LoaderExit};
pub use warmup::{reset_to_baseline, surplus_ids, wait_for_green};

use crate::applier::{ApplierSettings, TuningApplier};
use crate::client::{ClusterClient, CollectionApi, CollectionClient};
use crate::config::SweepConfig;
use crate::grid::{GridCell, GridConfig, SearchParams};
use crate::metrics::reporter::LoaderState;
use crate::metrics::{BenchSummary, CellOutcome, CellRecord, ResultStore};
use crate::tuning::TuningRecord;

/// Counts for a finished sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Already completed in an earlier run (resume)
    pub skipped: usize,
}

impl RunReport {
    fn record(&mut self, outcome: &CellOutcome) {
        match outcome {
            CellOutcome::Succeeded => self.succeeded += 1,
            CellOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Build the applier from configuration.
pub fn build_applier(
    config: &SweepConfig,
    collection: CollectionClient,
) -> Result<TuningApplier<CollectionClient, ClusterClient>> {
    let cluster = ClusterClient::new(&config.cluster, config.database.schema_error_markers.clone())?;
    Ok(TuningApplier::new(
        collection,
        cluster,
        ApplierSettings {
            max_attempts: config.polling.retry_attempts,
            retry_delay: config.polling.retry_delay(),
            health: config.polling.health_poller(),
            healthy_phase: config.cluster.healthy_phase.clone(),
        },
    ))
}

/// Log the cells a run would execute. Touches nothing remote.
pub fn dry_run(grid: &GridConfig) -> Vec<GridCell> {
    let cells = grid.cells();
    for (i, cell) in cells.iter().enumerate() {
        info!(index = i + 1, total = cells.len(), cell = %cell.key(), tuning = %cell.tuning, search = %cell.search, "planned cell");
    }
    cells
}

pub struct GridDriver {
    config: SweepConfig,
    collection: CollectionClient,
    applier: TuningApplier<CollectionClient, ClusterClient>,
    loader: DataLoader,
    generator: LoadGenerator,
    store: ResultStore,
}

impl GridDriver {
    pub fn new(config: SweepConfig, run_dir: &Path) -> Result<Self> {
        config.validate_for_sweep()?;
        let collection = CollectionClient::new(&config.database)?;
        let applier = build_applier(&config, collection.clone())?;
        let loader = DataLoader::from_config(&config.loader)?;
        let generator = LoadGenerator::new(
            &config.benchmark,
            config.benchmark_uri(),
            &config.database.collection,
            config.database.api_key.clone(),
        );
        let store = ResultStore::open(run_dir)?;
        Ok(Self {
            config,
            collection,
            applier,
            loader,
            generator,
            store,
        })
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    fn progress_bar(&self, total: usize) -> Result<ProgressBar> {
        // Only draw when logs are not competing for the terminal.
        if !self.config.output.progress || self.config.logging.file.is_none() {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} cells {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    /// Run every cell of the grid.
    pub async fn run(&self) -> Result<RunReport> {
        let tunings = self.config.grid.tuning_records();
        let searches = self.config.grid.search_params();
        let mut report = RunReport {
            total: tunings.len() * searches.len(),
            ..RunReport::default()
        };
        info!(
            cells = report.total,
            tunings = tunings.len(),
            searches = searches.len(),
            run_dir = %self.store.run_dir().display(),
            "starting sweep"
        );

        let pb = self.progress_bar(report.total)?;
        for (index, tuning) in tunings.iter().enumerate() {
            let pending = self.pending_searches(tuning, &searches)?;
            let done = searches.len() - pending.len();
            report.skipped += done;
            pb.inc(done as u64);
            if pending.is_empty() {
                info!(tuning = %tuning.key(), "all cells already completed; skipping tuning");
                continue;
            }

            pb.set_message(tuning.key());
            let span = info_span!("tuning", index = index + 1, key = %tuning.key());
            self.run_tuning(tuning, &pending, &mut report, &pb)
                .instrument(span)
                .await?;
        }
        pb.finish_with_message("sweep complete");

        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "sweep finished"
        );
        Ok(report)
    }

    fn pending_searches(&self, tuning: &TuningRecord, searches: &[SearchParams]) -> Result<Vec<SearchParams>> {
        let mut pending = Vec::with_capacity(searches.len());
        for search in searches {
            let cell = GridCell {
                tuning: tuning.clone(),
                search: search.clone(),
            };
            if self.config.output.resume && self.store.is_completed(&cell.key())? {
                continue;
            }
            pending.push(search.clone());
        }
        Ok(pending)
    }

    async fn run_tuning(
        &self,
        tuning: &TuningRecord,
        searches: &[SearchParams],
        report: &mut RunReport,
        pb: &ProgressBar,
    ) -> Result<()> {
        info!(%tuning, "applying tuning");
        self.applier
            .apply(tuning)
            .await
            .with_context(|| format!("Failed to apply tuning {}", tuning.key()))?;

        let loader_cfg = &self.config.loader;
        reset_to_baseline(
            &self.collection,
            &self.loader,
            loader_cfg.baseline_rows,
            loader_cfg.id_offset,
            loader_cfg.delete_batch_size,
            &self.store.loader_log(&format!("{}-baseline", tuning.key())),
        )
        .await?;
        wait_for_green(&self.collection, &self.config.polling.green_poller()).await?;

        let mut background = if self.config.writes.enabled {
            let target = LoadTarget::rows(loader_cfg.baseline_rows + self.config.writes.extra_rows);
            let log = self.store.loader_log(&format!("{}-writes", tuning.key()));
            Some(self.loader.spawn(target, &log)?)
        } else {
            None
        };

        let outcome = self
            .run_searches(tuning, searches, &mut background, report, pb)
            .await;

        if let Some(loader) = background {
            let exit = loader
                .stop(Duration::from_secs(loader_cfg.stop_grace_secs))
                .await
                .context("Failed to stop background loader")?;
            info!(?exit, "background writes stopped");
        }
        outcome
    }

    async fn run_searches(
        &self,
        tuning: &TuningRecord,
        searches: &[SearchParams],
        background: &mut Option<BackgroundLoader>,
        report: &mut RunReport,
        pb: &ProgressBar,
    ) -> Result<()> {
        let mut death_reported = false;
        for search in searches {
            let cell = GridCell {
                tuning: tuning.clone(),
                search: search.clone(),
            };
            let loader_state = observe_loader(background, &mut death_reported);
            let outcome = self
                .run_cell(&cell, loader_state)
                .instrument(info_span!("cell", search = %search.key()))
                .await?;
            report.record(&outcome);
            pb.inc(1);
        }
        Ok(())
    }

    async fn point_count(&self) -> Option<u64> {
        match self.collection.collection_info().await {
            Ok(info) => Some(info.points()),
            Err(e) => {
                warn!(error = %e, "failed to sample point count");
                None
            }
        }
    }

    /// Run one benchmark and persist its artifacts. Only persistence errors
    /// are returned; a failed benchmark becomes a failed record.
    async fn run_cell(&self, cell: &GridCell, background_loader: LoaderState) -> Result<CellOutcome> {
        let key = cell.key();
        let paths = self.store.begin_cell(&key)?;

        let started_at = Utc::now();
        let points_before = self.point_count().await;
        let result = self.generator.run(&cell.search, &paths.result, &paths.log).await;
        let points_after = self.point_count().await;
        let finished_at = Utc::now();

        let (outcome, summary) = match result
            .map_err(anyhow::Error::from)
            .and_then(|output| BenchSummary::from_output(&output, self.config.benchmark.latency_unit))
        {
            Ok(summary) => {
                info!(
                    rps = summary.rps_mean,
                    p50_ms = summary.latency.p50_ms,
                    p99_ms = summary.latency.p99_ms,
                    "cell succeeded"
                );
                (CellOutcome::Succeeded, Some(summary))
            }
            Err(e) => {
                warn!(cell = %key, error = %e, "cell failed; continuing");
                (CellOutcome::Failed { reason: format!("{e:#}") }, None)
            }
        };

        let result_file = paths
            .result
            .exists()
            .then(|| format!("{key}.json"));
        let record = CellRecord {
            key,
            attempt: paths.attempt,
            tuning: cell.tuning.clone(),
            search: cell.search.clone(),
            started_at,
            finished_at,
            outcome: outcome.clone(),
            points_before,
            points_after,
            background_loader,
            result_file,
            summary,
        };
        self.store.persist(&record)?;
        Ok(outcome)
    }
}

fn observe_loader(background: &mut Option<BackgroundLoader>, death_reported: &mut bool) -> LoaderState {
    let Some(loader) = background.as_mut() else {
        return LoaderState::Disabled;
    };
    let target_rows = loader.target().rows;
    let status = match loader.try_status() {
        Ok(None) => return LoaderState::Running { target_rows },
        Ok(Some(status)) => Some(status),
        Err(e) => {
            warn!(error = %e, "could not poll background loader");
            None
        }
    };
    if !*death_reported {
        warn!(
            status = ?status,
            target_rows,
            "background loader is no longer running; continuing without concurrent writes"
        );
        *death_reported = true;
    }
    LoaderState::Exited {
        target_rows,
        code: status.and_then(|s| s.code()),
    }
}
