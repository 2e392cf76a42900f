//! On-disk layout of a sweep run.
//!
//! ```text
//! <run_dir>/
//!   summary.csv             one row per persisted attempt
//!   cells/<key>.json        raw load generator output
//!   cells/<key>.meta.json   CellRecord
//!   logs/<key>.log          load generator stdout/stderr
//!   logs/loader-*.log       data loader output
//!   superseded/             earlier attempts of cells re-run on resume
//! ```
//!
//! Every artifact is created once and never rewritten. A cell re-run on
//! resume appends a second `summary.csv` row with a higher `attempt`; the
//! row with the highest attempt for a key is current.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::BenchSummary;
use crate::grid::SearchParams;
use crate::tuning::TuningRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CellOutcome {
    Succeeded,
    Failed { reason: String },
}

impl CellOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CellOutcome::Succeeded)
    }

    fn label(&self) -> &'static str {
        match self {
            CellOutcome::Succeeded => "succeeded",
            CellOutcome::Failed { .. } => "failed",
        }
    }
}

/// State of the background loader when a cell started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoaderState {
    Disabled,
    Running { target_rows: u64 },
    Exited { target_rows: u64, code: Option<i32> },
}

/// Metadata persisted next to each cell's raw result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellRecord {
    pub key: String,
    /// 1 for the first attempt at this key in the run directory
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub tuning: TuningRecord,
    pub search: SearchParams,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CellOutcome,
    pub points_before: Option<u64>,
    pub points_after: Option<u64>,
    pub background_loader: LoaderState,
    /// File name of the raw result under `cells/`, when one was produced
    pub result_file: Option<String>,
    pub summary: Option<BenchSummary>,
}

fn first_attempt() -> u32 {
    1
}

/// Flattened view of a [`CellRecord`] for `summary.csv`.
#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    key: &'a str,
    attempt: u32,
    started_at: String,
    finished_at: String,
    optimizer_threads: String,
    indexing_threads: String,
    segment_number: String,
    max_segment_size_kb: String,
    indexing_threshold_kb: u64,
    cpu_budget: String,
    async_scorer: bool,
    parallel: u32,
    threads: u32,
    hnsw_ef: String,
    search_limit: u32,
    outcome: &'static str,
    reason: &'a str,
    points_before: Option<u64>,
    points_after: Option<u64>,
    rps_mean: Option<f64>,
    rps_min: Option<f64>,
    rps_max: Option<f64>,
    latency_samples: Option<u64>,
    latency_mean_ms: Option<f64>,
    latency_p50_ms: Option<f64>,
    latency_p95_ms: Option<f64>,
    latency_p99_ms: Option<f64>,
    latency_max_ms: Option<f64>,
}

impl<'a> From<&'a CellRecord> for SummaryRow<'a> {
    fn from(record: &'a CellRecord) -> Self {
        let t = &record.tuning;
        let s = record.summary.as_ref();
        let reason = match &record.outcome {
            CellOutcome::Succeeded => "",
            CellOutcome::Failed { reason } => reason.as_str(),
        };
        Self {
            key: &record.key,
            attempt: record.attempt,
            started_at: record.started_at.to_rfc3339(),
            finished_at: record.finished_at.to_rfc3339(),
            optimizer_threads: t.optimizer_threads.to_string(),
            indexing_threads: t.indexing_threads.to_string(),
            segment_number: t.segment_number.to_string(),
            max_segment_size_kb: t.max_segment_size_kb.to_string(),
            indexing_threshold_kb: t.indexing_threshold_kb,
            cpu_budget: t.cpu_budget.to_string(),
            async_scorer: t.async_scorer,
            parallel: record.search.parallel,
            threads: record.search.threads,
            hnsw_ef: record.search.hnsw_ef.to_string(),
            search_limit: record.search.search_limit,
            outcome: record.outcome.label(),
            reason,
            points_before: record.points_before,
            points_after: record.points_after,
            rps_mean: s.map(|s| s.rps_mean),
            rps_min: s.map(|s| s.rps_min),
            rps_max: s.map(|s| s.rps_max),
            latency_samples: s.map(|s| s.latency.samples),
            latency_mean_ms: s.map(|s| s.latency.mean_ms),
            latency_p50_ms: s.map(|s| s.latency.p50_ms),
            latency_p95_ms: s.map(|s| s.latency.p95_ms),
            latency_p99_ms: s.map(|s| s.latency.p99_ms),
            latency_max_ms: s.map(|s| s.latency.max_ms),
        }
    }
}

/// Paths for one cell attempt.
#[derive(Debug, Clone)]
pub struct CellPaths {
    /// Attempt number this set of paths belongs to
    pub attempt: u32,
    pub result: PathBuf,
    pub meta: PathBuf,
    pub log: PathBuf,
}

/// Write-once artifact store for one run directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    run_dir: PathBuf,
}

impl ResultStore {
    pub fn open(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let run_dir = run_dir.into();
        for sub in ["cells", "logs"] {
            let dir = run_dir.join(sub);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        info!(run_dir = %run_dir.display(), "result store ready");
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir.join("summary.csv")
    }

    pub fn paths(&self, key: &str) -> CellPaths {
        CellPaths {
            attempt: 1,
            result: self.run_dir.join("cells").join(format!("{key}.json")),
            meta: self.run_dir.join("cells").join(format!("{key}.meta.json")),
            log: self.run_dir.join("logs").join(format!("{key}.log")),
        }
    }

    /// Log file for one loader invocation.
    pub fn loader_log(&self, label: &str) -> PathBuf {
        self.run_dir.join("logs").join(format!("loader-{label}.log"))
    }

    /// Persisted record for `key`, if any.
    pub fn load_record(&self, key: &str) -> Result<Option<CellRecord>> {
        let path = self.paths(key).meta;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse cell record {}", path.display()))?;
        Ok(Some(record))
    }

    /// Whether `key` already has a successful record.
    pub fn is_completed(&self, key: &str) -> Result<bool> {
        Ok(self
            .load_record(key)?
            .is_some_and(|record| record.outcome.is_success()))
    }

    /// Paths for a fresh attempt at `key`. Artifacts of an earlier attempt are
    /// moved to `superseded/` rather than overwritten.
    pub fn begin_cell(&self, key: &str) -> Result<CellPaths> {
        let paths = self.paths(key);
        let stale: Vec<&PathBuf> = [&paths.result, &paths.meta, &paths.log]
            .into_iter()
            .filter(|p| p.exists())
            .collect();
        if !stale.is_empty() {
            let dir = self.run_dir.join("superseded");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
            for path in stale {
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                let target = dir.join(format!("{stamp}-{name}"));
                std::fs::rename(path, &target).with_context(|| {
                    format!("Failed to move {} to {}", path.display(), target.display())
                })?;
                debug!(from = %path.display(), to = %target.display(), "superseded earlier attempt");
            }
        }
        let attempt = self.superseded_records(key)? + 1;
        Ok(CellPaths { attempt, ..paths })
    }

    /// Number of earlier metadata records for `key` under `superseded/`.
    fn superseded_records(&self, key: &str) -> Result<u32> {
        let dir = self.run_dir.join("superseded");
        if !dir.exists() {
            return Ok(0);
        }
        let meta = format!("{key}.meta.json");
        let mut count = 0;
        for entry in std::fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let name = entry?.file_name();
            // Entries are `<stamp>-<file>` and the stamp has no '-'.
            if name.to_string_lossy().split_once('-').is_some_and(|(_, file)| file == meta) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Write the metadata record and append its summary row.
    pub fn persist(&self, record: &CellRecord) -> Result<()> {
        let path = self.paths(&record.key).meta;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(&file, record)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        (&file).write_all(b"\n")?;
        file.sync_all()?;

        self.append_summary(record)
    }

    fn append_summary(&self, record: &CellRecord) -> Result<()> {
        let path = self.summary_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(SummaryRow::from(record))?;
        writer.flush()?;
        Ok(())
    }

    /// Records of every persisted cell, in `summary.csv` order.
    pub fn summary_rows(&self) -> Result<Vec<csv::StringRecord>> {
        let path = self.summary_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_reader(File::open(&path)?);
        reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LatencyMetrics;
    use crate::tuning::Knob;

    fn record(key: &str, outcome: CellOutcome) -> CellRecord {
        let now = Utc::now();
        let summary = outcome.is_success().then(|| BenchSummary {
            rps_samples: 2,
            rps_mean: 150.0,
            rps_min: 100.0,
            rps_max: 200.0,
            latency: LatencyMetrics {
                samples: 10,
                mean_ms: 1.5,
                p50_ms: 1.0,
                p95_ms: 3.0,
                p99_ms: 4.0,
                max_ms: 5.0,
            },
        });
        CellRecord {
            key: key.to_string(),
            attempt: 1,
            tuning: TuningRecord {
                optimizer_threads: Knob::Value(2),
                ..TuningRecord::default()
            },
            search: SearchParams {
                parallel: 4,
                threads: 1,
                hnsw_ef: Knob::Auto,
                search_limit: 10,
            },
            started_at: now,
            finished_at: now,
            outcome,
            points_before: Some(1_000),
            points_after: Some(1_250),
            background_loader: LoaderState::Running { target_rows: 2_000 },
            result_file: Some(format!("{key}.json")),
            summary,
        }
    }

    #[test]
    fn test_persist_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        store.persist(&record("a", CellOutcome::Succeeded)).unwrap();
        assert!(store.persist(&record("a", CellOutcome::Succeeded)).is_err());
        assert!(store.is_completed("a").unwrap());
        assert!(!store.is_completed("b").unwrap());
    }

    #[test]
    fn test_summary_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        store.persist(&record("a", CellOutcome::Succeeded)).unwrap();
        store
            .persist(&record("b", CellOutcome::Failed { reason: "no output".into() }))
            .unwrap();

        let raw = std::fs::read_to_string(store.summary_path()).unwrap();
        assert_eq!(raw.matches("key,started_at").count(), 1);

        let rows = store.summary_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "a");
        assert_eq!(&rows[0][1], "1");
        assert_eq!(&rows[0][4], "2");
        assert_eq!(&rows[1][15], "failed");
        assert_eq!(&rows[1][16], "no output");
    }

    #[test]
    fn test_failed_cell_is_superseded_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let first = store.begin_cell("a").unwrap();
        assert_eq!(first.attempt, 1);
        std::fs::write(&first.log, "first attempt").unwrap();
        store
            .persist(&record("a", CellOutcome::Failed { reason: "exit 1".into() }))
            .unwrap();
        assert!(!store.is_completed("a").unwrap());

        let second = store.begin_cell("a").unwrap();
        assert_eq!(second.attempt, 2);
        assert!(!second.meta.exists());
        assert!(!second.log.exists());
        let moved = std::fs::read_dir(dir.path().join("superseded")).unwrap().count();
        assert_eq!(moved, 2);
        let retried = CellRecord {
            attempt: second.attempt,
            ..record("a", CellOutcome::Succeeded)
        };
        store.persist(&retried).unwrap();
        assert!(store.is_completed("a").unwrap());

        // Both attempts stay in the summary, told apart by attempt number.
        let rows = store.summary_rows().unwrap();
        let attempts: Vec<(&str, &str, &str)> =
            rows.iter().map(|r| (&r[0], &r[1], &r[15])).collect();
        assert_eq!(attempts, vec![("a", "1", "failed"), ("a", "2", "succeeded")]);
    }
}
