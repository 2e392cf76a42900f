//! Periodic raw capture of local statistics and remote telemetry endpoints.
//!
//! Read-only with respect to the cluster. Each tick appends one row to
//! `local_stats.csv` and writes every endpoint's body verbatim to
//! `<endpoint>/<timestamp>.<ext>`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Networks, System};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::CollectionClient;
use crate::config::EndpointConfig;

/// One row of `local_stats.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct LocalStats {
    pub timestamp: String,
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub load_1m: f64,
    /// Summed over all interfaces since the previous sample
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

/// What a single tick managed to write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub endpoints_written: usize,
    pub endpoints_failed: usize,
}

pub struct TelemetryCollector {
    client: CollectionClient,
    endpoints: Vec<EndpointConfig>,
    dir: PathBuf,
    interval: Duration,
    sys: System,
    networks: Networks,
}

impl TelemetryCollector {
    pub fn new(
        client: CollectionClient,
        endpoints: Vec<EndpointConfig>,
        dir: impl Into<PathBuf>,
        interval: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        for endpoint in &endpoints {
            let sub = dir.join(&endpoint.name);
            std::fs::create_dir_all(&sub).with_context(|| format!("Failed to create {}", sub.display()))?;
        }

        let mut sys = System::new();
        // CPU usage is a delta; prime it so the first sample is meaningful.
        sys.refresh_cpu_usage();
        Ok(Self {
            client,
            endpoints,
            dir,
            interval,
            sys,
            networks: Networks::new_with_refreshed_list(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sample_local(&mut self, now: DateTime<Utc>) -> LocalStats {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.networks.refresh(true);

        let (rx, tx) = self
            .networks
            .list()
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });

        LocalStats {
            timestamp: now.to_rfc3339(),
            cpu_percent: self.sys.global_cpu_usage(),
            memory_used_bytes: self.sys.used_memory(),
            memory_total_bytes: self.sys.total_memory(),
            load_1m: System::load_average().one,
            net_rx_bytes: rx,
            net_tx_bytes: tx,
        }
    }

    fn append_local(&self, stats: &LocalStats) -> Result<()> {
        let path = self.dir.join("local_stats.csv");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(stats)?;
        writer.flush()?;
        Ok(())
    }

    async fn capture_endpoint(&self, endpoint: &EndpointConfig, stamp: &str) -> Result<PathBuf> {
        let body = self
            .client
            .fetch_text(&endpoint.path)
            .await
            .with_context(|| format!("Failed to fetch {}", endpoint.path))?;
        let path = self
            .dir
            .join(&endpoint.name)
            .join(format!("{stamp}.{}", endpoint.extension));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(body.as_bytes())?;
        Ok(path)
    }

    /// Capture everything once. Endpoint failures are counted, not returned.
    pub async fn capture_once(&mut self) -> Result<CaptureReport> {
        let now = Utc::now();
        let stamp = now.format("%Y%m%dT%H%M%S%.3fZ").to_string();

        let stats = self.sample_local(now);
        self.append_local(&stats)?;

        let mut report = CaptureReport::default();
        for endpoint in &self.endpoints {
            match self.capture_endpoint(endpoint, &stamp).await {
                Ok(path) => {
                    debug!(endpoint = %endpoint.name, path = %path.display(), "captured");
                    report.endpoints_written += 1;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %format!("{e:#}"), "capture failed");
                    report.endpoints_failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Collect, sleep, repeat until `shutdown` resolves. Returns the number of
    /// completed ticks.
    pub async fn run<S>(mut self, shutdown: S) -> Result<u64>
    where
        S: Future<Output = ()>,
    {
        info!(
            dir = %self.dir.display(),
            interval = ?self.interval,
            endpoints = self.endpoints.len(),
            "telemetry capture started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.capture_once().await?;
                    ticks += 1;
                    debug!(tick = ticks, written = report.endpoints_written, failed = report.endpoints_failed, "telemetry tick");
                }
            }
        }
        info!(ticks, "telemetry capture stopped");
        Ok(ticks)
    }
}
