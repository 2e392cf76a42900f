use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

pub mod reporter;
pub use reporter::{CellOutcome, CellRecord, ResultStore};

use crate::config::LatencyUnit;
use crate::runner::executor::BenchOutput;

/// Latency samples are recorded at microsecond resolution.
const MICROS_PER_MILLI: f64 = 1_000.0;

/// Derived figures for one benchmark cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchSummary {
    pub rps_samples: usize,
    pub rps_mean: f64,
    pub rps_min: f64,
    pub rps_max: f64,
    pub latency: LatencyMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub samples: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyMetrics {
    fn empty() -> Self {
        Self {
            samples: 0,
            mean_ms: 0.0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            max_ms: 0.0,
        }
    }
}

impl BenchSummary {
    pub fn from_output(output: &BenchOutput, unit: LatencyUnit) -> Result<Self> {
        let rps: Vec<f64> = output.rps.iter().copied().filter(|v| v.is_finite()).collect();
        let (rps_mean, rps_min, rps_max) = if rps.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                rps.iter().sum::<f64>() / rps.len() as f64,
                rps.iter().copied().fold(f64::INFINITY, f64::min),
                rps.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            )
        };

        let mut histogram = Histogram::<u64>::new(3)?;
        for sample in &output.latencies {
            let millis = unit.to_millis(*sample);
            if millis.is_finite() && millis >= 0.0 {
                histogram.saturating_record((millis * MICROS_PER_MILLI).round() as u64);
            }
        }

        let latency = if histogram.is_empty() {
            LatencyMetrics::empty()
        } else {
            let ms = |micros: u64| micros as f64 / MICROS_PER_MILLI;
            LatencyMetrics {
                samples: histogram.len(),
                mean_ms: histogram.mean() / MICROS_PER_MILLI,
                p50_ms: ms(histogram.value_at_quantile(0.50)),
                p95_ms: ms(histogram.value_at_quantile(0.95)),
                p99_ms: ms(histogram.value_at_quantile(0.99)),
                max_ms: ms(histogram.max()),
            }
        };

        Ok(Self {
            rps_samples: rps.len(),
            rps_mean,
            rps_min,
            rps_max,
            latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_from_seconds() {
        let output = BenchOutput {
            rps: vec![100.0, 200.0, 300.0],
            latencies: (1..=100).map(|i| i as f64 / 1000.0).collect(),
        };
        let summary = BenchSummary::from_output(&output, LatencyUnit::Seconds).unwrap();
        assert_eq!(summary.rps_samples, 3);
        assert_eq!(summary.rps_mean, 200.0);
        assert_eq!(summary.rps_min, 100.0);
        assert_eq!(summary.rps_max, 300.0);
        assert_eq!(summary.latency.samples, 100);
        assert!((summary.latency.p50_ms - 50.0).abs() < 0.1);
        assert!((summary.latency.p99_ms - 99.0).abs() < 0.1);
        assert!((summary.latency.max_ms - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_summary_from_millis_and_empty_latencies() {
        let output = BenchOutput {
            rps: vec![50.0],
            latencies: vec![2.0, 4.0],
        };
        let summary = BenchSummary::from_output(&output, LatencyUnit::Milliseconds).unwrap();
        assert!((summary.latency.mean_ms - 3.0).abs() < 0.01);

        let output = BenchOutput {
            rps: vec![50.0],
            latencies: vec![],
        };
        let summary = BenchSummary::from_output(&output, LatencyUnit::Seconds).unwrap();
        assert_eq!(summary.latency, LatencyMetrics::empty());
    }
}
