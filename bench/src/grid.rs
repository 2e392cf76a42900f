//! Sweep grid: the Cartesian product of tuning and search dimensions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tuning::{Knob, TuningRecord};

/// Lists of values to sweep. Every list must be non-empty; the last
/// dimension of each group varies fastest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    pub optimizer_threads: Vec<Knob<u32>>,
    pub indexing_threads: Vec<Knob<u32>>,
    pub segment_number: Vec<Knob<u32>>,
    pub max_segment_size_kb: Vec<Knob<u64>>,
    pub indexing_threshold_kb: Vec<u64>,
    pub cpu_budget: Vec<Knob<i64>>,
    pub async_scorer: Vec<bool>,

    /// Concurrent search requests
    pub parallel: Vec<u32>,
    /// Client threads
    pub threads: Vec<u32>,
    pub hnsw_ef: Vec<Knob<u32>>,
    pub search_limit: Vec<u32>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            optimizer_threads: vec![Knob::Auto],
            indexing_threads: vec![Knob::Auto],
            segment_number: vec![Knob::Auto],
            max_segment_size_kb: vec![Knob::Auto],
            indexing_threshold_kb: vec![20_000],
            cpu_budget: vec![Knob::Auto],
            async_scorer: vec![false],
            parallel: vec![4],
            threads: vec![1],
            hnsw_ef: vec![Knob::Auto],
            search_limit: vec![10],
        }
    }
}

/// Search-side parameters of one benchmark invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchParams {
    pub parallel: u32,
    pub threads: u32,
    /// Omitted from the command line when auto
    pub hnsw_ef: Knob<u32>,
    pub search_limit: u32,
}

impl SearchParams {
    pub fn key(&self) -> String {
        format!(
            "p{}-t{}-ef{}-k{}",
            self.parallel, self.threads, self.hnsw_ef, self.search_limit
        )
    }
}

impl fmt::Display for SearchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parallel={} threads={} hnsw_ef={} search_limit={}",
            self.parallel, self.threads, self.hnsw_ef, self.search_limit
        )
    }
}

/// One concrete combination of tuning and search parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridCell {
    pub tuning: TuningRecord,
    pub search: SearchParams,
}

impl GridCell {
    pub fn key(&self) -> String {
        format!("{}__{}", self.tuning.key(), self.search.key())
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("grid.optimizer_threads", self.optimizer_threads.len()),
            ("grid.indexing_threads", self.indexing_threads.len()),
            ("grid.segment_number", self.segment_number.len()),
            ("grid.max_segment_size_kb", self.max_segment_size_kb.len()),
            ("grid.indexing_threshold_kb", self.indexing_threshold_kb.len()),
            ("grid.cpu_budget", self.cpu_budget.len()),
            ("grid.async_scorer", self.async_scorer.len()),
            ("grid.parallel", self.parallel.len()),
            ("grid.threads", self.threads.len()),
            ("grid.hnsw_ef", self.hnsw_ef.len()),
            ("grid.search_limit", self.search_limit.len()),
        ];
        for (name, len) in dims {
            anyhow::ensure!(len > 0, "{name} must list at least one value");
        }
        anyhow::ensure!(
            self.parallel.iter().chain(&self.threads).all(|&n| n > 0),
            "grid.parallel and grid.threads values must be > 0"
        );
        anyhow::ensure!(
            self.search_limit.iter().all(|&n| n > 0),
            "grid.search_limit values must be > 0"
        );
        // A null max_segment_size leaves the collection's value unchanged, so
        // auto cannot follow a concrete size within one sweep.
        let auto_segments = self.max_segment_size_kb.iter().filter(|k| k.is_auto()).count();
        anyhow::ensure!(
            auto_segments == 0 || auto_segments == self.max_segment_size_kb.len(),
            "grid.max_segment_size_kb cannot mix auto with concrete sizes: \
             once a size is set the server keeps it and auto no longer verifies"
        );
        Ok(())
    }

    /// Every tuning combination, in sweep order.
    pub fn tuning_records(&self) -> Vec<TuningRecord> {
        let mut records = Vec::new();
        for &optimizer_threads in &self.optimizer_threads {
            for &indexing_threads in &self.indexing_threads {
                for &segment_number in &self.segment_number {
                    for &max_segment_size_kb in &self.max_segment_size_kb {
                        for &indexing_threshold_kb in &self.indexing_threshold_kb {
                            for &cpu_budget in &self.cpu_budget {
                                for &async_scorer in &self.async_scorer {
                                    records.push(TuningRecord {
                                        optimizer_threads,
                                        indexing_threads,
                                        segment_number,
                                        max_segment_size_kb,
                                        indexing_threshold_kb,
                                        cpu_budget,
                                        async_scorer,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        records
    }

    /// Every search combination, in sweep order.
    pub fn search_params(&self) -> Vec<SearchParams> {
        let mut params = Vec::new();
        for &parallel in &self.parallel {
            for &threads in &self.threads {
                for &hnsw_ef in &self.hnsw_ef {
                    for &search_limit in &self.search_limit {
                        params.push(SearchParams {
                            parallel,
                            threads,
                            hnsw_ef,
                            search_limit,
                        });
                    }
                }
            }
        }
        params
    }

    pub fn cells(&self) -> Vec<GridCell> {
        let searches = self.search_params();
        self.tuning_records()
            .into_iter()
            .flat_map(|tuning| {
                searches.iter().map(move |search| GridCell {
                    tuning: tuning.clone(),
                    search: search.clone(),
                })
            })
            .collect()
    }

    pub fn cell_count(&self) -> usize {
        let tuning = self.optimizer_threads.len()
            * self.indexing_threads.len()
            * self.segment_number.len()
            * self.max_segment_size_kb.len()
            * self.indexing_threshold_kb.len()
            * self.cpu_budget.len()
            * self.async_scorer.len();
        let search =
            self.parallel.len() * self.threads.len() * self.hnsw_ef.len() * self.search_limit.len();
        tuning * search
    }
}
