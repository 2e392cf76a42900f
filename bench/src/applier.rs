//! Apply a tuning record to both control planes and confirm it took effect.
//!
//! Sequence: PATCH the collection (bounded retries, schema errors abort at
//! once), merge the performance knobs into the cluster descriptor, wait until
//! the cluster reports its healthy phase and the data port is ready, then read
//! both planes back and compare every field.

use backon::{ConstantBuilder, Retryable};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::client::cluster::{merge_performance, performance, phase};
use crate::client::{ApiError, ClusterApi, CollectionApi};
use crate::poll::{PollError, Poller};
use crate::tuning::{FieldMismatch, TuningRecord};

#[derive(Debug, Clone)]
pub struct ApplierSettings {
    /// Attempts per control-plane update, including the first
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub health: Poller,
    pub healthy_phase: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{stage} rejected as malformed: {source}")]
    Malformed {
        stage: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("{stage} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        stage: &'static str,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("cluster did not become healthy: {0}")]
    Health(#[from] PollError),

    #[error("reading back {stage} failed: {source}")]
    Readback {
        stage: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("applied tuning does not match read-back: {}", describe(.0))]
    Mismatch(Vec<FieldMismatch>),
}

fn describe(mismatches: &[FieldMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct TuningApplier<C, K> {
    collection: C,
    cluster: K,
    settings: ApplierSettings,
}

impl<C: CollectionApi, K: ClusterApi> TuningApplier<C, K> {
    pub fn new(collection: C, cluster: K, settings: ApplierSettings) -> Self {
        Self {
            collection,
            cluster,
            settings,
        }
    }

    pub fn collection(&self) -> &C {
        &self.collection
    }

    /// Apply and verify. Returns only once every field has been confirmed.
    #[instrument(skip_all, fields(tuning = %record.key()))]
    pub async fn apply(&self, record: &TuningRecord) -> Result<(), ApplyError> {
        let patch = record.collection_patch();
        self.with_retries("collection update", || {
            self.collection.update_collection(&patch)
        })
        .await?;
        info!("collection config accepted");

        let knobs = record.cluster_performance();
        self.with_retries("cluster update", || self.update_cluster(&knobs))
            .await?;
        info!("cluster performance settings accepted");

        self.wait_healthy().await?;
        self.verify(record).await?;
        info!("tuning verified on both control planes");
        Ok(())
    }

    async fn update_cluster(&self, knobs: &Value) -> Result<(), ApiError> {
        let mut descriptor = self.cluster.descriptor().await?;
        merge_performance(&mut descriptor, knobs);
        self.cluster.replace_descriptor(&descriptor).await
    }

    fn retry_policy(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.settings.retry_delay)
            .with_max_times(self.settings.max_attempts.max(1) as usize - 1)
    }

    async fn with_retries<T, F, Fut>(&self, stage: &'static str, op: F) -> Result<T, ApplyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        op.retry(self.retry_policy())
            .when(ApiError::is_retryable)
            .notify(|e: &ApiError, delay: Duration| {
                warn!(stage, max_attempts, ?delay, error = %e, "update failed; retrying");
            })
            .await
            .map_err(|source| {
                if source.is_retryable() {
                    ApplyError::RetriesExhausted {
                        stage,
                        attempts: max_attempts,
                        source,
                    }
                } else {
                    ApplyError::Malformed { stage, source }
                }
            })
    }

    /// Block until the cluster phase is healthy and the data port is ready.
    pub async fn wait_healthy(&self) -> Result<(), PollError> {
        let cluster = &self.cluster;
        let collection = &self.collection;
        let healthy_phase = self.settings.healthy_phase.as_str();

        self.settings
            .health
            .until("cluster healthy and data port ready", || async move {
                let descriptor = cluster.descriptor().await.map_err(anyhow::Error::from)?;
                let current = phase(&descriptor).unwrap_or("unknown");
                if !current.eq_ignore_ascii_case(healthy_phase) {
                    tracing::debug!(phase = current, "cluster not healthy yet");
                    return Ok(None);
                }
                anyhow::Ok(collection.ready().await.then_some(()))
            })
            .await
    }

    /// Compare the effective configuration on both planes against `record`.
    pub async fn verify(&self, record: &TuningRecord) -> Result<(), ApplyError> {
        let info = self
            .collection
            .collection_info()
            .await
            .map_err(|source| ApplyError::Readback {
                stage: "collection config",
                source,
            })?;
        let descriptor = self
            .cluster
            .descriptor()
            .await
            .map_err(|source| ApplyError::Readback {
                stage: "cluster descriptor",
                source,
            })?;

        let mismatches = record.verify(&info.config, &performance(&descriptor));
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(ApplyError::Mismatch(mismatches))
        }
    }
}
