use anyhow::{Context, Result};
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{info, warn};

use super::loader::{DataLoader, LoadTarget};
use crate::client::{CollectionApi, CollectionClient, CollectionStatus};
use crate::poll::Poller;

/// Ids written beyond the baseline, given the loader's `id_offset + n` scheme.
pub fn surplus_ids(baseline: u64, count: u64, id_offset: u64) -> Option<RangeInclusive<u64>> {
    (count > baseline).then(|| id_offset + baseline + 1..=id_offset + count)
}

/// Split `ids` into consecutive windows of at most `batch_size` ids.
pub fn id_batches(
    ids: RangeInclusive<u64>,
    batch_size: usize,
) -> impl Iterator<Item = RangeInclusive<u64>> {
    let step = batch_size.max(1) as u64;
    let (first, last) = ids.into_inner();
    let mut next = (first <= last).then_some(first);
    std::iter::from_fn(move || {
        let start = next?;
        let end = start.saturating_add(step - 1).min(last);
        next = end.checked_add(1).filter(|&n| n <= last);
        Some(start..=end)
    })
}

/// Bring the collection back to exactly `baseline` rows before a tuning cell.
///
/// Surplus points (from earlier background writes) are deleted by id, then the
/// loader tops the collection up if it holds fewer rows than the baseline.
pub async fn reset_to_baseline(
    collection: &CollectionClient,
    loader: &DataLoader,
    baseline: u64,
    id_offset: u64,
    batch_size: usize,
    log_path: &Path,
) -> Result<u64> {
    let before = collection
        .collection_info()
        .await
        .context("Failed to read point count before reset")?
        .points();

    if let Some(range) = surplus_ids(baseline, before, id_offset) {
        let surplus = before - baseline;
        info!(surplus, first = range.start(), last = range.end(), "deleting surplus points");
        for batch in id_batches(range, batch_size) {
            let ids: Vec<u64> = batch.collect();
            collection
                .delete_points(&ids)
                .await
                .context("Failed to delete surplus points")?;
        }
    }

    loader
        .run_to(LoadTarget::rows(baseline), log_path)
        .await
        .context("Failed to load baseline dataset")?;

    let after = collection
        .collection_info()
        .await
        .context("Failed to read point count after reset")?
        .points();
    if after != baseline {
        warn!(expected = baseline, observed = after, "point count differs from baseline after reset");
    } else {
        info!(points = after, "dataset at baseline");
    }
    Ok(after)
}

/// Wait until every segment of the collection is optimized.
pub async fn wait_for_green<C: CollectionApi>(collection: &C, poller: &Poller) -> Result<()> {
    poller
        .until("collection status green", || async move {
            let info = collection.collection_info().await?;
            if info.status != CollectionStatus::Green {
                tracing::debug!(status = ?info.status, "collection not green yet");
            }
            anyhow::Ok((info.status == CollectionStatus::Green).then_some(()))
        })
        .await?;
    info!("collection is green");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_batches() {
        let batches: Vec<_> = id_batches(2_001..=2_007, 3).collect();
        assert_eq!(batches, vec![2_001..=2_003, 2_004..=2_006, 2_007..=2_007]);
        assert_eq!(id_batches(5..=5, 0).collect::<Vec<_>>(), vec![5..=5]);
        assert_eq!(id_batches(1..=4, 4).count(), 1);
        let top: Vec<_> = id_batches(u64::MAX - 1..=u64::MAX, 10).collect();
        assert_eq!(top, vec![u64::MAX - 1..=u64::MAX]);
    }

    #[test]
    fn test_surplus_ids() {
        assert_eq!(surplus_ids(1_000, 1_000, 1_000), None);
        assert_eq!(surplus_ids(1_000, 900, 1_000), None);
        assert_eq!(surplus_ids(1_000, 1_003, 1_000), Some(2_001..=2_003));
        assert_eq!(surplus_ids(0, 2, 0), Some(1..=2));
    }
}
