use crate::types::{NodeId, RolloutStrategy};

/// Splits a resolved, ascending-sorted target list into ordered batches (spec §4.3).
///
/// `Rolling` honors `batch_size` when set, else `batch_percentage` (ceil'd against
/// the total target count, minimum 1), else falls back to a single batch of every
/// node. `AllAtOnce` always produces exactly one batch regardless of batch
/// settings.
pub fn plan_batches(
    mut targets: Vec<NodeId>,
    strategy: RolloutStrategy,
    batch_size: Option<u64>,
    batch_percentage: Option<f64>,
) -> Vec<Vec<NodeId>> {
    targets.sort();

    if targets.is_empty() {
        return Vec::new();
    }

    if strategy == RolloutStrategy::AllAtOnce {
        return vec![targets];
    }

    let chunk_len = match (batch_size, batch_percentage) {
        (Some(size), _) if size > 0 => size as usize,
        (None, Some(pct)) if pct > 0.0 => {
            let computed = (targets.len() as f64 * pct / 100.0).ceil() as usize;
            computed.max(1)
        }
        _ => targets.len(),
    };

    targets
        .chunks(chunk_len.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Counts nodes across a batch considered "unavailable" (offline per the node
/// service, spec §4.3's `max_unavailable` tolerance check).
pub fn count_unavailable(batch: &[NodeId], offline: &[NodeId]) -> usize {
    batch.iter().filter(|id| offline.contains(id)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids(n: usize) -> Vec<NodeId> {
        let mut v: Vec<NodeId> = (0..n).map(|_| Uuid::new_v4()).collect();
        v.sort();
        v
    }

    #[test]
    fn all_at_once_produces_single_batch() {
        let targets = ids(7);
        let batches = plan_batches(targets.clone(), RolloutStrategy::AllAtOnce, Some(2), None);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 7);
    }

    #[test]
    fn rolling_with_batch_size_chunks_evenly_with_remainder() {
        let targets = ids(7);
        let batches = plan_batches(targets, RolloutStrategy::Rolling, Some(3), None);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 3);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn rolling_with_percentage_rounds_up_and_is_at_least_one() {
        let targets = ids(10);
        let batches = plan_batches(targets, RolloutStrategy::Rolling, None, Some(25.0));
        // ceil(10 * 0.25) = 3 nodes per batch
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[3].len(), 1);
    }

    #[test]
    fn rolling_with_small_percentage_never_chunks_to_zero() {
        let targets = ids(3);
        let batches = plan_batches(targets, RolloutStrategy::Rolling, None, Some(1.0));
        assert!(batches.iter().all(|b| !b.is_empty()));
    }

    #[test]
    fn empty_targets_produce_no_batches() {
        let batches = plan_batches(Vec::new(), RolloutStrategy::Rolling, Some(2), None);
        assert!(batches.is_empty());
    }

    #[test]
    fn batches_preserve_ascending_node_id_order() {
        let targets = ids(5);
        let mut sorted = targets.clone();
        sorted.sort();
        let batches = plan_batches(targets, RolloutStrategy::Rolling, Some(2), None);
        let flattened: Vec<NodeId> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, sorted);
    }
}
