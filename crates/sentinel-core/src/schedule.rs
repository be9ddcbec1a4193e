use crate::error::SentinelError;
use crate::rollout::RolloutService;
use crate::store::RolloutStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Releases scheduled rollouts once `scheduled_at` arrives (spec §4.6). Not a
/// state machine of its own: it is one recurring arm of the job runner that
/// drives `RolloutService::plan` the same way the Approval Gate does when
/// quorum is reached early.
pub struct ScheduleGate {
    store: Arc<dyn RolloutStore>,
}

/// Outcome of planning one due rollout, for the caller's logging/metrics.
#[derive(Debug)]
pub struct ScheduleAttempt {
    pub rollout_id: uuid::Uuid,
    pub result: Result<(), SentinelError>,
}

impl ScheduleGate {
    pub fn new(store: Arc<dyn RolloutStore>) -> Self {
        Self { store }
    }

    /// Plans every rollout whose `scheduled_at` has arrived. A failure planning
    /// one rollout (e.g. `no_target_nodes`) does not block the others in the
    /// same sweep.
    pub async fn release_due(
        &self,
        rollout_service: &RolloutService,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleAttempt>, SentinelError> {
        let due = self.store.due_scheduled_rollouts(now).await?;
        let mut attempts = Vec::with_capacity(due.len());
        for rollout in due {
            let result = rollout_service.plan(rollout.id, now).await.map(|_| ());
            match &result {
                Ok(()) => info!(rollout_id = %rollout.id, "scheduled rollout released"),
                Err(err) => warn!(rollout_id = %rollout.id, error = %err, "scheduled rollout failed to plan"),
            }
            attempts.push(ScheduleAttempt { rollout_id: rollout.id, result });
        }
        Ok(attempts)
    }
}
