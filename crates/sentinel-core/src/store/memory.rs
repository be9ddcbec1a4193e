use super::{ApprovalOutcome, NewRollout, RolloutStore};
use crate::error::SentinelError;
use crate::types::{
    ApprovalDecision, ApprovalState, DriftEvent, DriftResolution, ErrorDetail, NodeBundleState,
    NodeBundleStatus, NodeId, ProjectId, Rollout, RolloutApproval, RolloutDetails, RolloutId,
    RolloutState, RolloutStep, StepState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// All state held by the in-memory backend, guarded by a single mutex. CAS
/// discipline is implemented with an explicit expected-state check before each
/// mutation, the same guarantee `PostgresRolloutStore` gets from `WHERE state =
/// $expected` (spec §4.1, §5). Exists so unit and integration tests never require
/// a live Postgres instance.
#[derive(Default)]
struct RolloutStoreData {
    rollouts: BTreeMap<RolloutId, Rollout>,
    steps: BTreeMap<(RolloutId, u32), RolloutStep>,
    node_statuses: BTreeMap<(NodeId, RolloutId), NodeBundleStatus>,
    approvals: BTreeMap<(RolloutId, Uuid), RolloutApproval>,
    drift_events: BTreeMap<Uuid, DriftEvent>,
}

pub struct InMemoryRolloutStore {
    data: Mutex<RolloutStoreData>,
}

impl Default for InMemoryRolloutStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRolloutStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(RolloutStoreData::default()),
        }
    }
}

#[async_trait]
impl RolloutStore for InMemoryRolloutStore {
    async fn create_rollout(
        &self,
        new: NewRollout,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let mut data = self.data.lock().await;
        let rollout = Rollout {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            bundle_id: new.bundle_id,
            target_selector: new.target_selector,
            strategy: new.strategy,
            batch_size: new.batch_size,
            batch_percentage: new.batch_percentage,
            max_unavailable: new.max_unavailable,
            progress_deadline_seconds: new.progress_deadline_seconds,
            health_gates: new.health_gates,
            state: new.initial_state,
            approval_state: new.initial_approval_state,
            scheduled_at: new.scheduled_at,
            auto_rollback: new.auto_rollback,
            rollback_threshold: new.rollback_threshold,
            started_at: None,
            completed_at: None,
            error: None,
            created_by: new.created_by,
            created_at: now,
        };
        data.rollouts.insert(rollout.id, rollout.clone());
        Ok(rollout)
    }

    async fn get_rollout(&self, id: RolloutId) -> Result<Option<Rollout>, SentinelError> {
        Ok(self.data.lock().await.rollouts.get(&id).cloned())
    }

    async fn get_details(&self, id: RolloutId) -> Result<Option<RolloutDetails>, SentinelError> {
        let data = self.data.lock().await;
        let Some(rollout) = data.rollouts.get(&id).cloned() else {
            return Ok(None);
        };
        let steps: Vec<RolloutStep> = data
            .steps
            .range((id, 0)..(id, u32::MAX))
            .map(|(_, step)| step.clone())
            .collect();
        let node_statuses: Vec<NodeBundleStatus> = data
            .node_statuses
            .values()
            .filter(|s| s.rollout_id == id)
            .cloned()
            .collect();
        Ok(Some(RolloutDetails {
            rollout,
            steps,
            node_statuses,
        }))
    }

    async fn list_rollouts(
        &self,
        project_id: ProjectId,
        state: Option<RolloutState>,
    ) -> Result<Vec<Rollout>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .rollouts
            .values()
            .filter(|r| r.project_id == project_id)
            .filter(|r| state.map(|s| s == r.state).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn due_scheduled_rollouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Rollout>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .rollouts
            .values()
            .filter(|r| r.state == RolloutState::Pending)
            .filter(|r| {
                matches!(
                    r.approval_state,
                    ApprovalState::NotRequired | ApprovalState::Approved
                )
            })
            .filter(|r| r.scheduled_at.map(|s| s <= now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn plan_rollout(
        &self,
        rollout_id: RolloutId,
        batches: Vec<Vec<NodeId>>,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let mut data = self.data.lock().await;
        let rollout = data
            .rollouts
            .get(&rollout_id)
            .cloned()
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;
        if rollout.state != RolloutState::Pending {
            return Err(SentinelError::InvalidState(format!(
                "cannot plan rollout in state {:?}",
                rollout.state
            )));
        }

        for (index, node_ids) in batches.iter().enumerate() {
            let step_index = index as u32;
            data.steps.insert(
                (rollout_id, step_index),
                RolloutStep {
                    rollout_id,
                    step_index,
                    node_ids: node_ids.clone(),
                    state: StepState::Pending,
                    started_at: None,
                    completed_at: None,
                    error: None,
                },
            );
            for node_id in node_ids {
                data.node_statuses.insert(
                    (*node_id, rollout_id),
                    NodeBundleStatus {
                        node_id: *node_id,
                        rollout_id,
                        bundle_id: rollout.bundle_id,
                        state: NodeBundleState::Pending,
                        staged_at: None,
                        activated_at: None,
                        verified_at: None,
                        last_report_at: None,
                        error: None,
                    },
                );
            }
        }

        let entry = data.rollouts.get_mut(&rollout_id).unwrap();
        entry.state = RolloutState::Running;
        entry.started_at = Some(now);
        Ok(entry.clone())
    }

    async fn transition_rollout(
        &self,
        rollout_id: RolloutId,
        expected: RolloutState,
        new_state: RolloutState,
        error: Option<ErrorDetail>,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let mut data = self.data.lock().await;
        let entry = data
            .rollouts
            .get_mut(&rollout_id)
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;
        if entry.state != expected {
            return Err(SentinelError::InvalidState(format!(
                "expected rollout state {expected:?}, found {:?}",
                entry.state
            )));
        }
        entry.state = new_state;
        entry.error = error;
        if new_state.is_terminal() {
            entry.completed_at = Some(now);
        }
        Ok(entry.clone())
    }

    async fn mark_rolled_back(&self, rollout_id: RolloutId) -> Result<(), SentinelError> {
        let data = self.data.lock().await;
        if data.rollouts.contains_key(&rollout_id) {
            Ok(())
        } else {
            Err(SentinelError::InvalidState("rollout not found".into()))
        }
    }

    async fn get_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
    ) -> Result<Option<RolloutStep>, SentinelError> {
        Ok(self
            .data
            .lock()
            .await
            .steps
            .get(&(rollout_id, step_index))
            .cloned())
    }

    async fn running_or_verifying_step(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Option<RolloutStep>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .steps
            .range((rollout_id, 0)..(rollout_id, u32::MAX))
            .map(|(_, step)| step)
            .find(|s| matches!(s.state, StepState::Running | StepState::Verifying))
            .cloned())
    }

    async fn lowest_pending_step(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Option<RolloutStep>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .steps
            .range((rollout_id, 0)..(rollout_id, u32::MAX))
            .map(|(_, step)| step)
            .find(|s| s.state == StepState::Pending)
            .cloned())
    }

    async fn all_steps_completed(&self, rollout_id: RolloutId) -> Result<bool, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .steps
            .range((rollout_id, 0)..(rollout_id, u32::MAX))
            .all(|(_, step)| step.state == StepState::Completed))
    }

    async fn transition_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
        expected: StepState,
        new_state: StepState,
        error: Option<ErrorDetail>,
        now: DateTime<Utc>,
    ) -> Result<RolloutStep, SentinelError> {
        let mut data = self.data.lock().await;
        let entry = data
            .steps
            .get_mut(&(rollout_id, step_index))
            .ok_or_else(|| SentinelError::InvalidState("step not found".into()))?;
        if entry.state != expected {
            return Err(SentinelError::InvalidState(format!(
                "expected step state {expected:?}, found {:?}",
                entry.state
            )));
        }
        entry.state = new_state;
        entry.error = error;
        match new_state {
            StepState::Running => entry.started_at = Some(now),
            StepState::Completed | StepState::Failed => entry.completed_at = Some(now),
            _ => {}
        }
        Ok(entry.clone())
    }

    async fn complete_verifying_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
        node_ids: &[NodeId],
        now: DateTime<Utc>,
    ) -> Result<RolloutStep, SentinelError> {
        let mut data = self.data.lock().await;

        for node_id in node_ids {
            if let Some(status) = data.node_statuses.get_mut(&(*node_id, rollout_id)) {
                status.state = NodeBundleState::Active;
                status.last_report_at = Some(now);
                status.activated_at = Some(now);
                status.verified_at = Some(now);
            }
        }

        let entry = data
            .steps
            .get_mut(&(rollout_id, step_index))
            .ok_or_else(|| SentinelError::InvalidState("step not found".into()))?;
        if entry.state != StepState::Verifying {
            return Err(SentinelError::InvalidState(format!(
                "expected step state {:?}, found {:?}",
                StepState::Verifying,
                entry.state
            )));
        }
        entry.state = StepState::Completed;
        entry.error = None;
        entry.completed_at = Some(now);
        Ok(entry.clone())
    }

    async fn node_statuses_for_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
    ) -> Result<Vec<NodeBundleStatus>, SentinelError> {
        let data = self.data.lock().await;
        let Some(step) = data.steps.get(&(rollout_id, step_index)) else {
            return Ok(Vec::new());
        };
        Ok(step
            .node_ids
            .iter()
            .filter_map(|id| data.node_statuses.get(&(*id, rollout_id)).cloned())
            .collect())
    }

    async fn node_statuses_for_rollout(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Vec<NodeBundleStatus>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .node_statuses
            .values()
            .filter(|s| s.rollout_id == rollout_id)
            .cloned()
            .collect())
    }

    async fn bulk_set_node_bundle_state(
        &self,
        rollout_id: RolloutId,
        node_ids: &[NodeId],
        state: NodeBundleState,
        now: DateTime<Utc>,
    ) -> Result<(), SentinelError> {
        let mut data = self.data.lock().await;
        for node_id in node_ids {
            if let Some(status) = data.node_statuses.get_mut(&(*node_id, rollout_id)) {
                status.state = state;
                status.last_report_at = Some(now);
                match state {
                    NodeBundleState::Staging => status.staged_at = Some(now),
                    NodeBundleState::Active => {
                        status.activated_at = Some(now);
                        status.verified_at = Some(now);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn record_approval(
        &self,
        rollout_id: RolloutId,
        user_id: Uuid,
        decision: ApprovalDecision,
        comment: Option<String>,
        approvals_needed: u32,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome, SentinelError> {
        let mut data = self.data.lock().await;
        if data.approvals.contains_key(&(rollout_id, user_id)) {
            return Err(SentinelError::AlreadyApproved);
        }
        data.approvals.insert(
            (rollout_id, user_id),
            RolloutApproval {
                rollout_id,
                user_id,
                decision,
                comment,
                created_at: now,
            },
        );

        match decision {
            ApprovalDecision::Rejected => {
                let entry = data
                    .rollouts
                    .get_mut(&rollout_id)
                    .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;
                entry.approval_state = ApprovalState::Rejected;
                entry.state = RolloutState::Cancelled;
                entry.completed_at = Some(now);
                Ok(ApprovalOutcome::Rejected)
            }
            ApprovalDecision::Approved => {
                let approvals_count = data
                    .approvals
                    .keys()
                    .filter(|(r, _)| *r == rollout_id)
                    .count() as u32;
                let quorum_reached = approvals_count >= approvals_needed;
                if quorum_reached {
                    let entry = data
                        .rollouts
                        .get_mut(&rollout_id)
                        .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;
                    entry.approval_state = ApprovalState::Approved;
                }
                Ok(ApprovalOutcome::Recorded {
                    approvals_count,
                    quorum_reached,
                })
            }
        }
    }

    async fn list_approvals(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Vec<RolloutApproval>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .approvals
            .values()
            .filter(|a| a.rollout_id == rollout_id)
            .cloned()
            .collect())
    }

    async fn unresolved_drift_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Option<DriftEvent>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .drift_events
            .values()
            .find(|e| e.node_id == node_id && e.resolved_at.is_none())
            .cloned())
    }

    async fn insert_drift_event(&self, event: DriftEvent) -> Result<DriftEvent, SentinelError> {
        let mut data = self.data.lock().await;
        if data
            .drift_events
            .values()
            .any(|e| e.node_id == event.node_id && e.resolved_at.is_none())
        {
            return Err(SentinelError::InvalidState(
                "an unresolved drift event already exists for this node".into(),
            ));
        }
        data.drift_events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn resolve_drift_event(
        &self,
        id: Uuid,
        resolution: DriftResolution,
        now: DateTime<Utc>,
    ) -> Result<DriftEvent, SentinelError> {
        let mut data = self.data.lock().await;
        let entry = data
            .drift_events
            .get_mut(&id)
            .ok_or_else(|| SentinelError::InvalidState("drift event not found".into()))?;
        if entry.resolved_at.is_some() {
            return Err(SentinelError::InvalidState(
                "drift event already resolved".into(),
            ));
        }
        entry.resolved_at = Some(now);
        entry.resolution = Some(resolution);
        Ok(entry.clone())
    }

    async fn list_drift_events(
        &self,
        project_id: ProjectId,
        unresolved_only: bool,
    ) -> Result<Vec<DriftEvent>, SentinelError> {
        let data = self.data.lock().await;
        Ok(data
            .drift_events
            .values()
            .filter(|e| e.project_id == project_id)
            .filter(|e| !unresolved_only || e.resolved_at.is_none())
            .cloned()
            .collect())
    }

    async fn get_drift_event(&self, id: Uuid) -> Result<Option<DriftEvent>, SentinelError> {
        Ok(self.data.lock().await.drift_events.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalState, HealthGates, RolloutStrategy, TargetSelector};

    fn new_rollout(created_by: Uuid) -> NewRollout {
        NewRollout {
            project_id: Uuid::new_v4(),
            bundle_id: Uuid::new_v4(),
            target_selector: TargetSelector::All,
            strategy: RolloutStrategy::Rolling,
            batch_size: Some(2),
            batch_percentage: None,
            max_unavailable: 0,
            progress_deadline_seconds: 600,
            health_gates: HealthGates::default(),
            scheduled_at: None,
            auto_rollback: false,
            rollback_threshold: None,
            created_by,
            initial_state: RolloutState::Pending,
            initial_approval_state: ApprovalState::NotRequired,
        }
    }

    #[tokio::test]
    async fn transition_rollout_rejects_mismatched_expected_state() {
        let store = InMemoryRolloutStore::new();
        let now = Utc::now();
        let rollout = store.create_rollout(new_rollout(Uuid::new_v4()), now).await.unwrap();

        let err = store
            .transition_rollout(rollout.id, RolloutState::Running, RolloutState::Completed, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::InvalidState(_)));
    }

    #[tokio::test]
    async fn plan_rollout_creates_ordered_steps_and_node_rows() {
        let store = InMemoryRolloutStore::new();
        let now = Utc::now();
        let rollout = store.create_rollout(new_rollout(Uuid::new_v4()), now).await.unwrap();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        let n3 = Uuid::new_v4();

        store
            .plan_rollout(rollout.id, vec![vec![n1, n2], vec![n3]], now)
            .await
            .unwrap();

        let details = store.get_details(rollout.id).await.unwrap().unwrap();
        assert_eq!(details.rollout.state, RolloutState::Running);
        assert_eq!(details.steps.len(), 2);
        assert_eq!(details.steps[0].step_index, 0);
        assert_eq!(details.node_statuses.len(), 3);
    }

    #[tokio::test]
    async fn record_approval_twice_by_same_user_is_rejected() {
        let store = InMemoryRolloutStore::new();
        let now = Utc::now();
        let creator = Uuid::new_v4();
        let rollout = store.create_rollout(new_rollout(creator), now).await.unwrap();
        let approver = Uuid::new_v4();

        store
            .record_approval(rollout.id, approver, ApprovalDecision::Approved, None, 2, now)
            .await
            .unwrap();

        let err = store
            .record_approval(rollout.id, approver, ApprovalDecision::Approved, None, 2, now)
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::AlreadyApproved));
    }

    #[tokio::test]
    async fn insert_drift_event_rejects_second_unresolved_event_for_same_node() {
        let store = InMemoryRolloutStore::new();
        let node_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let now = Utc::now();
        let event = |id| DriftEvent {
            id,
            node_id,
            project_id,
            expected_bundle_id: Uuid::new_v4(),
            actual_bundle_id: None,
            detected_at: now,
            resolved_at: None,
            resolution: None,
            severity: crate::types::DriftSeverity::Critical,
            diff_stats: Default::default(),
        };

        store.insert_drift_event(event(Uuid::new_v4())).await.unwrap();
        let err = store.insert_drift_event(event(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidState(_)));
    }
}
