mod memory;
mod postgres;

pub use memory::InMemoryRolloutStore;
pub use postgres::PostgresRolloutStore;

use crate::error::SentinelError;
use crate::types::{
    ApprovalDecision, BundleId, DriftEvent, DriftResolution, ErrorDetail, NodeBundleState,
    NodeBundleStatus, NodeId, ProjectId, Rollout, RolloutApproval, RolloutDetails, RolloutId,
    RolloutState, RolloutStep, StepState, TargetSelector, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Fields needed to insert a new rollout row. Bundle-compiled validation happens
/// before construction (caller holds a `BundleSnapshot`); the store only persists.
#[derive(Debug, Clone)]
pub struct NewRollout {
    pub project_id: ProjectId,
    pub bundle_id: BundleId,
    pub target_selector: TargetSelector,
    pub strategy: crate::types::RolloutStrategy,
    pub batch_size: Option<u64>,
    pub batch_percentage: Option<f64>,
    pub max_unavailable: u64,
    pub progress_deadline_seconds: i64,
    pub health_gates: crate::types::HealthGates,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub auto_rollback: bool,
    pub rollback_threshold: Option<f64>,
    pub created_by: UserId,
    pub initial_state: RolloutState,
    pub initial_approval_state: crate::types::ApprovalState,
}

/// Result of recording one approval or rejection decision (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Recorded { approvals_count: u32, quorum_reached: bool },
    Rejected,
}

/// A transactional repository for rollouts, steps, per-node bundle statuses,
/// approvals, and drift events (spec §4.1). Object-safe so it can live behind
/// `Arc<dyn RolloutStore>` on `ServiceState` alongside the collaborator and
/// connector registries.
#[async_trait]
pub trait RolloutStore: Send + Sync {
    async fn create_rollout(
        &self,
        new: NewRollout,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError>;

    async fn get_rollout(&self, id: RolloutId) -> Result<Option<Rollout>, SentinelError>;

    async fn get_details(&self, id: RolloutId) -> Result<Option<RolloutDetails>, SentinelError>;

    async fn list_rollouts(
        &self,
        project_id: ProjectId,
        state: Option<RolloutState>,
    ) -> Result<Vec<Rollout>, SentinelError>;

    /// Rollouts whose `scheduled_at` has arrived and are otherwise eligible for
    /// planning (spec §4.6): `state = pending`, `approval_state ∈
    /// {not_required, approved}`, `scheduled_at <= now`.
    async fn due_scheduled_rollouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Rollout>, SentinelError>;

    /// Creates steps and per-node status rows for the resolved batches and
    /// transitions the rollout to `running` with `started_at = now`, inside one
    /// transaction (invariants 2, 3, 5 depend on this atomicity).
    async fn plan_rollout(
        &self,
        rollout_id: RolloutId,
        batches: Vec<Vec<NodeId>>,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError>;

    /// Compare-and-swap rollout state transition; `Err(InvalidState)` if the
    /// current state does not equal `expected`.
    async fn transition_rollout(
        &self,
        rollout_id: RolloutId,
        expected: RolloutState,
        new_state: RolloutState,
        error: Option<ErrorDetail>,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError>;

    /// Clears every node's `staged_bundle_id` that the caller determined is a
    /// rollback target (spec R3); the store only records the rollout-side
    /// bookkeeping, node writes go through `NodeService` in the caller.
    async fn mark_rolled_back(&self, rollout_id: RolloutId) -> Result<(), SentinelError>;

    async fn get_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
    ) -> Result<Option<RolloutStep>, SentinelError>;

    /// The step with `state ∈ {running, verifying}`, if any (invariant 2).
    async fn running_or_verifying_step(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Option<RolloutStep>, SentinelError>;

    /// The lowest-`step_index` step still `pending`, if any.
    async fn lowest_pending_step(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Option<RolloutStep>, SentinelError>;

    async fn all_steps_completed(&self, rollout_id: RolloutId) -> Result<bool, SentinelError>;

    async fn transition_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
        expected: StepState,
        new_state: StepState,
        error: Option<ErrorDetail>,
        now: DateTime<Utc>,
    ) -> Result<RolloutStep, SentinelError>;

    /// Marks `node_ids` `active` and transitions the step from `verifying` to
    /// `completed` in one atomic unit: a reader never observes a step marked
    /// `completed` with node statuses still `verifying`. The caller's prior
    /// `NodeService::set_expected_bundle` calls are a write to an external
    /// collaborator and can't join this transaction.
    async fn complete_verifying_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
        node_ids: &[NodeId],
        now: DateTime<Utc>,
    ) -> Result<RolloutStep, SentinelError>;

    async fn node_statuses_for_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
    ) -> Result<Vec<NodeBundleStatus>, SentinelError>;

    async fn node_statuses_for_rollout(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Vec<NodeBundleStatus>, SentinelError>;

    async fn bulk_set_node_bundle_state(
        &self,
        rollout_id: RolloutId,
        node_ids: &[NodeId],
        state: NodeBundleState,
        now: DateTime<Utc>,
    ) -> Result<(), SentinelError>;

    async fn record_approval(
        &self,
        rollout_id: RolloutId,
        user_id: UserId,
        decision: ApprovalDecision,
        comment: Option<String>,
        approvals_needed: u32,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome, SentinelError>;

    async fn list_approvals(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Vec<RolloutApproval>, SentinelError>;

    async fn unresolved_drift_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Option<DriftEvent>, SentinelError>;

    async fn insert_drift_event(&self, event: DriftEvent) -> Result<DriftEvent, SentinelError>;

    async fn resolve_drift_event(
        &self,
        id: Uuid,
        resolution: DriftResolution,
        now: DateTime<Utc>,
    ) -> Result<DriftEvent, SentinelError>;

    async fn list_drift_events(
        &self,
        project_id: ProjectId,
        unresolved_only: bool,
    ) -> Result<Vec<DriftEvent>, SentinelError>;

    async fn get_drift_event(&self, id: Uuid) -> Result<Option<DriftEvent>, SentinelError>;
}
