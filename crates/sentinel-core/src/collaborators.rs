use crate::types::{
    BundleId, BundleSnapshot, DiffStats, DriftEvent, Heartbeat, NodeId, NodeSnapshot, ProjectId,
    RolloutId, UserId,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Errors raised by external collaborators. Kept distinct from `SentinelError` so
/// adapter crates don't need to depend on the core's full error surface; the core
/// wraps these into `SentinelError::Collaborator` at the call site.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Bundle compile/revocation state, read at rollout-creation time and again
/// before each step start (spec §4.4, §6). `diff_stats` backs the Drift
/// Reconciler's severity classification (spec §4.7); bundle *compilation* and
/// diffing stay an opaque producer per spec §1, this is just the read side.
#[async_trait]
pub trait BundleService: Send + Sync {
    async fn get_bundle(&self, bundle_id: BundleId) -> Result<BundleSnapshot, CollaboratorError>;

    async fn diff_stats(
        &self,
        expected: BundleId,
        actual: Option<BundleId>,
    ) -> Result<DiffStats, CollaboratorError>;
}

/// Minimal project-scoped facts the core needs but does not own (project/org
/// management is out of scope per spec §1): the approval quorum and the drift
/// alert thresholds checked by the reconciler (spec §4.7).
#[derive(Debug, Clone)]
pub struct ProjectSnapshot {
    pub id: ProjectId,
    pub approvals_needed: u32,
    pub drift_threshold_percentage: Option<f64>,
    pub drift_threshold_absolute: Option<u64>,
}

#[async_trait]
pub trait ProjectService: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectSnapshot>, CollaboratorError>;

    async fn get_project(&self, project_id: ProjectId) -> Result<ProjectSnapshot, CollaboratorError>;

    /// `operator` role check backing the Approval Gate's `not_authorized`
    /// rejection (spec §4.5); user/org membership itself is out of scope.
    async fn has_operator_role(
        &self,
        user_id: UserId,
        project_id: ProjectId,
    ) -> Result<bool, CollaboratorError>;
}

/// Node inventory and the two fields the core is allowed to write on a node:
/// `staged_bundle_id` and `expected_bundle_id` (spec §3, §4.2, §4.4).
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn get_node(&self, node_id: NodeId) -> Result<NodeSnapshot, CollaboratorError>;

    async fn list_nodes(
        &self,
        project_id: ProjectId,
        labels: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<NodeSnapshot>, CollaboratorError>;

    async fn list_nodes_in_groups(
        &self,
        project_id: ProjectId,
        group_ids: &[uuid::Uuid],
    ) -> Result<Vec<NodeSnapshot>, CollaboratorError>;

    async fn latest_heartbeat(
        &self,
        node_id: NodeId,
    ) -> Result<Option<Heartbeat>, CollaboratorError>;

    async fn stage_bundle(
        &self,
        node_id: NodeId,
        bundle_id: BundleId,
    ) -> Result<(), CollaboratorError>;

    async fn set_expected_bundle(
        &self,
        node_id: NodeId,
        bundle_id: BundleId,
    ) -> Result<(), CollaboratorError>;

    /// Reverts a node that was staged but never activated (spec R3 rollback).
    async fn clear_staged_bundle(&self, node_id: NodeId) -> Result<(), CollaboratorError>;

    async fn mark_offline(&self, node_id: NodeId) -> Result<(), CollaboratorError>;
}

/// Operator/watcher notifications fired at state-transition boundaries (spec §4.9,
/// §6). Distinct from `EventPublisher`: this is for humans (email/chat/webhook),
/// the publisher is for the pub/sub topics consumed by the API's event stream.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify_rollout_event(
        &self,
        rollout_id: RolloutId,
        message: &str,
    ) -> Result<(), CollaboratorError>;

    async fn notify_drift_detected(
        &self,
        node_id: NodeId,
        event: &DriftEvent,
        project_id: ProjectId,
    ) -> Result<(), CollaboratorError>;

    async fn notify_drift_threshold_exceeded(
        &self,
        project_id: ProjectId,
        drifted_count: usize,
        managed_count: usize,
    ) -> Result<(), CollaboratorError>;
}

/// Append-only audit trail for approval/reject/cancel/rollback actions (spec §6).
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn record(
        &self,
        rollout_id: RolloutId,
        actor: uuid::Uuid,
        action: &str,
    ) -> Result<(), CollaboratorError>;
}

/// One named HTTP health-check endpoint, as referenced by a rollout's
/// `health_gates.custom_health_checks` (spec §4.4, Open Question (c)).
#[derive(Debug, Clone)]
pub struct CustomHealthCheckEndpoint {
    pub id: String,
    pub url: String,
    pub timeout_ms: u64,
    pub expected_status: u16,
}

/// Resolves and invokes the named custom health checks for a rollout step.
/// Invoked once per listed endpoint id per step, per Open Question (c)'s resolution
/// in the component design, not once per node.
#[async_trait]
pub trait CustomHealthCheckService: Send + Sync {
    async fn check(&self, check_id: &str) -> Result<bool, CollaboratorError>;
}

#[cfg(test)]
pub(crate) struct InMemoryNodeServiceStub {
    nodes: Vec<NodeSnapshot>,
}

#[cfg(test)]
impl InMemoryNodeServiceStub {
    pub(crate) fn new(nodes: Vec<NodeSnapshot>) -> Self {
        Self { nodes }
    }
}

#[cfg(test)]
#[async_trait]
impl NodeService for InMemoryNodeServiceStub {
    async fn get_node(&self, node_id: NodeId) -> Result<NodeSnapshot, CollaboratorError> {
        self.nodes
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::new("node not found"))
    }

    async fn list_nodes(
        &self,
        project_id: ProjectId,
        _labels: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_nodes_in_groups(
        &self,
        _project_id: ProjectId,
        _group_ids: &[uuid::Uuid],
    ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
        Ok(vec![])
    }

    async fn latest_heartbeat(
        &self,
        _node_id: NodeId,
    ) -> Result<Option<Heartbeat>, CollaboratorError> {
        Ok(None)
    }

    async fn stage_bundle(
        &self,
        _node_id: NodeId,
        _bundle_id: BundleId,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn set_expected_bundle(
        &self,
        _node_id: NodeId,
        _bundle_id: BundleId,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn clear_staged_bundle(&self, _node_id: NodeId) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn mark_offline(&self, _node_id: NodeId) -> Result<(), CollaboratorError> {
        Ok(())
    }
}
