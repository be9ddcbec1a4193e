//! Deterministic in-memory collaborator adapters for Sentinel-CP.
//!
//! `sentinel-core` only ever talks to the outside world through the traits in
//! `sentinel_core::collaborators`. These adapters are reference
//! implementations of those traits for local development and integration
//! tests, the way a mock settlement connector stands in for a real payment
//! rail: deterministic, in-process, no network calls.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use sentinel_core::collaborators::{
    AuditService, BundleService, CollaboratorError, CustomHealthCheckService, NodeService,
    NotificationService, ProjectService, ProjectSnapshot,
};
use sentinel_core::types::{
    BundleId, BundleSnapshot, DiffStats, DriftEvent, Heartbeat, NodeId, NodeSnapshot, ProjectId,
    RolloutId, UserId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::info;

/// In-memory bundle registry. Seeded by the caller (CLI/test harness) with
/// `insert`; `diff_stats` is a deterministic function of the two ids rather
/// than an actual content diff, since bundle compilation itself is an opaque
/// producer out of scope here.
#[derive(Default)]
pub struct InMemoryBundleService {
    bundles: Mutex<HashMap<BundleId, BundleSnapshot>>,
}

impl InMemoryBundleService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bundle: BundleSnapshot) {
        self.bundles.lock().unwrap().insert(bundle.id, bundle);
    }
}

#[async_trait]
impl BundleService for InMemoryBundleService {
    async fn get_bundle(&self, bundle_id: BundleId) -> Result<BundleSnapshot, CollaboratorError> {
        self.bundles
            .lock()
            .unwrap()
            .get(&bundle_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::new(format!("bundle {bundle_id} not found")))
    }

    async fn diff_stats(
        &self,
        expected: BundleId,
        actual: Option<BundleId>,
    ) -> Result<DiffStats, CollaboratorError> {
        let Some(actual) = actual else {
            return Ok(DiffStats { additions: 0, deletions: 0 });
        };
        if actual == expected {
            return Ok(DiffStats::default());
        }
        // Deterministic stand-in for a real content diff: derive a stable
        // spread from the two ids so repeated calls with the same pair agree.
        let mix = expected.as_u128() ^ actual.as_u128();
        Ok(DiffStats {
            additions: (mix % 23 + 1) as u32,
            deletions: ((mix >> 8) % 11) as u32,
        })
    }
}

/// In-memory node inventory. Owns the two fields the core is allowed to write
/// (`staged_bundle_id`, `expected_bundle_id`) plus the latest heartbeat per
/// node, seeded and mutated by the caller outside of rollout execution.
#[derive(Default)]
pub struct InMemoryNodeService {
    nodes: Mutex<HashMap<NodeId, NodeSnapshot>>,
    heartbeats: Mutex<HashMap<NodeId, Heartbeat>>,
}

impl InMemoryNodeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: NodeSnapshot) {
        self.nodes.lock().unwrap().insert(node.id, node);
    }

    pub fn record_heartbeat(&self, heartbeat: Heartbeat) {
        self.heartbeats.lock().unwrap().insert(heartbeat.node_id, heartbeat);
    }

    /// Test/CLI convenience: directly marks a node's `active_bundle_id`,
    /// simulating the node having finished activating a staged bundle.
    pub fn set_active_bundle(&self, node_id: NodeId, bundle_id: BundleId) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&node_id) {
            node.active_bundle_id = Some(bundle_id);
        }
    }
}

#[async_trait]
impl NodeService for InMemoryNodeService {
    async fn get_node(&self, node_id: NodeId) -> Result<NodeSnapshot, CollaboratorError> {
        self.nodes
            .lock()
            .unwrap()
            .get(&node_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::new(format!("node {node_id} not found")))
    }

    async fn list_nodes(
        &self,
        project_id: ProjectId,
        labels: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.project_id == project_id)
            .filter(|n| match labels {
                None => true,
                Some(wanted) => wanted.iter().all(|(k, v)| n.labels.get(k) == Some(v)),
            })
            .cloned()
            .collect())
    }

    async fn list_nodes_in_groups(
        &self,
        project_id: ProjectId,
        group_ids: &[uuid::Uuid],
    ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
        // Groups are modeled as a reserved label key; membership of a node in
        // group `g` is `labels["group"] == g.to_string()`.
        let wanted: HashSet<String> = group_ids.iter().map(|g| g.to_string()).collect();
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.project_id == project_id)
            .filter(|n| n.labels.get("group").map(|g| wanted.contains(g)).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn latest_heartbeat(&self, node_id: NodeId) -> Result<Option<Heartbeat>, CollaboratorError> {
        Ok(self.heartbeats.lock().unwrap().get(&node_id).cloned())
    }

    async fn stage_bundle(&self, node_id: NodeId, bundle_id: BundleId) -> Result<(), CollaboratorError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| CollaboratorError::new(format!("node {node_id} not found")))?;
        node.staged_bundle_id = Some(bundle_id);
        Ok(())
    }

    async fn set_expected_bundle(&self, node_id: NodeId, bundle_id: BundleId) -> Result<(), CollaboratorError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| CollaboratorError::new(format!("node {node_id} not found")))?;
        node.expected_bundle_id = Some(bundle_id);
        Ok(())
    }

    async fn clear_staged_bundle(&self, node_id: NodeId) -> Result<(), CollaboratorError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| CollaboratorError::new(format!("node {node_id} not found")))?;
        node.staged_bundle_id = None;
        Ok(())
    }

    async fn mark_offline(&self, node_id: NodeId) -> Result<(), CollaboratorError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| CollaboratorError::new(format!("node {node_id} not found")))?;
        node.status = sentinel_core::types::NodeStatus::Offline;
        Ok(())
    }
}

/// In-memory project metadata: approval quorum, drift thresholds, and the
/// operator roster.
#[derive(Default)]
pub struct InMemoryProjectService {
    projects: Mutex<HashMap<ProjectId, ProjectSnapshot>>,
    operators: Mutex<HashMap<ProjectId, HashSet<UserId>>>,
}

impl InMemoryProjectService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: ProjectSnapshot) {
        self.projects.lock().unwrap().insert(project.id, project);
    }

    pub fn grant_operator(&self, project_id: ProjectId, user_id: UserId) {
        self.operators
            .lock()
            .unwrap()
            .entry(project_id)
            .or_default()
            .insert(user_id);
    }
}

#[async_trait]
impl ProjectService for InMemoryProjectService {
    async fn list_projects(&self) -> Result<Vec<ProjectSnapshot>, CollaboratorError> {
        Ok(self.projects.lock().unwrap().values().cloned().collect())
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<ProjectSnapshot, CollaboratorError> {
        self.projects
            .lock()
            .unwrap()
            .get(&project_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::new(format!("project {project_id} not found")))
    }

    async fn has_operator_role(&self, user_id: UserId, project_id: ProjectId) -> Result<bool, CollaboratorError> {
        Ok(self
            .operators
            .lock()
            .unwrap()
            .get(&project_id)
            .map(|set| set.contains(&user_id))
            .unwrap_or(false))
    }
}

/// Notification sink that logs instead of paging anyone; sufficient for
/// local/dev operation where there is no chat/email/webhook endpoint wired up.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationService;

#[async_trait]
impl NotificationService for LoggingNotificationService {
    async fn notify_rollout_event(&self, rollout_id: RolloutId, message: &str) -> Result<(), CollaboratorError> {
        info!(rollout_id = %rollout_id, message, "rollout notification");
        Ok(())
    }

    async fn notify_drift_detected(
        &self,
        node_id: NodeId,
        event: &DriftEvent,
        project_id: ProjectId,
    ) -> Result<(), CollaboratorError> {
        info!(node_id = %node_id, project_id = %project_id, severity = ?event.severity, "drift detected notification");
        Ok(())
    }

    async fn notify_drift_threshold_exceeded(
        &self,
        project_id: ProjectId,
        drifted_count: usize,
        managed_count: usize,
    ) -> Result<(), CollaboratorError> {
        info!(project_id = %project_id, drifted_count, managed_count, "drift threshold exceeded notification");
        Ok(())
    }
}

/// Append-only, in-process audit trail. A real deployment would persist this
/// alongside the rollout store; kept separate here since audit records are
/// never read back by the orchestration core itself (spec §6).
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub rollout_id: RolloutId,
    pub actor: uuid::Uuid,
    pub action: String,
    pub at: chrono::DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryAuditService {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditService for InMemoryAuditService {
    async fn record(&self, rollout_id: RolloutId, actor: uuid::Uuid, action: &str) -> Result<(), CollaboratorError> {
        self.records.lock().unwrap().push(AuditRecord {
            rollout_id,
            actor,
            action: action.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

/// Custom health check endpoints keyed by id, each resolving to a fixed
/// pass/fail outcome. A real implementation would issue an HTTP GET against
/// the endpoint's URL with its `timeout_ms`/`expected_status`; this fixture
/// lets tests and local runs exercise the gate deterministically without a
/// network dependency.
#[derive(Default)]
pub struct FixedCustomHealthCheckService {
    outcomes: Mutex<HashMap<String, bool>>,
}

impl FixedCustomHealthCheckService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, check_id: impl Into<String>, healthy: bool) {
        self.outcomes.lock().unwrap().insert(check_id.into(), healthy);
    }
}

#[async_trait]
impl CustomHealthCheckService for FixedCustomHealthCheckService {
    async fn check(&self, check_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.outcomes.lock().unwrap().get(check_id).copied().unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::types::{BundleStatus, NodeStatus};
    use uuid::Uuid;

    fn bundle(id: Uuid, project: Uuid) -> BundleSnapshot {
        BundleSnapshot {
            id,
            project_id: project,
            version: "v1".into(),
            status: BundleStatus::Compiled,
            checksum: "deadbeef".into(),
        }
    }

    fn node(id: Uuid, project: Uuid) -> NodeSnapshot {
        NodeSnapshot {
            id,
            project_id: project,
            status: NodeStatus::Online,
            active_bundle_id: None,
            staged_bundle_id: None,
            expected_bundle_id: None,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn bundle_service_returns_seeded_bundle() {
        let service = InMemoryBundleService::new();
        let project = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        service.insert(bundle(bundle_id, project));
        let fetched = service.get_bundle(bundle_id).await.unwrap();
        assert_eq!(fetched.id, bundle_id);
    }

    #[tokio::test]
    async fn diff_stats_is_zero_for_matching_bundles_and_stable_otherwise() {
        let service = InMemoryBundleService::new();
        let expected = Uuid::new_v4();
        let actual = Uuid::new_v4();

        let same = service.diff_stats(expected, Some(expected)).await.unwrap();
        assert_eq!(same.total(), 0);

        let a = service.diff_stats(expected, Some(actual)).await.unwrap();
        let b = service.diff_stats(expected, Some(actual)).await.unwrap();
        assert_eq!(a.additions, b.additions);
        assert_eq!(a.deletions, b.deletions);
    }

    #[tokio::test]
    async fn node_service_stage_and_clear_round_trips() {
        let service = InMemoryNodeService::new();
        let project = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        service.insert(node(node_id, project));

        service.stage_bundle(node_id, bundle_id).await.unwrap();
        assert_eq!(service.get_node(node_id).await.unwrap().staged_bundle_id, Some(bundle_id));

        service.clear_staged_bundle(node_id).await.unwrap();
        assert_eq!(service.get_node(node_id).await.unwrap().staged_bundle_id, None);
    }

    #[tokio::test]
    async fn node_service_list_nodes_filters_by_labels() {
        let service = InMemoryNodeService::new();
        let project = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        let mut edge = node(n1, project);
        edge.labels.insert("tier".into(), "edge".into());
        service.insert(edge);
        service.insert(node(n2, project));

        let wanted = BTreeMap::from([("tier".to_string(), "edge".to_string())]);
        let matched = service.list_nodes(project, Some(&wanted)).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, n1);
    }

    #[tokio::test]
    async fn project_service_operator_role_checks_roster() {
        let service = InMemoryProjectService::new();
        let project = Uuid::new_v4();
        let operator = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        service.grant_operator(project, operator);

        assert!(service.has_operator_role(operator, project).await.unwrap());
        assert!(!service.has_operator_role(outsider, project).await.unwrap());
    }

    #[tokio::test]
    async fn audit_service_accumulates_records_in_order() {
        let service = InMemoryAuditService::new();
        let rollout_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        service.record(rollout_id, actor, "approved").await.unwrap();
        service.record(rollout_id, actor, "cancelled").await.unwrap();

        let records = service.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, "approved");
        assert_eq!(records[1].action, "cancelled");
    }

    #[tokio::test]
    async fn custom_health_check_defaults_to_healthy_when_unregistered() {
        let service = FixedCustomHealthCheckService::new();
        assert!(service.check("unregistered").await.unwrap());
        service.set_outcome("gate-a", false);
        assert!(!service.check("gate-a").await.unwrap());
    }
}
