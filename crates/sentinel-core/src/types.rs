use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Stable identifiers for every persisted entity. All ids are 128-bit per spec §6.
pub type RolloutId = Uuid;
pub type NodeId = Uuid;
pub type BundleId = Uuid;
pub type ProjectId = Uuid;
pub type UserId = Uuid;

/// Rollout strategy: how resolved targets are chunked into steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    Rolling,
    AllAtOnce,
}

/// Rollout lifecycle state. `Completed`/`Failed`/`Cancelled` are terminal (invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    AwaitingApproval,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RolloutState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Approval quorum state for a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    NotRequired,
    PendingApproval,
    Approved,
    Rejected,
}

/// Structured failure/pause reason carried on a rollout or step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub reason: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ErrorDetail {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Recognized health-gate keys (spec §4.4). Absent keys default to pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthGates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_health_checks: Vec<String>,
}

/// One (type-tagged) selector for resolving a rollout's target nodes (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSelector {
    All,
    Labels { labels: BTreeMap<String, String> },
    NodeIds { node_ids: Vec<NodeId> },
    Groups { group_ids: Vec<Uuid> },
}

/// A single deployment campaign (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub id: RolloutId,
    pub project_id: ProjectId,
    pub bundle_id: BundleId,
    pub target_selector: TargetSelector,
    pub strategy: RolloutStrategy,
    pub batch_size: Option<u64>,
    pub batch_percentage: Option<f64>,
    pub max_unavailable: u64,
    pub progress_deadline_seconds: i64,
    pub health_gates: HealthGates,
    pub state: RolloutState,
    pub approval_state: ApprovalState,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub auto_rollback: bool,
    pub rollback_threshold: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetail>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Per-batch step state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Verifying,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStep {
    pub rollout_id: RolloutId,
    pub step_index: u32,
    pub node_ids: Vec<NodeId>,
    pub state: StepState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetail>,
}

/// Per-(node, rollout) progress row (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeBundleState {
    Pending,
    Staging,
    Activating,
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBundleStatus {
    pub node_id: NodeId,
    pub rollout_id: RolloutId,
    pub bundle_id: BundleId,
    pub state: NodeBundleState,
    pub staged_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_report_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetail>,
}

/// One (rollout, user) approval record (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutApproval {
    pub rollout_id: RolloutId,
    pub user_id: UserId,
    pub decision: ApprovalDecision,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Rollout with its steps (ordered by `step_index`) and per-node statuses eagerly
/// loaded, as returned by `GET .../rollouts/{id}` (spec §4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutDetails {
    pub rollout: Rollout,
    pub steps: Vec<RolloutStep>,
    pub node_statuses: Vec<NodeBundleStatus>,
}

/// Node status as reported by the external node service (consumed-only, spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

/// Snapshot of node state the core reads; it only ever writes `staged_bundle_id`
/// and `expected_bundle_id` on the underlying node (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub project_id: ProjectId,
    pub status: NodeStatus,
    pub active_bundle_id: Option<BundleId>,
    pub staged_bundle_id: Option<BundleId>,
    pub expected_bundle_id: Option<BundleId>,
    pub labels: BTreeMap<String, String>,
}

/// Bundle compile status (consumed from the bundle service, spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Pending,
    Compiling,
    Compiled,
    Failed,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSnapshot {
    pub id: BundleId,
    pub project_id: ProjectId,
    pub version: String,
    pub status: BundleStatus,
    pub checksum: String,
}

/// Latest per-node heartbeat snapshot (consumed-only, spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub latency_p99_ms: f64,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub healthy: bool,
    pub metrics: HeartbeatMetrics,
    pub observed_at: DateTime<Utc>,
}

/// Drift resolution reasons (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftResolution {
    AutoCorrected,
    Manual,
    RolloutStarted,
    RolloutCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiffStats {
    pub additions: u32,
    pub deletions: u32,
}

impl DiffStats {
    pub fn total(&self) -> u32 {
        self.additions + self.deletions
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEvent {
    pub id: Uuid,
    pub node_id: NodeId,
    pub project_id: ProjectId,
    pub expected_bundle_id: BundleId,
    pub actual_bundle_id: Option<BundleId>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<DriftResolution>,
    pub severity: DriftSeverity,
    pub diff_stats: DiffStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_completed_failed_cancelled() {
        assert!(RolloutState::Completed.is_terminal());
        assert!(RolloutState::Failed.is_terminal());
        assert!(RolloutState::Cancelled.is_terminal());
        assert!(!RolloutState::Running.is_terminal());
        assert!(!RolloutState::Paused.is_terminal());
        assert!(!RolloutState::Pending.is_terminal());
        assert!(!RolloutState::AwaitingApproval.is_terminal());
    }

    #[test]
    fn target_selector_round_trips_through_tagged_json() {
        let selector = TargetSelector::Labels {
            labels: BTreeMap::from([("tier".to_string(), "edge".to_string())]),
        };
        let json = serde_json::to_value(&selector).unwrap();
        assert_eq!(json["type"], "labels");
        let back: TargetSelector = serde_json::from_value(json).unwrap();
        match back {
            TargetSelector::Labels { labels } => assert_eq!(labels["tier"], "edge"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
