//! Sentinel-CP orchestration core: the rollout state machine, target resolution,
//! health/approval/schedule gates, and drift reconciliation.
//!
//! This crate owns no I/O of its own beyond the `RolloutStore` backends. Node
//! inventory, bundle compilation, notifications, and project metadata are all
//! read through the collaborator traits in [`collaborators`], so the same
//! orchestration logic runs against either the in-memory or the Postgres store
//! without caring which adapter crate is wired up at the edges.

#![deny(unsafe_code)]

pub mod approval;
pub mod collaborators;
pub mod drift;
pub mod error;
pub mod events;
pub mod planner;
pub mod rollout;
pub mod schedule;
pub mod selector;
pub mod store;
pub mod tick;
pub mod types;

pub use approval::ApprovalGate;
pub use collaborators::{
    AuditService, BundleService, CollaboratorError, CustomHealthCheckEndpoint,
    CustomHealthCheckService, NodeService, NotificationService, ProjectService, ProjectSnapshot,
};
pub use drift::{DriftReconciler, DriftScanSummary};
pub use error::SentinelError;
pub use events::{EventPublisher, RolloutEvent};
pub use rollout::{CreateRolloutRequest, RolloutService};
pub use schedule::{ScheduleAttempt, ScheduleGate};
pub use selector::TargetResolver;
pub use store::{ApprovalOutcome, NewRollout, RolloutStore};
pub use tick::{TickDriver, TickOutcome};
pub use types::{
    ApprovalDecision, ApprovalState, BundleId, BundleSnapshot, BundleStatus, DiffStats,
    DriftEvent, DriftResolution, DriftSeverity, ErrorDetail, HealthGates, Heartbeat,
    HeartbeatMetrics, NodeBundleState, NodeBundleStatus, NodeId, NodeSnapshot, NodeStatus,
    ProjectId, Rollout, RolloutApproval, RolloutDetails, RolloutId, RolloutState, RolloutStep,
    RolloutStrategy, StepState, TargetSelector, UserId,
};
