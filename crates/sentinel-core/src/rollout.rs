use crate::collaborators::{BundleService, NodeService};
use crate::error::SentinelError;
use crate::events::{EventPublisher, RolloutEvent};
use crate::planner;
use crate::selector::TargetResolver;
use crate::store::{NewRollout, RolloutStore};
use crate::types::{
    ApprovalState, BundleId, BundleStatus, HealthGates, ProjectId, Rollout, RolloutId,
    RolloutState, RolloutStrategy, TargetSelector, UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

/// Caller-supplied fields for a new rollout (spec §6's `POST .../rollouts` body).
#[derive(Debug, Clone)]
pub struct CreateRolloutRequest {
    pub project_id: ProjectId,
    pub bundle_id: BundleId,
    pub target_selector: TargetSelector,
    pub strategy: RolloutStrategy,
    pub batch_size: Option<u64>,
    pub batch_percentage: Option<f64>,
    pub max_unavailable: u64,
    pub progress_deadline_seconds: i64,
    pub health_gates: HealthGates,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub auto_rollback: bool,
    pub rollback_threshold: Option<f64>,
    pub created_by: UserId,
    pub approvals_needed: u32,
}

/// Orchestrates rollout creation, planning, and the pause/resume/cancel/rollback
/// lifecycle transitions (spec §2, §4.4's planning step, §4.4's "Pause/Resume/
/// Cancel/Rollback" subsection). `TickDriver` owns step-by-step advance once a
/// rollout is `running`; this is the layer that gets it there and takes it out
/// early, composing a validation step, a registry lookup, and a store write
/// behind one façade.
pub struct RolloutService {
    store: Arc<dyn RolloutStore>,
    bundles: Arc<dyn BundleService>,
    nodes: Arc<dyn NodeService>,
    resolver: TargetResolver,
    events: Arc<EventPublisher>,
}

impl RolloutService {
    pub fn new(
        store: Arc<dyn RolloutStore>,
        bundles: Arc<dyn BundleService>,
        nodes: Arc<dyn NodeService>,
        events: Arc<EventPublisher>,
    ) -> Self {
        let resolver = TargetResolver::new(nodes.clone());
        Self {
            store,
            bundles,
            nodes,
            resolver,
            events,
        }
    }

    /// Validates the bundle is `compiled` (invariant 1), then inserts the rollout
    /// in `pending`/`awaiting_approval` per whether the project gates on approval
    /// quorum. Plans immediately when ungated and not future-scheduled.
    #[instrument(skip(self, req), fields(project_id = %req.project_id, bundle_id = %req.bundle_id))]
    pub async fn create(
        &self,
        req: CreateRolloutRequest,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let bundle = self
            .bundles
            .get_bundle(req.bundle_id)
            .await
            .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
        if bundle.status != BundleStatus::Compiled {
            return Err(SentinelError::BundleNotCompiled(req.bundle_id.to_string()));
        }

        let initial_approval_state = if req.approvals_needed > 0 {
            ApprovalState::PendingApproval
        } else {
            ApprovalState::NotRequired
        };

        let new = NewRollout {
            project_id: req.project_id,
            bundle_id: req.bundle_id,
            target_selector: req.target_selector,
            strategy: req.strategy,
            batch_size: req.batch_size,
            batch_percentage: req.batch_percentage,
            max_unavailable: req.max_unavailable,
            progress_deadline_seconds: req.progress_deadline_seconds,
            health_gates: req.health_gates,
            scheduled_at: req.scheduled_at,
            auto_rollback: req.auto_rollback,
            rollback_threshold: req.rollback_threshold,
            created_by: req.created_by,
            initial_state: RolloutState::Pending,
            initial_approval_state,
        };
        let rollout = self.store.create_rollout(new, now).await?;
        info!(rollout_id = %rollout.id, "rollout created");
        self.events.publish(RolloutEvent::rollout_updated(&rollout));

        let gated = rollout.approval_state == ApprovalState::PendingApproval;
        let due = rollout.scheduled_at.map(|s| s <= now).unwrap_or(true);
        if !gated && due {
            return self.plan(rollout.id, now).await;
        }
        Ok(rollout)
    }

    /// Resolves targets, chunks them into batches, and hands the rollout to the
    /// tick driver by transitioning it to `running` (spec §4.2–§4.4). Returns
    /// `no_target_nodes` without any store write when resolution is empty
    /// (invariant/property P7).
    #[instrument(skip(self), fields(rollout_id = %rollout_id))]
    pub async fn plan(&self, rollout_id: RolloutId, now: DateTime<Utc>) -> Result<Rollout, SentinelError> {
        let rollout = self
            .store
            .get_rollout(rollout_id)
            .await?
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;

        let targets = self
            .resolver
            .resolve(rollout.project_id, &rollout.target_selector)
            .await?;
        if targets.is_empty() {
            return Err(SentinelError::NoTargetNodes);
        }

        let batches = planner::plan_batches(
            targets,
            rollout.strategy,
            rollout.batch_size,
            rollout.batch_percentage,
        );
        let updated = self.store.plan_rollout(rollout_id, batches, now).await?;
        info!("rollout planned and running");
        self.events.publish(RolloutEvent::rollout_updated(&updated));
        Ok(updated)
    }

    /// Pause only from `running` (spec §4.4).
    pub async fn pause(&self, rollout_id: RolloutId, now: DateTime<Utc>) -> Result<Rollout, SentinelError> {
        let updated = self
            .store
            .transition_rollout(rollout_id, RolloutState::Running, RolloutState::Paused, None, now)
            .await?;
        self.events.publish(RolloutEvent::rollout_updated(&updated));
        Ok(updated)
    }

    /// Resume only from `paused`; caller is responsible for re-enqueueing a tick.
    pub async fn resume(&self, rollout_id: RolloutId, now: DateTime<Utc>) -> Result<Rollout, SentinelError> {
        let updated = self
            .store
            .transition_rollout(rollout_id, RolloutState::Paused, RolloutState::Running, None, now)
            .await?;
        self.events.publish(RolloutEvent::rollout_updated(&updated));
        Ok(updated)
    }

    /// Cancel from `running` or `paused`; terminal (spec §4.4).
    pub async fn cancel(&self, rollout_id: RolloutId, now: DateTime<Utc>) -> Result<Rollout, SentinelError> {
        let rollout = self
            .store
            .get_rollout(rollout_id)
            .await?
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;
        let expected = match rollout.state {
            RolloutState::Running => RolloutState::Running,
            RolloutState::Paused => RolloutState::Paused,
            _ => {
                return Err(SentinelError::InvalidState(format!(
                    "cannot cancel rollout in state {:?}",
                    rollout.state
                )))
            }
        };
        let updated = self
            .store
            .transition_rollout(rollout_id, expected, RolloutState::Cancelled, None, now)
            .await?;
        self.events.publish(RolloutEvent::rollout_updated(&updated));
        Ok(updated)
    }

    /// Cancel plus revert: every node whose `staged_bundle_id` still equals this
    /// rollout's bundle has it cleared back to its previous intent (spec R3). A
    /// node already advanced past staging by a *different* later rollout is left
    /// alone, since its `staged_bundle_id` no longer matches.
    pub async fn rollback(&self, rollout_id: RolloutId, now: DateTime<Utc>) -> Result<Rollout, SentinelError> {
        let rollout = self.cancel(rollout_id, now).await?;
        let statuses = self.store.node_statuses_for_rollout(rollout_id).await?;
        for status in statuses {
            let node = self
                .nodes
                .get_node(status.node_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
            if node.staged_bundle_id == Some(rollout.bundle_id) {
                self.nodes
                    .clear_staged_bundle(status.node_id)
                    .await
                    .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
            }
        }
        self.store.mark_rolled_back(rollout_id).await?;
        Ok(rollout)
    }
}
