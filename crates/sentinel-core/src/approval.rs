use crate::collaborators::ProjectService;
use crate::error::SentinelError;
use crate::events::{EventPublisher, RolloutEvent};
use crate::rollout::RolloutService;
use crate::store::{ApprovalOutcome, RolloutStore};
use crate::types::{ApprovalDecision, RolloutId, UserId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Guards the `pending -> running` transition for projects that require
/// approval quorum (spec §4.5). A thin transition table over `RolloutStore`,
/// mapping `(state, event) -> state` with an explicit `Err` arm for each
/// disallowed pair.
pub struct ApprovalGate {
    store: Arc<dyn RolloutStore>,
    projects: Arc<dyn ProjectService>,
    events: Arc<EventPublisher>,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<dyn RolloutStore>,
        projects: Arc<dyn ProjectService>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            store,
            projects,
            events,
        }
    }

    /// Records one approval. Rejects self-approval, duplicate approval, and
    /// actors without the `operator` role. On reaching quorum, triggers planning
    /// immediately unless the rollout is still waiting on `scheduled_at` (spec
    /// §4.5's "otherwise the Schedule Gate will release it").
    pub async fn approve(
        &self,
        rollout_service: &RolloutService,
        rollout_id: RolloutId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome, SentinelError> {
        let rollout = self
            .store
            .get_rollout(rollout_id)
            .await?
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;

        if rollout.created_by == actor {
            return Err(SentinelError::SelfApproval);
        }

        let authorized = self
            .projects
            .has_operator_role(actor, rollout.project_id)
            .await
            .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
        if !authorized {
            return Err(SentinelError::NotAuthorized);
        }

        let project = self
            .projects
            .get_project(rollout.project_id)
            .await
            .map_err(|e| SentinelError::Collaborator(e.to_string()))?;

        let outcome = self
            .store
            .record_approval(
                rollout_id,
                actor,
                ApprovalDecision::Approved,
                None,
                project.approvals_needed,
                now,
            )
            .await?;
        info!(rollout_id = %rollout_id, actor = %actor, "approval recorded");
        self.events.publish(RolloutEvent::ApprovalRecorded { rollout_id, at: now });

        if let ApprovalOutcome::Recorded { quorum_reached: true, .. } = outcome {
            let due = rollout.scheduled_at.map(|s| s <= now).unwrap_or(true);
            if due {
                rollout_service.plan(rollout_id, now).await?;
            }
        }

        Ok(outcome)
    }

    /// Records a rejection. A comment is mandatory (spec §4.5); the rollout is
    /// immediately cancelled.
    pub async fn reject(
        &self,
        rollout_id: RolloutId,
        actor: UserId,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SentinelError> {
        let comment = comment.ok_or(SentinelError::CommentRequired)?;
        self.store
            .record_approval(rollout_id, actor, ApprovalDecision::Rejected, Some(comment), 0, now)
            .await?;
        warn!(rollout_id = %rollout_id, actor = %actor, "rollout rejected");
        self.events.publish(RolloutEvent::ApprovalRecorded { rollout_id, at: now });
        Ok(())
    }
}
