use super::{ApprovalOutcome, NewRollout, RolloutStore};
use crate::error::SentinelError;
use crate::types::{
    ApprovalDecision, ApprovalState, DriftEvent, DriftResolution, DriftSeverity, ErrorDetail,
    NodeBundleState, NodeBundleStatus, NodeId, ProjectId, Rollout, RolloutApproval,
    RolloutDetails, RolloutId, RolloutState, RolloutStep, RolloutStrategy, StepState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// `sqlx::PgPool`-backed implementation of `RolloutStore`. Compare-and-swap state
/// transitions are `UPDATE ... WHERE state = $expected` updates that report
/// `invalid_state` when the affected row count is 0 (spec §4.1, §5); multi-row
/// writes run inside one `sqlx::Transaction` so a step's row and its per-node
/// status rows commit or roll back together.
pub struct PostgresRolloutStore {
    pool: PgPool,
}

impl PostgresRolloutStore {
    pub async fn connect(database_url: &str) -> Result<Self, SentinelError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the schema described in the data model if it does not already
    /// exist. Intended for local/dev bring-up; production deployments migrate
    /// out of band.
    pub async fn run_migrations(&self) -> Result<(), SentinelError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
create table if not exists rollouts (
    id uuid primary key,
    project_id uuid not null,
    bundle_id uuid not null,
    target_selector jsonb not null,
    strategy text not null,
    batch_size bigint,
    batch_percentage double precision,
    max_unavailable bigint not null,
    progress_deadline_seconds bigint not null,
    health_gates jsonb not null,
    state text not null,
    approval_state text not null,
    scheduled_at timestamptz,
    auto_rollback boolean not null,
    rollback_threshold double precision,
    started_at timestamptz,
    completed_at timestamptz,
    error jsonb,
    created_by uuid not null,
    created_at timestamptz not null
);

create table if not exists rollout_steps (
    rollout_id uuid not null references rollouts(id),
    step_index bigint not null,
    node_ids jsonb not null,
    state text not null,
    started_at timestamptz,
    completed_at timestamptz,
    error jsonb,
    primary key (rollout_id, step_index)
);

create table if not exists node_bundle_statuses (
    node_id uuid not null,
    rollout_id uuid not null references rollouts(id),
    bundle_id uuid not null,
    state text not null,
    staged_at timestamptz,
    activated_at timestamptz,
    verified_at timestamptz,
    last_report_at timestamptz,
    error jsonb,
    primary key (node_id, rollout_id)
);

create table if not exists rollout_approvals (
    rollout_id uuid not null references rollouts(id),
    user_id uuid not null,
    decision text not null,
    comment text,
    created_at timestamptz not null,
    primary key (rollout_id, user_id)
);

create table if not exists drift_events (
    id uuid primary key,
    node_id uuid not null,
    project_id uuid not null,
    expected_bundle_id uuid not null,
    actual_bundle_id uuid,
    detected_at timestamptz not null,
    resolved_at timestamptz,
    resolution text,
    severity text not null,
    diff_stats jsonb not null
);

create unique index if not exists drift_events_one_unresolved_per_node
    on drift_events (node_id)
    where resolved_at is null;
"#;

fn rollout_from_row(row: &sqlx::postgres::PgRow) -> Result<Rollout, SentinelError> {
    Ok(Rollout {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        bundle_id: row.try_get("bundle_id")?,
        target_selector: serde_json::from_value(row.try_get("target_selector")?)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
        strategy: parse_strategy(row.try_get("strategy")?)?,
        batch_size: row.try_get::<Option<i64>, _>("batch_size")?.map(|v| v as u64),
        batch_percentage: row.try_get("batch_percentage")?,
        max_unavailable: row.try_get::<i64, _>("max_unavailable")? as u64,
        progress_deadline_seconds: row.try_get("progress_deadline_seconds")?,
        health_gates: serde_json::from_value(row.try_get("health_gates")?)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
        state: parse_rollout_state(row.try_get("state")?)?,
        approval_state: parse_approval_state(row.try_get("approval_state")?)?,
        scheduled_at: row.try_get("scheduled_at")?,
        auto_rollback: row.try_get("auto_rollback")?,
        rollback_threshold: row.try_get("rollback_threshold")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row
            .try_get::<Option<serde_json::Value>, _>("error")?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn step_from_row(row: &sqlx::postgres::PgRow) -> Result<RolloutStep, SentinelError> {
    Ok(RolloutStep {
        rollout_id: row.try_get("rollout_id")?,
        step_index: row.try_get::<i64, _>("step_index")? as u32,
        node_ids: serde_json::from_value(row.try_get("node_ids")?)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
        state: parse_step_state(row.try_get("state")?)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row
            .try_get::<Option<serde_json::Value>, _>("error")?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
    })
}

fn node_status_from_row(row: &sqlx::postgres::PgRow) -> Result<NodeBundleStatus, SentinelError> {
    Ok(NodeBundleStatus {
        node_id: row.try_get("node_id")?,
        rollout_id: row.try_get("rollout_id")?,
        bundle_id: row.try_get("bundle_id")?,
        state: parse_node_bundle_state(row.try_get("state")?)?,
        staged_at: row.try_get("staged_at")?,
        activated_at: row.try_get("activated_at")?,
        verified_at: row.try_get("verified_at")?,
        last_report_at: row.try_get("last_report_at")?,
        error: row
            .try_get::<Option<serde_json::Value>, _>("error")?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
    })
}

fn approval_from_row(row: &sqlx::postgres::PgRow) -> Result<RolloutApproval, SentinelError> {
    Ok(RolloutApproval {
        rollout_id: row.try_get("rollout_id")?,
        user_id: row.try_get("user_id")?,
        decision: parse_decision(row.try_get("decision")?)?,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
    })
}

fn drift_from_row(row: &sqlx::postgres::PgRow) -> Result<DriftEvent, SentinelError> {
    Ok(DriftEvent {
        id: row.try_get("id")?,
        node_id: row.try_get("node_id")?,
        project_id: row.try_get("project_id")?,
        expected_bundle_id: row.try_get("expected_bundle_id")?,
        actual_bundle_id: row.try_get("actual_bundle_id")?,
        detected_at: row.try_get("detected_at")?,
        resolved_at: row.try_get("resolved_at")?,
        resolution: row
            .try_get::<Option<String>, _>("resolution")?
            .map(|s| parse_resolution(&s))
            .transpose()?,
        severity: parse_severity(row.try_get("severity")?)?,
        diff_stats: serde_json::from_value(row.try_get("diff_stats")?)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?,
    })
}

fn parse_strategy(s: String) -> Result<RolloutStrategy, SentinelError> {
    match s.as_str() {
        "rolling" => Ok(RolloutStrategy::Rolling),
        "all_at_once" => Ok(RolloutStrategy::AllAtOnce),
        other => Err(SentinelError::Serialization(format!("unknown strategy: {other}"))),
    }
}

fn strategy_str(s: RolloutStrategy) -> &'static str {
    match s {
        RolloutStrategy::Rolling => "rolling",
        RolloutStrategy::AllAtOnce => "all_at_once",
    }
}

fn parse_rollout_state(s: String) -> Result<RolloutState, SentinelError> {
    Ok(match s.as_str() {
        "pending" => RolloutState::Pending,
        "awaiting_approval" => RolloutState::AwaitingApproval,
        "running" => RolloutState::Running,
        "paused" => RolloutState::Paused,
        "completed" => RolloutState::Completed,
        "failed" => RolloutState::Failed,
        "cancelled" => RolloutState::Cancelled,
        other => return Err(SentinelError::Serialization(format!("unknown rollout state: {other}"))),
    })
}

fn rollout_state_str(s: RolloutState) -> &'static str {
    match s {
        RolloutState::Pending => "pending",
        RolloutState::AwaitingApproval => "awaiting_approval",
        RolloutState::Running => "running",
        RolloutState::Paused => "paused",
        RolloutState::Completed => "completed",
        RolloutState::Failed => "failed",
        RolloutState::Cancelled => "cancelled",
    }
}

fn parse_approval_state(s: String) -> Result<ApprovalState, SentinelError> {
    Ok(match s.as_str() {
        "not_required" => ApprovalState::NotRequired,
        "pending_approval" => ApprovalState::PendingApproval,
        "approved" => ApprovalState::Approved,
        "rejected" => ApprovalState::Rejected,
        other => return Err(SentinelError::Serialization(format!("unknown approval state: {other}"))),
    })
}

fn approval_state_str(s: ApprovalState) -> &'static str {
    match s {
        ApprovalState::NotRequired => "not_required",
        ApprovalState::PendingApproval => "pending_approval",
        ApprovalState::Approved => "approved",
        ApprovalState::Rejected => "rejected",
    }
}

fn parse_step_state(s: String) -> Result<StepState, SentinelError> {
    Ok(match s.as_str() {
        "pending" => StepState::Pending,
        "running" => StepState::Running,
        "verifying" => StepState::Verifying,
        "completed" => StepState::Completed,
        "failed" => StepState::Failed,
        other => return Err(SentinelError::Serialization(format!("unknown step state: {other}"))),
    })
}

fn step_state_str(s: StepState) -> &'static str {
    match s {
        StepState::Pending => "pending",
        StepState::Running => "running",
        StepState::Verifying => "verifying",
        StepState::Completed => "completed",
        StepState::Failed => "failed",
    }
}

fn parse_node_bundle_state(s: String) -> Result<NodeBundleState, SentinelError> {
    Ok(match s.as_str() {
        "pending" => NodeBundleState::Pending,
        "staging" => NodeBundleState::Staging,
        "activating" => NodeBundleState::Activating,
        "active" => NodeBundleState::Active,
        "failed" => NodeBundleState::Failed,
        other => return Err(SentinelError::Serialization(format!("unknown node bundle state: {other}"))),
    })
}

fn node_bundle_state_str(s: NodeBundleState) -> &'static str {
    match s {
        NodeBundleState::Pending => "pending",
        NodeBundleState::Staging => "staging",
        NodeBundleState::Activating => "activating",
        NodeBundleState::Active => "active",
        NodeBundleState::Failed => "failed",
    }
}

fn parse_decision(s: String) -> Result<ApprovalDecision, SentinelError> {
    Ok(match s.as_str() {
        "approved" => ApprovalDecision::Approved,
        "rejected" => ApprovalDecision::Rejected,
        other => return Err(SentinelError::Serialization(format!("unknown decision: {other}"))),
    })
}

fn decision_str(d: ApprovalDecision) -> &'static str {
    match d {
        ApprovalDecision::Approved => "approved",
        ApprovalDecision::Rejected => "rejected",
    }
}

fn parse_severity(s: String) -> Result<DriftSeverity, SentinelError> {
    Ok(match s.as_str() {
        "low" => DriftSeverity::Low,
        "medium" => DriftSeverity::Medium,
        "high" => DriftSeverity::High,
        "critical" => DriftSeverity::Critical,
        other => return Err(SentinelError::Serialization(format!("unknown severity: {other}"))),
    })
}

fn severity_str(s: DriftSeverity) -> &'static str {
    match s {
        DriftSeverity::Low => "low",
        DriftSeverity::Medium => "medium",
        DriftSeverity::High => "high",
        DriftSeverity::Critical => "critical",
    }
}

fn parse_resolution(s: &str) -> Result<DriftResolution, SentinelError> {
    Ok(match s {
        "auto_corrected" => DriftResolution::AutoCorrected,
        "manual" => DriftResolution::Manual,
        "rollout_started" => DriftResolution::RolloutStarted,
        "rollout_completed" => DriftResolution::RolloutCompleted,
        other => return Err(SentinelError::Serialization(format!("unknown resolution: {other}"))),
    })
}

fn resolution_str(r: DriftResolution) -> &'static str {
    match r {
        DriftResolution::AutoCorrected => "auto_corrected",
        DriftResolution::Manual => "manual",
        DriftResolution::RolloutStarted => "rollout_started",
        DriftResolution::RolloutCompleted => "rollout_completed",
    }
}

#[async_trait]
impl RolloutStore for PostgresRolloutStore {
    async fn create_rollout(
        &self,
        new: NewRollout,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let id = Uuid::new_v4();
        let target_selector = serde_json::to_value(&new.target_selector)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?;
        let health_gates = serde_json::to_value(&new.health_gates)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"insert into rollouts
               (id, project_id, bundle_id, target_selector, strategy, batch_size,
                batch_percentage, max_unavailable, progress_deadline_seconds,
                health_gates, state, approval_state, scheduled_at, auto_rollback,
                rollback_threshold, started_at, completed_at, error, created_by,
                created_at)
               values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,null,null,null,$16,$17)
               returning *"#,
        )
        .bind(id)
        .bind(new.project_id)
        .bind(new.bundle_id)
        .bind(target_selector)
        .bind(strategy_str(new.strategy))
        .bind(new.batch_size.map(|v| v as i64))
        .bind(new.batch_percentage)
        .bind(new.max_unavailable as i64)
        .bind(new.progress_deadline_seconds)
        .bind(health_gates)
        .bind(rollout_state_str(new.initial_state))
        .bind(approval_state_str(new.initial_approval_state))
        .bind(new.scheduled_at)
        .bind(new.auto_rollback)
        .bind(new.rollback_threshold)
        .bind(new.created_by)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        rollout_from_row(&row)
    }

    async fn get_rollout(&self, id: RolloutId) -> Result<Option<Rollout>, SentinelError> {
        let row = sqlx::query("select * from rollouts where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rollout_from_row).transpose()
    }

    async fn get_details(&self, id: RolloutId) -> Result<Option<RolloutDetails>, SentinelError> {
        let Some(rollout) = self.get_rollout(id).await? else {
            return Ok(None);
        };
        let step_rows = sqlx::query(
            "select * from rollout_steps where rollout_id = $1 order by step_index asc",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let steps = step_rows.iter().map(step_from_row).collect::<Result<_, _>>()?;

        let status_rows =
            sqlx::query("select * from node_bundle_statuses where rollout_id = $1")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        let node_statuses = status_rows
            .iter()
            .map(node_status_from_row)
            .collect::<Result<_, _>>()?;

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
        let rows = match state {
            Some(state) => {
                sqlx::query("select * from rollouts where project_id = $1 and state = $2")
                    .bind(project_id)
                    .bind(rollout_state_str(state))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => sqlx::query("select * from rollouts where project_id = $1")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?,
        };
        rows.iter().map(rollout_from_row).collect()
    }

    async fn due_scheduled_rollouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Rollout>, SentinelError> {
        let rows = sqlx::query(
            r#"select * from rollouts
               where state = 'pending'
                 and approval_state in ('not_required', 'approved')
                 and scheduled_at is not null
                 and scheduled_at <= $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rollout_from_row).collect()
    }

    async fn plan_rollout(
        &self,
        rollout_id: RolloutId,
        batches: Vec<Vec<NodeId>>,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let mut tx = self.pool.begin().await?;

        let rollout_row = sqlx::query("select * from rollouts where id = $1 for update")
            .bind(rollout_id)
            .fetch_one(&mut *tx)
            .await?;
        let rollout = rollout_from_row(&rollout_row)?;
        if rollout.state != RolloutState::Pending {
            return Err(SentinelError::InvalidState(format!(
                "cannot plan rollout in state {:?}",
                rollout.state
            )));
        }

        for (index, node_ids) in batches.iter().enumerate() {
            let node_ids_json = serde_json::to_value(node_ids)
                .map_err(|e| SentinelError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"insert into rollout_steps (rollout_id, step_index, node_ids, state)
                   values ($1, $2, $3, 'pending')"#,
            )
            .bind(rollout_id)
            .bind(index as i64)
            .bind(node_ids_json)
            .execute(&mut *tx)
            .await?;

            for node_id in node_ids {
                sqlx::query(
                    r#"insert into node_bundle_statuses (node_id, rollout_id, bundle_id, state)
                       values ($1, $2, $3, 'pending')"#,
                )
                .bind(node_id)
                .bind(rollout_id)
                .bind(rollout.bundle_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated_row = sqlx::query(
            r#"update rollouts set state = 'running', started_at = $2 where id = $1 returning *"#,
        )
        .bind(rollout_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        rollout_from_row(&updated_row)
    }

    async fn transition_rollout(
        &self,
        rollout_id: RolloutId,
        expected: RolloutState,
        new_state: RolloutState,
        error: Option<ErrorDetail>,
        now: DateTime<Utc>,
    ) -> Result<Rollout, SentinelError> {
        let error_json = error
            .map(|e| serde_json::to_value(e))
            .transpose()
            .map_err(|e| SentinelError::Serialization(e.to_string()))?;
        let completed_at = new_state.is_terminal().then_some(now);

        let row = sqlx::query(
            r#"update rollouts
               set state = $3, error = $4, completed_at = coalesce($5, completed_at)
               where id = $1 and state = $2
               returning *"#,
        )
        .bind(rollout_id)
        .bind(rollout_state_str(expected))
        .bind(rollout_state_str(new_state))
        .bind(error_json)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => rollout_from_row(&row),
            None => Err(SentinelError::InvalidState(format!(
                "rollout {rollout_id} is not in state {expected:?}"
            ))),
        }
    }

    async fn mark_rolled_back(&self, rollout_id: RolloutId) -> Result<(), SentinelError> {
        let exists: Option<Uuid> = sqlx::query_scalar("select id from rollouts where id = $1")
            .bind(rollout_id)
            .fetch_optional(&self.pool)
            .await?;
        exists
            .map(|_| ())
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))
    }

    async fn get_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
    ) -> Result<Option<RolloutStep>, SentinelError> {
        let row = sqlx::query(
            "select * from rollout_steps where rollout_id = $1 and step_index = $2",
        )
        .bind(rollout_id)
        .bind(step_index as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn running_or_verifying_step(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Option<RolloutStep>, SentinelError> {
        let row = sqlx::query(
            r#"select * from rollout_steps
               where rollout_id = $1 and state in ('running', 'verifying')
               limit 1"#,
        )
        .bind(rollout_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn lowest_pending_step(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Option<RolloutStep>, SentinelError> {
        let row = sqlx::query(
            r#"select * from rollout_steps
               where rollout_id = $1 and state = 'pending'
               order by step_index asc
               limit 1"#,
        )
        .bind(rollout_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn all_steps_completed(&self, rollout_id: RolloutId) -> Result<bool, SentinelError> {
        let incomplete: Option<i64> = sqlx::query_scalar(
            r#"select count(*) from rollout_steps
               where rollout_id = $1 and state != 'completed'"#,
        )
        .bind(rollout_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(incomplete.unwrap_or(0) == 0)
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
        let error_json = error
            .map(|e| serde_json::to_value(e))
            .transpose()
            .map_err(|e| SentinelError::Serialization(e.to_string()))?;
        let started_at = matches!(new_state, StepState::Running).then_some(now);
        let completed_at =
            matches!(new_state, StepState::Completed | StepState::Failed).then_some(now);

        let row = sqlx::query(
            r#"update rollout_steps
               set state = $4, error = $5,
                   started_at = coalesce($6, started_at),
                   completed_at = coalesce($7, completed_at)
               where rollout_id = $1 and step_index = $2 and state = $3
               returning *"#,
        )
        .bind(rollout_id)
        .bind(step_index as i64)
        .bind(step_state_str(expected))
        .bind(step_state_str(new_state))
        .bind(error_json)
        .bind(started_at)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => step_from_row(&row),
            None => Err(SentinelError::InvalidState(format!(
                "step {step_index} of rollout {rollout_id} is not in state {expected:?}"
            ))),
        }
    }

    async fn node_statuses_for_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
    ) -> Result<Vec<NodeBundleStatus>, SentinelError> {
        let Some(step) = self.get_step(rollout_id, step_index).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "select * from node_bundle_statuses where rollout_id = $1 and node_id = any($2)",
        )
        .bind(rollout_id)
        .bind(&step.node_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_status_from_row).collect()
    }

    async fn node_statuses_for_rollout(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Vec<NodeBundleStatus>, SentinelError> {
        let rows = sqlx::query("select * from node_bundle_statuses where rollout_id = $1")
            .bind(rollout_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_status_from_row).collect()
    }

    async fn bulk_set_node_bundle_state(
        &self,
        rollout_id: RolloutId,
        node_ids: &[NodeId],
        state: NodeBundleState,
        now: DateTime<Utc>,
    ) -> Result<(), SentinelError> {
        let staged_at = matches!(state, NodeBundleState::Staging).then_some(now);
        let activated_at = matches!(state, NodeBundleState::Active).then_some(now);
        let verified_at = matches!(state, NodeBundleState::Active).then_some(now);

        sqlx::query(
            r#"update node_bundle_statuses
               set state = $3, last_report_at = $4,
                   staged_at = coalesce($5, staged_at),
                   activated_at = coalesce($6, activated_at),
                   verified_at = coalesce($7, verified_at)
               where rollout_id = $1 and node_id = any($2)"#,
        )
        .bind(rollout_id)
        .bind(node_ids)
        .bind(node_bundle_state_str(state))
        .bind(now)
        .bind(staged_at)
        .bind(activated_at)
        .bind(verified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_verifying_step(
        &self,
        rollout_id: RolloutId,
        step_index: u32,
        node_ids: &[NodeId],
        now: DateTime<Utc>,
    ) -> Result<RolloutStep, SentinelError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"update node_bundle_statuses
               set state = 'active', last_report_at = $3,
                   activated_at = $3, verified_at = $3
               where rollout_id = $1 and node_id = any($2)"#,
        )
        .bind(rollout_id)
        .bind(node_ids)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"update rollout_steps
               set state = 'completed', error = null, completed_at = $3
               where rollout_id = $1 and step_index = $2 and state = 'verifying'
               returning *"#,
        )
        .bind(rollout_id)
        .bind(step_index as i64)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                tx.rollback().await?;
                return Err(SentinelError::InvalidState(format!(
                    "step {step_index} of rollout {rollout_id} is not in state Verifying"
                )));
            }
        };

        tx.commit().await?;
        step_from_row(&row)
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
        let mut tx = self.pool.begin().await?;

        let insert_result = sqlx::query(
            r#"insert into rollout_approvals (rollout_id, user_id, decision, comment, created_at)
               values ($1, $2, $3, $4, $5)
               on conflict (rollout_id, user_id) do nothing"#,
        )
        .bind(rollout_id)
        .bind(user_id)
        .bind(decision_str(decision))
        .bind(&comment)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if insert_result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(SentinelError::AlreadyApproved);
        }

        let outcome = match decision {
            ApprovalDecision::Rejected => {
                sqlx::query(
                    r#"update rollouts set approval_state = 'rejected', state = 'cancelled',
                       completed_at = $2 where id = $1"#,
                )
                .bind(rollout_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                ApprovalOutcome::Rejected
            }
            ApprovalDecision::Approved => {
                let approvals_count: i64 = sqlx::query_scalar(
                    "select count(*) from rollout_approvals where rollout_id = $1",
                )
                .bind(rollout_id)
                .fetch_one(&mut *tx)
                .await?;
                let quorum_reached = approvals_count as u32 >= approvals_needed;
                if quorum_reached {
                    sqlx::query("update rollouts set approval_state = 'approved' where id = $1")
                        .bind(rollout_id)
                        .execute(&mut *tx)
                        .await?;
                }
                ApprovalOutcome::Recorded {
                    approvals_count: approvals_count as u32,
                    quorum_reached,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_approvals(
        &self,
        rollout_id: RolloutId,
    ) -> Result<Vec<RolloutApproval>, SentinelError> {
        let rows = sqlx::query("select * from rollout_approvals where rollout_id = $1")
            .bind(rollout_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(approval_from_row).collect()
    }

    async fn unresolved_drift_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Option<DriftEvent>, SentinelError> {
        let row = sqlx::query(
            "select * from drift_events where node_id = $1 and resolved_at is null",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(drift_from_row).transpose()
    }

    async fn insert_drift_event(&self, event: DriftEvent) -> Result<DriftEvent, SentinelError> {
        let diff_stats = serde_json::to_value(event.diff_stats)
            .map_err(|e| SentinelError::Serialization(e.to_string()))?;
        let row = sqlx::query(
            r#"insert into drift_events
               (id, node_id, project_id, expected_bundle_id, actual_bundle_id, detected_at,
                resolved_at, resolution, severity, diff_stats)
               values ($1,$2,$3,$4,$5,$6,null,null,$7,$8)
               returning *"#,
        )
        .bind(event.id)
        .bind(event.node_id)
        .bind(event.project_id)
        .bind(event.expected_bundle_id)
        .bind(event.actual_bundle_id)
        .bind(event.detected_at)
        .bind(severity_str(event.severity))
        .bind(diff_stats)
        .fetch_one(&self.pool)
        .await?;
        drift_from_row(&row)
    }

    async fn resolve_drift_event(
        &self,
        id: Uuid,
        resolution: DriftResolution,
        now: DateTime<Utc>,
    ) -> Result<DriftEvent, SentinelError> {
        let row = sqlx::query(
            r#"update drift_events set resolved_at = $2, resolution = $3
               where id = $1 and resolved_at is null
               returning *"#,
        )
        .bind(id)
        .bind(now)
        .bind(resolution_str(resolution))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => drift_from_row(&row),
            None => Err(SentinelError::InvalidState(
                "drift event not found or already resolved".into(),
            )),
        }
    }

    async fn list_drift_events(
        &self,
        project_id: ProjectId,
        unresolved_only: bool,
    ) -> Result<Vec<DriftEvent>, SentinelError> {
        let rows = if unresolved_only {
            sqlx::query(
                "select * from drift_events where project_id = $1 and resolved_at is null",
            )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query("select * from drift_events where project_id = $1")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(drift_from_row).collect()
    }

    async fn get_drift_event(&self, id: Uuid) -> Result<Option<DriftEvent>, SentinelError> {
        let row = sqlx::query("select * from drift_events where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(drift_from_row).transpose()
    }
}
