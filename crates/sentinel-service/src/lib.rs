#![deny(unsafe_code)]

pub mod queue;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use queue::{Job, JobRunner, JobRunnerConfig, QueueError, QUEUE_MAINTENANCE, QUEUE_ROLLOUTS};
use sentinel_adapters::{
    FixedCustomHealthCheckService, InMemoryAuditService, InMemoryBundleService,
    InMemoryNodeService, InMemoryProjectService, LoggingNotificationService,
};
use sentinel_core::{
    ApprovalGate, AuditService, BundleService, CreateRolloutRequest, CustomHealthCheckService,
    DriftReconciler, DriftResolution, EventPublisher, NodeService, NotificationService,
    ProjectId, ProjectService, Rollout, RolloutDetails, RolloutId, RolloutState, RolloutStore,
    RolloutService, ScheduleGate, SentinelError, TargetSelector, TickDriver, TickOutcome, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Durable-job and gate-interval settings (spec §9's "Global configuration"
/// list). Passed at construction rather than read from process-wide state.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub drift_check_interval_seconds: u64,
    pub tick_delay_seconds: u64,
    pub default_progress_deadline_seconds: i64,
    pub job_runner: JobRunnerConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            drift_check_interval_seconds: 30,
            tick_delay_seconds: 1,
            default_progress_deadline_seconds: 600,
            job_runner: JobRunnerConfig::default(),
        }
    }
}

/// Store backend selection (spec §2's "relational database"). Memory is for
/// local/dev and tests; Postgres is the production backend.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Memory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store_backend: StoreBackend,
    pub sentinel: SentinelConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            sentinel: SentinelConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub store: Arc<dyn RolloutStore>,
    pub projects: Arc<InMemoryProjectService>,
    pub nodes: Arc<InMemoryNodeService>,
    pub bundles: Arc<InMemoryBundleService>,
    pub audit: Arc<dyn AuditService>,
    pub events: Arc<EventPublisher>,
    pub rollout_service: Arc<RolloutService>,
    pub approval_gate: Arc<ApprovalGate>,
    pub schedule_gate: Arc<ScheduleGate>,
    pub tick_driver: Arc<TickDriver>,
    pub drift_reconciler: Arc<DriftReconciler>,
    pub jobs: Arc<JobRunner>,
    pub config: SentinelConfig,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store: Arc<dyn RolloutStore> = match &config.store_backend {
            StoreBackend::Memory => Arc::new(sentinel_core::store::InMemoryRolloutStore::new()),
            StoreBackend::Postgres { database_url } => {
                let store = sentinel_core::store::PostgresRolloutStore::connect(database_url)
                    .await
                    .map_err(ServiceError::Core)?;
                store.run_migrations().await.map_err(ServiceError::Core)?;
                Arc::new(store)
            }
        };

        let projects = Arc::new(InMemoryProjectService::new());
        let nodes = Arc::new(InMemoryNodeService::new());
        let bundles = Arc::new(InMemoryBundleService::new());
        let notifications = Arc::new(LoggingNotificationService);
        let audit: Arc<dyn AuditService> = Arc::new(InMemoryAuditService::new());
        let health_checks: Arc<dyn CustomHealthCheckService> =
            Arc::new(FixedCustomHealthCheckService::new());
        let events = Arc::new(EventPublisher::new());
        let jobs = Arc::new(JobRunner::new(config.sentinel.job_runner));

        let bundles_trait: Arc<dyn BundleService> = bundles.clone();
        let nodes_trait: Arc<dyn NodeService> = nodes.clone();
        let projects_trait: Arc<dyn ProjectService> = projects.clone();
        let notifications_trait: Arc<dyn NotificationService> = notifications;

        let rollout_service = Arc::new(RolloutService::new(
            store.clone(),
            bundles_trait.clone(),
            nodes_trait.clone(),
            events.clone(),
        ));
        let approval_gate = Arc::new(ApprovalGate::new(
            store.clone(),
            projects_trait.clone(),
            events.clone(),
        ));
        let schedule_gate = Arc::new(ScheduleGate::new(store.clone()));
        let tick_driver = Arc::new(TickDriver::new(
            store.clone(),
            bundles_trait.clone(),
            nodes_trait.clone(),
            health_checks,
            events.clone(),
        ));
        let drift_reconciler = Arc::new(DriftReconciler::new(
            store.clone(),
            nodes_trait,
            bundles_trait,
            projects_trait,
            notifications_trait,
            events.clone(),
        ));

        Ok(Self {
            store,
            projects,
            nodes,
            bundles,
            audit,
            events,
            rollout_service,
            approval_gate,
            schedule_gate,
            tick_driver,
            drift_reconciler,
            jobs,
            config: config.sentinel,
        })
    }

    /// Enqueues the first tick for a rollout that just became `running` (spec
    /// §2, §4.4, §4.5, §4.6 all converge on this same job).
    pub async fn enqueue_tick(&self, rollout_id: RolloutId) {
        let job = Arc::new(TickJob {
            rollout_id,
            driver: self.tick_driver.clone(),
            runner: self.jobs.clone(),
            tick_delay: Duration::from_secs(self.config.tick_delay_seconds.max(1)),
        });
        if let Err(err) = self.jobs.enqueue(QUEUE_ROLLOUTS, job).await {
            tracing::warn!(rollout_id = %rollout_id, error = %err, "failed to enqueue tick");
        }
    }

    /// Starts the two recurring maintenance jobs (spec §4.6, §4.7). Call once
    /// at process start; each job re-enqueues itself after it runs.
    pub fn spawn_background_jobs(self: &Arc<Self>) {
        let sweep = Arc::new(ScheduleSweepJob {
            state: self.clone(),
            interval: Duration::from_secs(60),
        });
        let drift = Arc::new(DriftScanJob {
            state: self.clone(),
            interval: Duration::from_secs(self.config.drift_check_interval_seconds.max(1)),
        });
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let _ = jobs.enqueue(QUEUE_MAINTENANCE, sweep).await;
        });
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let _ = jobs
                .enqueue_unique(
                    QUEUE_MAINTENANCE,
                    drift,
                    "startup",
                    Duration::from_secs(1),
                )
                .await;
        });
    }
}

struct TickJob {
    rollout_id: RolloutId,
    driver: Arc<TickDriver>,
    runner: Arc<JobRunner>,
    tick_delay: Duration,
}

#[async_trait::async_trait]
impl Job for TickJob {
    fn kind(&self) -> &'static str {
        "rollout_tick"
    }

    async fn run(&self) -> Result<(), String> {
        let outcome = self
            .driver
            .tick(self.rollout_id, Utc::now())
            .await
            .map_err(|e| e.to_string())?;

        if matches!(outcome, TickOutcome::Waiting | TickOutcome::StepAdvanced { .. }) {
            let next = Arc::new(TickJob {
                rollout_id: self.rollout_id,
                driver: self.driver.clone(),
                runner: self.runner.clone(),
                tick_delay: self.tick_delay,
            });
            self.runner
                .enqueue_delayed(QUEUE_ROLLOUTS, next, Some(self.tick_delay))
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

struct ScheduleSweepJob {
    state: Arc<ServiceState>,
    interval: Duration,
}

#[async_trait::async_trait]
impl Job for ScheduleSweepJob {
    fn kind(&self) -> &'static str {
        "schedule_sweep"
    }

    async fn run(&self) -> Result<(), String> {
        let attempts = self
            .state
            .schedule_gate
            .release_due(&self.state.rollout_service, Utc::now())
            .await
            .map_err(|e| e.to_string())?;

        for attempt in attempts {
            if attempt.result.is_ok() {
                self.state.enqueue_tick(attempt.rollout_id).await;
            }
        }

        let next = Arc::new(ScheduleSweepJob {
            state: self.state.clone(),
            interval: self.interval,
        });
        self.state
            .jobs
            .enqueue_delayed(QUEUE_MAINTENANCE, next, Some(self.interval))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

struct DriftScanJob {
    state: Arc<ServiceState>,
    interval: Duration,
}

#[async_trait::async_trait]
impl Job for DriftScanJob {
    fn kind(&self) -> &'static str {
        "drift_scan"
    }

    async fn run(&self) -> Result<(), String> {
        let summary = self
            .state
            .drift_reconciler
            .run_once(Utc::now())
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(
            detected = summary.detected,
            auto_resolved = summary.auto_resolved,
            threshold_alerts = summary.threshold_alerts,
            "drift scan complete"
        );

        let next = Arc::new(DriftScanJob {
            state: self.state.clone(),
            interval: self.interval,
        });
        self.state
            .jobs
            .enqueue_delayed(QUEUE_MAINTENANCE, next, Some(self.interval))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

pub fn build_router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route(
            "/v1/projects/:project_id/rollouts",
            get(list_rollouts).post(create_rollout),
        )
        .route("/v1/rollouts/:id", get(get_rollout))
        .route("/v1/rollouts/:id/pause", post(pause_rollout))
        .route("/v1/rollouts/:id/resume", post(resume_rollout))
        .route("/v1/rollouts/:id/cancel", post(cancel_rollout))
        .route("/v1/rollouts/:id/rollback", post(rollback_rollout))
        .route("/v1/rollouts/:id/approve", post(approve_rollout))
        .route("/v1/rollouts/:id/reject", post(reject_rollout))
        .route("/v1/projects/:project_id/drift", get(list_drift))
        .route("/v1/drift/:id/resolve", post(resolve_drift))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] SentinelError),
}

/// Maps `SentinelError`'s stable `code()` onto the 4xx/5xx surface spec §6
/// enumerates, plus a catch-all 500 for the infrastructure kind (spec §7.4).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, code: &'static str, message: String },
    #[error(transparent)]
    Core(#[from] SentinelError),
}

impl ApiError {
    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::Http { status: StatusCode::NOT_FOUND, code, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
        }
    }
}

fn status_for(err: &SentinelError) -> StatusCode {
    match err {
        SentinelError::Validation(_) => StatusCode::BAD_REQUEST,
        SentinelError::CommentRequired => StatusCode::BAD_REQUEST,
        SentinelError::InvalidState(_) => StatusCode::CONFLICT,
        SentinelError::NoTargetNodes => StatusCode::UNPROCESSABLE_ENTITY,
        SentinelError::BundleNotCompiled(_) => StatusCode::CONFLICT,
        SentinelError::BundleRevoked(_) => StatusCode::CONFLICT,
        SentinelError::SelfApproval => StatusCode::FORBIDDEN,
        SentinelError::AlreadyApproved => StatusCode::CONFLICT,
        SentinelError::NotAuthorized => StatusCode::FORBIDDEN,
        SentinelError::MaxUnavailableExceeded(_) => StatusCode::CONFLICT,
        SentinelError::DeadlineExceeded => StatusCode::CONFLICT,
        SentinelError::StepDeadlineExceeded(_) => StatusCode::CONFLICT,
        SentinelError::Store(_) | SentinelError::Collaborator(_) | SentinelError::Serialization(_) | SentinelError::Sqlx(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, code, message } => {
                (status, Json(serde_json::json!({ "error": message, "code": code }))).into_response()
            }
            ApiError::Core(err) => {
                let status = status_for(&err);
                (status, Json(serde_json::json!({ "error": err.to_string(), "code": err.code() }))).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", service: "sentinel-service" })
}

#[derive(Debug, Deserialize)]
struct CreateRolloutBody {
    bundle_id: sentinel_core::BundleId,
    target_selector: TargetSelector,
    strategy: sentinel_core::RolloutStrategy,
    #[serde(default)]
    batch_size: Option<u64>,
    #[serde(default)]
    batch_percentage: Option<f64>,
    #[serde(default)]
    max_unavailable: u64,
    #[serde(default)]
    progress_deadline_seconds: Option<i64>,
    #[serde(default)]
    health_gates: sentinel_core::HealthGates,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    auto_rollback: bool,
    #[serde(default)]
    rollback_threshold: Option<f64>,
    created_by: UserId,
}

async fn create_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<CreateRolloutBody>,
) -> Result<(StatusCode, Json<Rollout>), ApiError> {
    let project = state
        .projects
        .get_project(project_id)
        .await
        .map_err(|e| SentinelError::Collaborator(e.to_string()))?;

    let req = CreateRolloutRequest {
        project_id,
        bundle_id: body.bundle_id,
        target_selector: body.target_selector,
        strategy: body.strategy,
        batch_size: body.batch_size,
        batch_percentage: body.batch_percentage,
        max_unavailable: body.max_unavailable,
        progress_deadline_seconds: body
            .progress_deadline_seconds
            .unwrap_or(state.config.default_progress_deadline_seconds),
        health_gates: body.health_gates,
        scheduled_at: body.scheduled_at,
        auto_rollback: body.auto_rollback,
        rollback_threshold: body.rollback_threshold,
        created_by: body.created_by,
        approvals_needed: project.approvals_needed,
    };

    let rollout = state.rollout_service.create(req, Utc::now()).await?;
    if rollout.state == RolloutState::Running {
        state.enqueue_tick(rollout.id).await;
    }
    Ok((StatusCode::CREATED, Json(rollout)))
}

#[derive(Debug, Deserialize)]
struct ListRolloutsQuery {
    state: Option<String>,
}

fn parse_state_filter(state: Option<&str>) -> Result<Option<RolloutState>, ApiError> {
    match state {
        None => Ok(None),
        Some(raw) => serde_json::from_value(serde_json::Value::String(raw.to_string()))
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("invalid state '{raw}'"))),
    }
}

#[derive(Debug, Serialize)]
struct RolloutListResponse {
    items: Vec<Rollout>,
}

async fn list_rollouts(
    State(state): State<Arc<ServiceState>>,
    Path(project_id): Path<ProjectId>,
    Query(query): Query<ListRolloutsQuery>,
) -> Result<Json<RolloutListResponse>, ApiError> {
    let filter = parse_state_filter(query.state.as_deref())?;
    let items = state.store.list_rollouts(project_id, filter).await?;
    Ok(Json(RolloutListResponse { items }))
}

async fn get_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
) -> Result<Json<RolloutDetails>, ApiError> {
    let details = state
        .store
        .get_details(id)
        .await?
        .ok_or_else(|| ApiError::not_found("not_found", format!("rollout '{id}' not found")))?;
    Ok(Json(details))
}

async fn pause_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
) -> Result<Json<Rollout>, ApiError> {
    Ok(Json(state.rollout_service.pause(id, Utc::now()).await?))
}

async fn resume_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
) -> Result<Json<Rollout>, ApiError> {
    let rollout = state.rollout_service.resume(id, Utc::now()).await?;
    state.enqueue_tick(id).await;
    Ok(Json(rollout))
}

async fn cancel_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
) -> Result<Json<Rollout>, ApiError> {
    Ok(Json(state.rollout_service.cancel(id, Utc::now()).await?))
}

async fn rollback_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
) -> Result<Json<Rollout>, ApiError> {
    Ok(Json(state.rollout_service.rollback(id, Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    actor: UserId,
}

#[derive(Debug, Serialize)]
struct ApproveResponse {
    approvals_count: u32,
    quorum_reached: bool,
}

async fn approve_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let now = Utc::now();
    let outcome = state
        .approval_gate
        .approve(&state.rollout_service, id, body.actor, now)
        .await?;

    let (approvals_count, quorum_reached) = match outcome {
        sentinel_core::ApprovalOutcome::Recorded { approvals_count, quorum_reached } => {
            (approvals_count, quorum_reached)
        }
        sentinel_core::ApprovalOutcome::Rejected => (0, false),
    };

    if quorum_reached {
        if let Some(rollout) = state.store.get_rollout(id).await? {
            if rollout.state == RolloutState::Running {
                state.enqueue_tick(id).await;
            }
        }
    }

    Ok(Json(ApproveResponse { approvals_count, quorum_reached }))
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    actor: UserId,
    comment: Option<String>,
}

async fn reject_rollout(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<RolloutId>,
    Json(body): Json<RejectBody>,
) -> Result<StatusCode, ApiError> {
    state
        .approval_gate
        .reject(id, body.actor, body.comment, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DriftQuery {
    #[serde(default)]
    unresolved_only: bool,
}

#[derive(Debug, Serialize)]
struct DriftListResponse {
    items: Vec<sentinel_core::DriftEvent>,
}

async fn list_drift(
    State(state): State<Arc<ServiceState>>,
    Path(project_id): Path<ProjectId>,
    Query(query): Query<DriftQuery>,
) -> Result<Json<DriftListResponse>, ApiError> {
    let items = state.store.list_drift_events(project_id, query.unresolved_only).await?;
    Ok(Json(DriftListResponse { items }))
}

async fn resolve_drift(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<sentinel_core::DriftEvent>, ApiError> {
    state
        .store
        .get_drift_event(id)
        .await?
        .ok_or_else(|| ApiError::not_found("not_found", format!("drift event '{id}' not found")))?;
    let resolved = state
        .store
        .resolve_drift_event(id, DriftResolution::Manual, Utc::now())
        .await?;
    Ok(Json(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use sentinel_core::types::{BundleSnapshot, BundleStatus, NodeSnapshot, NodeStatus};
    use std::collections::BTreeMap;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn test_state() -> Arc<ServiceState> {
        Arc::new(ServiceState::bootstrap(ServiceConfig::default()).await.unwrap())
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

    fn bundle(id: Uuid, project: Uuid) -> BundleSnapshot {
        BundleSnapshot {
            id,
            project_id: project,
            version: "v1".into(),
            status: BundleStatus::Compiled,
            checksum: "deadbeef".into(),
        }
    }

    #[tokio::test]
    async fn create_rollout_without_approvals_plans_immediately() {
        let state = test_state().await;
        let project = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        state.projects.insert(sentinel_core::ProjectSnapshot {
            id: project,
            approvals_needed: 0,
            drift_threshold_percentage: None,
            drift_threshold_absolute: None,
        });
        state.nodes.insert(node(n1, project));
        state.bundles.insert(bundle(bundle_id, project));

        let app = build_router(state);
        let payload = serde_json::json!({
            "bundle_id": bundle_id,
            "target_selector": { "type": "all" },
            "strategy": "rolling",
            "batch_size": 1,
            "max_unavailable": 0,
            "progress_deadline_seconds": 600,
            "created_by": Uuid::new_v4(),
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/projects/{project}/rollouts"))
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let rollout: Rollout = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rollout.state, RolloutState::Running);
    }

    #[tokio::test]
    async fn create_rollout_rejects_bundle_not_compiled() {
        let state = test_state().await;
        let project = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        state.projects.insert(sentinel_core::ProjectSnapshot {
            id: project,
            approvals_needed: 0,
            drift_threshold_percentage: None,
            drift_threshold_absolute: None,
        });
        state.bundles.insert(BundleSnapshot {
            id: bundle_id,
            project_id: project,
            version: "v1".into(),
            status: BundleStatus::Pending,
            checksum: "x".into(),
        });

        let app = build_router(state);
        let payload = serde_json::json!({
            "bundle_id": bundle_id,
            "target_selector": { "type": "all" },
            "strategy": "rolling",
            "batch_size": 1,
            "max_unavailable": 0,
            "progress_deadline_seconds": 600,
            "created_by": Uuid::new_v4(),
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/projects/{project}/rollouts"))
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.get("code").and_then(|v| v.as_str()), Some("bundle_not_compiled"));
    }

    #[tokio::test]
    async fn get_rollout_returns_eager_steps_and_statuses() {
        let state = test_state().await;
        let project = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        state.projects.insert(sentinel_core::ProjectSnapshot {
            id: project,
            approvals_needed: 0,
            drift_threshold_percentage: None,
            drift_threshold_absolute: None,
        });
        state.nodes.insert(node(n1, project));
        state.bundles.insert(bundle(bundle_id, project));

        let created = state
            .rollout_service
            .create(
                CreateRolloutRequest {
                    project_id: project,
                    bundle_id,
                    target_selector: TargetSelector::All,
                    strategy: sentinel_core::RolloutStrategy::Rolling,
                    batch_size: Some(1),
                    batch_percentage: None,
                    max_unavailable: 0,
                    progress_deadline_seconds: 600,
                    health_gates: sentinel_core::HealthGates::default(),
                    scheduled_at: None,
                    auto_rollback: false,
                    rollback_threshold: None,
                    created_by: Uuid::new_v4(),
                    approvals_needed: 0,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/rollouts/{}", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let details: RolloutDetails = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(details.steps.len(), 1);
        assert_eq!(details.node_statuses.len(), 1);
    }

    #[tokio::test]
    async fn approve_rejects_self_approval_with_forbidden() {
        let state = test_state().await;
        let project = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let creator = Uuid::new_v4();
        state.projects.insert(sentinel_core::ProjectSnapshot {
            id: project,
            approvals_needed: 1,
            drift_threshold_percentage: None,
            drift_threshold_absolute: None,
        });
        state.nodes.insert(node(n1, project));
        state.bundles.insert(bundle(bundle_id, project));

        let created = state
            .rollout_service
            .create(
                CreateRolloutRequest {
                    project_id: project,
                    bundle_id,
                    target_selector: TargetSelector::All,
                    strategy: sentinel_core::RolloutStrategy::Rolling,
                    batch_size: Some(1),
                    batch_percentage: None,
                    max_unavailable: 0,
                    progress_deadline_seconds: 600,
                    health_gates: sentinel_core::HealthGates::default(),
                    scheduled_at: None,
                    auto_rollback: false,
                    rollback_threshold: None,
                    created_by: creator,
                    approvals_needed: 1,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let app = build_router(state);
        let payload = serde_json::json!({ "actor": creator });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/rollouts/{}/approve", created.id))
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn resolve_drift_returns_not_found_for_unknown_id() {
        let state = test_state().await;
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/drift/{}/resolve", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
