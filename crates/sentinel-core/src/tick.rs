use crate::collaborators::{BundleService, CustomHealthCheckService, NodeService};
use crate::error::SentinelError;
use crate::events::{EventPublisher, RolloutEvent};
use crate::store::RolloutStore;
use crate::types::{
    BundleStatus, ErrorDetail, HealthGates, NodeBundleState, NodeId, NodeStatus, Rollout,
    RolloutId, RolloutState, RolloutStep, StepState,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Result of a single `TickDriver::tick` invocation (spec §4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The rollout was not `running`; no mutation performed (idempotence rule).
    NotRunning,
    /// The active step did not advance this tick; the caller should re-enqueue.
    Waiting,
    StepAdvanced { step_index: u32, new_state: StepState },
    RolloutCompleted,
    RolloutPaused { reason: String },
    RolloutFailed { reason: String },
}

/// Drives exactly one state transition per call (spec §4.4's "single advance
/// primitive"): one ordered pipeline per invocation, with a `RolloutEvent`
/// published at each stage boundary it crosses.
pub struct TickDriver {
    store: Arc<dyn RolloutStore>,
    bundles: Arc<dyn BundleService>,
    nodes: Arc<dyn NodeService>,
    health_checks: Arc<dyn CustomHealthCheckService>,
    events: Arc<EventPublisher>,
}

impl TickDriver {
    pub fn new(
        store: Arc<dyn RolloutStore>,
        bundles: Arc<dyn BundleService>,
        nodes: Arc<dyn NodeService>,
        health_checks: Arc<dyn CustomHealthCheckService>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            store,
            bundles,
            nodes,
            health_checks,
            events,
        }
    }

    #[instrument(skip(self), fields(rollout_id = %rollout_id))]
    pub async fn tick(
        &self,
        rollout_id: RolloutId,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, SentinelError> {
        let rollout = self
            .store
            .get_rollout(rollout_id)
            .await?
            .ok_or_else(|| SentinelError::InvalidState("rollout not found".into()))?;

        if rollout.state != RolloutState::Running {
            return Ok(TickOutcome::NotRunning);
        }

        if let Some(step) = self.store.running_or_verifying_step(rollout_id).await? {
            return match step.state {
                StepState::Running => self.advance_running_step(&rollout, step, now).await,
                StepState::Verifying => self.advance_verifying_step(&rollout, step, now).await,
                _ => unreachable!("running_or_verifying_step only returns running/verifying"),
            };
        }

        if let Some(step) = self.store.lowest_pending_step(rollout_id).await? {
            return self.start_step(&rollout, step, now).await;
        }

        let updated = self
            .store
            .transition_rollout(rollout_id, RolloutState::Running, RolloutState::Completed, None, now)
            .await?;
        info!("rollout completed");
        self.events.publish(RolloutEvent::rollout_updated(&updated));
        Ok(TickOutcome::RolloutCompleted)
    }

    async fn advance_running_step(
        &self,
        rollout: &Rollout,
        step: RolloutStep,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, SentinelError> {
        let mut reported_active = 0usize;
        let mut unavailable = 0usize;

        for node_id in &step.node_ids {
            let node = self
                .nodes
                .get_node(*node_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
            if matches!(node.status, NodeStatus::Offline | NodeStatus::Unknown) {
                unavailable += 1;
            }
            if node.active_bundle_id == Some(rollout.bundle_id) {
                reported_active += 1;
            }
        }

        if rollout.max_unavailable > 0 && unavailable as u64 > rollout.max_unavailable {
            let error = ErrorDetail::new("max_unavailable_exceeded")
                .with_detail("unavailable", unavailable)
                .with_detail("max_unavailable", rollout.max_unavailable);
            let updated = self
                .store
                .transition_rollout(rollout.id, RolloutState::Running, RolloutState::Paused, Some(error), now)
                .await?;
            warn!(unavailable, "pausing rollout: max_unavailable exceeded");
            self.events.publish(RolloutEvent::rollout_updated(&updated));
            return Ok(TickOutcome::RolloutPaused {
                reason: "max_unavailable_exceeded".into(),
            });
        }

        let required = if rollout.max_unavailable > 0 {
            step.node_ids.len().saturating_sub(rollout.max_unavailable as usize)
        } else {
            step.node_ids.len()
        };

        if reported_active >= required && reported_active > 0 {
            self.store
                .transition_step(rollout.id, step.step_index, StepState::Running, StepState::Verifying, None, now)
                .await?;
            self.store
                .bulk_set_node_bundle_state(rollout.id, &step.node_ids, NodeBundleState::Activating, now)
                .await?;
            info!(step_index = step.step_index, "step advanced to verifying");
            self.events.publish(RolloutEvent::rollout_step_updated(rollout.id, step.step_index));
            return Ok(TickOutcome::StepAdvanced {
                step_index: step.step_index,
                new_state: StepState::Verifying,
            });
        }

        self.check_deadline(rollout, &step, now).await
    }

    async fn advance_verifying_step(
        &self,
        rollout: &Rollout,
        step: RolloutStep,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, SentinelError> {
        let available_nodes = self.available_nodes(rollout, &step).await?;
        let gates_pass = self
            .evaluate_health_gates(&rollout.health_gates, &available_nodes)
            .await?;

        if !gates_pass {
            return self.check_deadline(rollout, &step, now).await;
        }

        // Set on each node via the external collaborator first; this write can't
        // join the store transaction below.
        for node_id in &step.node_ids {
            self.nodes
                .set_expected_bundle(*node_id, rollout.bundle_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
        }

        self.store
            .complete_verifying_step(rollout.id, step.step_index, &step.node_ids, now)
            .await?;
        info!(step_index = step.step_index, "step completed");
        self.events.publish(RolloutEvent::rollout_step_updated(rollout.id, step.step_index));

        if self.store.all_steps_completed(rollout.id).await? {
            let updated = self
                .store
                .transition_rollout(rollout.id, RolloutState::Running, RolloutState::Completed, None, now)
                .await?;
            info!("rollout completed");
            self.events.publish(RolloutEvent::rollout_updated(&updated));
            return Ok(TickOutcome::RolloutCompleted);
        }

        Ok(TickOutcome::StepAdvanced {
            step_index: step.step_index,
            new_state: StepState::Completed,
        })
    }

    async fn start_step(
        &self,
        rollout: &Rollout,
        step: RolloutStep,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, SentinelError> {
        let bundle = self
            .bundles
            .get_bundle(rollout.bundle_id)
            .await
            .map_err(|e| SentinelError::Collaborator(e.to_string()))?;

        if bundle.status != BundleStatus::Compiled {
            let error = ErrorDetail::new("bundle_revoked").with_detail("bundle_id", bundle.id.to_string());
            self.store
                .transition_step(rollout.id, step.step_index, StepState::Pending, StepState::Failed, Some(error.clone()), now)
                .await?;
            let updated = self
                .store
                .transition_rollout(rollout.id, RolloutState::Running, RolloutState::Failed, Some(error), now)
                .await?;
            warn!("rollout failed: bundle no longer compiled");
            self.events.publish(RolloutEvent::rollout_updated(&updated));
            return Ok(TickOutcome::RolloutFailed {
                reason: "bundle_revoked".into(),
            });
        }

        self.store
            .transition_step(rollout.id, step.step_index, StepState::Pending, StepState::Running, None, now)
            .await?;

        for node_id in &step.node_ids {
            self.nodes
                .stage_bundle(*node_id, rollout.bundle_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
        }
        self.store
            .bulk_set_node_bundle_state(rollout.id, &step.node_ids, NodeBundleState::Staging, now)
            .await?;

        info!(step_index = step.step_index, "step started");
        self.events.publish(RolloutEvent::rollout_step_updated(rollout.id, step.step_index));
        Ok(TickOutcome::StepAdvanced {
            step_index: step.step_index,
            new_state: StepState::Running,
        })
    }

    async fn check_deadline(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, SentinelError> {
        let started = step.started_at.unwrap_or(now);
        let elapsed = (now - started).num_seconds();

        if elapsed > rollout.progress_deadline_seconds {
            let step_error = ErrorDetail::new("deadline_exceeded");
            self.store
                .transition_step(rollout.id, step.step_index, step.state, StepState::Failed, Some(step_error), now)
                .await?;
            let rollout_error = ErrorDetail::new("step_deadline_exceeded")
                .with_detail("step_index", step.step_index);
            let updated = self
                .store
                .transition_rollout(rollout.id, RolloutState::Running, RolloutState::Failed, Some(rollout_error), now)
                .await?;
            warn!(step_index = step.step_index, "rollout failed: step deadline exceeded");
            self.events.publish(RolloutEvent::rollout_updated(&updated));
            return Ok(TickOutcome::RolloutFailed {
                reason: "step_deadline_exceeded".into(),
            });
        }

        Ok(TickOutcome::Waiting)
    }

    async fn available_nodes(
        &self,
        rollout: &Rollout,
        step: &RolloutStep,
    ) -> Result<Vec<NodeId>, SentinelError> {
        if rollout.max_unavailable == 0 {
            return Ok(step.node_ids.clone());
        }
        let mut available = Vec::with_capacity(step.node_ids.len());
        for node_id in &step.node_ids {
            let node = self
                .nodes
                .get_node(*node_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
            if !matches!(node.status, NodeStatus::Offline | NodeStatus::Unknown) {
                available.push(*node_id);
            }
        }
        Ok(available)
    }

    /// All enabled gates must pass for every available node; absent keys default
    /// to pass (spec §4.4). `custom_health_checks` are invoked once per listed
    /// endpoint id for the step, not once per node (Open Question (c)).
    async fn evaluate_health_gates(
        &self,
        gates: &HealthGates,
        available_nodes: &[NodeId],
    ) -> Result<bool, SentinelError> {
        for node_id in available_nodes {
            let heartbeat = self
                .nodes
                .latest_heartbeat(*node_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;

            if gates.heartbeat_healthy == Some(true) {
                let healthy = heartbeat.as_ref().map(|h| h.healthy).unwrap_or(false);
                if !healthy {
                    return Ok(false);
                }
            }

            let metrics = heartbeat.as_ref().map(|h| h.metrics.clone()).unwrap_or_default();

            if let Some(max_error_rate) = gates.max_error_rate {
                if metrics.error_rate > max_error_rate {
                    return Ok(false);
                }
            }
            if let Some(max_latency_ms) = gates.max_latency_ms {
                if metrics.latency_p99_ms > max_latency_ms {
                    return Ok(false);
                }
            }
            if let Some(max_cpu_percent) = gates.max_cpu_percent {
                if metrics.cpu_percent > max_cpu_percent {
                    return Ok(false);
                }
            }
            if let Some(max_memory_percent) = gates.max_memory_percent {
                if metrics.memory_percent > max_memory_percent {
                    return Ok(false);
                }
            }
        }

        for check_id in &gates.custom_health_checks {
            let passed = self
                .health_checks
                .check(check_id)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
            if !passed {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BundleService, CollaboratorError, CustomHealthCheckService, NodeService};
    use crate::store::{InMemoryRolloutStore, NewRollout};
    use crate::types::{
        ApprovalState, BundleSnapshot, Heartbeat, HeartbeatMetrics, NodeSnapshot, RolloutStrategy,
        TargetSelector,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex as AsyncMutex;
    use uuid::Uuid;

    struct FixtureBundles;
    #[async_trait]
    impl BundleService for FixtureBundles {
        async fn get_bundle(&self, bundle_id: Uuid) -> Result<BundleSnapshot, CollaboratorError> {
            Ok(BundleSnapshot {
                id: bundle_id,
                project_id: Uuid::new_v4(),
                version: "v1".into(),
                status: crate::types::BundleStatus::Compiled,
                checksum: "deadbeef".into(),
            })
        }
        async fn diff_stats(
            &self,
            _expected: Uuid,
            _actual: Option<Uuid>,
        ) -> Result<crate::types::DiffStats, CollaboratorError> {
            Ok(crate::types::DiffStats::default())
        }
    }

    struct FixtureNodes {
        inner: AsyncMutex<std::collections::HashMap<Uuid, NodeSnapshot>>,
        heartbeats: AsyncMutex<std::collections::HashMap<Uuid, Heartbeat>>,
    }

    impl FixtureNodes {
        fn new(nodes: Vec<NodeSnapshot>) -> Self {
            Self {
                inner: AsyncMutex::new(nodes.into_iter().map(|n| (n.id, n)).collect()),
                heartbeats: AsyncMutex::new(std::collections::HashMap::new()),
            }
        }

        async fn set_active(&self, node_id: Uuid, bundle_id: Uuid) {
            self.inner.lock().await.get_mut(&node_id).unwrap().active_bundle_id = Some(bundle_id);
        }

        async fn set_healthy(&self, node_id: Uuid) {
            self.heartbeats.lock().await.insert(
                node_id,
                Heartbeat {
                    node_id,
                    healthy: true,
                    metrics: HeartbeatMetrics::default(),
                    observed_at: Utc::now(),
                },
            );
        }
    }

    #[async_trait]
    impl NodeService for FixtureNodes {
        async fn get_node(&self, node_id: Uuid) -> Result<NodeSnapshot, CollaboratorError> {
            self.inner
                .lock()
                .await
                .get(&node_id)
                .cloned()
                .ok_or_else(|| CollaboratorError::new("not found"))
        }

        async fn list_nodes(
            &self,
            _project_id: Uuid,
            _labels: Option<&BTreeMap<String, String>>,
        ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
            Ok(self.inner.lock().await.values().cloned().collect())
        }

        async fn list_nodes_in_groups(
            &self,
            _project_id: Uuid,
            _group_ids: &[Uuid],
        ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
            Ok(vec![])
        }

        async fn latest_heartbeat(&self, node_id: Uuid) -> Result<Option<Heartbeat>, CollaboratorError> {
            Ok(self.heartbeats.lock().await.get(&node_id).cloned())
        }

        async fn stage_bundle(&self, node_id: Uuid, bundle_id: Uuid) -> Result<(), CollaboratorError> {
            self.inner.lock().await.get_mut(&node_id).unwrap().staged_bundle_id = Some(bundle_id);
            Ok(())
        }

        async fn set_expected_bundle(&self, node_id: Uuid, bundle_id: Uuid) -> Result<(), CollaboratorError> {
            self.inner.lock().await.get_mut(&node_id).unwrap().expected_bundle_id = Some(bundle_id);
            Ok(())
        }

        async fn clear_staged_bundle(&self, node_id: Uuid) -> Result<(), CollaboratorError> {
            self.inner.lock().await.get_mut(&node_id).unwrap().staged_bundle_id = None;
            Ok(())
        }

        async fn mark_offline(&self, _node_id: Uuid) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    struct NoCustomChecks;
    #[async_trait]
    impl CustomHealthCheckService for NoCustomChecks {
        async fn check(&self, _check_id: &str) -> Result<bool, CollaboratorError> {
            Ok(true)
        }
    }

    fn node(id: Uuid, project: Uuid) -> NodeSnapshot {
        NodeSnapshot {
            id,
            project_id: project,
            status: crate::types::NodeStatus::Online,
            active_bundle_id: None,
            staged_bundle_id: None,
            expected_bundle_id: None,
            labels: BTreeMap::new(),
        }
    }

    async fn setup(
        node_ids: Vec<Uuid>,
        batch_size: u64,
        max_unavailable: u64,
        progress_deadline_seconds: i64,
    ) -> (TickDriver, Arc<InMemoryRolloutStore>, Arc<FixtureNodes>, Rollout) {
        let project = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        let store = Arc::new(InMemoryRolloutStore::new());
        let nodes = Arc::new(FixtureNodes::new(
            node_ids.iter().map(|id| node(*id, project)).collect(),
        ));
        let bundles = Arc::new(FixtureBundles);
        let health = Arc::new(NoCustomChecks);
        let events = Arc::new(EventPublisher::new());

        let now = Utc::now();
        let rollout = store
            .create_rollout(
                NewRollout {
                    project_id: project,
                    bundle_id,
                    target_selector: TargetSelector::All,
                    strategy: RolloutStrategy::Rolling,
                    batch_size: Some(batch_size),
                    batch_percentage: None,
                    max_unavailable,
                    progress_deadline_seconds,
                    health_gates: HealthGates {
                        heartbeat_healthy: Some(true),
                        ..Default::default()
                    },
                    scheduled_at: None,
                    auto_rollback: false,
                    rollback_threshold: None,
                    created_by: Uuid::new_v4(),
                    initial_state: RolloutState::Pending,
                    initial_approval_state: ApprovalState::NotRequired,
                },
                now,
            )
            .await
            .unwrap();

        let batches = crate::planner::plan_batches(
            node_ids.clone(),
            RolloutStrategy::Rolling,
            Some(batch_size),
            None,
        );
        store.plan_rollout(rollout.id, batches, now).await.unwrap();
        let rollout = store.get_rollout(rollout.id).await.unwrap().unwrap();

        let driver = TickDriver::new(store.clone(), bundles, nodes.clone(), health, events);
        (driver, store, nodes, rollout)
    }

    #[tokio::test]
    async fn happy_path_rolling_completes_all_steps() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let (driver, store, nodes, rollout) = setup(ids.clone(), 2, 0, 600).await;
        let t = Utc::now();

        // step 0 start
        driver.tick(rollout.id, t).await.unwrap();
        nodes.set_active(ids[0], rollout.bundle_id).await;
        nodes.set_active(ids[1], rollout.bundle_id).await;
        nodes.set_healthy(ids[0]).await;
        nodes.set_healthy(ids[1]).await;

        // -> verifying
        driver.tick(rollout.id, t).await.unwrap();
        // -> completed, step 1 not yet started
        let outcome = driver.tick(rollout.id, t).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::StepAdvanced { step_index: 0, new_state: StepState::Completed }
        );

        // step 1 start
        driver.tick(rollout.id, t).await.unwrap();
        nodes.set_active(ids[2], rollout.bundle_id).await;
        nodes.set_active(ids[3], rollout.bundle_id).await;
        nodes.set_healthy(ids[2]).await;
        nodes.set_healthy(ids[3]).await;
        driver.tick(rollout.id, t).await.unwrap();
        let outcome = driver.tick(rollout.id, t).await.unwrap();
        assert_eq!(outcome, TickOutcome::RolloutCompleted);

        let details = store.get_details(rollout.id).await.unwrap().unwrap();
        assert!(details
            .node_statuses
            .iter()
            .all(|s| s.state == NodeBundleState::Active));
        assert_eq!(details.rollout.state, RolloutState::Completed);
    }

    #[tokio::test]
    async fn deadline_exceeded_fails_rollout() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let (driver, store, nodes, rollout) = setup(ids.clone(), 2, 0, 30).await;
        let t0 = Utc::now();

        driver.tick(rollout.id, t0).await.unwrap();
        nodes.set_active(ids[0], rollout.bundle_id).await; // only n1 reports, n2 never does
        nodes.set_healthy(ids[0]).await;

        let t_late = t0 + chrono::Duration::seconds(35);
        let outcome = driver.tick(rollout.id, t_late).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::RolloutFailed { reason: "step_deadline_exceeded".into() }
        );
        let updated = store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(updated.state, RolloutState::Failed);
        assert_eq!(updated.error.unwrap().reason, "step_deadline_exceeded");
    }

    #[tokio::test]
    async fn zero_deadline_fails_on_second_tick() {
        let ids = vec![Uuid::new_v4()];
        let (driver, store, _nodes, rollout) = setup(ids, 1, 0, 0).await;
        let t0 = Utc::now();

        driver.tick(rollout.id, t0).await.unwrap(); // starts step (first tick)
        let t1 = t0 + chrono::Duration::seconds(1);
        let outcome = driver.tick(rollout.id, t1).await.unwrap(); // second tick: no progress, deadline 0
        assert_eq!(
            outcome,
            TickOutcome::RolloutFailed { reason: "step_deadline_exceeded".into() }
        );
        let updated = store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(updated.state, RolloutState::Failed);
    }

    #[tokio::test]
    async fn max_unavailable_tolerance_allows_completion_with_one_offline() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let (driver, store, nodes, rollout) = setup(ids.clone(), 4, 1, 600).await;
        nodes.inner.lock().await.get_mut(&ids[3]).unwrap().status = crate::types::NodeStatus::Offline;
        let t = Utc::now();

        driver.tick(rollout.id, t).await.unwrap(); // start step 0 (all 4 nodes)
        for id in &ids[0..3] {
            nodes.set_active(*id, rollout.bundle_id).await;
            nodes.set_healthy(*id).await;
        }

        driver.tick(rollout.id, t).await.unwrap(); // -> verifying (3 >= 4-1)
        let outcome = driver.tick(rollout.id, t).await.unwrap(); // -> completed
        assert_eq!(outcome, TickOutcome::RolloutCompleted);

        let details = store.get_details(rollout.id).await.unwrap().unwrap();
        let offline_status = details
            .node_statuses
            .iter()
            .find(|s| s.node_id == ids[3])
            .unwrap();
        assert_ne!(offline_status.state, NodeBundleState::Active);
    }

    #[tokio::test]
    async fn exceeding_max_unavailable_pauses_rollout() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let (driver, store, nodes, rollout) = setup(ids.clone(), 4, 1, 600).await;
        nodes.inner.lock().await.get_mut(&ids[2]).unwrap().status = crate::types::NodeStatus::Offline;
        nodes.inner.lock().await.get_mut(&ids[3]).unwrap().status = crate::types::NodeStatus::Offline;
        let t = Utc::now();

        driver.tick(rollout.id, t).await.unwrap();
        let outcome = driver.tick(rollout.id, t).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::RolloutPaused { reason: "max_unavailable_exceeded".into() }
        );
        let updated = store.get_rollout(rollout.id).await.unwrap().unwrap();
        assert_eq!(updated.state, RolloutState::Paused);
    }

    #[tokio::test]
    async fn tick_on_non_running_rollout_is_idempotent_noop() {
        let ids = vec![Uuid::new_v4()];
        let (driver, store, _nodes, rollout) = setup(ids, 1, 0, 600).await;
        let t = Utc::now();
        store
            .transition_rollout(rollout.id, RolloutState::Running, RolloutState::Paused, None, t)
            .await
            .unwrap();

        let outcome = driver.tick(rollout.id, t).await.unwrap();
        assert_eq!(outcome, TickOutcome::NotRunning);
    }
}
