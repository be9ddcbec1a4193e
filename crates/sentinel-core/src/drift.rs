use crate::collaborators::{BundleService, NodeService, NotificationService, ProjectService};
use crate::error::SentinelError;
use crate::events::{EventPublisher, RolloutEvent};
use crate::store::RolloutStore;
use crate::types::{DriftEvent, DriftResolution, DriftSeverity, NodeStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Counts produced by one reconciler pass, for logging/metrics at the call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftScanSummary {
    pub detected: u32,
    pub auto_resolved: u32,
    pub threshold_alerts: u32,
}

/// Detect → auto-resolve → alert-threshold scan over every online node with a
/// committed `expected_bundle_id` (spec §4.7). Read-only with respect to
/// rollouts; only ever writes `DriftEvent` rows. Runs independently of the tick
/// driver, dedicated a `drift.rs` module per SPEC_FULL §4.7.
pub struct DriftReconciler {
    store: Arc<dyn RolloutStore>,
    nodes: Arc<dyn NodeService>,
    bundles: Arc<dyn BundleService>,
    projects: Arc<dyn ProjectService>,
    notifications: Arc<dyn NotificationService>,
    events: Arc<EventPublisher>,
}

impl DriftReconciler {
    pub fn new(
        store: Arc<dyn RolloutStore>,
        nodes: Arc<dyn NodeService>,
        bundles: Arc<dyn BundleService>,
        projects: Arc<dyn ProjectService>,
        notifications: Arc<dyn NotificationService>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            store,
            nodes,
            bundles,
            projects,
            notifications,
            events,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DriftScanSummary, SentinelError> {
        let mut summary = DriftScanSummary::default();
        let projects = self
            .projects
            .list_projects()
            .await
            .map_err(|e| SentinelError::Collaborator(e.to_string()))?;

        for project in projects {
            let nodes = self
                .nodes
                .list_nodes(project.id, None)
                .await
                .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
            let online: Vec<_> = nodes
                .into_iter()
                .filter(|n| n.status == NodeStatus::Online)
                .collect();

            let managed_count = online.len();
            let mut drifted_count = 0usize;

            for node in &online {
                let Some(expected) = node.expected_bundle_id else {
                    continue;
                };

                if node.active_bundle_id != Some(expected) {
                    drifted_count += 1;
                    if self.store.unresolved_drift_for_node(node.id).await?.is_some() {
                        continue;
                    }
                    let diff = self
                        .bundles
                        .diff_stats(expected, node.active_bundle_id)
                        .await
                        .map_err(|e| SentinelError::Collaborator(e.to_string()))?;
                    let severity = classify_severity(node.active_bundle_id.is_none(), diff.total());
                    let event = DriftEvent {
                        id: Uuid::new_v4(),
                        node_id: node.id,
                        project_id: project.id,
                        expected_bundle_id: expected,
                        actual_bundle_id: node.active_bundle_id,
                        detected_at: now,
                        resolved_at: None,
                        resolution: None,
                        severity,
                        diff_stats: diff,
                    };
                    let inserted = self.store.insert_drift_event(event).await?;
                    info!(node_id = %node.id, severity = ?severity, "drift detected");
                    self.events.publish(RolloutEvent::DriftDetected {
                        project_id: project.id,
                        drift_event_id: inserted.id,
                        at: now,
                    });
                    let _ = self
                        .notifications
                        .notify_drift_detected(node.id, &inserted, project.id)
                        .await;
                    summary.detected += 1;
                } else if let Some(existing) = self.store.unresolved_drift_for_node(node.id).await? {
                    let resolved = self
                        .store
                        .resolve_drift_event(existing.id, DriftResolution::AutoCorrected, now)
                        .await?;
                    info!(node_id = %node.id, "drift auto-resolved");
                    self.events.publish(RolloutEvent::DriftResolved {
                        project_id: project.id,
                        drift_event_id: resolved.id,
                        at: now,
                    });
                    summary.auto_resolved += 1;
                }
            }

            if managed_count > 0 {
                let ratio = drifted_count as f64 / managed_count as f64;
                let pct_exceeded = project
                    .drift_threshold_percentage
                    .map(|t| ratio * 100.0 > t)
                    .unwrap_or(false);
                let abs_exceeded = project
                    .drift_threshold_absolute
                    .map(|t| drifted_count as u64 > t)
                    .unwrap_or(false);
                if pct_exceeded || abs_exceeded {
                    warn!(project_id = %project.id, drifted_count, managed_count, "drift threshold exceeded");
                    let _ = self
                        .notifications
                        .notify_drift_threshold_exceeded(project.id, drifted_count, managed_count)
                        .await;
                    summary.threshold_alerts += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// `null actual -> critical`; else by diff size (spec §4.7).
fn classify_severity(actual_missing: bool, diff_total: u32) -> DriftSeverity {
    if actual_missing {
        return DriftSeverity::Critical;
    }
    match diff_total {
        n if n > 50 => DriftSeverity::Critical,
        n if n > 20 => DriftSeverity::High,
        n if n > 5 => DriftSeverity::Medium,
        _ => DriftSeverity::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BundleService, CollaboratorError, NodeService, ProjectSnapshot};
    use crate::store::InMemoryRolloutStore;
    use crate::types::{BundleSnapshot, BundleStatus, DiffStats, Heartbeat, NodeSnapshot};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex as AsyncMutex;

    struct FixtureBundles;
    #[async_trait]
    impl BundleService for FixtureBundles {
        async fn get_bundle(&self, bundle_id: Uuid) -> Result<BundleSnapshot, CollaboratorError> {
            Ok(BundleSnapshot {
                id: bundle_id,
                project_id: Uuid::new_v4(),
                version: "v1".into(),
                status: BundleStatus::Compiled,
                checksum: "x".into(),
            })
        }
        async fn diff_stats(&self, _expected: Uuid, actual: Option<Uuid>) -> Result<DiffStats, CollaboratorError> {
            Ok(if actual.is_none() {
                DiffStats::default()
            } else {
                DiffStats { additions: 10, deletions: 2 }
            })
        }
    }

    struct FixtureNodes(AsyncMutex<Vec<NodeSnapshot>>);
    #[async_trait]
    impl NodeService for FixtureNodes {
        async fn get_node(&self, node_id: Uuid) -> Result<NodeSnapshot, CollaboratorError> {
            self.0
                .lock()
                .await
                .iter()
                .find(|n| n.id == node_id)
                .cloned()
                .ok_or_else(|| CollaboratorError::new("not found"))
        }
        async fn list_nodes(
            &self,
            project_id: Uuid,
            _labels: Option<&BTreeMap<String, String>>,
        ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
            Ok(self
                .0
                .lock()
                .await
                .iter()
                .filter(|n| n.project_id == project_id)
                .cloned()
                .collect())
        }
        async fn list_nodes_in_groups(
            &self,
            _project_id: Uuid,
            _group_ids: &[Uuid],
        ) -> Result<Vec<NodeSnapshot>, CollaboratorError> {
            Ok(vec![])
        }
        async fn latest_heartbeat(&self, _node_id: Uuid) -> Result<Option<Heartbeat>, CollaboratorError> {
            Ok(None)
        }
        async fn stage_bundle(&self, _n: Uuid, _b: Uuid) -> Result<(), CollaboratorError> {
            Ok(())
        }
        async fn set_expected_bundle(&self, _n: Uuid, _b: Uuid) -> Result<(), CollaboratorError> {
            Ok(())
        }
        async fn clear_staged_bundle(&self, _n: Uuid) -> Result<(), CollaboratorError> {
            Ok(())
        }
        async fn mark_offline(&self, _n: Uuid) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    struct FixtureProjects(Vec<ProjectSnapshot>);
    #[async_trait]
    impl ProjectService for FixtureProjects {
        async fn list_projects(&self) -> Result<Vec<ProjectSnapshot>, CollaboratorError> {
            Ok(self.0.clone())
        }
        async fn get_project(&self, project_id: Uuid) -> Result<ProjectSnapshot, CollaboratorError> {
            self.0
                .iter()
                .find(|p| p.id == project_id)
                .cloned()
                .ok_or_else(|| CollaboratorError::new("not found"))
        }
        async fn has_operator_role(&self, _u: Uuid, _p: Uuid) -> Result<bool, CollaboratorError> {
            Ok(true)
        }
    }

    struct NoopNotifications;
    #[async_trait]
    impl NotificationService for NoopNotifications {
        async fn notify_rollout_event(&self, _r: Uuid, _m: &str) -> Result<(), CollaboratorError> {
            Ok(())
        }
        async fn notify_drift_detected(
            &self,
            _n: Uuid,
            _e: &DriftEvent,
            _p: Uuid,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }
        async fn notify_drift_threshold_exceeded(&self, _p: Uuid, _d: usize, _m: usize) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    fn node(id: Uuid, project: Uuid, active: Option<Uuid>, expected: Option<Uuid>) -> NodeSnapshot {
        NodeSnapshot {
            id,
            project_id: project,
            status: NodeStatus::Online,
            active_bundle_id: active,
            staged_bundle_id: None,
            expected_bundle_id: expected,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn detects_drift_when_active_differs_from_expected() {
        let project = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let bundle_b = Uuid::new_v4();
        let bundle_c = Uuid::new_v4();
        let store = Arc::new(InMemoryRolloutStore::new());
        let nodes = Arc::new(FixtureNodes(AsyncMutex::new(vec![node(
            n1,
            project,
            Some(bundle_c),
            Some(bundle_b),
        )])));
        let projects = Arc::new(FixtureProjects(vec![ProjectSnapshot {
            id: project,
            approvals_needed: 0,
            drift_threshold_percentage: None,
            drift_threshold_absolute: None,
        }]));
        let reconciler = DriftReconciler::new(
            store.clone(),
            nodes,
            Arc::new(FixtureBundles),
            projects,
            Arc::new(NoopNotifications),
            Arc::new(EventPublisher::new()),
        );

        let summary = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(summary.detected, 1);
        let events = store.list_drift_events(project, true).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, DriftSeverity::High);
    }

    #[tokio::test]
    async fn auto_resolves_when_active_matches_expected_again() {
        let project = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let bundle_b = Uuid::new_v4();
        let store = Arc::new(InMemoryRolloutStore::new());
        let nodes = Arc::new(FixtureNodes(AsyncMutex::new(vec![node(
            n1,
            project,
            None,
            Some(bundle_b),
        )])));
        let projects = Arc::new(FixtureProjects(vec![ProjectSnapshot {
            id: project,
            approvals_needed: 0,
            drift_threshold_percentage: None,
            drift_threshold_absolute: None,
        }]));
        let reconciler = DriftReconciler::new(
            store.clone(),
            nodes.clone(),
            Arc::new(FixtureBundles),
            projects,
            Arc::new(NoopNotifications),
            Arc::new(EventPublisher::new()),
        );

        reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(store.list_drift_events(project, true).await.unwrap().len(), 1);

        nodes.0.lock().await[0].active_bundle_id = Some(bundle_b);
        let summary = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(summary.auto_resolved, 1);
        assert_eq!(store.list_drift_events(project, true).await.unwrap().len(), 0);
    }

    #[test]
    fn severity_classification_matches_spec_thresholds() {
        assert_eq!(classify_severity(true, 0), DriftSeverity::Critical);
        assert_eq!(classify_severity(false, 51), DriftSeverity::Critical);
        assert_eq!(classify_severity(false, 21), DriftSeverity::High);
        assert_eq!(classify_severity(false, 6), DriftSeverity::Medium);
        assert_eq!(classify_severity(false, 5), DriftSeverity::Low);
    }
}
