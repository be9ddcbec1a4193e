use crate::types::{ProjectId, Rollout, RolloutId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// One message broadcast on a pub/sub topic (spec §6). Carries enough of the
/// rollout to let a subscriber render a summary without a follow-up fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutEvent {
    RolloutUpdated {
        rollout_id: RolloutId,
        project_id: ProjectId,
        state: String,
        at: DateTime<Utc>,
    },
    RolloutStepUpdated {
        rollout_id: RolloutId,
        step_index: u32,
        at: DateTime<Utc>,
    },
    ApprovalRecorded {
        rollout_id: RolloutId,
        at: DateTime<Utc>,
    },
    DriftDetected {
        project_id: ProjectId,
        drift_event_id: uuid::Uuid,
        at: DateTime<Utc>,
    },
    DriftResolved {
        project_id: ProjectId,
        drift_event_id: uuid::Uuid,
        at: DateTime<Utc>,
    },
}

impl RolloutEvent {
    pub fn rollout_updated(rollout: &Rollout) -> Self {
        Self::RolloutUpdated {
            rollout_id: rollout.id,
            project_id: rollout.project_id,
            state: format!("{:?}", rollout.state).to_lowercase(),
            at: Utc::now(),
        }
    }

    pub fn rollout_step_updated(rollout_id: RolloutId, step_index: u32) -> Self {
        Self::RolloutStepUpdated {
            rollout_id,
            step_index,
            at: Utc::now(),
        }
    }
}

/// In-process pub/sub over `tokio::sync::broadcast`, one channel per topic (spec
/// §4.9): `rollout:{id}`, `rollouts:{project_id}`, `rollouts:approvals`,
/// `drift:{project_id}`. A broadcast fired at each pipeline stage boundary,
/// mirroring the audit-append calls that bracket each stage in the state
/// machine, except the record here is ephemeral rather than persisted.
pub struct EventPublisher {
    channels: Mutex<HashMap<String, broadcast::Sender<RolloutEvent>>>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<RolloutEvent> {
        self.channel(topic).subscribe()
    }

    /// Publishes to every topic the event is relevant to: the per-rollout topic,
    /// the per-project topic, and (for approval/drift events) the specialized
    /// topic, mirroring spec §6's topic list.
    pub fn publish(&self, event: RolloutEvent) {
        match &event {
            RolloutEvent::RolloutUpdated { rollout_id, project_id, .. } => {
                self.send(&format!("rollout:{rollout_id}"), event.clone());
                self.send(&format!("rollouts:{project_id}"), event);
            }
            RolloutEvent::RolloutStepUpdated { rollout_id, .. } => {
                self.send(&format!("rollout:{rollout_id}"), event);
            }
            RolloutEvent::ApprovalRecorded { rollout_id, .. } => {
                self.send(&format!("rollout:{rollout_id}"), event.clone());
                self.send("rollouts:approvals", event);
            }
            RolloutEvent::DriftDetected { project_id, .. }
            | RolloutEvent::DriftResolved { project_id, .. } => {
                self.send(&format!("drift:{project_id}"), event);
            }
        }
    }

    fn send(&self, topic: &str, event: RolloutEvent) {
        // A topic with no subscribers yet still gets its channel lazily created
        // so a late subscriber sees a live sender; the send itself is allowed to
        // have no active receivers (broadcast::Sender::send errors are ignored,
        // same as fire-and-forget notification dispatch).
        let _ = self.channel(topic).send(event);
    }

    fn channel(&self, topic: &str) -> broadcast::Sender<RolloutEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}
