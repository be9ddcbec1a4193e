use crate::collaborators::NodeService;
use crate::types::{NodeId, ProjectId, TargetSelector};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Resolves a `target_selector` into a deduplicated, stable-ordered list of node
/// ids (spec §4.2). Always goes through the injected `NodeService`, never a
/// direct store join, so the core stays collaborator-agnostic.
pub struct TargetResolver {
    nodes: Arc<dyn NodeService>,
}

impl TargetResolver {
    pub fn new(nodes: Arc<dyn NodeService>) -> Self {
        Self { nodes }
    }

    pub async fn resolve(
        &self,
        project_id: ProjectId,
        selector: &TargetSelector,
    ) -> Result<Vec<NodeId>, crate::error::SentinelError> {
        let ids: BTreeSet<NodeId> = match selector {
            TargetSelector::All => self
                .nodes
                .list_nodes(project_id, None)
                .await
                .map_err(|e| crate::error::SentinelError::Collaborator(e.to_string()))?
                .into_iter()
                .map(|n| n.id)
                .collect(),
            TargetSelector::Labels { labels } => self
                .nodes
                .list_nodes(project_id, None)
                .await
                .map_err(|e| crate::error::SentinelError::Collaborator(e.to_string()))?
                .into_iter()
                .filter(|node| labels.iter().all(|(k, v)| node.labels.get(k) == Some(v)))
                .map(|n| n.id)
                .collect(),
            TargetSelector::NodeIds { node_ids } => node_ids.iter().copied().collect(),
            TargetSelector::Groups { group_ids } => self
                .nodes
                .list_nodes_in_groups(project_id, group_ids)
                .await
                .map_err(|e| crate::error::SentinelError::Collaborator(e.to_string()))?
                .into_iter()
                .map(|n| n.id)
                .collect(),
        };

        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryNodeServiceStub;
    use crate::types::{NodeSnapshot, NodeStatus};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn node(id: Uuid, project: Uuid, labels: &[(&str, &str)]) -> NodeSnapshot {
        NodeSnapshot {
            id,
            project_id: project,
            status: NodeStatus::Online,
            active_bundle_id: None,
            staged_bundle_id: None,
            expected_bundle_id: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn labels_selector_requires_all_pairs_to_match() {
        let project = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        let stub = InMemoryNodeServiceStub::new(vec![
            node(n1, project, &[("tier", "edge"), ("region", "us")]),
            node(n2, project, &[("tier", "edge")]),
        ]);
        let resolver = TargetResolver::new(Arc::new(stub));

        let selector = TargetSelector::Labels {
            labels: BTreeMap::from([
                ("tier".to_string(), "edge".to_string()),
                ("region".to_string(), "us".to_string()),
            ]),
        };

        let resolved = resolver.resolve(project, &selector).await.unwrap();
        assert_eq!(resolved, vec![n1]);
    }

    #[tokio::test]
    async fn node_ids_selector_is_verbatim_and_deduplicated() {
        let project = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let stub = InMemoryNodeServiceStub::new(vec![]);
        let resolver = TargetResolver::new(Arc::new(stub));

        let selector = TargetSelector::NodeIds {
            node_ids: vec![n1, n1],
        };
        let resolved = resolver.resolve(project, &selector).await.unwrap();
        assert_eq!(resolved, vec![n1]);
    }
}
