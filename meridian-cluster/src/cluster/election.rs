//! Leader selection over the node map

use super::node::ClusterNode;

/// Highest-priority available node.
///
/// Iteration order is registration order, so on equal priority the node
/// registered first wins.
pub fn elect<'a>(nodes: impl IntoIterator<Item = &'a ClusterNode>) -> Option<&'a ClusterNode> {
    best_by_priority(nodes.into_iter().filter(|n| n.is_available()))
}

/// Failover target: the highest-priority available node other than `leader`
pub fn failover_candidate<'a>(
    nodes: impl IntoIterator<Item = &'a ClusterNode>,
    leader: Option<&str>,
) -> Option<&'a ClusterNode> {
    best_by_priority(
        nodes
            .into_iter()
            .filter(|n| n.is_available() && Some(n.id.as_str()) != leader),
    )
}

fn best_by_priority<'a>(nodes: impl Iterator<Item = &'a ClusterNode>) -> Option<&'a ClusterNode> {
    let mut best: Option<(&ClusterNode, f64)> = None;
    for node in nodes {
        let priority = node.priority();
        if best.is_none_or(|(_, top)| priority > top) {
            best = Some((node, priority));
        }
    }
    best.map(|(node, _)| node)
}

/// Nodes eligible for removal on scale-down, lowest priority first
pub fn removal_order<'a>(
    nodes: impl IntoIterator<Item = &'a ClusterNode>,
    keep: &[Option<&str>],
) -> Vec<&'a ClusterNode> {
    let mut eligible: Vec<&ClusterNode> = nodes
        .into_iter()
        .filter(|n| !keep.contains(&Some(n.id.as_str())))
        .collect();
    eligible.sort_by(|a, b| a.priority().total_cmp(&b.priority()));
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{NodeSpec, NodeStatus};
    use crate::health::HealthStatus;
    use chrono::Utc;
    use meridian_core::config::NodeRole;

    fn node(id: &str, role: NodeRole) -> ClusterNode {
        NodeSpec::new("10.0.0.1", 7400)
            .with_id(id)
            .with_role(role)
            .build(Utc::now())
    }

    #[test]
    fn test_elects_highest_priority() {
        let nodes = vec![
            node("a", NodeRole::Worker),
            node("b", NodeRole::Primary),
            node("c", NodeRole::Secondary),
        ];
        assert_eq!(elect(&nodes).map(|n| n.id.as_str()), Some("b"));
    }

    #[test]
    fn test_tie_goes_to_first_registered() {
        let nodes = vec![node("z", NodeRole::Worker), node("a", NodeRole::Worker)];
        assert_eq!(elect(&nodes).map(|n| n.id.as_str()), Some("z"));
    }

    #[test]
    fn test_skips_unavailable_nodes() {
        let mut nodes = vec![node("a", NodeRole::Primary), node("b", NodeRole::Worker)];
        nodes[0].health.status = HealthStatus::Unhealthy;
        assert_eq!(elect(&nodes).map(|n| n.id.as_str()), Some("b"));

        nodes[1].status = NodeStatus::Maintenance;
        assert!(elect(&nodes).is_none());
    }

    #[test]
    fn test_failover_candidate_excludes_leader() {
        let nodes = vec![
            node("a", NodeRole::Primary),
            node("b", NodeRole::Observer),
            node("c", NodeRole::Secondary),
        ];
        let target = failover_candidate(&nodes, Some("a"));
        assert_eq!(target.map(|n| n.id.as_str()), Some("c"));
        assert!(failover_candidate(&nodes[..1], Some("a")).is_none());
    }

    #[test]
    fn test_removal_order() {
        let nodes = vec![
            node("a", NodeRole::Primary),
            node("b", NodeRole::Observer),
            node("c", NodeRole::Worker),
            node("d", NodeRole::Secondary),
        ];
        let order: Vec<&str> = removal_order(&nodes, &[Some("a"), None])
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(order, vec!["b", "c", "d"]);
    }
}
