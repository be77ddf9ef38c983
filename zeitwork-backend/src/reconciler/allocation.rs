use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::models::{Instance, Node, NodeState, Region};

/// Resources requested for a new instance
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest {
    pub vcpus: i32,
    pub memory_mib: i64,
    pub default_port: i32,
}

/// Chosen placement for a new instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub region_id: Uuid,
    pub node_id: Uuid,
}

/// Pick a node for a new instance.
///
/// Policy: first region (by ordinal) with a configured load balancer; then
/// the schedulable node in that region with the most free memory, ties
/// broken by node id ascending. Free memory is the node's declared
/// `memory_mib` minus the memory of every instance holding capacity on it
/// (`pending`, `starting`, `running`).
///
/// A node is schedulable when it is `ready`, not soft-deleted, and its
/// agent heartbeat is younger than `heartbeat_timeout`.
pub fn allocate(
    regions: &[Region],
    nodes: &[Node],
    instances: &[Instance],
    request: ResourceRequest,
    now: DateTime<Utc>,
    heartbeat_timeout: Duration,
) -> Option<Placement> {
    let mut regions: Vec<&Region> = regions
        .iter()
        .filter(|r| r.deleted_at.is_none() && r.load_balancer_ipv4.is_some())
        .collect();
    regions.sort_by_key(|r| r.ordinal);
    let region = regions.first()?;

    let mut best: Option<(i64, &Node)> = None;
    for node in nodes {
        if node.region_id != region.id
            || node.state != NodeState::Ready
            || node.deleted_at.is_some()
            || now - node.updated_at > heartbeat_timeout
        {
            continue;
        }

        let used: i64 = instances
            .iter()
            .filter(|i| i.node_id == node.id && i.state.consumes_capacity())
            .map(|i| i.memory_mib)
            .sum();
        let free = node.memory_mib - used;
        if free < request.memory_mib {
            continue;
        }

        best = match best {
            None => Some((free, node)),
            Some((best_free, best_node)) => {
                if free > best_free || (free == best_free && node.id < best_node.id) {
                    Some((free, node))
                } else {
                    Some((best_free, best_node))
                }
            }
        };
    }

    best.map(|(_, node)| Placement {
        region_id: region.id,
        node_id: node.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::InstanceState;

    fn region(ordinal: i32, lb: Option<&str>) -> Region {
        Region {
            id: Uuid::now_v7(),
            organisation_id: Uuid::nil(),
            name: format!("region-{}", ordinal),
            ordinal,
            load_balancer_ipv4: lb.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn node(region_id: Uuid, memory_mib: i64) -> Node {
        Node {
            id: Uuid::now_v7(),
            organisation_id: Uuid::nil(),
            region_id,
            hostname: "worker".to_string(),
            private_address: "fd00::1".to_string(),
            state: NodeState::Ready,
            vcpus: 8,
            memory_mib,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn instance(node_id: Uuid, memory_mib: i64, state: InstanceState) -> Instance {
        Instance {
            id: Uuid::now_v7(),
            organisation_id: Uuid::nil(),
            region_id: Uuid::nil(),
            node_id,
            image_id: Uuid::nil(),
            state,
            vcpus: 2,
            memory_mib,
            default_port: 3000,
            ipv6_address: None,
            env_vars: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn request() -> ResourceRequest {
        ResourceRequest {
            vcpus: 2,
            memory_mib: 2048,
            default_port: 3000,
        }
    }

    fn timeout() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn test_picks_node_with_most_free_memory() {
        let r = region(0, Some("203.0.113.1"));
        let small = node(r.id, 4096);
        let big = node(r.id, 16384);
        let nodes = vec![small.clone(), big.clone()];

        let placement = allocate(
            &[r.clone()],
            &nodes,
            &[],
            request(),
            Utc::now(),
            timeout(),
        )
        .unwrap();
        assert_eq!(placement.node_id, big.id);
        assert_eq!(placement.region_id, r.id);
    }

    #[test]
    fn test_running_and_pending_instances_consume_capacity() {
        let r = region(0, Some("203.0.113.1"));
        let a = node(r.id, 8192);
        let b = node(r.id, 8192);
        // 6 GiB committed on a: 2 running + 2 starting + 2 pending
        let instances = vec![
            instance(a.id, 2048, InstanceState::Running),
            instance(a.id, 2048, InstanceState::Starting),
            instance(a.id, 2048, InstanceState::Pending),
            instance(b.id, 2048, InstanceState::Stopped),
        ];

        let placement = allocate(
            &[r],
            &[a, b.clone()],
            &instances,
            request(),
            Utc::now(),
            timeout(),
        )
        .unwrap();
        assert_eq!(placement.node_id, b.id);
    }

    #[test]
    fn test_ties_break_by_node_id_ascending() {
        let r = region(0, Some("203.0.113.1"));
        let first = node(r.id, 8192);
        let second = node(r.id, 8192);
        let expected = first.id.min(second.id);

        let placement = allocate(
            &[r],
            &[second, first],
            &[],
            request(),
            Utc::now(),
            timeout(),
        )
        .unwrap();
        assert_eq!(placement.node_id, expected);
    }

    #[test]
    fn test_skips_regions_without_load_balancer() {
        let bare = region(0, None);
        let served = region(1, Some("203.0.113.2"));
        let n = node(served.id, 8192);

        let placement = allocate(
            &[bare, served.clone()],
            &[n],
            &[],
            request(),
            Utc::now(),
            timeout(),
        )
        .unwrap();
        assert_eq!(placement.region_id, served.id);
    }

    #[test]
    fn test_skips_stale_and_non_ready_nodes() {
        let r = region(0, Some("203.0.113.1"));
        let mut stale = node(r.id, 16384);
        stale.updated_at = Utc::now() - Duration::seconds(300);
        let mut draining = node(r.id, 16384);
        draining.state = NodeState::Draining;

        let result = allocate(
            &[r],
            &[stale, draining],
            &[],
            request(),
            Utc::now(),
            timeout(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_no_capacity_returns_none() {
        let r = region(0, Some("203.0.113.1"));
        let n = node(r.id, 2048);
        let instances = vec![instance(n.id, 1024, InstanceState::Running)];

        let result = allocate(&[r], &[n], &instances, request(), Utc::now(), timeout());
        assert!(result.is_none(), "1 GiB free cannot fit a 2 GiB request");
    }

    #[test]
    fn test_no_regions_returns_none() {
        let result = allocate(&[], &[], &[], request(), Utc::now(), timeout());
        assert!(result.is_none());
    }
}
