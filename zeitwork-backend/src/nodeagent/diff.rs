use std::collections::HashMap;
use uuid::Uuid;

use crate::db::models::{Instance, InstanceState};

use super::runtime::{env_hash, ActualContainer};

/// A container to tear down: no desired row wants it anymore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub container_id: String,
    pub instance_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Environment changed; tear down and create again
    Recreate,
    /// Desired state is winding down; stop the container
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub instance_id: Uuid,
    pub container_id: String,
    pub kind: UpdateKind,
}

/// A database state correction for rows whose container is already gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFix {
    pub instance_id: Uuid,
    pub to: InstanceState,
}

/// The ordered convergence plan for one reconcile tick.
///
/// Deletes run first to free resources, then updates, then creates.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub deletes: Vec<Delete>,
    pub updates: Vec<Update>,
    pub creates: Vec<Uuid>,
    pub state_fixes: Vec<StateFix>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
            && self.updates.is_empty()
            && self.creates.is_empty()
            && self.state_fixes.is_empty()
    }
}

/// Diff desired instances (database) against actual containers (runtime).
///
/// Pure so it can be exercised with fixtures; the agent executes the
/// returned plan against the real runtime.
pub fn diff(desired: &[Instance], actual: &[ActualContainer]) -> ReconcilePlan {
    let desired_by_id: HashMap<Uuid, &Instance> = desired.iter().map(|i| (i.id, i)).collect();
    let actual_by_id: HashMap<Uuid, &ActualContainer> =
        actual.iter().map(|c| (c.instance_id, c)).collect();

    let mut plan = ReconcilePlan::default();

    for container in actual {
        if !desired_by_id.contains_key(&container.instance_id) {
            plan.deletes.push(Delete {
                container_id: container.container_id.clone(),
                instance_id: container.instance_id,
            });
        }
    }

    for instance in desired {
        match actual_by_id.get(&instance.id) {
            Some(container) => match instance.state {
                InstanceState::Stopping | InstanceState::Stopped => {
                    if container.running {
                        plan.updates.push(Update {
                            instance_id: instance.id,
                            container_id: container.container_id.clone(),
                            kind: UpdateKind::Stop,
                        });
                    } else if instance.state == InstanceState::Stopping {
                        plan.state_fixes.push(StateFix {
                            instance_id: instance.id,
                            to: InstanceState::Stopped,
                        });
                    }
                }
                InstanceState::Pending
                | InstanceState::Starting
                | InstanceState::Running => {
                    let desired_hash = env_hash(&instance.env_vars);
                    if container.env_hash.as_deref() != Some(desired_hash.as_str()) {
                        plan.updates.push(Update {
                            instance_id: instance.id,
                            container_id: container.container_id.clone(),
                            kind: UpdateKind::Recreate,
                        });
                    }
                }
                InstanceState::Failed | InstanceState::Terminated => {
                    plan.deletes.push(Delete {
                        container_id: container.container_id.clone(),
                        instance_id: instance.id,
                    });
                }
            },
            None => match instance.state {
                InstanceState::Pending
                | InstanceState::Starting
                | InstanceState::Running => {
                    plan.creates.push(instance.id);
                }
                InstanceState::Stopping => plan.state_fixes.push(StateFix {
                    instance_id: instance.id,
                    to: InstanceState::Stopped,
                }),
                InstanceState::Stopped => plan.state_fixes.push(StateFix {
                    instance_id: instance.id,
                    to: InstanceState::Terminated,
                }),
                InstanceState::Failed | InstanceState::Terminated => {}
            },
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instance(state: InstanceState, env: serde_json::Value) -> Instance {
        Instance {
            id: Uuid::now_v7(),
            organisation_id: Uuid::nil(),
            region_id: Uuid::nil(),
            node_id: Uuid::nil(),
            image_id: Uuid::nil(),
            state,
            vcpus: 2,
            memory_mib: 2048,
            default_port: 3000,
            ipv6_address: None,
            env_vars: env,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn container_for(instance: &Instance, running: bool) -> ActualContainer {
        ActualContainer {
            instance_id: instance.id,
            container_id: format!("ctr-{}", instance.id.simple()),
            running,
            env_hash: Some(env_hash(&instance.env_vars)),
        }
    }

    #[test]
    fn test_missing_container_is_created() {
        let desired = vec![instance(InstanceState::Pending, serde_json::json!({}))];
        let plan = diff(&desired, &[]);
        assert_eq!(plan.creates, vec![desired[0].id]);
        assert!(plan.deletes.is_empty());
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn test_unwanted_container_is_deleted() {
        let orphan = ActualContainer {
            instance_id: Uuid::now_v7(),
            container_id: "ctr-orphan".to_string(),
            running: true,
            env_hash: None,
        };
        let plan = diff(&[], &[orphan.clone()]);
        assert_eq!(
            plan.deletes,
            vec![Delete {
                container_id: "ctr-orphan".to_string(),
                instance_id: orphan.instance_id,
            }]
        );
    }

    #[test]
    fn test_converged_instance_is_untouched() {
        let desired = vec![instance(
            InstanceState::Running,
            serde_json::json!({"PORT": "3000"}),
        )];
        let actual = vec![container_for(&desired[0], true)];
        assert!(diff(&desired, &actual).is_empty());
    }

    #[test]
    fn test_env_change_forces_recreate() {
        let mut wanted = instance(InstanceState::Running, serde_json::json!({"A": "1"}));
        let actual = vec![container_for(&wanted, true)];
        wanted.env_vars = serde_json::json!({"A": "2"});

        let plan = diff(&[wanted.clone()], &actual);
        assert_eq!(
            plan.updates,
            vec![Update {
                instance_id: wanted.id,
                container_id: actual[0].container_id.clone(),
                kind: UpdateKind::Recreate,
            }]
        );
    }

    #[test]
    fn test_stopping_instance_with_running_container_stops() {
        let wanted = instance(InstanceState::Stopping, serde_json::json!({}));
        let actual = vec![container_for(&wanted, true)];

        let plan = diff(&[wanted.clone()], &actual);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].kind, UpdateKind::Stop);
    }

    #[test]
    fn test_stopping_instance_without_container_becomes_stopped() {
        let wanted = instance(InstanceState::Stopping, serde_json::json!({}));
        let plan = diff(&[wanted.clone()], &[]);
        assert_eq!(
            plan.state_fixes,
            vec![StateFix {
                instance_id: wanted.id,
                to: InstanceState::Stopped,
            }]
        );
    }

    #[test]
    fn test_stopped_instance_without_container_terminates() {
        let wanted = instance(InstanceState::Stopped, serde_json::json!({}));
        let plan = diff(&[wanted.clone()], &[]);
        assert_eq!(
            plan.state_fixes,
            vec![StateFix {
                instance_id: wanted.id,
                to: InstanceState::Terminated,
            }]
        );
    }

    #[test]
    fn test_running_instance_with_lost_container_is_recreated() {
        // Container killed out-of-band; full resync converges it back.
        let wanted = instance(InstanceState::Running, serde_json::json!({}));
        let plan = diff(&[wanted.clone()], &[]);
        assert_eq!(plan.creates, vec![wanted.id]);
    }
}
