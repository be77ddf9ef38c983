use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::models::Deployment;

/// Which older `ready` deployments of one `(project, environment)` group
/// should become `inactive` this tick.
///
/// The group is sorted newest-first by id (ids are time-ordered). The
/// newest stays `ready`. The runner-up is only retired once the newest has
/// been stable for the grace window, giving routing time to switch; any
/// deployment beyond position 1 is retired immediately.
pub fn supersession_actions(
    group: &[Deployment],
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<Uuid> {
    let mut sorted: Vec<&Deployment> = group.iter().collect();
    sorted.sort_by(|a, b| b.id.cmp(&a.id));

    let mut retire = Vec::new();
    for (position, deployment) in sorted.iter().enumerate() {
        match position {
            0 => {}
            1 => {
                if now - sorted[0].updated_at > grace {
                    retire.push(deployment.id);
                }
            }
            _ => retire.push(deployment.id),
        }
    }
    retire
}

/// Whether a deployment has sat in `deploying` past its timeout
pub fn deploy_timed_out(deployment: &Deployment, now: DateTime<Utc>, timeout: Duration) -> bool {
    now - deployment.updated_at > timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DeploymentStatus;

    fn deployment(updated_secs_ago: i64) -> Deployment {
        Deployment {
            id: Uuid::now_v7(),
            organisation_id: Uuid::nil(),
            project_id: Uuid::nil(),
            environment_id: Uuid::nil(),
            deployment_slug: "d".to_string(),
            commit_sha: "abc".to_string(),
            status: DeploymentStatus::Ready,
            build_id: None,
            image_id: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now() - Duration::seconds(updated_secs_ago),
            deleted_at: None,
        }
    }

    fn new_deployment_after(prev: &Deployment, updated_secs_ago: i64) -> Deployment {
        // Force strictly increasing ids even within the same millisecond
        let mut d = deployment(updated_secs_ago);
        while d.id <= prev.id {
            d.id = Uuid::now_v7();
        }
        d
    }

    #[test]
    fn test_single_ready_deployment_untouched() {
        let d = deployment(1000);
        assert!(supersession_actions(&[d], Utc::now(), Duration::seconds(300)).is_empty());
    }

    #[test]
    fn test_runner_up_kept_inside_grace_window() {
        let old = deployment(3600);
        let new = new_deployment_after(&old, 10); // newest updated 10s ago

        let retire = supersession_actions(
            &[old.clone(), new],
            Utc::now(),
            Duration::seconds(300),
        );
        assert!(retire.is_empty(), "grace window still open");
    }

    #[test]
    fn test_runner_up_retired_after_grace_window() {
        let old = deployment(3600);
        let new = new_deployment_after(&old, 400); // newest stable for 400s

        let retire = supersession_actions(
            &[old.clone(), new],
            Utc::now(),
            Duration::seconds(300),
        );
        assert_eq!(retire, vec![old.id]);
    }

    #[test]
    fn test_deeper_positions_retired_immediately() {
        let oldest = deployment(7200);
        let older = new_deployment_after(&oldest, 3600);
        let newest = new_deployment_after(&older, 1); // inside grace

        let retire = supersession_actions(
            &[oldest.clone(), newest, older.clone()],
            Utc::now(),
            Duration::seconds(300),
        );
        // Position 1 (older) survives the grace window; position 2 does not.
        assert_eq!(retire, vec![oldest.id]);
    }

    #[test]
    fn test_order_of_input_does_not_matter() {
        let a = deployment(3600);
        let b = new_deployment_after(&a, 3600);
        let c = new_deployment_after(&b, 400);

        let forward =
            supersession_actions(&[a.clone(), b.clone(), c.clone()], Utc::now(), Duration::seconds(300));
        let backward =
            supersession_actions(&[c, b, a], Utc::now(), Duration::seconds(300));
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_deploy_timeout_boundary() {
        let fresh = deployment(200);
        let stale = deployment(400);
        let timeout = Duration::seconds(300);
        assert!(!deploy_timed_out(&fresh, Utc::now(), timeout));
        assert!(deploy_timed_out(&stale, Utc::now(), timeout));
    }
}
