pub mod advance;
pub mod allocation;
pub mod delivery;
pub mod domains;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::models::{Build, BuildStatus, Deployment, DeploymentStatus, InstanceState};
use crate::db::{builds, deployments, domains as db_domains, images, instances, nodes, regions};
use crate::db::{leases, logs};
use crate::events;
use crate::settings::{ReconcilerSettings, RegistrySettings};
use crate::state::ControllerState;

use allocation::ResourceRequest;
use delivery::ImageDelivery;
use domains::DomainVerifier;

/// Lease name electing the active deployment reconciler
const LEASE_NAME: &str = "deployment-reconciler";

/// Attempts before an undeliverable image fails its instance
const DELIVERY_ATTEMPTS: u32 = 4;

/// The singleton-per-cluster loop that drives deployments from `queued` to
/// `ready` and keeps the fleet aligned with declared state.
///
/// Leadership is held through a time-bounded lease row. Every operation is
/// an idempotent conditional update, so a stale leader racing the new one
/// during the TTL window cannot corrupt state - one of the two updates
/// simply matches zero rows.
pub struct DeploymentReconciler {
    state: Arc<ControllerState>,
    settings: ReconcilerSettings,
    database_url: String,
    delivery: ImageDelivery,
    verifier: DomainVerifier,
    holder_id: String,
    is_leader: AtomicBool,
}

impl DeploymentReconciler {
    pub fn new(
        state: Arc<ControllerState>,
        settings: ReconcilerSettings,
        registry: Option<RegistrySettings>,
        database_url: String,
    ) -> Result<Self> {
        let holder_id = format!(
            "{}-{}",
            hostname_or_unknown(),
            Uuid::now_v7().simple()
        );
        let delivery = ImageDelivery::new(registry, settings.ssh_user.clone())?;

        Ok(Self {
            state,
            settings,
            database_url,
            delivery,
            verifier: DomainVerifier::new(),
            holder_id,
            is_leader: AtomicBool::new(false),
        })
    }

    /// Spawn the scan, domain verification, and delivery loops
    pub fn start(self: Arc<Self>) {
        let scan = self.clone();
        tokio::spawn(async move {
            scan.scan_loop().await;
        });

        let domains = self.clone();
        tokio::spawn(async move {
            domains.domain_loop().await;
        });

        tokio::spawn(async move {
            self.delivery_loop().await;
        });
    }

    /// Main loop: renew the lease on its own cadence, scan every tick
    /// while leading, wake early on change notifications.
    async fn scan_loop(&self) {
        info!("Deployment reconciler started (holder {})", self.holder_id);

        let tick = Duration::from_secs(self.settings.tick_secs);
        let renew_every = Duration::from_secs(self.settings.lease_renew_secs);
        let mut last_renewal = Instant::now() - renew_every;

        let mut wakeups = match events::subscribe(&self.database_url).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Event subscription unavailable, relying on polling: {}", e);
                None
            }
        };

        loop {
            if last_renewal.elapsed() >= renew_every {
                self.renew_lease().await;
                last_renewal = Instant::now();
            }

            if self.is_leader.load(Ordering::Relaxed) {
                if let Err(e) = self.scan_once().await {
                    error!("Reconciliation scan failed: {}", e);
                }
            }

            match wakeups.as_mut() {
                Some(rx) => events::next_wakeup(rx, tick).await,
                None => tokio::time::sleep(tick).await,
            }
        }
    }

    async fn renew_lease(&self) {
        let was_leader = self.is_leader.load(Ordering::Relaxed);
        match leases::acquire(
            &self.state.db_pool,
            LEASE_NAME,
            &self.holder_id,
            self.settings.lease_ttl_secs as i64,
        )
        .await
        {
            Ok(acquired) => {
                if acquired && !was_leader {
                    info!("Acquired reconciler lease as {}", self.holder_id);
                } else if !acquired && was_leader {
                    warn!("Lost reconciler lease, stepping down");
                }
                self.is_leader.store(acquired, Ordering::Relaxed);
            }
            Err(e) => {
                // Step down on election trouble and retry next renewal.
                warn!("Lease renewal failed, stepping down: {}", e);
                self.is_leader.store(false, Ordering::Relaxed);
            }
        }
    }

    /// One full pass over every non-terminal deployment state.
    ///
    /// Errors in a single deployment's advancement are logged and never
    /// block the others.
    async fn scan_once(&self) -> Result<()> {
        self.promote_queued().await?;
        self.fail_stale_builds().await?;
        self.advance_building().await?;
        self.advance_deploying().await?;
        self.supersede_ready().await?;
        self.cleanup_failed().await?;
        self.fail_instances_on_gone_nodes().await?;
        Ok(())
    }

    /// A node declared gone cannot be trusted to wind anything down;
    /// its instances are failed so their deployments get rescheduled.
    async fn fail_instances_on_gone_nodes(&self) -> Result<()> {
        let pool = &self.state.db_pool;
        for node in nodes::list(pool).await? {
            if node.state != crate::db::models::NodeState::Gone {
                continue;
            }
            match instances::fail_for_node(pool, node.id).await {
                Ok(0) => {}
                Ok(n) => {
                    warn!("Failed {} instance(s) on gone node {}", n, node.id);
                    events::publish_quiet(pool, "nodes", node.id).await;
                }
                Err(e) => error!("Failed to reap instances on node {}: {:#}", node.id, e),
            }
        }
        Ok(())
    }

    /// `queued` deployments get a build row and move to `building`
    async fn promote_queued(&self) -> Result<()> {
        let queued = deployments::find_by_status(&self.state.db_pool, DeploymentStatus::Queued)
            .await?;

        for deployment in queued {
            let slug = deployment.deployment_slug.clone();
            if let Err(e) = self.promote_one(deployment).await {
                error!("Failed to promote deployment {}: {:#}", slug, e);
            }
        }
        Ok(())
    }

    async fn promote_one(&self, deployment: Deployment) -> Result<()> {
        let pool = &self.state.db_pool;

        let Some(project) = crate::db::projects::find_by_id(pool, deployment.project_id).await?
        else {
            // Fail fast: nothing to build without a project.
            deployments::mark_failed(pool, deployment.id, "project no longer exists").await?;
            return Ok(());
        };
        if crate::db::environments::find_by_id(pool, deployment.environment_id)
            .await?
            .is_none()
        {
            deployments::mark_failed(pool, deployment.id, "environment no longer exists").await?;
            return Ok(());
        }

        let build = builds::create(
            pool,
            deployment.organisation_id,
            deployment.project_id,
            &project.repository,
            &deployment.commit_sha,
            project.root_directory.as_deref(),
            project.dockerfile_path.as_deref(),
        )
        .await?;

        if deployments::set_build(pool, deployment.id, build.id)
            .await?
            .is_some()
        {
            info!(
                "Deployment {} queued -> building (build {})",
                deployment.deployment_slug, build.id
            );
            logs::append_deployment_log(
                pool,
                deployment.id,
                "info",
                &format!("build {} queued for commit {}", build.id, deployment.commit_sha),
            )
            .await?;
            events::publish_quiet(pool, "builds", build.id).await;
        }
        Ok(())
    }

    /// The build watchdog: flip builds with no progress past the timeout
    /// to `error`, then fail their dependent deployments.
    async fn fail_stale_builds(&self) -> Result<()> {
        let stale = builds::fail_stale(
            &self.state.db_pool,
            self.settings.build_timeout_secs as i64,
        )
        .await?;

        for build in stale {
            warn!("Build {} timed out", build.id);
            if let Err(e) = self.fail_dependents(&build, "build timed out").await {
                error!("Failed to propagate timeout of build {}: {:#}", build.id, e);
            }
        }
        Ok(())
    }

    async fn fail_dependents(&self, build: &Build, reason: &str) -> Result<()> {
        let pool = &self.state.db_pool;
        for deployment in deployments::find_by_build(pool, build.id).await? {
            if deployment.status.is_terminal() {
                continue;
            }
            if deployments::mark_failed(pool, deployment.id, reason)
                .await?
                .is_some()
            {
                instances::mark_stopping_for_deployment(pool, deployment.id).await?;
                events::publish_quiet(pool, "deployments", deployment.id).await;
            }
        }
        Ok(())
    }

    /// Advance `building` deployments according to their build's status
    async fn advance_building(&self) -> Result<()> {
        let building =
            deployments::find_by_status(&self.state.db_pool, DeploymentStatus::Building).await?;

        for deployment in building {
            let slug = deployment.deployment_slug.clone();
            if let Err(e) = self.advance_building_one(deployment).await {
                error!("Failed to advance deployment {}: {:#}", slug, e);
            }
        }
        Ok(())
    }

    async fn advance_building_one(&self, deployment: Deployment) -> Result<()> {
        let pool = &self.state.db_pool;

        let Some(build_id) = deployment.build_id else {
            deployments::mark_failed(pool, deployment.id, "building without a build").await?;
            instances::mark_stopping_for_deployment(pool, deployment.id).await?;
            return Ok(());
        };
        let Some(build) = builds::find_by_id(pool, build_id).await? else {
            deployments::mark_failed(pool, deployment.id, "build row disappeared").await?;
            instances::mark_stopping_for_deployment(pool, deployment.id).await?;
            return Ok(());
        };

        match build.status {
            BuildStatus::Ready => {
                if deployment.image_id.is_none() {
                    let Some(image_id) = build.image_id else {
                        // Precondition violation: a ready build must carry its image.
                        deployments::mark_failed(pool, deployment.id, "ready build has no image")
                            .await?;
                        instances::mark_stopping_for_deployment(pool, deployment.id).await?;
                        return Ok(());
                    };
                    deployments::set_image(pool, deployment.id, image_id).await?;
                    debug!(
                        "Deployment {} linked image {}",
                        deployment.deployment_slug, image_id
                    );
                    // Allocation happens on the next pass with the image linked.
                    return Ok(());
                }
                self.allocate_and_deploy(&deployment).await
            }
            BuildStatus::Error | BuildStatus::Canceled => {
                let reason = build
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("build {}", build.status));
                if deployments::mark_failed(pool, deployment.id, &reason)
                    .await?
                    .is_some()
                {
                    info!(
                        "Deployment {} building -> failed ({})",
                        deployment.deployment_slug, reason
                    );
                    instances::mark_stopping_for_deployment(pool, deployment.id).await?;
                    events::publish_quiet(pool, "deployments", deployment.id).await;
                }
                Ok(())
            }
            BuildStatus::Queued | BuildStatus::Initializing | BuildStatus::Building => Ok(()),
        }
    }

    /// Pick a node, create the instance, and move the deployment to
    /// `deploying`. No capacity anywhere leaves the deployment in
    /// `building` for the next tick.
    async fn allocate_and_deploy(&self, deployment: &Deployment) -> Result<()> {
        let pool = &self.state.db_pool;
        let image_id = deployment
            .image_id
            .context("allocation requires a linked image")?;

        // A previous leader may have allocated before handing over; the
        // transition below is then the only thing left to do.
        let joined = instances::list_for_deployment(pool, deployment.id).await?;
        if joined.iter().any(|i| !matches!(i.state, InstanceState::Terminated | InstanceState::Failed)) {
            deployments::transition(
                pool,
                deployment.id,
                DeploymentStatus::Building,
                DeploymentStatus::Deploying,
            )
            .await?;
            return Ok(());
        }

        let request = ResourceRequest {
            vcpus: self.settings.default_vcpus,
            memory_mib: self.settings.default_memory_mib,
            default_port: self.settings.default_port,
        };

        let all_regions = regions::list(pool).await?;
        let all_nodes = nodes::list(pool).await?;
        let committed = instances::list_capacity_consuming(pool).await?;

        let Some(placement) = allocation::allocate(
            &all_regions,
            &all_nodes,
            &committed,
            request,
            Utc::now(),
            ChronoDuration::seconds(self.settings.node_heartbeat_timeout_secs as i64),
        ) else {
            debug!(
                "No capacity for deployment {}, retrying next tick",
                deployment.deployment_slug
            );
            return Ok(());
        };

        let env_vars = serde_json::json!({
            "PORT": request.default_port.to_string(),
        });

        let instance = instances::create_for_deployment(
            pool,
            deployment.id,
            deployment.organisation_id,
            placement.region_id,
            placement.node_id,
            image_id,
            request.vcpus,
            request.memory_mib,
            request.default_port,
            &env_vars,
        )
        .await?;

        if deployments::transition(
            pool,
            deployment.id,
            DeploymentStatus::Building,
            DeploymentStatus::Deploying,
        )
        .await?
        .is_some()
        {
            info!(
                "Deployment {} building -> deploying (instance {} on node {})",
                deployment.deployment_slug, instance.id, placement.node_id
            );
            events::publish_quiet(pool, "instances", instance.id).await;
        }
        Ok(())
    }

    /// `deploying` deployments become `ready` on the first running
    /// instance, or `failed` once the timeout passes.
    async fn advance_deploying(&self) -> Result<()> {
        let pool = &self.state.db_pool;
        let deploying =
            deployments::find_by_status(pool, DeploymentStatus::Deploying).await?;
        let timeout = ChronoDuration::seconds(self.settings.deploy_timeout_secs as i64);
        let now = Utc::now();

        for deployment in deploying {
            let joined = match instances::list_for_deployment(pool, deployment.id).await {
                Ok(list) => list,
                Err(e) => {
                    error!(
                        "Failed to load instances for deployment {}: {:#}",
                        deployment.deployment_slug, e
                    );
                    continue;
                }
            };

            if joined.iter().any(|i| i.state == InstanceState::Running) {
                if deployments::transition(
                    pool,
                    deployment.id,
                    DeploymentStatus::Deploying,
                    DeploymentStatus::Ready,
                )
                .await?
                .is_some()
                {
                    info!("Deployment {} deploying -> ready", deployment.deployment_slug);
                    logs::append_deployment_log(pool, deployment.id, "info", "deployment ready")
                        .await
                        .ok();
                    // Routing follows the newest ready deployment.
                    if let Err(e) = db_domains::relink_for_environment(
                        pool,
                        deployment.project_id,
                        deployment.environment_id,
                        deployment.id,
                    )
                    .await
                    {
                        error!(
                            "Failed to relink domains for {}: {:#}",
                            deployment.deployment_slug, e
                        );
                    }
                    events::publish_quiet(pool, "deployments", deployment.id).await;
                }
            } else if advance::deploy_timed_out(&deployment, now, timeout) {
                if deployments::mark_failed(pool, deployment.id, "no instance became ready in time")
                    .await?
                    .is_some()
                {
                    warn!(
                        "Deployment {} deploying -> failed (timeout)",
                        deployment.deployment_slug
                    );
                    instances::mark_stopping_for_deployment(pool, deployment.id).await?;
                    events::publish_quiet(pool, "deployments", deployment.id).await;
                }
            }
        }
        Ok(())
    }

    /// Retire older `ready` deployments per `(project, environment)` group
    async fn supersede_ready(&self) -> Result<()> {
        let pool = &self.state.db_pool;
        let ready = deployments::find_by_status(pool, DeploymentStatus::Ready).await?;

        let mut groups: HashMap<(Uuid, Uuid), Vec<Deployment>> = HashMap::new();
        for deployment in ready {
            groups
                .entry((deployment.project_id, deployment.environment_id))
                .or_default()
                .push(deployment);
        }

        let grace = ChronoDuration::seconds(self.settings.supersession_grace_secs as i64);
        let now = Utc::now();

        for group in groups.values() {
            for id in advance::supersession_actions(group, now, grace) {
                match deployments::transition(
                    pool,
                    id,
                    DeploymentStatus::Ready,
                    DeploymentStatus::Inactive,
                )
                .await
                {
                    Ok(Some(retired)) => {
                        info!(
                            "Deployment {} superseded, ready -> inactive",
                            retired.deployment_slug
                        );
                        if let Err(e) =
                            instances::mark_stopping_for_deployment(pool, id).await
                        {
                            error!("Failed to stop instances of {}: {:#}", id, e);
                        }
                        events::publish_quiet(pool, "deployments", id).await;
                    }
                    Ok(None) => {}
                    Err(e) => error!("Failed to supersede deployment {}: {:#}", id, e),
                }
            }
        }
        Ok(())
    }

    /// Sweep instances of failed deployments toward `stopping`
    async fn cleanup_failed(&self) -> Result<()> {
        let pool = &self.state.db_pool;
        for deployment in
            deployments::find_by_status(pool, DeploymentStatus::Failed).await?
        {
            match instances::mark_stopping_for_deployment(pool, deployment.id).await {
                Ok(0) => {}
                Ok(n) => {
                    debug!(
                        "Marked {} instance(s) of failed deployment {} stopping",
                        n, deployment.deployment_slug
                    );
                }
                Err(e) => error!(
                    "Failed to clean up deployment {}: {:#}",
                    deployment.deployment_slug, e
                ),
            }
        }
        Ok(())
    }

    /// Verify pending external domains on a slower cadence.
    /// DNS errors are non-fatal; unresolved domains retry next scan.
    async fn domain_loop(&self) {
        let mut ticker = interval(Duration::from_secs(self.settings.domain_scan_secs));

        loop {
            ticker.tick().await;
            if !self.is_leader.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(e) = self.verify_domains().await {
                error!("Domain verification scan failed: {:#}", e);
            }
        }
    }

    async fn verify_domains(&self) -> Result<()> {
        let pool = &self.state.db_pool;
        let pending = db_domains::list_pending_verification(pool).await?;

        for domain in pending {
            let Some(token) = domain.verification_token.as_deref() else {
                continue;
            };

            match self.verifier.check(&domain.name, token).await {
                Ok(true) => {
                    db_domains::set_verified(pool, domain.id).await?;
                    info!("Domain {} verified", domain.name);
                    events::publish_quiet(pool, "domains", domain.id).await;
                }
                Ok(false) => {
                    debug!("Domain {} proof not published yet", domain.name);
                }
                Err(e) => {
                    debug!("Domain {} verification deferred: {:#}", domain.name, e);
                }
            }
        }
        Ok(())
    }

    /// Ship images for pending instances to their nodes. Persistent
    /// delivery failure marks the instance failed.
    async fn delivery_loop(&self) {
        let mut ticker = interval(Duration::from_secs(self.settings.tick_secs.max(2)));
        // Instances whose image already landed; an instance can linger in
        // `pending` for a few ticks while its agent picks it up.
        let mut delivered: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

        loop {
            ticker.tick().await;
            if !self.is_leader.load(Ordering::Relaxed) {
                delivered.clear();
                continue;
            }
            if let Err(e) = self.deliver_pending(&mut delivered).await {
                error!("Image delivery scan failed: {:#}", e);
            }
        }
    }

    async fn deliver_pending(
        &self,
        delivered: &mut std::collections::HashSet<Uuid>,
    ) -> Result<()> {
        let pool = &self.state.db_pool;
        let pending = instances::find_by_state(pool, InstanceState::Pending).await?;
        delivered.retain(|id| pending.iter().any(|i| i.id == *id));

        for instance in pending {
            if delivered.contains(&instance.id) {
                continue;
            }

            let Some(image) = images::find_by_id(pool, instance.image_id).await? else {
                instances::set_state(pool, instance.id, InstanceState::Failed).await?;
                continue;
            };
            let Some(node) = nodes::find_by_id(pool, instance.node_id).await? else {
                instances::set_state(pool, instance.id, InstanceState::Failed).await?;
                continue;
            };

            match self
                .delivery
                .deliver_with_retry(
                    &image.reference(),
                    &node.private_address,
                    instance.id,
                    DELIVERY_ATTEMPTS,
                )
                .await
            {
                Ok(()) => {
                    delivered.insert(instance.id);
                }
                Err(e) => {
                    error!(
                        "Image delivery for instance {} failed permanently: {:#}",
                        instance.id, e
                    );
                    instances::set_state(pool, instance.id, InstanceState::Failed).await?;
                }
            }
        }
        Ok(())
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "reconciler".to_string())
}
