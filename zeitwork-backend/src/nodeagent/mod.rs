pub mod auth;
pub mod diff;
pub mod handlers;
pub mod health;
pub mod routes;
pub mod runtime;

use anyhow::Result;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::models::{Instance, InstanceState};
use crate::db::{images, instances, nodes};
use crate::events;
use crate::settings::NodeSettings;
use crate::state::ControllerState;

use diff::{ReconcilePlan, UpdateKind};
use runtime::{env_hash, env_list, ContainerRuntime, ContainerSpec};

/// Graceful stop deadline before the runtime kills a container
const STOP_DEADLINE_SECS: i64 = 30;

/// How long a fresh instance may take to accept its first connection
const READINESS_WINDOW: Duration = Duration::from_secs(60);

/// Shared state for the node-agent HTTP API
#[derive(Clone)]
pub struct NodeAgentState {
    pub db_pool: PgPool,
    pub settings: Arc<NodeSettings>,
}

/// The per-node local reconciler.
///
/// Every tick it loads the desired instances for this node from the
/// database, enumerates the managed containers on the local runtime, and
/// executes the ordered diff: deletes first (freeing resources), then
/// updates, then creates.
pub struct NodeAgent {
    state: Arc<ControllerState>,
    settings: Arc<NodeSettings>,
    runtime: Arc<dyn ContainerRuntime>,
    database_url: String,
    probing: Arc<Mutex<HashSet<Uuid>>>,
}

impl NodeAgent {
    pub fn new(
        state: Arc<ControllerState>,
        settings: Arc<NodeSettings>,
        runtime: Arc<dyn ContainerRuntime>,
        database_url: String,
    ) -> Self {
        Self {
            state,
            settings,
            runtime,
            database_url,
            probing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn start(self: Arc<Self>) {
        let reconcile = self.clone();
        tokio::spawn(async move {
            reconcile.reconcile_loop().await;
        });

        tokio::spawn(async move {
            self.heartbeat_loop().await;
        });
    }

    /// Tick every `reconcile_secs`, waking early on change notifications.
    /// Both snapshots are rebuilt from scratch on every pass, so the
    /// periodic full resync also catches state that drifted silently
    /// (e.g. a container killed out-of-band).
    async fn reconcile_loop(&self) {
        info!("Node agent started for node {}", self.settings.id);

        let tick = Duration::from_secs(self.settings.reconcile_secs);
        let resync_every = Duration::from_secs(self.settings.full_resync_secs);
        let mut last_resync_log = Instant::now();

        let mut wakeups = match events::subscribe(&self.database_url).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Event subscription unavailable, relying on polling: {}", e);
                None
            }
        };

        loop {
            match self.reconcile_once().await {
                Ok(plan_size) => {
                    if last_resync_log.elapsed() >= resync_every {
                        info!("Full resync pass complete ({} action(s))", plan_size);
                        last_resync_log = Instant::now();
                    }
                }
                Err(e) => error!("Reconcile pass failed: {:#}", e),
            }

            match wakeups.as_mut() {
                Some(rx) => events::next_wakeup(rx, tick).await,
                None => tokio::time::sleep(tick).await,
            }
        }
    }

    /// One desired-vs-actual convergence pass. Returns the number of
    /// actions executed.
    async fn reconcile_once(&self) -> Result<usize> {
        let pool = &self.state.db_pool;

        let mut desired =
            instances::list_desired_for_node(pool, self.settings.id).await?;
        // Rows without a resolvable image are invalid; leave them out of
        // the diff rather than tearing anything down over bad data.
        let mut image_refs = std::collections::HashMap::new();
        let mut valid = Vec::with_capacity(desired.len());
        for instance in desired.drain(..) {
            match images::find_by_id(pool, instance.image_id).await? {
                Some(image) => {
                    image_refs.insert(instance.id, image.reference());
                    valid.push(instance);
                }
                None => {
                    warn!("Instance {} references a missing image, skipping", instance.id);
                }
            }
        }

        let actual = self.runtime.list().await?;
        let plan = diff::diff(&valid, &actual);
        if plan.is_empty() {
            return Ok(0);
        }

        debug!(
            "Converging: {} delete(s), {} update(s), {} create(s), {} state fix(es)",
            plan.deletes.len(),
            plan.updates.len(),
            plan.creates.len(),
            plan.state_fixes.len()
        );

        let actions = self.execute(&plan, &valid, &image_refs).await;
        Ok(actions)
    }

    async fn execute(
        &self,
        plan: &ReconcilePlan,
        desired: &[Instance],
        image_refs: &std::collections::HashMap<Uuid, String>,
    ) -> usize {
        let pool = &self.state.db_pool;
        let mut actions = 0;

        for delete in &plan.deletes {
            actions += 1;
            if let Err(e) = self.teardown(&delete.container_id).await {
                error!("Failed to remove container {}: {:#}", delete.container_id, e);
                continue;
            }
            if let Err(e) =
                instances::set_state(pool, delete.instance_id, InstanceState::Terminated).await
            {
                // The row may be gone entirely; that is fine.
                debug!("Could not terminate instance row {}: {:#}", delete.instance_id, e);
            }
            events::publish_quiet(pool, "instances", delete.instance_id).await;
        }

        for update in &plan.updates {
            actions += 1;
            match update.kind {
                UpdateKind::Stop => {
                    if let Err(e) = self
                        .runtime
                        .stop(&update.container_id, STOP_DEADLINE_SECS)
                        .await
                    {
                        error!("Failed to stop container {}: {:#}", update.container_id, e);
                        continue;
                    }
                    if let Err(e) = instances::transition(
                        pool,
                        update.instance_id,
                        InstanceState::Stopping,
                        InstanceState::Stopped,
                    )
                    .await
                    {
                        error!("Failed to mark instance {} stopped: {:#}", update.instance_id, e);
                    }
                    events::publish_quiet(pool, "instances", update.instance_id).await;
                }
                UpdateKind::Recreate => {
                    if let Err(e) = self.teardown(&update.container_id).await {
                        error!(
                            "Failed to remove container {} for recreate: {:#}",
                            update.container_id, e
                        );
                        continue;
                    }
                    if let Some(instance) = desired.iter().find(|i| i.id == update.instance_id) {
                        self.create(instance, image_refs).await;
                    }
                }
            }
        }

        for instance_id in &plan.creates {
            if let Some(instance) = desired.iter().find(|i| i.id == *instance_id) {
                actions += 1;
                self.create(instance, image_refs).await;
            }
        }

        for fix in &plan.state_fixes {
            actions += 1;
            if let Err(e) = instances::set_state(pool, fix.instance_id, fix.to).await {
                error!("Failed to fix instance {} state: {:#}", fix.instance_id, e);
            }
            events::publish_quiet(pool, "instances", fix.instance_id).await;
        }

        actions
    }

    async fn teardown(&self, container_id: &str) -> Result<()> {
        self.runtime.stop(container_id, STOP_DEADLINE_SECS).await?;
        self.runtime.remove(container_id).await?;
        Ok(())
    }

    /// Start a container for an instance and gate `running` behind the
    /// readiness probe. Skips quietly while the image is still in flight
    /// from the control plane.
    async fn create(&self, instance: &Instance, image_refs: &std::collections::HashMap<Uuid, String>) {
        let pool = &self.state.db_pool;
        let Some(image_ref) = image_refs.get(&instance.id) else {
            return;
        };

        match self.runtime.image_present(image_ref).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Image {} for instance {} not delivered yet",
                    image_ref, instance.id
                );
                return;
            }
            Err(e) => {
                error!("Failed to check image {}: {:#}", image_ref, e);
                return;
            }
        }

        let spec = ContainerSpec {
            instance_id: instance.id,
            image_ref: image_ref.clone(),
            port: instance.default_port,
            env: env_list(&instance.env_vars),
            env_hash: env_hash(&instance.env_vars),
        };

        if let Err(e) = self.runtime.create_and_start(&spec).await {
            error!("Failed to start instance {}: {:#}", instance.id, e);
            return;
        }

        if let Err(e) = instances::set_ipv6_address(pool, instance.id, &self.settings.ip).await {
            error!("Failed to record instance {} address: {:#}", instance.id, e);
        }
        if instance.state == InstanceState::Pending {
            if let Err(e) = instances::transition(
                pool,
                instance.id,
                InstanceState::Pending,
                InstanceState::Starting,
            )
            .await
            {
                error!("Failed to mark instance {} starting: {:#}", instance.id, e);
            }
        }
        events::publish_quiet(pool, "instances", instance.id).await;

        self.spawn_readiness_probe(instance.id, self.settings.ip.clone(), instance.default_port);
    }

    /// One probe task per instance; the first successful TCP connect flips
    /// `starting -> running`. Giving up leaves the instance for the
    /// deployment timeout to clean up.
    fn spawn_readiness_probe(&self, instance_id: Uuid, address: String, port: i32) {
        {
            let Ok(mut probing) = self.probing.lock() else {
                return;
            };
            if !probing.insert(instance_id) {
                return;
            }
        }

        let pool = self.state.db_pool.clone();
        let guard = ProbeGuard {
            probing: self.probing.clone(),
            instance_id,
        };

        tokio::spawn(async move {
            let _guard = guard;
            if health::wait_until_ready(&address, port as u16, READINESS_WINDOW).await {
                match instances::transition(
                    &pool,
                    instance_id,
                    InstanceState::Starting,
                    InstanceState::Running,
                )
                .await
                {
                    Ok(Some(_)) => {
                        info!("Instance {} starting -> running", instance_id);
                        events::publish_quiet(&pool, "instances", instance_id).await;
                    }
                    Ok(None) => {}
                    Err(e) => error!("Failed to mark instance {} running: {:#}", instance_id, e),
                }
            } else {
                warn!("Instance {} never became ready", instance_id);
            }
        });
    }

    /// Heartbeat: keep this node's row fresh so the scheduler trusts it
    async fn heartbeat_loop(&self) {
        let mut ticker = interval(Duration::from_secs(self.settings.heartbeat_secs));

        loop {
            ticker.tick().await;
            match nodes::heartbeat(
                &self.state.db_pool,
                self.settings.id,
                &local_hostname(),
                &self.settings.ip,
                detect_vcpus(),
                detect_memory_mib(),
            )
            .await
            {
                Ok(Some(_)) => {}
                Ok(None) => warn!(
                    "Node {} has no row in the nodes table; register it via the operator API",
                    self.settings.id
                ),
                Err(e) => warn!("Node heartbeat failed: {:#}", e),
            }
        }
    }
}

/// Removes an instance from the probing set when its probe task finishes,
/// however it finishes.
struct ProbeGuard {
    probing: Arc<Mutex<HashSet<Uuid>>>,
    instance_id: Uuid,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Ok(mut probing) = self.probing.lock() {
            probing.remove(&self.instance_id);
        }
    }
}

pub(crate) fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string())
}

pub(crate) fn detect_vcpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1)
}

/// MemTotal from /proc/meminfo, in MiB. Zero when undetectable.
pub(crate) fn detect_memory_mib() -> i64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            if let Some(kib) = rest.split_whitespace().next().and_then(|v| v.parse::<i64>().ok()) {
                return kib / 1024;
            }
        }
    }
    0
}
