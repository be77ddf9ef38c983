use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Region model - a failure domain holding nodes and an edge load balancer
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Region {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub name: String,
    pub ordinal: i32,
    pub load_balancer_ipv4: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Ready,
    Draining,
    Gone,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Pending => write!(f, "pending"),
            NodeState::Ready => write!(f, "ready"),
            NodeState::Draining => write!(f, "draining"),
            NodeState::Gone => write!(f, "gone"),
        }
    }
}

/// Node model - a worker host inside a region
///
/// The node's agent is authoritative for liveness: it heartbeats by bumping
/// `updated_at`. Nodes with a stale heartbeat are skipped for scheduling but
/// never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub region_id: Uuid,
    pub hostname: String,
    pub private_address: String,
    pub state: NodeState,
    pub vcpus: i32,
    pub memory_mib: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Project model - a deployable repository
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub name: String,
    pub slug: String,
    pub repository: String,
    pub default_branch: String,
    pub root_directory: Option<String>,
    pub dockerfile_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Environment model - a named deploy target of a project (e.g. production)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Environment {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Image model - an immutable, digest-addressed OCI artifact
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Image {
    /// Full pullable reference, e.g. `registry.example.com/proj:abc123`
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Build status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Initializing,
    Building,
    Ready,
    Canceled,
    Error,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Ready | BuildStatus::Canceled | BuildStatus::Error
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Queued => write!(f, "queued"),
            BuildStatus::Initializing => write!(f, "initializing"),
            BuildStatus::Building => write!(f, "building"),
            BuildStatus::Ready => write!(f, "ready"),
            BuildStatus::Canceled => write!(f, "canceled"),
            BuildStatus::Error => write!(f, "error"),
        }
    }
}

/// Build model - transforms a commit into an image
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Build {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub repository: String,
    pub commit_sha: String,
    pub root_directory: Option<String>,
    pub dockerfile_path: Option<String>,
    pub status: BuildStatus,
    pub image_id: Option<Uuid>,
    pub vm_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Effective build context inside the checkout
    pub fn context_path(&self) -> &str {
        self.root_directory.as_deref().unwrap_or("/")
    }

    /// Dockerfile path relative to the build context
    pub fn dockerfile(&self) -> &str {
        self.dockerfile_path.as_deref().unwrap_or("Dockerfile")
    }
}

/// Deployment status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deploying,
    Ready,
    Inactive,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Inactive | DeploymentStatus::Failed)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Queued => write!(f, "queued"),
            DeploymentStatus::Building => write!(f, "building"),
            DeploymentStatus::Deploying => write!(f, "deploying"),
            DeploymentStatus::Ready => write!(f, "ready"),
            DeploymentStatus::Inactive => write!(f, "inactive"),
            DeploymentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Deployment model - the intent to run a specific commit in an environment
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub deployment_slug: String,
    pub commit_sha: String,
    pub status: DeploymentStatus,
    pub build_id: Option<Uuid>,
    pub image_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Instance state enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Terminated,
}

impl InstanceState {
    /// States that count against a node's declared capacity
    pub fn consumes_capacity(&self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Starting | InstanceState::Running
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Failed => write!(f, "failed"),
            InstanceState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Instance model - one running container/micro-VM realizing a deployment
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub region_id: Uuid,
    pub node_id: Uuid,
    pub image_id: Uuid,
    pub state: InstanceState,
    pub vcpus: i32,
    pub memory_mib: i64,
    pub default_port: i32,
    pub ipv6_address: Option<String>,
    pub env_vars: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Join row linking a deployment to the instances serving it
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeploymentInstance {
    pub deployment_id: Uuid,
    pub instance_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Domain model - a hostname claimed by a tenant
///
/// Internal domains (platform subdomains) are implicitly verified on
/// creation. External domains require a DNS TXT proof. `verified_at` is
/// monotonic: never cleared once set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Domain {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub name: String,
    pub internal: bool,
    pub verification_token: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub deployment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Append-only build log line
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BuildLog {
    pub id: Uuid,
    pub build_id: Uuid,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only deployment log line
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeploymentLog {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Time-bounded lease row used for singleton election
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lease {
    pub name: String,
    pub holder: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_round_trip() {
        assert_eq!(DeploymentStatus::Queued.to_string(), "queued");
        assert_eq!(BuildStatus::Initializing.to_string(), "initializing");
        assert_eq!(InstanceState::Terminated.to_string(), "terminated");
        assert_eq!(NodeState::Draining.to_string(), "draining");
    }

    #[test]
    fn test_terminal_states() {
        assert!(BuildStatus::Ready.is_terminal());
        assert!(BuildStatus::Canceled.is_terminal());
        assert!(BuildStatus::Error.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());

        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Inactive.is_terminal());
        assert!(!DeploymentStatus::Ready.is_terminal());
    }

    #[test]
    fn test_capacity_states() {
        assert!(InstanceState::Pending.consumes_capacity());
        assert!(InstanceState::Starting.consumes_capacity());
        assert!(InstanceState::Running.consumes_capacity());
        assert!(!InstanceState::Stopping.consumes_capacity());
        assert!(!InstanceState::Terminated.consumes_capacity());
    }

    #[test]
    fn test_build_context_defaults() {
        let build = Build {
            id: Uuid::now_v7(),
            organisation_id: Uuid::now_v7(),
            project_id: Uuid::now_v7(),
            repository: "acme/web".to_string(),
            commit_sha: "abc123def".to_string(),
            root_directory: None,
            dockerfile_path: None,
            status: BuildStatus::Queued,
            image_id: None,
            vm_id: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        assert_eq!(build.context_path(), "/");
        assert_eq!(build.dockerfile(), "Dockerfile");
    }
}
