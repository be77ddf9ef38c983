use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    #[serde(default)]
    pub builder: BuilderSettings,
    #[serde(default)]
    pub registry: Option<RegistrySettings>,
    #[serde(default)]
    pub github: Option<GitHubSettings>,
    #[serde(default)]
    pub node: Option<NodeSettings>,
    #[serde(default)]
    pub edge: Option<EdgeSettings>,
    /// Reserved for at-rest secret encryption; validated at startup when set
    #[serde(default)]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Address the operator/tenant API binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_tick() -> u64 {
    1
}

fn default_domain_scan() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    600
}

fn default_deploy_timeout() -> u64 {
    300
}

fn default_grace() -> u64 {
    300
}

fn default_node_heartbeat_timeout() -> u64 {
    60
}

fn default_lease_ttl() -> u64 {
    30
}

fn default_lease_renew() -> u64 {
    10
}

fn default_vcpus() -> i32 {
    2
}

fn default_memory_mib() -> i64 {
    2048
}

fn default_port() -> i32 {
    3000
}

fn default_ssh_user() -> String {
    "root".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerSettings {
    /// Interval in seconds between deployment scans (default: 1)
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// Interval in seconds between domain verification scans (default: 30)
    #[serde(default = "default_domain_scan")]
    pub domain_scan_secs: u64,

    /// Builds stuck without progress longer than this are failed (default: 600)
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Deployments stuck in deploying longer than this are failed (default: 300)
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    /// Grace window before a superseded deployment is torn down (default: 300)
    #[serde(default = "default_grace")]
    pub supersession_grace_secs: u64,

    /// Nodes whose heartbeat is older than this are not schedulable (default: 60)
    #[serde(default = "default_node_heartbeat_timeout")]
    pub node_heartbeat_timeout_secs: u64,

    /// Leader lease TTL in seconds (default: 30)
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Leader lease renewal cadence in seconds (default: 10)
    #[serde(default = "default_lease_renew")]
    pub lease_renew_secs: u64,

    /// Default instance resources
    #[serde(default = "default_vcpus")]
    pub default_vcpus: i32,
    #[serde(default = "default_memory_mib")]
    pub default_memory_mib: i64,
    #[serde(default = "default_port")]
    pub default_port: i32,

    /// SSH user for image delivery to nodes (default: root)
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            domain_scan_secs: default_domain_scan(),
            build_timeout_secs: default_build_timeout(),
            deploy_timeout_secs: default_deploy_timeout(),
            supersession_grace_secs: default_grace(),
            node_heartbeat_timeout_secs: default_node_heartbeat_timeout(),
            lease_ttl_secs: default_lease_ttl(),
            lease_renew_secs: default_lease_renew(),
            default_vcpus: default_vcpus(),
            default_memory_mib: default_memory_mib(),
            default_port: default_port(),
            ssh_user: default_ssh_user(),
        }
    }
}

fn default_builder_poll() -> u64 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuilderSettings {
    /// Seconds between claim attempts when no work is queued (default: 2)
    #[serde(default = "default_builder_poll")]
    pub poll_secs: u64,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            poll_secs: default_builder_poll(),
        }
    }
}

/// OCI registry the builders push to and the reconciler pulls from.
///
/// Credentials stay on the control-plane side; nodes never see them.
#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

/// GitHub App credentials backing the git-host integration
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubSettings {
    pub app_id: String,
    pub private_key_pem: String,
    pub webhook_secret: String,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

fn default_node_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_node_reconcile() -> u64 {
    5
}

fn default_node_full_resync() -> u64 {
    300
}

fn default_node_heartbeat() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    /// This node's row id in the nodes table
    pub id: Uuid,

    /// Routable private address instances are exposed on
    pub ip: String,

    /// Region name, informational for logs
    #[serde(default)]
    pub region: Option<String>,

    /// Operator API base URL, informational for logs and diagnostics
    #[serde(default)]
    pub operator_url: Option<String>,

    /// HS256 secret validating bearer JWTs presented to the node-agent
    /// HTTP API. With no secret the API is open (development setups).
    #[serde(default)]
    pub jwt: Option<String>,

    #[serde(default = "default_node_listen_addr")]
    pub listen_addr: String,

    /// Seconds between reconcile ticks (default: 5)
    #[serde(default = "default_node_reconcile")]
    pub reconcile_secs: u64,

    /// Seconds between unconditional full resyncs (default: 300)
    #[serde(default = "default_node_full_resync")]
    pub full_resync_secs: u64,

    /// Seconds between node heartbeats (default: 15)
    #[serde(default = "default_node_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_edge_http_port() -> u16 {
    80
}

fn default_edge_https_port() -> u16 {
    443
}

fn default_edge_refresh() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EdgeSettings {
    /// Identifier of this edge proxy, used as the lock holder id
    pub id: String,

    /// Region this edge serves, informational for logs
    #[serde(default)]
    pub region_id: Option<Uuid>,

    #[serde(default = "default_edge_http_port")]
    pub http_port: u16,

    #[serde(default = "default_edge_https_port")]
    pub https_port: u16,

    /// Routing table refresh cadence in seconds (default: 30)
    #[serde(default = "default_edge_refresh")]
    pub refresh_secs: u64,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// ACME contact email; certificate issuance is disabled without it
    #[serde(default)]
    pub acme_email: Option<String>,

    #[serde(default = "default_acme_directory")]
    pub acme_directory: String,

    /// Optional per-client-IP rate limit in requests per second
    #[serde(default)]
    pub rate_limit_rps: Option<u32>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("ZEITWORK_CONFIG_DIR").unwrap_or_else(|_| "/config".into());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // `ZEITWORK_RECONCILER__TICK_SECS=2` sets reconciler.tick_secs
            .add_source(Environment::with_prefix("ZEITWORK").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.apply_conventional_env();

        if settings.database.url.is_empty() {
            return Err(ConfigError::Message(
                "Database URL not configured. Set DATABASE_URL or [database] url in config"
                    .to_string(),
            ));
        }

        if let Some(ref key) = settings.encryption_key {
            if key.len() < 32 {
                return Err(ConfigError::Message(
                    "ENCRYPTION_KEY must be at least 32 bytes".to_string(),
                ));
            }
        }

        Ok(settings)
    }

    /// Each daemon is configurable entirely through well-known environment
    /// variables; these take precedence over the TOML layers.
    fn apply_conventional_env(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database.url = url;
            }
        }
        if let Ok(addr) = env::var("LISTEN_ADDR") {
            if !addr.is_empty() {
                self.server.listen_addr = addr;
            }
        }
        if let Ok(key) = env::var("ENCRYPTION_KEY") {
            if !key.is_empty() {
                self.encryption_key = Some(key);
            }
        }

        if let Ok(url) = env::var("REGISTRY_URL") {
            if !url.is_empty() {
                let registry = self.registry.get_or_insert(RegistrySettings {
                    url: String::new(),
                    username: None,
                    password: None,
                });
                registry.url = url;
                if let Ok(username) = env::var("REGISTRY_USERNAME") {
                    registry.username = Some(username);
                }
                if let Ok(password) = env::var("REGISTRY_PASSWORD") {
                    registry.password = Some(password);
                }
            }
        }

        if let Ok(node_id) = env::var("NODE_ID") {
            if let Ok(id) = node_id.parse::<Uuid>() {
                let node = self.node.get_or_insert(NodeSettings {
                    id,
                    ip: String::new(),
                    region: None,
                    operator_url: None,
                    jwt: None,
                    listen_addr: default_node_listen_addr(),
                    reconcile_secs: default_node_reconcile(),
                    full_resync_secs: default_node_full_resync(),
                    heartbeat_secs: default_node_heartbeat(),
                });
                node.id = id;
                if let Ok(ip) = env::var("NODE_IP") {
                    node.ip = ip;
                }
                if let Ok(region) = env::var("NODE_REGION") {
                    node.region = Some(region);
                }
                if let Ok(url) = env::var("OPERATOR_URL") {
                    node.operator_url = Some(url);
                }
                if let Ok(jwt) = env::var("NODE_JWT") {
                    node.jwt = Some(jwt);
                }
            }
        }

        if let Ok(edge_id) = env::var("EDGEPROXY_ID") {
            if !edge_id.is_empty() {
                let edge = self.edge.get_or_insert(EdgeSettings {
                    id: String::new(),
                    region_id: None,
                    http_port: default_edge_http_port(),
                    https_port: default_edge_https_port(),
                    refresh_secs: default_edge_refresh(),
                    upstream_timeout_secs: default_upstream_timeout(),
                    acme_email: None,
                    acme_directory: default_acme_directory(),
                    rate_limit_rps: None,
                });
                edge.id = edge_id;
                if let Ok(region) = env::var("EDGEPROXY_REGION_ID") {
                    edge.region_id = region.parse().ok();
                }
                if let Ok(port) = env::var("EDGEPROXY_PORT") {
                    if let Ok(port) = port.parse() {
                        edge.https_port = port;
                    }
                }
                if let Ok(email) = env::var("ACME_EMAIL") {
                    edge.acme_email = Some(email);
                }
            }
        }
    }

    /// Registry settings, required by the builder and the reconciler
    pub fn require_registry(&self) -> Result<&RegistrySettings, ConfigError> {
        self.registry.as_ref().ok_or_else(|| {
            ConfigError::Message("Registry not configured. Set REGISTRY_URL".to_string())
        })
    }

    /// Node settings, required by the node agent
    pub fn require_node(&self) -> Result<&NodeSettings, ConfigError> {
        self.node.as_ref().ok_or_else(|| {
            ConfigError::Message("Node identity not configured. Set NODE_ID and NODE_IP".to_string())
        })
    }

    /// Edge settings, required by the edge proxy
    pub fn require_edge(&self) -> Result<&EdgeSettings, ConfigError> {
        self.edge.as_ref().ok_or_else(|| {
            ConfigError::Message("Edge identity not configured. Set EDGEPROXY_ID".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_defaults() {
        let settings = ReconcilerSettings::default();
        assert_eq!(settings.tick_secs, 1);
        assert_eq!(settings.build_timeout_secs, 600);
        assert_eq!(settings.deploy_timeout_secs, 300);
        assert_eq!(settings.supersession_grace_secs, 300);
        assert_eq!(settings.default_vcpus, 2);
        assert_eq!(settings.default_memory_mib, 2048);
        assert_eq!(settings.default_port, 3000);
    }

    #[test]
    fn test_server_default_listen_addr() {
        assert_eq!(ServerSettings::default().listen_addr, "0.0.0.0:3000");
    }
}
