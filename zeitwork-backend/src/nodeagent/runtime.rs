use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label carrying the instance id on every container this agent manages.
/// Containers without it are operator-manual and never touched.
pub const INSTANCE_LABEL: &str = "zeitwork.instance_id";

/// Label carrying a fingerprint of the injected environment, used to
/// detect env changes that require a recreate.
pub const ENV_HASH_LABEL: &str = "zeitwork.env_hash";

/// A managed container as observed on the local runtime
#[derive(Debug, Clone)]
pub struct ActualContainer {
    pub instance_id: Uuid,
    pub container_id: String,
    pub running: bool,
    pub env_hash: Option<String>,
}

/// Everything needed to realize one instance as a container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub instance_id: Uuid,
    pub image_ref: String,
    pub port: i32,
    pub env: Vec<String>,
    pub env_hash: String,
}

/// Fingerprint of an instance's environment bundle
pub fn env_hash(env_vars: &serde_json::Value) -> String {
    let canonical = env_vars.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

/// Environment bundle as `KEY=value` pairs, sorted for determinism
pub fn env_list(env_vars: &serde_json::Value) -> Vec<String> {
    let mut env: Vec<String> = env_vars
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("{}={}", k, s),
                    other => format!("{}={}", k, other),
                })
                .collect()
        })
        .unwrap_or_default();
    env.sort();
    env
}

/// Seam over the local container runtime so the reconcile logic is
/// testable against a fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Enumerate managed containers (running or not)
    async fn list(&self) -> anyhow::Result<Vec<ActualContainer>>;

    /// Whether an image is already loaded locally
    async fn image_present(&self, image_ref: &str) -> anyhow::Result<bool>;

    /// Create, label, and start a container. Returns the container id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Stop a container gracefully (SIGTERM, then kill after the deadline)
    async fn stop(&self, container_id: &str, deadline_secs: i64) -> anyhow::Result<()>;

    /// Remove a stopped container
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
}

/// Docker implementation used in production
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self) -> anyhow::Result<Vec<ActualContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![INSTANCE_LABEL.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut actual = Vec::new();
        for container in containers {
            let labels = container.labels.unwrap_or_default();
            let Some(instance_id) = labels
                .get(INSTANCE_LABEL)
                .and_then(|v| v.parse::<Uuid>().ok())
            else {
                continue;
            };
            let Some(container_id) = container.id else {
                continue;
            };
            let running = container.state.as_deref() == Some("running");
            actual.push(ActualContainer {
                instance_id,
                container_id,
                running,
                env_hash: labels.get(ENV_HASH_LABEL).cloned(),
            });
        }
        Ok(actual)
    }

    async fn image_present(&self, image_ref: &str) -> anyhow::Result<bool> {
        match self.docker.inspect_image(image_ref).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let container_name = format!("zeitwork-{}", spec.instance_id);
        let port_key = format!("{}/tcp", spec.port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("::".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut labels = HashMap::new();
        labels.insert(INSTANCE_LABEL.to_string(), spec.instance_id.to_string());
        labels.insert(ENV_HASH_LABEL.to_string(), spec.env_hash.clone());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image_ref.clone()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            ..Default::default()
        };

        let container_id = match self.docker.create_container(Some(options), config).await {
            Ok(response) => response.id,
            Err(e) if e.to_string().contains("Conflict") => {
                // A previous attempt got as far as creating it.
                debug!("Container {} already exists, reusing", container_name);
                let inspect = self.docker.inspect_container(&container_name, None).await?;
                inspect
                    .id
                    .ok_or_else(|| anyhow::anyhow!("Existing container has no id"))?
            }
            Err(e) => return Err(e.into()),
        };

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;

        info!(
            "Started container {} for instance {}",
            container_id, spec.instance_id
        );
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, deadline_secs: i64) -> anyhow::Result<()> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: deadline_secs }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("304") => Ok(()), // already stopped
            Err(e) => {
                warn!("Graceful stop of {} failed, killing: {}", container_id, e);
                self.docker.kill_container::<String>(container_id, None).await?;
                Ok(())
            }
        }
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_hash_is_stable_and_sensitive() {
        let a = serde_json::json!({"PORT": "3000", "MODE": "prod"});
        let b = serde_json::json!({"PORT": "3000", "MODE": "prod"});
        let c = serde_json::json!({"PORT": "3000", "MODE": "staging"});
        assert_eq!(env_hash(&a), env_hash(&b));
        assert_ne!(env_hash(&a), env_hash(&c));
    }

    #[test]
    fn test_env_list_sorted_key_value_pairs() {
        let env = serde_json::json!({"Z_LAST": "1", "A_FIRST": "x", "NUM": 7});
        assert_eq!(
            env_list(&env),
            vec![
                "A_FIRST=x".to_string(),
                "NUM=7".to_string(),
                "Z_LAST=1".to_string()
            ]
        );
    }

    #[test]
    fn test_env_list_of_non_object_is_empty() {
        assert!(env_list(&serde_json::json!(null)).is_empty());
        assert!(env_list(&serde_json::json!("str")).is_empty());
    }
}
