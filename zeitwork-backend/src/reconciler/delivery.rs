use anyhow::{bail, Context, Result};
use bollard::auth::DockerCredentials;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use openssh::{KnownHosts, SessionBuilder, Stdio};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::settings::RegistrySettings;

/// Ships images to nodes without handing out registry credentials.
///
/// The control plane pulls with its own credentials, saves the image to a
/// local tar, streams the tar over SSH, and loads it into the node's
/// runtime. Nodes only ever see image bytes.
pub struct ImageDelivery {
    docker: Docker,
    registry: Option<RegistrySettings>,
    ssh_user: String,
}

/// Removes a local scratch file when dropped, so the tar disappears on
/// every exit path including panics.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove scratch tar {}: {}", self.0.display(), e);
            }
        }
    }
}

impl ImageDelivery {
    pub fn new(registry: Option<RegistrySettings>, ssh_user: String) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to local Docker daemon")?;

        Ok(Self {
            docker,
            registry,
            ssh_user,
        })
    }

    fn credentials(&self) -> Option<DockerCredentials> {
        self.registry.as_ref().map(|r| DockerCredentials {
            username: r.username.clone(),
            password: r.password.clone(),
            serveraddress: Some(r.url.clone()),
            ..Default::default()
        })
    }

    /// Deliver an image to a node, retrying with exponential backoff.
    ///
    /// Returns an error only once every attempt is exhausted; the caller
    /// then marks the instance failed.
    pub async fn deliver_with_retry(
        &self,
        image_ref: &str,
        node_address: &str,
        instance_id: Uuid,
        attempts: u32,
    ) -> Result<()> {
        let mut backoff = Duration::from_secs(2);
        for attempt in 1..=attempts {
            match self.deliver(image_ref, node_address, instance_id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Image delivery attempt {}/{} for instance {} failed: {:#}",
                        attempt, attempts, instance_id, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("attempts is always >= 1")
    }

    /// One pull → save → stream → load round trip
    async fn deliver(&self, image_ref: &str, node_address: &str, instance_id: Uuid) -> Result<()> {
        self.pull(image_ref).await?;

        let local_tar = std::env::temp_dir().join(format!("zeitwork-image-{}.tar", instance_id));
        let _cleanup = RemoveOnDrop(local_tar.clone());
        self.save(image_ref, &local_tar).await?;

        let remote_tar = format!("/tmp/zeitwork-image-{}.tar", instance_id);
        self.stream_and_load(node_address, &local_tar, &remote_tar)
            .await?;

        info!(
            "Delivered image {} to {} for instance {}",
            image_ref, node_address, instance_id
        );
        Ok(())
    }

    /// Pull the image locally using control-plane registry credentials
    async fn pull(&self, image_ref: &str) -> Result<()> {
        debug!("Pulling {}", image_ref);

        let options = CreateImageOptions {
            from_image: image_ref.to_string(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .create_image(Some(options), None, self.credentials());
        while let Some(progress) = stream.next().await {
            progress.context("Registry pull failed")?;
        }
        Ok(())
    }

    /// `docker save` the image to a uniquely named local tar
    async fn save(&self, image_ref: &str, tar_path: &Path) -> Result<()> {
        debug!("Saving {} to {}", image_ref, tar_path.display());

        let mut file = tokio::fs::File::create(tar_path)
            .await
            .context("Failed to create scratch tar")?;

        let mut export = self.docker.export_image(image_ref);
        while let Some(chunk) = export.next().await {
            let chunk = chunk.context("Image export failed")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write scratch tar")?;
        }
        file.flush().await.context("Failed to flush scratch tar")?;
        Ok(())
    }

    /// Stream the tar to the node and load it there. The remote tar is
    /// removed after a successful load, and best-effort on failure.
    async fn stream_and_load(
        &self,
        node_address: &str,
        local_tar: &Path,
        remote_tar: &str,
    ) -> Result<()> {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.user(self.ssh_user.clone());
        builder.connect_timeout(Duration::from_secs(10));

        let session = builder
            .connect(node_address)
            .await
            .with_context(|| format!("Failed to connect to {}@{}", self.ssh_user, node_address))?;

        let upload = async {
            let mut child = session
                .command("sh")
                .arg("-c")
                .arg(format!("cat > {}", remote_tar))
                .stdin(Stdio::piped())
                .spawn()
                .await
                .context("Failed to start remote upload")?;

            let mut stdin = child
                .stdin()
                .take()
                .context("Remote upload has no stdin")?;
            let mut file = tokio::fs::File::open(local_tar)
                .await
                .context("Failed to reopen scratch tar")?;
            tokio::io::copy(&mut file, &mut stdin)
                .await
                .context("Failed to stream tar to node")?;
            stdin.shutdown().await.context("Failed to finish upload")?;
            drop(stdin);

            let status = child.wait().await.context("Remote upload failed")?;
            if !status.success() {
                bail!("Remote upload exited with {}", status);
            }

            let load = session
                .command("sh")
                .arg("-c")
                .arg(format!("docker load -i {t} && rm -f {t}", t = remote_tar))
                .output()
                .await
                .context("Failed to run docker load on node")?;
            if !load.status.success() {
                bail!(
                    "docker load failed on node: {}",
                    String::from_utf8_lossy(&load.stderr).trim()
                );
            }
            Ok(())
        };

        let result = upload.await;

        if result.is_err() {
            // The && above only removes the tar on success.
            let _ = session
                .command("sh")
                .arg("-c")
                .arg(format!("rm -f {}", remote_tar))
                .output()
                .await;
        }

        let _ = session.close().await;
        result
    }
}
