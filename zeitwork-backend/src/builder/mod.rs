use anyhow::{bail, Context, Result};
use base64::Engine;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::models::{Build, BuildStatus};
use crate::db::{builds, logs};
use crate::events;
use crate::githost::GitHost;
use crate::settings::{BuilderSettings, RegistrySettings};
use crate::state::ControllerState;

/// Stateless worker competing for queued builds.
///
/// A build is claimed with an atomic conditional update; losing the race
/// returns no work and the worker sleeps briefly. Work items never take
/// the loop down: errors (and panics, caught at the task boundary) are
/// recorded against the build and the loop continues.
pub struct BuildWorker {
    state: Arc<ControllerState>,
    settings: BuilderSettings,
    registry: RegistrySettings,
    githost: Option<Arc<dyn GitHost>>,
    worker_id: String,
}

impl BuildWorker {
    pub fn new(
        state: Arc<ControllerState>,
        settings: BuilderSettings,
        registry: RegistrySettings,
        githost: Option<Arc<dyn GitHost>>,
    ) -> Self {
        let worker_id = format!("builder-{}", Uuid::now_v7().simple());
        Self {
            state,
            settings,
            registry,
            githost,
            worker_id,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Build worker {} started", self.worker_id);

        loop {
            match builds::claim_next(&self.state.db_pool, &self.worker_id).await {
                Ok(Some(build)) => {
                    let build_id = build.id;
                    let worker = self.clone();
                    let task = tokio::spawn(async move { worker.run_build(build).await });
                    match task.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!("Build {} failed: {:#}", build_id, e);
                            self.record_failure(build_id, &format!("{:#}", e)).await;
                        }
                        Err(join_error) => {
                            error!("Build {} task panicked: {}", build_id, join_error);
                            self.record_failure(build_id, "internal builder error").await;
                        }
                    }
                }
                Ok(None) => {
                    // Nothing queued; back off with a little jitter so a
                    // worker pool does not stampede the queue.
                    let jitter = rand::thread_rng().gen_range(0..500);
                    tokio::time::sleep(
                        Duration::from_secs(self.settings.poll_secs)
                            + Duration::from_millis(jitter),
                    )
                    .await;
                }
                Err(e) => {
                    warn!("Build claim failed, retrying: {:#}", e);
                    tokio::time::sleep(Duration::from_secs(self.settings.poll_secs)).await;
                }
            }
        }
    }

    async fn record_failure(&self, build_id: Uuid, message: &str) {
        let pool = &self.state.db_pool;
        if let Err(e) = builds::mark_error(pool, build_id, message).await {
            error!("Failed to record build {} failure: {:#}", build_id, e);
        }
        logs::append_build_log(pool, build_id, "error", message)
            .await
            .ok();
        events::publish_quiet(pool, "builds", build_id).await;
    }

    /// The per-build protocol: clone, build, push, record the image.
    async fn run_build(&self, build: Build) -> Result<()> {
        let pool = &self.state.db_pool;

        if builds::transition(pool, build.id, BuildStatus::Initializing, BuildStatus::Building)
            .await?
            .is_none()
        {
            // Someone else moved it; treat as already handled.
            debug!("Build {} no longer initializing, skipping", build.id);
            return Ok(());
        }

        info!(
            "Build {} started for {}@{}",
            build.id, build.repository, build.commit_sha
        );
        logs::append_build_log(
            pool,
            build.id,
            "info",
            &format!("building {} at {}", build.repository, build.commit_sha),
        )
        .await?;

        let workspace = tempfile::tempdir().context("Failed to create build workspace")?;
        self.checkout(&build, workspace.path()).await?;

        let context_dir = resolve_context(workspace.path(), build.context_path());
        let dockerfile = context_dir.join(build.dockerfile());
        if !dockerfile.exists() {
            bail!("Dockerfile not found at {}", build.dockerfile());
        }

        let tag = image_tag(&self.registry.url, build.project_id, &build.commit_sha);

        // Registry credentials live in an isolated docker config that dies
        // with the build; the sandbox never sees long-lived secrets.
        let docker_config = tempfile::tempdir().context("Failed to create docker config dir")?;
        self.write_docker_config(docker_config.path())?;

        self.docker(
            &build,
            docker_config.path(),
            &[
                "build",
                "-t",
                &tag,
                "-f",
                dockerfile.to_string_lossy().as_ref(),
                context_dir.to_string_lossy().as_ref(),
            ],
        )
        .await
        .context("docker build failed")?;

        let push_output = self
            .docker(&build, docker_config.path(), &["push", &tag])
            .await
            .context("docker push failed")?;

        let digest = match parse_pushed_digest(&push_output) {
            Some(digest) => digest,
            None => self.inspect_digest(&build, docker_config.path(), &tag).await?,
        };

        let image = builds::complete(
            pool,
            build.id,
            build.organisation_id,
            &self.registry.url,
            &build.project_id.to_string(),
            &short_sha(&build.commit_sha),
            &digest,
        )
        .await?;

        info!("Build {} ready, image {} ({})", build.id, image.id, digest);
        logs::append_build_log(pool, build.id, "info", &format!("pushed {}", digest)).await?;
        events::publish_quiet(pool, "builds", build.id).await;
        Ok(())
    }

    /// Fetch exactly the requested commit using a short-lived installation
    /// token. The token only ever appears in the remote URL of this
    /// throwaway checkout and is never logged or persisted.
    async fn checkout(&self, build: &Build, workspace: &Path) -> Result<()> {
        let clone_url = match &self.githost {
            Some(githost) => {
                let token = githost
                    .installation_token(&build.repository)
                    .await
                    .context("Failed to obtain installation token")?;
                format!(
                    "https://x-access-token:{}@github.com/{}.git",
                    token.token, build.repository
                )
            }
            None => format!("https://github.com/{}.git", build.repository),
        };

        run_quiet(workspace, "git", &["init", "-q", "."]).await?;
        run_quiet(workspace, "git", &["remote", "add", "origin", &clone_url]).await?;
        run_quiet(
            workspace,
            "git",
            &["fetch", "-q", "--depth", "1", "origin", &build.commit_sha],
        )
        .await
        .context("Failed to fetch commit")?;
        run_quiet(workspace, "git", &["checkout", "-q", "FETCH_HEAD"]).await?;
        Ok(())
    }

    fn write_docker_config(&self, dir: &Path) -> Result<()> {
        let mut auths = serde_json::Map::new();
        if let (Some(username), Some(password)) =
            (&self.registry.username, &self.registry.password)
        {
            let auth = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            auths.insert(
                self.registry.url.clone(),
                serde_json::json!({ "auth": auth }),
            );
        }
        let config = serde_json::json!({ "auths": auths });
        std::fs::write(dir.join("config.json"), config.to_string())
            .context("Failed to write docker config")?;
        Ok(())
    }

    /// Run a docker subcommand, streaming stdout/stderr line-by-line into
    /// the build log. Returns captured stdout for digest parsing.
    async fn docker(&self, build: &Build, docker_config: &Path, args: &[&str]) -> Result<String> {
        debug!("Build {}: docker {}", build.id, args.join(" "));

        let mut child = Command::new("docker")
            .args(args)
            .env("DOCKER_CONFIG", docker_config)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn docker")?;

        let stdout = child.stdout.take().context("docker has no stdout")?;
        let stderr = child.stderr.take().context("docker has no stderr")?;

        let out_task = stream_log_lines(self.state.db_pool.clone(), build.id, stdout, false);
        let err_task = stream_log_lines(self.state.db_pool.clone(), build.id, stderr, true);
        let (out_lines, _) = tokio::join!(out_task, err_task);

        let status = child.wait().await.context("docker did not exit")?;
        if !status.success() {
            bail!("docker {} exited with {}", args.first().unwrap_or(&"?"), status);
        }
        Ok(out_lines)
    }

    async fn inspect_digest(
        &self,
        build: &Build,
        docker_config: &Path,
        tag: &str,
    ) -> Result<String> {
        let output = self
            .docker(
                build,
                docker_config,
                &[
                    "image",
                    "inspect",
                    "--format",
                    "{{index .RepoDigests 0}}",
                    tag,
                ],
            )
            .await
            .context("docker image inspect failed")?;

        output
            .lines()
            .filter_map(|l| l.rsplit('@').next())
            .find(|d| d.starts_with("sha256:"))
            .map(str::to_string)
            .context("No digest in docker image inspect output")
    }
}

/// Stream a process pipe into the build log, returning everything read
async fn stream_log_lines(
    pool: sqlx::PgPool,
    build_id: Uuid,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    is_stderr: bool,
) -> String {
    let mut captured = String::new();
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let level = infer_level(&line, is_stderr);
        if let Err(e) = logs::append_build_log(&pool, build_id, level, &line).await {
            warn!("Dropping build log line for {}: {}", build_id, e);
        }
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}

/// Map a tool output line to a log level by its common prefixes
fn infer_level(line: &str, is_stderr: bool) -> &'static str {
    let trimmed = line.trim_start();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("error") || lower.starts_with("fatal") {
        "error"
    } else if lower.starts_with("warn") || lower.starts_with("warning") {
        "warn"
    } else if is_stderr && !trimmed.starts_with('#') {
        // BuildKit writes step progress ("#5 ...") to stderr.
        "warn"
    } else {
        "info"
    }
}

/// `<registry>/<project_id>:<short sha>`
fn image_tag(registry_url: &str, project_id: Uuid, commit_sha: &str) -> String {
    format!(
        "{}/{}:{}",
        registry_url.trim_end_matches('/'),
        project_id,
        short_sha(commit_sha)
    )
}

fn short_sha(commit_sha: &str) -> String {
    commit_sha.chars().take(12).collect()
}

/// Join the checkout root with the configured build context, refusing to
/// escape the checkout.
fn resolve_context(workspace: &Path, root_directory: &str) -> PathBuf {
    let relative = root_directory.trim_start_matches('/');
    if relative.is_empty() || relative.contains("..") {
        workspace.to_path_buf()
    } else {
        workspace.join(relative)
    }
}

/// Pull the `digest: sha256:...` token out of docker push output
fn parse_pushed_digest(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.split("digest: ").nth(1) {
            if let Some(digest) = rest.split_whitespace().next() {
                if digest.starts_with("sha256:") {
                    return Some(digest.to_string());
                }
            }
        }
    }
    None
}

async fn run_quiet(dir: &Path, program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} {} exited with {}: {}",
            program,
            args.first().unwrap_or(&"?"),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_level_prefixes() {
        assert_eq!(infer_level("ERROR: step failed", false), "error");
        assert_eq!(infer_level("error something", true), "error");
        assert_eq!(infer_level("fatal: not a git repository", true), "error");
        assert_eq!(infer_level("WARNING: platform mismatch", false), "warn");
        assert_eq!(infer_level("warn: deprecated", false), "warn");
        assert_eq!(infer_level("Step 3/9 : RUN make", false), "info");
    }

    #[test]
    fn test_infer_level_buildkit_progress_stays_info() {
        assert_eq!(infer_level("#5 [2/4] COPY . .", true), "info");
        assert_eq!(infer_level("some stderr chatter", true), "warn");
    }

    #[test]
    fn test_image_tag_format() {
        let project_id = Uuid::nil();
        let tag = image_tag(
            "registry.zeitwork.app/",
            project_id,
            "abc123def4567890abcdef",
        );
        assert_eq!(
            tag,
            "registry.zeitwork.app/00000000-0000-0000-0000-000000000000:abc123def456"
        );
    }

    #[test]
    fn test_parse_pushed_digest() {
        let output = "\
The push refers to repository [registry.zeitwork.app/p1]
5f70bf18a086: Pushed
latest: digest: sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae size: 528
";
        assert_eq!(
            parse_pushed_digest(output).as_deref(),
            Some("sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae")
        );
        assert_eq!(parse_pushed_digest("no digest here"), None);
    }

    #[test]
    fn test_resolve_context_stays_inside_workspace() {
        let workspace = Path::new("/work/checkout");
        assert_eq!(resolve_context(workspace, "/"), workspace);
        assert_eq!(resolve_context(workspace, ""), workspace);
        assert_eq!(
            resolve_context(workspace, "/apps/web"),
            workspace.join("apps/web")
        );
        assert_eq!(resolve_context(workspace, "../escape"), workspace);
    }

    #[test]
    fn test_short_sha_truncates() {
        assert_eq!(short_sha("abc123def4567890"), "abc123def456");
        assert_eq!(short_sha("abc"), "abc");
    }
}
