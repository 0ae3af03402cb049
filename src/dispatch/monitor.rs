//! Follows one build from launch to a terminal status.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use launchpad_common::{DeploymentStatus, Project};
use tracing::{error, info, warn};

use super::executor::{BuildExit, BuildHandle, OutputLine};
use crate::artifacts::{ArtifactLayout, ArtifactStore, content_type_for, list_files};
use crate::logs::LogPublisher;
use crate::registry::{DeploymentNotFound, InvalidTransition, Registry};

const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_INITIAL: Duration = Duration::from_millis(200);
const KILL_GRACE: Duration = Duration::from_secs(10);
/// How long to keep reading output after the build process has exited.
/// Background processes left behind by the build may hold the pipes open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Write a status, retrying transient registry failures. Illegal transitions
/// and unknown deployments are not retried.
pub(crate) async fn transition_with_retry(
    registry: &Registry,
    deployment_id: &str,
    to: DeploymentStatus,
) -> Result<()> {
    let mut backoff = STATUS_RETRY_INITIAL;
    let mut attempt = 1;
    loop {
        match registry.transition_deployment(deployment_id, to).await {
            Ok(_) => return Ok(()),
            Err(e)
                if e.downcast_ref::<InvalidTransition>().is_some()
                    || e.downcast_ref::<DeploymentNotFound>().is_some() =>
            {
                return Err(e);
            }
            Err(e) if attempt >= STATUS_ATTEMPTS => {
                return Err(e.context(format!("Giving up on status {} after {} attempts", to, attempt)));
            }
            Err(e) => {
                error!(
                    deployment_id = %deployment_id,
                    status = %to,
                    attempt,
                    error = %e,
                    "Failed to write deployment status"
                );
            }
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
        attempt += 1;
    }
}

pub struct BuildMonitor {
    pub(crate) registry: Registry,
    pub(crate) publisher: LogPublisher,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) layout: ArtifactLayout,
    pub(crate) project: Project,
    pub(crate) timeout: Duration,
    pub(crate) keep_workdirs: bool,
}

impl BuildMonitor {
    async fn emit(&self, line: impl Into<String>) {
        if let Err(e) = self.publisher.publish(line).await {
            error!(
                deployment_id = %self.publisher.deployment_id(),
                error = %e,
                "Failed to publish build log"
            );
        }
    }

    async fn set_status(&self, to: DeploymentStatus) -> bool {
        let deployment_id = self.publisher.deployment_id();
        match transition_with_retry(&self.registry, deployment_id, to).await {
            Ok(()) => {
                info!(deployment_id = %deployment_id, status = %to, "Deployment status changed");
                true
            }
            Err(e) => {
                error!(
                    deployment_id = %deployment_id,
                    status = %to,
                    error = %format!("{:#}", e),
                    "Deployment status write failed"
                );
                false
            }
        }
    }

    /// Drive the build to SUCCEEDED or FAILED.
    pub async fn run(self, mut handle: BuildHandle) {
        if !self.set_status(DeploymentStatus::Building).await {
            handle.kill();
            self.set_status(DeploymentStatus::Failed).await;
            self.cleanup(&handle).await;
            return;
        }
        self.emit("Building project").await;

        let followed = tokio::time::timeout(self.timeout, self.follow(&mut handle)).await;
        let exit = match followed {
            Ok(exit) => exit,
            Err(_) => {
                handle.kill();
                let _ = tokio::time::timeout(KILL_GRACE, &mut handle.exit).await;
                self.emit(format!(
                    "ERROR : Build timed out after {}s",
                    self.timeout.as_secs()
                ))
                .await;
                BuildExit::Killed
            }
        };

        let succeeded = match exit {
            BuildExit::Success => {
                self.emit("Build Completed").await;
                match self.upload(&handle.artifact_dir).await {
                    Ok(count) => {
                        info!(
                            deployment_id = %self.publisher.deployment_id(),
                            files = count,
                            "Artifacts uploaded"
                        );
                        self.emit("All files uploaded").await;
                        true
                    }
                    Err(e) => {
                        self.emit(format!("ERROR : Upload failed: {:#}", e)).await;
                        false
                    }
                }
            }
            BuildExit::Failed(code) => {
                let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                self.emit(format!("ERROR : Build failed with exit code {}", code)).await;
                false
            }
            BuildExit::Killed => {
                self.emit("ERROR : Build was terminated").await;
                false
            }
        };

        let status = if succeeded {
            DeploymentStatus::Succeeded
        } else {
            DeploymentStatus::Failed
        };
        self.set_status(status).await;
        self.cleanup(&handle).await;
    }

    /// Publish output until the build exits, then drain what is left of it.
    /// Exit is not gated on EOF of the output streams.
    async fn follow(&self, handle: &mut BuildHandle) -> BuildExit {
        loop {
            tokio::select! {
                line = handle.output.recv() => match line {
                    Some(line) => self.emit_output(line).await,
                    None => return (&mut handle.exit).await.unwrap_or(BuildExit::Failed(None)),
                },
                exit = &mut handle.exit => {
                    let exit = exit.unwrap_or(BuildExit::Failed(None));
                    self.drain_output(handle).await;
                    return exit;
                }
            }
        }
    }

    async fn drain_output(&self, handle: &mut BuildHandle) {
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, handle.output.recv()).await {
            self.emit_output(line).await;
        }
    }

    async fn emit_output(&self, line: OutputLine) {
        match line {
            OutputLine::Stdout(text) => self.emit(text).await,
            OutputLine::Stderr(text) => self.emit(format!("ERROR : {}", text)).await,
        }
    }

    async fn upload(&self, artifact_dir: &Path) -> Result<usize> {
        let dir = artifact_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_files(&dir))
            .await
            .context("Artifact listing task panicked")?
            .context("Build output directory not found")?;
        if files.is_empty() {
            anyhow::bail!("Build produced no files in {}", artifact_dir.display());
        }

        for relative in &files {
            self.emit(format!("Uploading {}", relative)).await;
            let path = artifact_dir.join(relative);
            let body = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let key = self.layout.key_for(&self.project.id, relative);
            self.artifacts
                .put(&key, body, &content_type_for(&path))
                .await?;
            self.emit(format!("Uploaded {}", relative)).await;
        }
        Ok(files.len())
    }

    async fn cleanup(&self, handle: &BuildHandle) {
        if self.keep_workdirs {
            return;
        }
        if let Some(workdir) = &handle.workdir
            && let Err(e) = tokio::fs::remove_dir_all(workdir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %workdir.display(), error = %e, "Failed to remove build work directory");
        }
    }
}
