//! Deployment dispatch.
//!
//! [`Dispatcher::dispatch`] records a QUEUED deployment, launches exactly one
//! build for it and hands the running build to a [`monitor::BuildMonitor`]
//! task. The caller gets the QUEUED record back as soon as the build has
//! started; it never waits for the build itself.

pub mod executor;
pub mod monitor;

use std::sync::Arc;
use std::time::Duration;

use launchpad_common::{BuildContext, Deployment, DeploymentStatus};
use tracing::{error, info};

use crate::artifacts::{ArtifactLayout, ArtifactStore};
use crate::errors::DispatchError;
use crate::logs::LogPublisher;
use crate::logs::channel::LogChannel;
use crate::registry::Registry;
use executor::BuildExecutor;
use monitor::{BuildMonitor, transition_with_retry};

pub struct Dispatcher {
    registry: Registry,
    executor: Arc<dyn BuildExecutor>,
    channel: Arc<dyn LogChannel>,
    artifacts: Arc<dyn ArtifactStore>,
    layout: ArtifactLayout,
    build_timeout: Duration,
    keep_workdirs: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        executor: Arc<dyn BuildExecutor>,
        channel: Arc<dyn LogChannel>,
        artifacts: Arc<dyn ArtifactStore>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            registry,
            executor,
            channel,
            artifacts,
            layout,
            build_timeout: Duration::from_secs(1800),
            keep_workdirs: false,
        }
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_keep_workdirs(mut self, keep: bool) -> Self {
        self.keep_workdirs = keep;
        self
    }

    /// Create a QUEUED deployment and start its build.
    ///
    /// `source_locator` overrides the project's own locator for this build.
    /// When the build cannot be started the deployment is marked FAILED, one
    /// explanatory log line is published and [`DispatchError::Launch`] is
    /// returned.
    pub async fn dispatch(
        &self,
        project_id: &str,
        source_locator: Option<&str>,
    ) -> Result<Deployment, DispatchError> {
        let project_id = project_id.trim();
        if project_id.is_empty() {
            return Err(DispatchError::Validation("projectId is required".into()));
        }
        if let Some(locator) = source_locator
            && locator.trim().is_empty()
        {
            return Err(DispatchError::Validation(
                "sourceLocator must not be empty".into(),
            ));
        }

        let project = self
            .registry
            .get_project(project_id)
            .await
            .map_err(DispatchError::Store)?
            .ok_or_else(|| DispatchError::ProjectNotFound {
                id: project_id.to_string(),
            })?;

        let deployment = self
            .registry
            .create_deployment(&project.id)
            .await
            .map_err(DispatchError::Store)?;
        info!(
            project_id = %project.id,
            deployment_id = %deployment.id,
            "Deployment queued"
        );

        let ctx = BuildContext {
            project_id: project.id.clone(),
            deployment_id: deployment.id.clone(),
            source_locator: source_locator
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| project.source_locator.clone()),
        };
        let publisher = LogPublisher::new(
            Arc::clone(&self.channel),
            project.id.clone(),
            deployment.id.clone(),
        );

        let handle = match self.executor.launch(&ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                error!(deployment_id = %deployment.id, error = %message, "Failed to launch build");
                if let Err(status_err) =
                    transition_with_retry(&self.registry, &deployment.id, DeploymentStatus::Failed)
                        .await
                {
                    error!(
                        deployment_id = %deployment.id,
                        error = %format!("{:#}", status_err),
                        "Failed to mark deployment as failed"
                    );
                }
                if let Err(publish_err) = publisher
                    .publish(format!("ERROR : Failed to launch build: {}", message))
                    .await
                {
                    error!(deployment_id = %deployment.id, error = %publish_err, "Failed to publish launch failure");
                }
                return Err(DispatchError::Launch {
                    deployment_id: deployment.id,
                    message,
                });
            }
        };

        let monitor = BuildMonitor {
            registry: self.registry.clone(),
            publisher,
            artifacts: Arc::clone(&self.artifacts),
            layout: self.layout.clone(),
            project,
            timeout: self.build_timeout,
            keep_workdirs: self.keep_workdirs,
        };
        tokio::spawn(monitor.run(handle));

        Ok(deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutorError;
    use crate::logs::channel::MemoryLogChannel;
    use crate::registry::NewProject;
    use anyhow::Result;
    use async_trait::async_trait;
    use executor::{BuildExit, BuildHandle, OutputLine};
    use launchpad_common::{LogMessage, Project};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, oneshot};

    /// Replays a fixed script of output lines and exit status.
    struct ScriptedExecutor {
        lines: Vec<OutputLine>,
        exit: BuildExit,
        artifact_dir: PathBuf,
        launches: AtomicUsize,
        contexts: Mutex<Vec<BuildContext>>,
        /// Keep the output stream open after exiting, like a build that
        /// leaves a background process attached to its pipes.
        hold_output: bool,
    }

    impl ScriptedExecutor {
        fn new(lines: Vec<OutputLine>, exit: BuildExit, artifact_dir: PathBuf) -> Self {
            Self {
                lines,
                exit,
                artifact_dir,
                launches: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
                hold_output: false,
            }
        }

        fn holding_output_open(mut self) -> Self {
            self.hold_output = true;
            self
        }
    }

    #[async_trait]
    impl BuildExecutor for ScriptedExecutor {
        async fn launch(&self, ctx: &BuildContext) -> Result<BuildHandle, ExecutorError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().unwrap().push(ctx.clone());
            let (line_tx, line_rx) = mpsc::channel(64);
            let (exit_tx, exit_rx) = oneshot::channel();
            let lines = self.lines.clone();
            let exit = self.exit;
            let hold_output = self.hold_output;
            tokio::spawn(async move {
                for line in lines {
                    line_tx.send(line).await.unwrap();
                }
                if hold_output {
                    let _ = exit_tx.send(exit);
                    let _held = line_tx;
                    std::future::pending::<()>().await;
                } else {
                    drop(line_tx);
                    let _ = exit_tx.send(exit);
                }
            });
            Ok(BuildHandle::new(line_rx, exit_rx, self.artifact_dir.clone()))
        }
    }

    /// Never produces output or exits until killed.
    struct HangingExecutor;

    #[async_trait]
    impl BuildExecutor for HangingExecutor {
        async fn launch(&self, _ctx: &BuildContext) -> Result<BuildHandle, ExecutorError> {
            let (line_tx, line_rx) = mpsc::channel(1);
            let (exit_tx, exit_rx) = oneshot::channel();
            let (kill_tx, kill_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                let _keep_open = line_tx;
                let _ = kill_rx.await;
                let _ = exit_tx.send(BuildExit::Killed);
            });
            Ok(BuildHandle::new(line_rx, exit_rx, PathBuf::from("/nonexistent"))
                .with_kill_switch(kill_tx))
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl BuildExecutor for BrokenExecutor {
        async fn launch(&self, _ctx: &BuildContext) -> Result<BuildHandle, ExecutorError> {
            Err(ExecutorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "builder image missing",
            )))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, Vec<u8>, String)>>,
    }

    #[async_trait]
    impl ArtifactStore for RecordingStore {
        async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), body, content_type.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        registry: Registry,
        channel: Arc<MemoryLogChannel>,
        store: Arc<RecordingStore>,
        project: Project,
    }

    async fn fixture() -> Fixture {
        let registry = Registry::in_memory().unwrap();
        let project = registry
            .create_project(NewProject {
                name: "site".into(),
                source_locator: "git://repo".into(),
                slug: Some("site".into()),
            })
            .await
            .unwrap();
        Fixture {
            registry,
            channel: Arc::new(MemoryLogChannel::new(1, 1000)),
            store: Arc::new(RecordingStore::default()),
            project,
        }
    }

    fn dispatcher(fx: &Fixture, executor: Arc<dyn BuildExecutor>) -> Dispatcher {
        Dispatcher::new(
            fx.registry.clone(),
            executor,
            fx.channel.clone(),
            fx.store.clone(),
            ArtifactLayout::new("__outputs"),
        )
    }

    async fn wait_for_terminal(registry: &Registry, id: &str) -> DeploymentStatus {
        for _ in 0..200 {
            let status = registry.get_deployment(id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment {} never reached a terminal status", id);
    }

    async fn published_logs(channel: &MemoryLogChannel) -> Vec<String> {
        channel
            .poll_batch(1000, Duration::from_millis(10))
            .await
            .unwrap()
            .into_iter()
            .map(|r| LogMessage::decode(&r.payload).unwrap().log)
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_returns_queued_deployment() {
        let fx = fixture().await;
        let exec = Arc::new(HangingExecutor);
        let d = dispatcher(&fx, exec);

        let deployment = d.dispatch(&fx.project.id, None).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Queued);
        assert_eq!(deployment.project_id, fx.project.id);
        let deployments = fx.registry.list_deployments(&fx.project.id).await.unwrap();
        assert_eq!(deployments.len(), 1);
    }

    #[tokio::test]
    async fn test_successful_build_uploads_and_succeeds() {
        let fx = fixture().await;
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let exec = Arc::new(ScriptedExecutor::new(
            vec![
                OutputLine::Stdout("Installing deps".into()),
                OutputLine::Stdout("Build OK".into()),
            ],
            BuildExit::Success,
            out.path().to_path_buf(),
        ));
        let d = dispatcher(&fx, exec.clone());

        let deployment = d.dispatch(&fx.project.id, Some("git://override")).await.unwrap();
        assert_eq!(
            wait_for_terminal(&fx.registry, &deployment.id).await,
            DeploymentStatus::Succeeded
        );

        assert_eq!(exec.launches.load(Ordering::SeqCst), 1);
        let ctx = exec.contexts.lock().unwrap()[0].clone();
        assert_eq!(ctx.deployment_id, deployment.id);
        assert_eq!(ctx.source_locator, "git://override");

        let puts = fx.store.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, format!("__outputs/{}/index.html", fx.project.id));
        assert_eq!(puts[0].2, "text/html");

        assert_eq!(
            published_logs(&fx.channel).await,
            vec![
                "Building project",
                "Installing deps",
                "Build OK",
                "Build Completed",
                "Uploading index.html",
                "Uploaded index.html",
                "All files uploaded",
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_is_not_gated_on_output_eof() {
        let fx = fixture().await;
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new(
                vec![OutputLine::Stdout("Build OK".into())],
                BuildExit::Success,
                out.path().to_path_buf(),
            )
            .holding_output_open(),
        );
        let d = dispatcher(&fx, exec).with_build_timeout(Duration::from_secs(600));

        let deployment = d.dispatch(&fx.project.id, None).await.unwrap();
        assert_eq!(
            wait_for_terminal(&fx.registry, &deployment.id).await,
            DeploymentStatus::Succeeded
        );
        let logs = published_logs(&fx.channel).await;
        assert!(logs.contains(&"Build OK".to_string()));
        assert!(logs.contains(&"All files uploaded".to_string()));
        assert!(!logs.iter().any(|l| l.contains("timed out")));
    }

    #[tokio::test]
    async fn test_failed_build_marks_failed_and_prefixes_stderr() {
        let fx = fixture().await;
        let exec = Arc::new(ScriptedExecutor::new(
            vec![OutputLine::Stderr("npm ERR! missing script".into())],
            BuildExit::Failed(Some(1)),
            PathBuf::from("/nonexistent"),
        ));
        let d = dispatcher(&fx, exec);

        let deployment = d.dispatch(&fx.project.id, None).await.unwrap();
        assert_eq!(
            wait_for_terminal(&fx.registry, &deployment.id).await,
            DeploymentStatus::Failed
        );
        let logs = published_logs(&fx.channel).await;
        assert!(logs.contains(&"ERROR : npm ERR! missing script".to_string()));
        assert!(logs.contains(&"ERROR : Build failed with exit code 1".to_string()));
        assert!(fx.store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_output_dir_fails_deployment() {
        let fx = fixture().await;
        let exec = Arc::new(ScriptedExecutor::new(
            vec![],
            BuildExit::Success,
            PathBuf::from("/nonexistent/dist"),
        ));
        let d = dispatcher(&fx, exec);

        let deployment = d.dispatch(&fx.project.id, None).await.unwrap();
        assert_eq!(
            wait_for_terminal(&fx.registry, &deployment.id).await,
            DeploymentStatus::Failed
        );
        let logs = published_logs(&fx.channel).await;
        assert!(logs.iter().any(|l| l.starts_with("ERROR : Upload failed")));
    }

    #[tokio::test]
    async fn test_build_timeout_kills_and_fails() {
        let fx = fixture().await;
        let d = dispatcher(&fx, Arc::new(HangingExecutor))
            .with_build_timeout(Duration::from_millis(50));

        let deployment = d.dispatch(&fx.project.id, None).await.unwrap();
        assert_eq!(
            wait_for_terminal(&fx.registry, &deployment.id).await,
            DeploymentStatus::Failed
        );
        let logs = published_logs(&fx.channel).await;
        assert!(logs.iter().any(|l| l.contains("timed out")));
    }

    #[tokio::test]
    async fn test_launch_failure_marks_failed_with_one_log_line() {
        let fx = fixture().await;
        let d = dispatcher(&fx, Arc::new(BrokenExecutor));

        let err = d.dispatch(&fx.project.id, None).await.unwrap_err();
        let deployment_id = match err {
            DispatchError::Launch { deployment_id, message } => {
                assert!(message.contains("builder image missing"));
                deployment_id
            }
            other => panic!("Expected Launch, got {:?}", other),
        };

        let stored = fx.registry.get_deployment(&deployment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        let logs = published_logs(&fx.channel).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("Failed to launch build"));
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let fx = fixture().await;
        let exec = Arc::new(HangingExecutor);
        let d = dispatcher(&fx, exec);
        let err = d.dispatch("missing", None).await.unwrap_err();
        assert!(matches!(err, DispatchError::ProjectNotFound { id } if id == "missing"));
    }

    #[tokio::test]
    async fn test_blank_input_is_validation_error() {
        let fx = fixture().await;
        let d = dispatcher(&fx, Arc::new(HangingExecutor));
        assert!(matches!(
            d.dispatch("  ", None).await.unwrap_err(),
            DispatchError::Validation(_)
        ));
        assert!(matches!(
            d.dispatch(&fx.project.id, Some("")).await.unwrap_err(),
            DispatchError::Validation(_)
        ));
        assert!(fx.registry.list_deployments(&fx.project.id).await.unwrap().is_empty());
    }
}
