//! Build execution seam and the local process implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use launchpad_common::BuildContext;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::BuildSection;
use crate::errors::ExecutorError;

const OUTPUT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Terminal signal of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExit {
    Success,
    Failed(Option<i32>),
    Killed,
}

/// A running build. Output closes once both streams reach EOF; `exit`
/// resolves when the process ends.
pub struct BuildHandle {
    pub output: mpsc::Receiver<OutputLine>,
    pub exit: oneshot::Receiver<BuildExit>,
    /// Where the build leaves its artifacts.
    pub artifact_dir: PathBuf,
    /// Scratch directory to remove once the build is done, if any.
    pub workdir: Option<PathBuf>,
    kill: Option<oneshot::Sender<()>>,
}

impl BuildHandle {
    pub fn new(
        output: mpsc::Receiver<OutputLine>,
        exit: oneshot::Receiver<BuildExit>,
        artifact_dir: PathBuf,
    ) -> Self {
        Self {
            output,
            exit,
            artifact_dir,
            workdir: None,
            kill: None,
        }
    }

    pub fn with_workdir(mut self, workdir: PathBuf) -> Self {
        self.workdir = Some(workdir);
        self
    }

    pub fn with_kill_switch(mut self, kill: oneshot::Sender<()>) -> Self {
        self.kill = Some(kill);
        self
    }

    /// Ask the build to terminate. Later calls do nothing.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Starts isolated build executions.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn launch(&self, ctx: &BuildContext) -> Result<BuildHandle, ExecutorError>;
}

/// Runs the configured command as a child process in a fresh work
/// directory per deployment.
pub struct ProcessExecutor {
    command: Vec<String>,
    work_root: PathBuf,
    output_dir: String,
    env: HashMap<String, String>,
}

impl ProcessExecutor {
    pub fn new(config: &BuildSection) -> Self {
        Self {
            command: config.command.clone(),
            work_root: config.work_root.clone(),
            output_dir: config.output_dir.clone(),
            env: config.env.clone(),
        }
    }
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(wrap(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read build output");
                break;
            }
        }
    }
}

#[async_trait]
impl BuildExecutor for ProcessExecutor {
    async fn launch(&self, ctx: &BuildContext) -> Result<BuildHandle, ExecutorError> {
        let (program, args) = self
            .command
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or(ExecutorError::MissingCommand)?;

        let workdir = self.work_root.join(&ctx.deployment_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|source| ExecutorError::Workdir {
                path: workdir.clone(),
                source,
            })?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&workdir)
            .envs(&self.env)
            .envs(ctx.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        let missing = || ExecutorError::Spawn(std::io::Error::other("build output not captured"));
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_BUFFER);
        tokio::spawn(forward_lines(stdout, line_tx.clone(), OutputLine::Stdout));
        tokio::spawn(forward_lines(stderr, line_tx, OutputLine::Stderr));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let deployment_id = ctx.deployment_id.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => BuildExit::Success,
                    Ok(status) => BuildExit::Failed(status.code()),
                    Err(e) => {
                        warn!(deployment_id = %deployment_id, error = %e, "Failed to wait for build process");
                        BuildExit::Failed(None)
                    }
                },
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(deployment_id = %deployment_id, error = %e, "Failed to kill build process");
                    }
                    BuildExit::Killed
                }
            };
            debug!(deployment_id = %deployment_id, ?exit, "Build process finished");
            let _ = exit_tx.send(exit);
        });

        Ok(BuildHandle::new(line_rx, exit_rx, workdir.join(&self.output_dir))
            .with_workdir(workdir)
            .with_kill_switch(kill_tx))
    }
}
