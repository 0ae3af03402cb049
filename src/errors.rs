//! Typed error hierarchy for launchpad.
//!
//! One enum per subsystem:
//! - `DispatchError`: deployment requests and build launch
//! - `ExecutorError`: starting an isolated build
//! - `PipelineError`: the log consumption loop
//! - `ProxyError`: tenant resolution and artifact forwarding

use thiserror::Error;

/// Errors surfaced by `Dispatcher::dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    /// The deployment record exists and has been forced to FAILED.
    #[error("Failed to launch build for deployment {deployment_id}: {message}")]
    Launch {
        deployment_id: String,
        message: String,
    },

    #[error("Registry error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from a `BuildExecutor` while starting a build.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Build command is empty")]
    MissingCommand,

    #[error("Failed to prepare work directory {path}: {source}")]
    Workdir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn build process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors that stop the log pipeline loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Log pipeline shut down")]
    Shutdown,

    #[error("Log channel error: {0}")]
    Channel(#[source] anyhow::Error),
}

/// Errors from the content resolver / reverse proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("No deployment found for '{slug}'")]
    TenantNotFound { slug: String },

    #[error("Registry lookup failed: {0}")]
    LookupFailed(#[source] anyhow::Error),

    #[error("Registry lookup timed out")]
    LookupTimeout,

    #[error("Artifact store error: {0}")]
    Upstream(String),

    #[error("Artifact store timed out")]
    UpstreamTimeout,

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_project_not_found_carries_id() {
        let err = DispatchError::ProjectNotFound { id: "p42".into() };
        match &err {
            DispatchError::ProjectNotFound { id } => assert_eq!(id, "p42"),
            _ => panic!("Expected ProjectNotFound"),
        }
        assert!(err.to_string().contains("p42"));
    }

    #[test]
    fn dispatch_error_launch_mentions_deployment() {
        let err = DispatchError::Launch {
            deployment_id: "d7".into(),
            message: "no such file".into(),
        };
        let text = err.to_string();
        assert!(text.contains("d7"));
        assert!(text.contains("no such file"));
    }

    #[test]
    fn executor_error_spawn_keeps_io_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "sh not found");
        let err = ExecutorError::Spawn(io_err);
        match &err {
            ExecutorError::Spawn(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected Spawn"),
        }
    }

    #[test]
    fn proxy_error_tenant_not_found_names_slug() {
        let err = ProxyError::TenantNotFound { slug: "ghost".into() };
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DispatchError::Validation("x".into()));
        assert_std_error(&ExecutorError::MissingCommand);
        assert_std_error(&PipelineError::Shutdown);
        assert_std_error(&ProxyError::LookupTimeout);
    }
}
