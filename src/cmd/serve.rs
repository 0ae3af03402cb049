//! Long-running commands: `launchpad serve`, `launchpad proxy` and
//! `launchpad artifacts`.

use std::path::PathBuf;

use anyhow::Result;
use launchpad::config::PlatformConfig;
use launchpad::server;
use tracing::{info, warn};

fn warn_on_problems(config: &PlatformConfig) {
    for problem in config.validate() {
        warn!(problem = %problem, "Configuration problem");
    }
}

pub async fn cmd_serve(config: PlatformConfig, no_proxy: bool) -> Result<()> {
    warn_on_problems(&config);
    info!(
        api_addr = %config.server.api_addr,
        proxy = !no_proxy,
        "Starting platform"
    );
    server::run_platform(config, !no_proxy).await
}

pub async fn cmd_proxy(config: PlatformConfig) -> Result<()> {
    warn_on_problems(&config);
    server::run_proxy(config).await
}

/// Dev artifact store. Flags override `[artifacts]`; the default address
/// is the host and port of `artifacts.base_url`.
pub async fn cmd_artifacts(
    config: PlatformConfig,
    addr: Option<String>,
    root: Option<PathBuf>,
) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => listen_addr_from_url(&config.artifacts.base_url)?,
    };
    let root = root.unwrap_or(config.artifacts.root);
    server::run_artifact_store(&addr, root).await
}

fn listen_addr_from_url(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| anyhow::anyhow!("artifacts.base_url must be an http(s) URL: {}", url))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        anyhow::bail!("artifacts.base_url has no host: {}", url);
    }
    if authority.contains(':') {
        Ok(authority.to_string())
    } else {
        Ok(format!("{}:80", authority))
    }
}
