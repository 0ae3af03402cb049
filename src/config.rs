//! Platform configuration.
//!
//! Read from `launchpad.toml` (or the path given with `--config`), then
//! overridden from the environment. Every section and field is optional;
//! missing values fall back to the defaults below.
//!
//! ```toml
//! [server]
//! api_addr = "127.0.0.1:9000"
//! proxy_addr = "127.0.0.1:8000"
//!
//! [artifacts]
//! base_url = "http://127.0.0.1:9100"
//! prefix = "__outputs"
//!
//! [build]
//! command = ["sh", "-c", "npm install && npm run build"]
//! timeout_secs = 1800
//!
//! [pipeline]
//! partitions = 8
//! batch_size = 100
//!
//! [resolver]
//! cache_ttl_secs = 30
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::observability::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "launchpad.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub server: ServerSection,
    pub registry: RegistrySection,
    pub log_store: LogStoreSection,
    pub artifacts: ArtifactsSection,
    pub build: BuildSection,
    pub pipeline: PipelineSection,
    pub resolver: ResolverSection,
    pub gateway: GatewaySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub api_addr: String,
    pub proxy_addr: String,
    /// Permissive CORS on the API (browser dashboards on another origin).
    pub cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            api_addr: "127.0.0.1:9000".to_string(),
            proxy_addr: "127.0.0.1:8000".to_string(),
            cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub path: PathBuf,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".launchpad/registry.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreSection {
    pub path: PathBuf,
}

impl Default for LogStoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".launchpad/logs.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub base_url: String,
    pub prefix: String,
    /// Storage directory for the development artifact server.
    pub root: PathBuf,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9100".to_string(),
            prefix: "__outputs".to_string(),
            root: PathBuf::from(".launchpad/artifacts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Program and arguments, run inside the deployment's work directory.
    pub command: Vec<String>,
    pub work_root: PathBuf,
    /// Artifact directory relative to the work directory.
    pub output_dir: String,
    pub timeout_secs: u64,
    pub keep_workdirs: bool,
    pub env: HashMap<String, String>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "git clone --depth 1 -- \"$SOURCE_LOCATOR\" . && npm install && npm run build"
                    .to_string(),
            ],
            work_root: PathBuf::from(".launchpad/builds"),
            output_dir: "dist".to_string(),
            timeout_secs: 1800,
            keep_workdirs: false,
            env: HashMap::new(),
        }
    }
}

impl BuildSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub partitions: u32,
    /// Uncommitted records a partition holds before producers wait.
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            partitions: 8,
            channel_capacity: 10_000,
            batch_size: 100,
            poll_interval_ms: 500,
            retry_initial_ms: 200,
            retry_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub lookup_timeout_ms: u64,
    pub upstream_timeout_ms: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            cache_max_entries: 1024,
            lookup_timeout_ms: 2000,
            upstream_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Per-connection outbound queue; a full queue drops events for that member.
    pub member_buffer: usize,
    /// Capacity of the live broadcast channel feeding the gateway relay.
    pub live_buffer: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            member_buffer: 256,
            live_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
}

impl PlatformConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse launchpad.toml")
    }

    /// Load from `path`, returning defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `LAUNCHPAD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LAUNCHPAD_API_ADDR") {
            self.server.api_addr = addr;
        }
        if let Some(addr) = lookup("LAUNCHPAD_PROXY_ADDR") {
            self.server.proxy_addr = addr;
        }
        if let Some(url) = lookup("LAUNCHPAD_ARTIFACT_URL") {
            self.artifacts.base_url = url;
        }
        if let Some(format) = lookup("LAUNCHPAD_LOG_FORMAT")
            && let Ok(format) = format.parse::<LogFormat>()
        {
            self.logging.format = format;
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Return a list of configuration problems. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.build.command.is_empty() || self.build.command[0].trim().is_empty() {
            problems.push("build.command must name a program".to_string());
        }
        if self.build.output_dir.trim().is_empty() {
            problems.push("build.output_dir must not be empty".to_string());
        }
        if self.build.timeout_secs == 0 {
            problems.push("build.timeout_secs must be greater than 0".to_string());
        }
        if self.pipeline.partitions == 0 {
            problems.push("pipeline.partitions must be greater than 0".to_string());
        }
        if self.pipeline.batch_size == 0 {
            problems.push("pipeline.batch_size must be greater than 0".to_string());
        }
        if self.pipeline.channel_capacity == 0 {
            problems.push("pipeline.channel_capacity must be greater than 0".to_string());
        }
        if self.pipeline.retry_initial_ms > self.pipeline.retry_max_ms {
            problems.push("pipeline.retry_initial_ms exceeds pipeline.retry_max_ms".to_string());
        }
        if !(self.artifacts.base_url.starts_with("http://")
            || self.artifacts.base_url.starts_with("https://"))
        {
            problems.push(format!(
                "artifacts.base_url must be an http(s) URL, got '{}'",
                self.artifacts.base_url
            ));
        }
        if self.artifacts.prefix.contains("..") {
            problems.push("artifacts.prefix must not contain '..'".to_string());
        }
        if self.resolver.cache_max_entries == 0 {
            problems.push("resolver.cache_max_entries must be greater than 0".to_string());
        }
        if self.gateway.member_buffer == 0 || self.gateway.live_buffer == 0 {
            problems.push("gateway buffers must be greater than 0".to_string());
        }
        for (name, addr) in [
            ("server.api_addr", &self.server.api_addr),
            ("server.proxy_addr", &self.server.proxy_addr),
        ] {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                problems.push(format!("{} is not a socket address: '{}'", name, addr));
            }
        }

        problems
    }
}
