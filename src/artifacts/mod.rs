//! Artifact storage: key layout, the upload seam, and the HTTP client.

pub mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

/// Key-based object upload.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;
}

/// Where a project's files live inside the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    prefix: String,
}

impl ArtifactLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// `{prefix}/{project_id}`, the path prefix the proxy forwards under.
    pub fn project_prefix(&self, project_id: &str) -> String {
        if self.prefix.is_empty() {
            project_id.to_string()
        } else {
            format!("{}/{}", self.prefix, project_id)
        }
    }

    pub fn key_for(&self, project_id: &str, relative: &str) -> String {
        format!(
            "{}/{}",
            self.project_prefix(project_id),
            relative.trim_start_matches('/')
        )
    }
}

/// Uploads with `PUT {base_url}/{key}`.
#[derive(Clone)]
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, key);
        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to send upload request for {}", key))?
            .error_for_status()
            .with_context(|| format!("Artifact store rejected upload of {}", key))?;
        Ok(())
    }
}

pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Regular files under `dir`, as `/`-separated paths relative to it, sorted.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative: PathBuf = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?
            .to_path_buf();
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(key);
    }
    files.sort();
    Ok(files)
}
