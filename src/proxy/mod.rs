//! Content resolver: hostname → tenant → artifact path prefix.
//!
//! Only successful lookups are cached. A cached entry can point at the
//! previous deployment for up to the TTL after a newer one succeeds; it can
//! never point at another tenant.

pub mod server;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::artifacts::ArtifactLayout;
use crate::errors::ProxyError;
use crate::registry::{SlugLookup, TenantResolution};

/// Tenant slug of a `Host` header value: the leftmost label, lowercased,
/// with any port removed.
pub fn extract_slug(host: &str) -> Result<String, ProxyError> {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let label = without_port.split('.').next().unwrap_or_default();
    let valid = !label.is_empty()
        && label.len() <= 63
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(ProxyError::InvalidHost(host.to_string()));
    }
    Ok(label.to_ascii_lowercase())
}

/// WHATWG dot segment, including its percent-encoded spellings.
fn is_dot_segment(segment: &str) -> bool {
    let lowered = segment.to_ascii_lowercase().replace("%2e", ".");
    lowered == "." || lowered == ".."
}

/// Path to request from the artifact store, relative to the tenant prefix.
/// An empty or root path becomes `index.html`. Dot segments and
/// backslashes are rejected since URL normalization would resolve them
/// outside the tenant prefix.
pub fn rewrite_path(path: &str) -> Result<String, ProxyError> {
    let trimmed = path.trim_start_matches('/');
    let escapes = trimmed.split('/').any(|segment| {
        is_dot_segment(segment)
            || segment.contains('\\')
            || segment.to_ascii_lowercase().contains("%5c")
    });
    if escapes {
        return Err(ProxyError::InvalidPath(path.to_string()));
    }
    if trimmed.is_empty() {
        Ok("index.html".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    resolution: TenantResolution,
    expires_at: Instant,
}

/// Bounded TTL cache of slug resolutions.
pub struct ResolutionCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl ResolutionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, slug: &str) -> Option<TenantResolution> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(slug)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.resolution.clone());
        if hit.is_none() {
            self.entries.remove_if(slug, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    pub fn insert(&self, slug: &str, resolution: TenantResolution) {
        let now = Instant::now();
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(slug) {
            self.entries.retain(|_, entry| entry.expires_at > now);
            if self.entries.len() >= self.max_entries {
                // Still full of live entries: evict the one closest to expiry.
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|entry| entry.expires_at)
                    .map(|entry| entry.key().clone());
                if let Some(key) = oldest {
                    self.entries.remove(&key);
                }
            }
        }
        self.entries.insert(
            slug.to_string(),
            CacheEntry {
                resolution,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a request for a tenant should be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub slug: String,
    pub deployment_id: String,
    /// `{prefix}/{project_id}` inside the artifact store.
    pub path_prefix: String,
}

pub struct Resolver {
    lookup: Arc<dyn SlugLookup>,
    cache: ResolutionCache,
    layout: ArtifactLayout,
    lookup_timeout: Duration,
}

impl Resolver {
    pub fn new(
        lookup: Arc<dyn SlugLookup>,
        layout: ArtifactLayout,
        cache: ResolutionCache,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            lookup,
            cache,
            layout,
            lookup_timeout,
        }
    }

    pub async fn resolve(&self, host: &str) -> Result<ResolvedTarget, ProxyError> {
        let slug = extract_slug(host)?;

        let resolution = match self.cache.get(&slug) {
            Some(hit) => hit,
            None => {
                let looked_up =
                    tokio::time::timeout(self.lookup_timeout, self.lookup.resolve_slug(&slug))
                        .await
                        .map_err(|_| ProxyError::LookupTimeout)?
                        .map_err(ProxyError::LookupFailed)?;
                let resolution = looked_up.ok_or_else(|| ProxyError::TenantNotFound {
                    slug: slug.clone(),
                })?;
                debug!(slug = %slug, deployment_id = %resolution.deployment_id, "Resolved tenant");
                self.cache.insert(&slug, resolution.clone());
                resolution
            }
        };

        Ok(ResolvedTarget {
            path_prefix: self.layout.project_prefix(&resolution.project_id),
            deployment_id: resolution.deployment_id,
            slug,
        })
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MapLookup {
        tenants: Mutex<HashMap<String, TenantResolution>>,
        calls: AtomicUsize,
    }

    impl MapLookup {
        fn set(&self, slug: &str, project_id: &str, deployment_id: &str) {
            self.tenants.lock().unwrap().insert(
                slug.to_string(),
                TenantResolution {
                    project_id: project_id.to_string(),
                    deployment_id: deployment_id.to_string(),
                },
            );
        }
    }

    #[async_trait]
    impl SlugLookup for MapLookup {
        async fn resolve_slug(&self, slug: &str) -> Result<Option<TenantResolution>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tenants.lock().unwrap().get(slug).cloned())
        }
    }

    struct SlowLookup;

    #[async_trait]
    impl SlugLookup for SlowLookup {
        async fn resolve_slug(&self, _slug: &str) -> Result<Option<TenantResolution>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl SlugLookup for FailingLookup {
        async fn resolve_slug(&self, _slug: &str) -> Result<Option<TenantResolution>> {
            anyhow::bail!("registry unavailable")
        }
    }

    fn resolver(lookup: Arc<dyn SlugLookup>, ttl: Duration) -> Resolver {
        Resolver::new(
            lookup,
            ArtifactLayout::new("__outputs"),
            ResolutionCache::new(ttl, 16),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_extract_slug() {
        assert_eq!(extract_slug("shop.example.com").unwrap(), "shop");
        assert_eq!(extract_slug("Shop.Example.com:8000").unwrap(), "shop");
        assert_eq!(extract_slug("localhost:8000").unwrap(), "localhost");
        assert!(extract_slug("").is_err());
        assert!(extract_slug(".example.com").is_err());
        assert!(extract_slug("bad_label.example.com").is_err());
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("").unwrap(), "index.html");
        assert_eq!(rewrite_path("/").unwrap(), "index.html");
        assert_eq!(rewrite_path("/about.html").unwrap(), "about.html");
        assert_eq!(rewrite_path("/assets/app.js").unwrap(), "assets/app.js");
        assert_eq!(rewrite_path("/docs/").unwrap(), "docs/");
        assert_eq!(rewrite_path("/v1.2/..data").unwrap(), "v1.2/..data");
    }

    #[test]
    fn test_rewrite_path_rejects_dot_segments() {
        for path in [
            "/../p2/index.html",
            "/assets/../../p2/index.html",
            "/%2e%2e/p2/secret.txt",
            "/%2E./p2/secret.txt",
            "/.%2e/p2/secret.txt",
            "/./index.html",
            "/..\\p2/index.html",
            "/%5c../p2/index.html",
        ] {
            assert!(
                matches!(rewrite_path(path), Err(ProxyError::InvalidPath(_))),
                "{} should be rejected",
                path
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_known_tenant() {
        let lookup = Arc::new(MapLookup::default());
        lookup.set("shop", "p1", "d1");
        let r = resolver(lookup, Duration::from_secs(30));

        let target = r.resolve("shop.example.com").await.unwrap();
        assert_eq!(target.path_prefix, "__outputs/p1");
        assert_eq!(target.deployment_id, "d1");
        assert_eq!(target.slug, "shop");
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_found_and_not_cached() {
        let lookup = Arc::new(MapLookup::default());
        let r = resolver(lookup.clone(), Duration::from_secs(30));

        let err = r.resolve("ghost.example.com").await.unwrap_err();
        assert!(matches!(err, ProxyError::TenantNotFound { ref slug } if slug == "ghost"));
        assert!(r.cache().is_empty());

        // A tenant that appears later is picked up without waiting for a TTL.
        lookup.set("ghost", "p9", "d9");
        assert_eq!(r.resolve("ghost.example.com").await.unwrap().deployment_id, "d9");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_registry() {
        let lookup = Arc::new(MapLookup::default());
        lookup.set("shop", "p1", "d1");
        let r = resolver(lookup.clone(), Duration::from_secs(30));

        r.resolve("shop.example.com").await.unwrap();
        r.resolve("shop.example.com").await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_expiry_picks_up_new_deployment() {
        let lookup = Arc::new(MapLookup::default());
        lookup.set("shop", "p1", "d1");
        let r = resolver(lookup.clone(), Duration::from_millis(20));

        assert_eq!(r.resolve("shop.example.com").await.unwrap().deployment_id, "d1");
        lookup.set("shop", "p1", "d2");
        // Within the TTL the stale mapping is still served.
        assert_eq!(r.resolve("shop.example.com").await.unwrap().deployment_id, "d1");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(r.resolve("shop.example.com").await.unwrap().deployment_id, "d2");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        let r = resolver(Arc::new(SlowLookup), Duration::from_secs(30));
        let err = r.resolve("shop.example.com").await.unwrap_err();
        assert!(matches!(err, ProxyError::LookupTimeout));
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let r = resolver(Arc::new(FailingLookup), Duration::from_secs(30));
        let err = r.resolve("shop.example.com").await.unwrap_err();
        assert!(matches!(err, ProxyError::LookupFailed(_)));
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let cache = ResolutionCache::new(Duration::from_secs(30), 2);
        for slug in ["a", "b", "c"] {
            cache.insert(
                slug,
                TenantResolution {
                    project_id: slug.into(),
                    deployment_id: slug.into(),
                },
            );
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c").is_some());
    }
}
