//! Reverse proxy HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::{Resolver, rewrite_path};
use crate::errors::ProxyError;

const FORWARDED_REQUEST_HEADERS: [HeaderName; 4] = [
    header::ACCEPT,
    header::RANGE,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
];

const FORWARDED_RESPONSE_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::ETAG,
    header::LAST_MODIFIED,
    header::CACHE_CONTROL,
    header::CONTENT_RANGE,
];

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::InvalidHost(_) | ProxyError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ProxyError::TenantNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::LookupFailed(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::LookupTimeout | ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub struct ProxyState {
    pub resolver: Resolver,
    pub client: reqwest::Client,
    pub upstream_base: String,
    pub upstream_timeout: Duration,
}

impl ProxyState {
    pub fn new(resolver: Resolver, upstream_base: &str, upstream_timeout: Duration) -> Self {
        Self {
            resolver,
            client: reqwest::Client::new(),
            upstream_base: upstream_base.trim_end_matches('/').to_string(),
            upstream_timeout,
        }
    }
}

/// Every path on every host goes through the resolver.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn request_host(headers: &HeaderMap, req: &Request) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    match forward(&state, req).await {
        Ok(resp) => resp,
        Err(e) => {
            match &e {
                ProxyError::TenantNotFound { .. }
                | ProxyError::InvalidHost(_)
                | ProxyError::InvalidPath(_) => {
                    debug!(error = %e, "Proxy request rejected")
                }
                _ => warn!(error = %e, "Proxy request failed"),
            }
            e.into_response()
        }
    }
}

/// Upstream URL for `relative` under the tenant prefix. The URL is checked
/// after parsing so normalization can never leave the prefix.
fn upstream_url(
    state: &ProxyState,
    path_prefix: &str,
    relative: &str,
    query: Option<&str>,
) -> Result<reqwest::Url, ProxyError> {
    let mut raw = format!("{}/{}/{}", state.upstream_base, path_prefix, relative);
    if let Some(query) = query {
        raw.push('?');
        raw.push_str(query);
    }
    let url = reqwest::Url::parse(&raw).map_err(|_| ProxyError::InvalidPath(relative.to_string()))?;

    let base_path = reqwest::Url::parse(&state.upstream_base)
        .map(|base| base.path().trim_end_matches('/').to_string())
        .map_err(|e| ProxyError::Upstream(format!("invalid artifact store URL: {}", e)))?;
    let tenant_root = format!("{}/{}/", base_path, path_prefix);
    if !url.path().starts_with(&tenant_root) {
        return Err(ProxyError::InvalidPath(relative.to_string()));
    }
    Ok(url)
}

async fn forward(state: &ProxyState, req: Request) -> Result<Response, ProxyError> {
    let method = req.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return Err(ProxyError::MethodNotAllowed(method.to_string()));
    }
    let host = request_host(req.headers(), &req)
        .ok_or_else(|| ProxyError::InvalidHost(String::new()))?;
    let target = state.resolver.resolve(&host).await?;

    let relative = rewrite_path(req.uri().path())?;
    let url = upstream_url(state, &target.path_prefix, &relative, req.uri().query())?;
    debug!(slug = %target.slug, deployment_id = %target.deployment_id, url = %url, "Forwarding");

    let mut upstream = state
        .client
        .request(method.clone(), url)
        .timeout(state.upstream_timeout);
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if let Some(value) = req.headers().get(name) {
            upstream = upstream.header(name.clone(), value.clone());
        }
    }

    let resp = upstream.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::UpstreamTimeout
        } else {
            ProxyError::Upstream(e.to_string())
        }
    })?;

    let status = resp.status();
    if status.is_server_error() {
        return Err(ProxyError::Upstream(format!("artifact store returned {}", status)));
    }

    let mut builder = Response::builder().status(status.as_u16());
    for name in FORWARDED_RESPONSE_HEADERS.iter() {
        if let Some(value) = resp.headers().get(name) {
            builder = builder.header(name.clone(), value.clone());
        }
    }
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::UpstreamTimeout
            } else {
                ProxyError::Upstream(e.to_string())
            }
        })?;
        Body::from(bytes)
    };
    builder
        .body(body)
        .map_err(|e| ProxyError::Upstream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactLayout;
    use crate::proxy::ResolutionCache;
    use crate::registry::{SlugLookup, TenantResolution};
    use anyhow::Result;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct OneTenant;

    #[async_trait]
    impl SlugLookup for OneTenant {
        async fn resolve_slug(&self, slug: &str) -> Result<Option<TenantResolution>> {
            Ok((slug == "shop").then(|| TenantResolution {
                project_id: "p1".into(),
                deployment_id: "d1".into(),
            }))
        }
    }

    async fn spawn_upstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn proxy(upstream: &str, timeout: Duration) -> Router {
        let resolver = Resolver::new(
            Arc::new(OneTenant),
            ArtifactLayout::new("__outputs"),
            ResolutionCache::new(Duration::from_secs(30), 16),
            Duration::from_secs(1),
        );
        router(Arc::new(ProxyState::new(resolver, upstream, timeout)))
    }

    fn get(host: &str, path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_is_forwarded_as_index_html() {
        let upstream = spawn_upstream(Router::new().route(
            "/{*key}",
            axum::routing::get(|uri: axum::http::Uri| async move {
                ([(header::CONTENT_TYPE, "text/plain")], uri.to_string())
            }),
        ))
        .await;
        let app = proxy(&upstream, Duration::from_secs(2));

        let resp = app.clone().oneshot(get("shop.example.com", "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/__outputs/p1/index.html");

        let resp = app
            .oneshot(get("shop.example.com:8000", "/assets/app.js?v=2"))
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/__outputs/p1/assets/app.js?v=2");
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_404_without_forwarding() {
        // Nothing listens here; forwarding would fail with 502.
        let app = proxy("http://127.0.0.1:9", Duration::from_secs(1));
        let resp = app.oneshot(get("ghost.example.com", "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("ghost"));
    }

    struct TwoTenants;

    #[async_trait]
    impl SlugLookup for TwoTenants {
        async fn resolve_slug(&self, slug: &str) -> Result<Option<TenantResolution>> {
            let project_id = match slug {
                "shop" => "p1",
                "blog" => "p2",
                _ => return Ok(None),
            };
            Ok(Some(TenantResolution {
                project_id: project_id.into(),
                deployment_id: format!("d-{}", project_id),
            }))
        }
    }

    #[tokio::test]
    async fn test_each_host_reaches_only_its_own_prefix() {
        let upstream = spawn_upstream(Router::new().route(
            "/{*key}",
            axum::routing::get(|uri: axum::http::Uri| async move { uri.path().to_string() }),
        ))
        .await;
        let resolver = Resolver::new(
            Arc::new(TwoTenants),
            ArtifactLayout::new("__outputs"),
            ResolutionCache::new(Duration::from_secs(30), 16),
            Duration::from_secs(1),
        );
        let app = router(Arc::new(ProxyState::new(
            resolver,
            &upstream,
            Duration::from_secs(2),
        )));

        for (host, expected) in [
            ("shop.example.com", "/__outputs/p1/index.html"),
            ("blog.example.com", "/__outputs/p2/index.html"),
            // Served from cache the second time round.
            ("shop.example.com", "/__outputs/p1/index.html"),
        ] {
            let resp = app.clone().oneshot(get(host, "/")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], expected.as_bytes(), "{}", host);
        }
    }

    #[tokio::test]
    async fn test_paths_never_leave_tenant_prefix() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let recorder = Arc::clone(&seen);
        let upstream = spawn_upstream(Router::new().route(
            "/{*key}",
            axum::routing::get(move |uri: axum::http::Uri| {
                let recorder = Arc::clone(&recorder);
                async move {
                    recorder.lock().unwrap().push(uri.path().to_string());
                    uri.to_string()
                }
            }),
        ))
        .await;
        let app = proxy(&upstream, Duration::from_secs(2));

        for path in [
            "/../p2/index.html",
            "/assets/../../p2/index.html",
            "/%2e%2e/p2/secret.txt",
            "/%2E%2e/p2/secret.txt",
            "/.%2e/p2/secret.txt",
            "/a//../../p2/index.html",
        ] {
            let resp = app.clone().oneshot(get("shop.example.com", path)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", path);
        }

        let resp = app
            .clone()
            .oneshot(get("shop.example.com", "//assets//app.js"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(
            seen.iter().all(|p| p.starts_with("/__outputs/p1/")),
            "upstream saw {:?}",
            *seen
        );
    }

    #[tokio::test]
    async fn test_upstream_5xx_is_bad_gateway() {
        let upstream = spawn_upstream(Router::new().route(
            "/{*key}",
            axum::routing::get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let app = proxy(&upstream, Duration::from_secs(2));
        let resp = app.oneshot(get("shop.example.com", "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_upstream_404_passes_through() {
        let upstream = spawn_upstream(Router::new().route(
            "/{*key}",
            axum::routing::get(|| async { StatusCode::NOT_FOUND }),
        ))
        .await;
        let app = proxy(&upstream, Duration::from_secs(2));
        let resp = app.oneshot(get("shop.example.com", "/missing.html")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upstream_timeout_is_gateway_timeout() {
        let upstream = spawn_upstream(Router::new().route(
            "/{*key}",
            axum::routing::get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let app = proxy(&upstream, Duration::from_millis(100));
        let resp = app.oneshot(get("shop.example.com", "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let app = proxy("http://127.0.0.1:9", Duration::from_secs(1));
        let resp = app.oneshot(get("shop.example.com", "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_post_is_rejected() {
        let app = proxy("http://127.0.0.1:9", Duration::from_secs(1));
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::HOST, "shop.example.com")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
