//! Process wiring: builds each subsystem from configuration and runs the
//! HTTP listeners until shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::api::{self, AppState, SharedState};
use crate::artifacts::{self, ArtifactLayout, HttpArtifactStore};
use crate::config::PlatformConfig;
use crate::dispatch::Dispatcher;
use crate::dispatch::executor::ProcessExecutor;
use crate::gateway::{self, BroadcastGroups, ws};
use crate::logs::channel::MemoryLogChannel;
use crate::logs::pipeline::LogPipeline;
use crate::logs::store::SqliteLogStore;
use crate::logs::live_channel;
use crate::proxy::server::ProxyState;
use crate::proxy::{self, ResolutionCache, Resolver};
use crate::registry::{Registry, SlugLookup};

/// API routes plus the live log WebSocket.
pub fn build_api_router(state: SharedState, cors: bool) -> Router {
    let groups = Arc::clone(&state.groups);
    let mut app = api::api_router()
        .route(
            "/ws",
            get(move |upgrade| ws::ws_handler(upgrade, groups)),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

pub fn build_proxy_state(config: &PlatformConfig, lookup: Arc<dyn SlugLookup>) -> ProxyState {
    let resolver = Resolver::new(
        lookup,
        ArtifactLayout::new(&config.artifacts.prefix),
        ResolutionCache::new(
            Duration::from_secs(config.resolver.cache_ttl_secs),
            config.resolver.cache_max_entries,
        ),
        Duration::from_millis(config.resolver.lookup_timeout_ms),
    );
    ProxyState::new(
        resolver,
        &config.artifacts.base_url,
        Duration::from_millis(config.resolver.upstream_timeout_ms),
    )
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))
}

/// Serve `app` on `listener` until `shutdown` fires.
pub async fn serve_router(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Server error")
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        token.cancel();
    });
}

/// Run the whole platform: API and gateway, log pipeline, and optionally
/// the reverse proxy.
pub async fn run_platform(config: PlatformConfig, with_proxy: bool) -> Result<()> {
    let registry = Registry::open(&config.registry.path)
        .context("Failed to initialize registry database")?;
    let log_store = Arc::new(
        SqliteLogStore::open(&config.log_store.path).context("Failed to initialize log store")?,
    );
    let channel = Arc::new(MemoryLogChannel::new(
        config.pipeline.partitions,
        config.pipeline.channel_capacity,
    ));
    let live = live_channel(config.gateway.live_buffer);
    let groups = Arc::new(BroadcastGroups::new(config.gateway.member_buffer));

    let shutdown = CancellationToken::new();
    let relay = gateway::spawn_relay(Arc::clone(&groups), live.subscribe(), shutdown.clone());
    let pipeline = LogPipeline::new(
        channel.clone(),
        log_store.clone(),
        live,
        config.pipeline.clone(),
    );
    let pipeline_task = tokio::spawn(pipeline.run(shutdown.clone()));

    let dispatcher = Dispatcher::new(
        registry.clone(),
        Arc::new(ProcessExecutor::new(&config.build)),
        channel,
        Arc::new(HttpArtifactStore::new(&config.artifacts.base_url)),
        ArtifactLayout::new(&config.artifacts.prefix),
    )
    .with_build_timeout(config.build.timeout())
    .with_keep_workdirs(config.build.keep_workdirs);

    let state = Arc::new(AppState {
        registry: registry.clone(),
        dispatcher,
        log_store,
        groups,
    });

    let api_listener = bind(&config.server.api_addr).await?;
    info!(addr = %api_listener.local_addr()?, "API listening");
    let api_app = build_api_router(state, config.server.cors);
    let api_task = tokio::spawn(serve_router(api_listener, api_app, shutdown.clone()));

    let proxy_task = if with_proxy {
        let listener = bind(&config.server.proxy_addr).await?;
        info!(addr = %listener.local_addr()?, "Reverse proxy listening");
        let app = proxy::server::router(Arc::new(build_proxy_state(&config, Arc::new(registry))));
        Some(tokio::spawn(serve_router(listener, app, shutdown.clone())))
    } else {
        None
    };

    cancel_on_ctrl_c(shutdown.clone());

    let api_result = api_task.await.context("API server task panicked")?;
    shutdown.cancel();
    if let Some(task) = proxy_task {
        task.await.context("Proxy server task panicked")??;
    }
    if let Err(e) = pipeline_task.await.context("Log pipeline task panicked")? {
        error!(error = %e, "Log pipeline stopped with an error");
    }
    let _ = relay.await;
    api_result?;
    info!("Shut down gracefully");
    Ok(())
}

/// Run only the reverse proxy against the registry database.
pub async fn run_proxy(config: PlatformConfig) -> Result<()> {
    let registry = Registry::open(&config.registry.path)
        .context("Failed to open registry database")?;
    let listener = bind(&config.server.proxy_addr).await?;
    info!(addr = %listener.local_addr()?, "Reverse proxy listening");
    let app = proxy::server::router(Arc::new(build_proxy_state(&config, Arc::new(registry))));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    serve_router(listener, app, shutdown).await
}

/// Run the development artifact store.
pub async fn run_artifact_store(addr: &str, root: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create artifact root {}", root.display()))?;
    let listener = bind(addr).await?;
    info!(
        addr = %listener.local_addr()?,
        root = %root.display(),
        "Artifact store listening"
    );
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    serve_router(listener, artifacts::server::router(root), shutdown).await
}
