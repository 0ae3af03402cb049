//! Development artifact store: key-based PUT/GET over a local directory.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use super::content_type_for;

struct StoreState {
    root: PathBuf,
}

pub fn router(root: PathBuf) -> Router {
    let state = Arc::new(StoreState { root });
    Router::new()
        .route("/{*key}", get(get_object).put(put_object))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a key onto the storage root, rejecting anything that could escape it.
fn resolve_key(root: &FsPath, key: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

fn bad_key(key: &str) -> Response {
    (StatusCode::BAD_REQUEST, format!("Invalid object key '{}'", key)).into_response()
}

async fn put_object(
    State(state): State<Arc<StoreState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let Some(path) = resolve_key(&state.root, &key) else {
        return bad_key(&key);
    };
    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        error!(key = %key, error = %e, "Failed to create object directory");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match tokio::fs::write(&path, &body).await {
        Ok(()) => {
            debug!(key = %key, bytes = body.len(), "Stored object");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            error!(key = %key, error = %e, "Failed to write object");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_object(State(state): State<Arc<StoreState>>, Path(key): Path<String>) -> Response {
    let Some(path) = resolve_key(&state.root, &key) else {
        return bad_key(&key);
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type_for(&path))],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        // A directory at the key is not an object.
        Err(_) if path.is_dir() => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(key = %key, error = %e, "Failed to read object");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
