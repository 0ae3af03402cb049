//! Async access to synchronous SQLite-backed stores.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

/// Async-safe handle to a blocking database value.
///
/// Wraps `T` behind `Arc<Mutex>`; every `call` runs on tokio's blocking
/// thread pool via `spawn_blocking`. Shared by the registry and the log
/// store.
pub struct DbHandle<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for DbHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DbHandle<T> {
    pub fn new(db: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("DB task panicked")?
    }

    #[cfg(test)]
    fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, T>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}
