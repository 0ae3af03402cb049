//! Persistent log storage keyed by event id.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use launchpad_common::LogEvent;
use rusqlite::{Connection, params};

use crate::db::DbHandle;
use crate::registry::{format_ts, parse_ts};

/// Append-only log storage. Inserting an event whose `event_id` is already
/// stored is a no-op, so redelivered batches never duplicate lines.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist a batch atomically; returns how many events were new.
    async fn insert_batch(&self, events: Vec<LogEvent>) -> Result<usize>;

    /// All stored events of a deployment in arrival order.
    async fn events_for_deployment(&self, deployment_id: &str) -> Result<Vec<LogEvent>>;
}

#[derive(Clone)]
pub struct SqliteLogStore {
    db: DbHandle<Connection>,
}

impl SqliteLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create log store directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open log store")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory log store")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS log_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                deployment_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                log TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_log_events_deployment
                ON log_events(deployment_id, seq);
            ",
        )
        .context("Failed to create log_events table")?;
        Ok(Self {
            db: DbHandle::new(conn),
        })
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn insert_batch(&self, events: Vec<LogEvent>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        self.db
            .call(move |conn| {
                let tx = conn.transaction().context("Failed to begin log batch")?;
                let mut inserted = 0;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT OR IGNORE INTO log_events
                                (event_id, deployment_id, project_id, log, timestamp)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                        )
                        .context("Failed to prepare log insert")?;
                    for event in &events {
                        inserted += stmt
                            .execute(params![
                                event.event_id,
                                event.deployment_id,
                                event.project_id,
                                event.log,
                                format_ts(event.timestamp)
                            ])
                            .context("Failed to insert log event")?;
                    }
                }
                tx.commit().context("Failed to commit log batch")?;
                Ok(inserted)
            })
            .await
    }

    async fn events_for_deployment(&self, deployment_id: &str) -> Result<Vec<LogEvent>> {
        let deployment_id = deployment_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT event_id, deployment_id, project_id, log, timestamp
                         FROM log_events WHERE deployment_id = ?1 ORDER BY seq",
                    )
                    .context("Failed to prepare log query")?;
                let rows = stmt
                    .query_map(params![deployment_id], |row| {
                        let timestamp: String = row.get(4)?;
                        Ok(LogEvent {
                            event_id: row.get(0)?,
                            deployment_id: row.get(1)?,
                            project_id: row.get(2)?,
                            log: row.get(3)?,
                            timestamp: parse_ts(&timestamp)?,
                        })
                    })
                    .context("Failed to query log events")?;
                let mut events = Vec::new();
                for row in rows {
                    events.push(row.context("Failed to read log event")?);
                }
                Ok(events)
            })
            .await
    }
}
