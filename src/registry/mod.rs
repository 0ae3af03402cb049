//! Project/deployment registry backed by SQLite.
//!
//! The registry is the system of record for projects and the deployment
//! status machine. Status writes go through [`RegistryDb::transition_deployment`],
//! which only applies legal transitions from the row's current status, so a
//! stale writer can never move a deployment backwards.

pub mod slug;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use launchpad_common::{Deployment, DeploymentStatus, Project};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use thiserror::Error;

use crate::db::DbHandle;

/// A slug is already owned by another project.
#[derive(Debug, Error)]
#[error("Slug '{slug}' is already taken")]
pub struct SlugTaken {
    pub slug: String,
}

/// A status write named a deployment that does not exist.
#[derive(Debug, Error)]
#[error("Deployment {id} not found")]
pub struct DeploymentNotFound {
    pub id: String,
}

/// A status write was rejected because the deployment is not in a state
/// that may move to the requested one.
#[derive(Debug, Error)]
#[error("Deployment {id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
}

/// Where a tenant slug currently points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantResolution {
    pub project_id: String,
    pub deployment_id: String,
}

/// Lookup seam used by the content resolver.
#[async_trait]
pub trait SlugLookup: Send + Sync {
    async fn resolve_slug(&self, slug: &str) -> Result<Option<TenantResolution>>;
}

pub struct NewProject {
    pub name: String,
    pub source_locator: String,
    pub slug: Option<String>,
}

/// Current time at the precision timestamps are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let created_at: String = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        source_locator: row.get(2)?,
        slug: row.get(3)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Deployment {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status: status.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

const PROJECT_COLUMNS: &str = "id, name, source_locator, slug, created_at";
const DEPLOYMENT_COLUMNS: &str = "id, project_id, status, created_at, updated_at";

pub struct RegistryDb {
    conn: Connection,
}

impl RegistryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open registry database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory registry (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory registry database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    source_locator TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_deployments_project
                    ON deployments(project_id, status);
                ",
            )
            .context("Failed to create registry tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, source_locator: &str, slug: &str) -> Result<Project> {
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_locator: source_locator.to_string(),
            slug: slug.to_string(),
            created_at: now(),
        };
        let inserted = self.conn.execute(
            "INSERT INTO projects (id, name, source_locator, slug, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id,
                project.name,
                project.source_locator,
                project.slug,
                format_ts(project.created_at)
            ],
        );
        match inserted {
            Ok(_) => Ok(project),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SlugTaken {
                    slug: slug.to_string(),
                }
                .into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert project")),
        }
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE slug = ?1", PROJECT_COLUMNS),
                params![slug],
                project_from_row,
            )
            .optional()
            .context("Failed to query project by slug")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM projects ORDER BY created_at, rowid",
                PROJECT_COLUMNS
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    // ── Deployments ───────────────────────────────────────────────────

    /// Insert a QUEUED deployment for an existing project.
    pub fn create_deployment(&self, project_id: &str) -> Result<Deployment> {
        let created_at = now();
        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            status: DeploymentStatus::Queued,
            created_at,
            updated_at: created_at,
        };
        self.conn
            .execute(
                "INSERT INTO deployments (id, project_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    deployment.id,
                    deployment.project_id,
                    deployment.status.as_str(),
                    format_ts(created_at)
                ],
            )
            .context("Failed to insert deployment")?;
        Ok(deployment)
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS),
                params![id],
                deployment_from_row,
            )
            .optional()
            .context("Failed to query deployment")
    }

    /// Deployments of a project, newest first.
    pub fn list_deployments(&self, project_id: &str) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM deployments WHERE project_id = ?1
                 ORDER BY created_at DESC, id DESC",
                DEPLOYMENT_COLUMNS
            ))
            .context("Failed to prepare list_deployments")?;
        let rows = stmt
            .query_map(params![project_id], deployment_from_row)
            .context("Failed to query deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?);
        }
        Ok(deployments)
    }

    pub fn transition_deployment(&self, id: &str, to: DeploymentStatus) -> Result<Deployment> {
        self.transition_deployment_at(id, to, now())
    }

    /// Move a deployment to `to`, recording `at` as its update time. Fails
    /// with [`InvalidTransition`] when the current status cannot reach `to`.
    pub fn transition_deployment_at(
        &self,
        id: &str,
        to: DeploymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Deployment> {
        let from = DeploymentStatus::predecessors(to);
        let placeholders = (0..from.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE deployments SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ({})",
            if placeholders.is_empty() { "NULL".to_string() } else { placeholders }
        );
        let mut values = vec![to.as_str().to_string(), format_ts(at), id.to_string()];
        values.extend(from.iter().map(|s| s.as_str().to_string()));

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values.iter()))
            .context("Failed to update deployment status")?;

        let current = self.get_deployment(id)?.ok_or_else(|| DeploymentNotFound {
            id: id.to_string(),
        })?;
        if changed == 0 {
            return Err(InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to,
            }
            .into());
        }
        Ok(current)
    }

    /// Most recently completed SUCCEEDED deployment of the project owning `slug`.
    pub fn active_deployment_for_slug(&self, slug: &str) -> Result<Option<TenantResolution>> {
        self.conn
            .query_row(
                "SELECT p.id, d.id
                 FROM projects p
                 JOIN deployments d ON d.project_id = p.id
                 WHERE p.slug = ?1 AND d.status = ?2
                 ORDER BY d.updated_at DESC, d.created_at DESC, d.id DESC
                 LIMIT 1",
                params![slug, DeploymentStatus::Succeeded.as_str()],
                |row| {
                    Ok(TenantResolution {
                        project_id: row.get(0)?,
                        deployment_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to resolve tenant slug")
    }
}

/// Cloneable async facade over [`RegistryDb`].
#[derive(Clone)]
pub struct Registry {
    db: DbHandle<RegistryDb>,
}

impl Registry {
    pub fn new(db: RegistryDb) -> Self {
        Self {
            db: DbHandle::new(db),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory {}", parent.display())
            })?;
        }
        Ok(Self::new(RegistryDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(RegistryDb::new_in_memory()?))
    }

    /// Create a project, generating a slug from the name when none is given.
    pub async fn create_project(&self, new: NewProject) -> Result<Project> {
        let slug = new
            .slug
            .unwrap_or_else(|| slug::generate_slug(&new.name));
        self.db
            .call(move |db| db.create_project(&new.name, &new.source_locator, &slug))
            .await
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_project(&id)).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.db.call(|db| db.list_projects()).await
    }

    pub async fn create_deployment(&self, project_id: &str) -> Result<Deployment> {
        let project_id = project_id.to_string();
        self.db.call(move |db| db.create_deployment(&project_id)).await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let id = id.to_string();
        self.db.call(move |db| db.get_deployment(&id)).await
    }

    pub async fn list_deployments(&self, project_id: &str) -> Result<Vec<Deployment>> {
        let project_id = project_id.to_string();
        self.db.call(move |db| db.list_deployments(&project_id)).await
    }

    pub async fn transition_deployment(&self, id: &str, to: DeploymentStatus) -> Result<Deployment> {
        let id = id.to_string();
        self.db
            .call(move |db| db.transition_deployment(&id, to))
            .await
    }

    pub async fn active_deployment_for_slug(&self, slug: &str) -> Result<Option<TenantResolution>> {
        let slug = slug.to_string();
        self.db
            .call(move |db| db.active_deployment_for_slug(&slug))
            .await
    }
}

#[async_trait]
impl SlugLookup for Registry {
    async fn resolve_slug(&self, slug: &str) -> Result<Option<TenantResolution>> {
        self.active_deployment_for_slug(slug).await
    }
}
