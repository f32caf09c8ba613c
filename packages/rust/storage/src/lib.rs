//! libSQL storage layer for the catalog and the browser session.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the catalog
//! of last-seen content, the persisted session cookies, and a short cycle
//! history. Catalog and cookie writes always replace the whole set inside a
//! single transaction.
//!
//! **Access rules:**
//! - the monitor process: read-write (sole writer) via [`Storage::open`]
//! - inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use coursewatch_shared::{Catalog, CatalogRecord, ContentKind, Cookie, CourseWatchError, Result};
use libsql::{Connection, Database, params};

/// Cycles kept in the history; older rows are pruned on insert.
pub const HISTORY_RETAINED: usize = 500;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of cycle history.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `completed`, `bootstrap`, `skipped` or `failed`.
    pub outcome: String,
    pub items: Option<usize>,
    pub events: Option<usize>,
    pub error: Option<String>,
}

fn storage_err(e: impl std::fmt::Display) -> CourseWatchError {
    CourseWatchError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CourseWatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CourseWatchError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    CourseWatchError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CourseWatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Read the full catalog. An empty table yields an empty catalog.
    pub async fn load_catalog(&self) -> Result<Catalog> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, content_kind FROM catalog ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut catalog = Catalog::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id: String = row.get(0).map_err(storage_err)?;
            let title: String = row.get(1).map_err(storage_err)?;
            let kind: String = row.get(2).map_err(storage_err)?;
            catalog.insert(
                id,
                CatalogRecord {
                    title,
                    content_kind: ContentKind::from_label(&kind),
                },
            );
        }
        Ok(catalog)
    }

    /// Replace the whole catalog with `catalog`.
    ///
    /// Ids absent from `catalog` are removed. Either every row is written or
    /// the previous catalog is left intact.
    pub async fn replace_catalog(&self, catalog: &Catalog) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM catalog", params![])
            .await
            .map_err(storage_err)?;
        for (id, record) in catalog.iter() {
            tx.execute(
                "INSERT INTO catalog (id, title, content_kind, committed_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_str(),
                    record.title.as_str(),
                    record.content_kind.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        tracing::debug!(entries = catalog.len(), "catalog committed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session cookies
    // -----------------------------------------------------------------------

    /// Read the persisted cookie set. `None` when no session was ever saved.
    pub async fn load_cookies(&self) -> Result<Option<Vec<Cookie>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT cookie_json FROM session_cookies ORDER BY position",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut cookies = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let json: String = row.get(0).map_err(storage_err)?;
            let cookie: Cookie = serde_json::from_str(&json)
                .map_err(|e| CourseWatchError::Storage(format!("invalid cookie record: {e}")))?;
            cookies.push(cookie);
        }

        Ok((!cookies.is_empty()).then_some(cookies))
    }

    /// Replace the persisted cookie set, keeping the given order.
    pub async fn save_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM session_cookies", params![])
            .await
            .map_err(storage_err)?;
        for (position, cookie) in cookies.iter().enumerate() {
            let json = serde_json::to_string(cookie).map_err(storage_err)?;
            tx.execute(
                "INSERT INTO session_cookies (position, cookie_json, saved_at) VALUES (?1, ?2, ?3)",
                params![position as i64, json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Forget the persisted session so the next cycle logs in again.
    pub async fn clear_cookies(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM session_cookies", params![])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cycle history
    // -----------------------------------------------------------------------

    /// Append one cycle to the history, keeping the newest
    /// [`HISTORY_RETAINED`] rows.
    pub async fn record_cycle(&self, record: &CycleRecord) -> Result<()> {
        self.record_cycle_keeping(record, HISTORY_RETAINED).await
    }

    async fn record_cycle_keeping(&self, record: &CycleRecord, keep: usize) -> Result<()> {
        self.check_writable()?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "INSERT INTO cycle_runs (id, started_at, finished_at, outcome, items, events, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.as_str(),
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                record.outcome.as_str(),
                record.items.map(|n| n as i64),
                record.events.map(|n| n as i64),
                record.error.as_deref(),
            ],
        )
        .await
        .map_err(storage_err)?;
        let pruned = tx
            .execute(
                "DELETE FROM cycle_runs WHERE id NOT IN
                 (SELECT id FROM cycle_runs ORDER BY started_at DESC LIMIT ?1)",
                params![keep as i64],
            )
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        if pruned > 0 {
            tracing::debug!(pruned, "cycle history pruned");
        }
        Ok(())
    }

    /// Most recent cycles, newest first.
    pub async fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, outcome, items, events, error
                 FROM cycle_runs ORDER BY started_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_cycle_record(&row)?);
        }
        Ok(results)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CourseWatchError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`CycleRecord`].
fn row_to_cycle_record(row: &libsql::Row) -> Result<CycleRecord> {
    Ok(CycleRecord {
        id: row.get::<String>(0).map_err(storage_err)?,
        started_at: parse_timestamp(&row.get::<String>(1).map_err(storage_err)?)?,
        finished_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
        outcome: row.get::<String>(3).map_err(storage_err)?,
        items: row.get::<i64>(4).ok().map(|v| v as usize),
        events: row.get::<i64>(5).ok().map(|v| v as usize),
        error: row.get::<String>(6).ok(),
    })
}
