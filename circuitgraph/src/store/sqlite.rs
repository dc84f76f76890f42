//! SQLite graph store
//!
//! Persists components and connections as two tables with unique keys, so
//! re-ingesting a diagram matches the existing rows instead of duplicating
//! them. Each session owns its own connection; rusqlite calls run on the
//! blocking thread pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{edge_endpoints, GraphSession, GraphStore, StoreError, StoreId};
use crate::parser::schema::Element;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS components (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        diagram_uuid TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        value TEXT NOT NULL,
        kind TEXT NOT NULL,
        sub_kind TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(diagram_uuid, local_id)
    );

    CREATE TABLE IF NOT EXISTS connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        diagram_uuid TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        source_local_id INTEGER NOT NULL,
        target_local_id INTEGER NOT NULL,
        source_component INTEGER NOT NULL REFERENCES components(id),
        target_component INTEGER NOT NULL REFERENCES components(id),
        exit_x REAL NOT NULL,
        exit_y REAL NOT NULL,
        entry_x REAL NOT NULL,
        entry_y REAL NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(diagram_uuid, source_local_id, target_local_id)
    );

    CREATE INDEX IF NOT EXISTS idx_connections_diagram ON connections(diagram_uuid);
";

/// SQLite-backed store rooted at one database file.
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    path: PathBuf,
}

impl SqliteGraphStore {
    /// Open (creating if needed) the database and its schema.
    ///
    /// The path must name a file: every session opens its own connection,
    /// and `:memory:` databases are private to one connection.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = connect(&path)?;
        conn.execute_batch(SCHEMA).map_err(sql)?;
        info!(path = %path.display(), "sqlite graph store ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn component_count(&self, uuid: &str) -> Result<usize, StoreError> {
        self.count("SELECT COUNT(*) FROM components WHERE diagram_uuid = ?1", uuid)
    }

    pub fn connection_count(&self, uuid: &str) -> Result<usize, StoreError> {
        self.count("SELECT COUNT(*) FROM connections WHERE diagram_uuid = ?1", uuid)
    }

    fn count(&self, query: &str, uuid: &str) -> Result<usize, StoreError> {
        let conn = connect(&self.path)?;
        let n: i64 = conn
            .query_row(query, params![uuid], |row| row.get(0))
            .map_err(sql)?;
        Ok(n as usize)
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn open_session(&self) -> Result<Box<dyn GraphSession>, StoreError> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || connect(&path))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))??;
        debug!(path = %self.path.display(), "sqlite session opened");
        Ok(Box::new(SqliteSession { conn: Some(conn) }))
    }
}

struct SqliteSession {
    conn: Option<Connection>,
}

impl SqliteSession {
    /// Run `f` against the session's connection on the blocking pool.
    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| StoreError::Unavailable("sqlite session already released".to_string()))?;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl GraphSession for SqliteSession {
    async fn merge_vertex(&mut self, element: &Element) -> Result<StoreId, StoreError> {
        let el = element.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO components (diagram_uuid, local_id, value, kind, sub_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(diagram_uuid, local_id) DO NOTHING",
                params![el.uuid, el.id, el.value, el.kind, el.sub_kind],
            )
            .map_err(sql)?;
            component_id(conn, &el.uuid, el.id)?.ok_or_else(|| {
                StoreError::Backend(format!("component {}:{} vanished after insert", el.uuid, el.id))
            })
        })
        .await
    }

    async fn merge_edge(&mut self, element: &Element) -> Result<StoreId, StoreError> {
        let (source, target) = edge_endpoints(element)?;
        let el = element.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sql)?;
            let from = component_id(&tx, &el.uuid, source)?.ok_or_else(|| StoreError::NoMatch {
                uuid: el.uuid.clone(),
                local_id: source,
            })?;
            let to = component_id(&tx, &el.uuid, target)?.ok_or_else(|| StoreError::NoMatch {
                uuid: el.uuid.clone(),
                local_id: target,
            })?;
            let link = el.link.clone().unwrap_or_default();

            tx.execute(
                "INSERT INTO connections (diagram_uuid, local_id, source_local_id, target_local_id,
                     source_component, target_component, exit_x, exit_y, entry_x, entry_y)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(diagram_uuid, source_local_id, target_local_id) DO NOTHING",
                params![
                    el.uuid,
                    el.id,
                    source,
                    target,
                    from,
                    to,
                    link.exit.x as f64,
                    link.exit.y as f64,
                    link.entry.x as f64,
                    link.entry.y as f64,
                ],
            )
            .map_err(sql)?;

            let id: StoreId = tx
                .query_row(
                    "SELECT id FROM connections
                     WHERE diagram_uuid = ?1 AND source_local_id = ?2 AND target_local_id = ?3",
                    params![el.uuid, source, target],
                    |row| row.get(0),
                )
                .map_err(sql)?;
            tx.commit().map_err(sql)?;
            Ok(id)
        })
        .await
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "sqlite connection did not close cleanly");
            }
        }
    }
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(sql)?;
    Ok(conn)
}

fn component_id(conn: &Connection, uuid: &str, local_id: u32) -> Result<Option<StoreId>, StoreError> {
    conn.query_row(
        "SELECT id FROM components WHERE diagram_uuid = ?1 AND local_id = ?2",
        params![uuid, local_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql)
}

fn sql(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}
