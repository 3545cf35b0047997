//! libSQL connection wrapper shared by the peer store and the ledger.
//!
//! Supports local file and in-memory databases. Each instance runs its own
//! migration set on open.

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};
use tracing::info;

use crate::error::DatabaseError;
use crate::store::migrations::{self, Migration};

/// libSQL database handle.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run `schema`.
    pub async fn new_local(path: &Path, schema: &[Migration]) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db, schema).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(schema: &[Migration]) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db, schema).await
    }

    async fn from_database(db: LibSqlDatabase, schema: &[Migration]) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn, schema).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Convert `Option<&str>` to libsql Value.
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}
