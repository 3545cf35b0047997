//! Version-tracked database migrations for the libSQL stores.
//!
//! Each store has its own ordered list of migrations. `run_migrations()`
//! checks the current version recorded in `_migrations` and applies only the
//! newer ones, each inside a transaction together with its version row.

use libsql::Connection;
use tracing::info;

use crate::error::DatabaseError;

/// A single migration step.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Entity cache schema. Add new versions to the end.
pub static PEER_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "peers",
    sql: r#"
        CREATE TABLE IF NOT EXISTS peers (
            kind TEXT NOT NULL,
            id INTEGER NOT NULL,
            handle TEXT,
            created_at TEXT NOT NULL,
            version INTEGER NOT NULL,
            PRIMARY KEY (kind, id)
        );
    "#,
}];

/// Resume ledger schema. Add new versions to the end.
pub static LEDGER_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "update_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS update_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "recent_events",
        sql: r#"
            CREATE TABLE IF NOT EXISTS recent_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_kind TEXT NOT NULL,
                peer_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                UNIQUE (peer_kind, peer_id, message_id)
            );
        "#,
    },
];

/// Apply every migration in `schema` newer than the recorded version.
pub async fn run_migrations(conn: &Connection, schema: &[Migration]) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in schema.iter().filter(|m| m.version > current_version) {
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        conn.execute_batch(&batch).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn peer_schema_creates_table() {
        let conn = test_conn().await;
        run_migrations(&conn, PEER_MIGRATIONS).await.unwrap();
        assert!(table_exists(&conn, "peers").await);
        assert!(!table_exists(&conn, "update_state").await);
    }

    #[tokio::test]
    async fn ledger_schema_creates_table() {
        let conn = test_conn().await;
        run_migrations(&conn, LEDGER_MIGRATIONS).await.unwrap();
        assert!(table_exists(&conn, "update_state").await);
        assert!(table_exists(&conn, "recent_events").await);
        assert!(!table_exists(&conn, "peers").await);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn, PEER_MIGRATIONS).await.unwrap();
        run_migrations(&conn, PEER_MIGRATIONS).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn ledger_upgrade_applies_only_new_steps() {
        let conn = test_conn().await;
        run_migrations(&conn, &LEDGER_MIGRATIONS[..1]).await.unwrap();
        assert!(!table_exists(&conn, "recent_events").await);

        run_migrations(&conn, LEDGER_MIGRATIONS).await.unwrap();
        assert!(table_exists(&conn, "recent_events").await);
        assert_eq!(get_current_version(&conn).await.unwrap(), 2);
    }
}
