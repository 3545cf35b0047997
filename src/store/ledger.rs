//! Resume ledger backed by the `update_state` and `recent_events` tables.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::params;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::types::{EventKey, PeerKey, PeerKind};
use crate::store::libsql_backend::LibSqlBackend;
use crate::store::migrations::LEDGER_MIGRATIONS;
use crate::store::traits::ResumeLedger;

const OFFSET_KEY: &str = "update_offset";

/// libSQL implementation of [`ResumeLedger`].
pub struct LibSqlLedger {
    backend: LibSqlBackend,
    /// Serializes commit batches on the shared connection.
    write: Mutex<()>,
}

impl LibSqlLedger {
    /// Open (or create) the ledger database at `path`.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            backend: LibSqlBackend::new_local(path, LEDGER_MIGRATIONS).await?,
            write: Mutex::new(()),
        })
    }

    /// In-memory ledger (for tests).
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self {
            backend: LibSqlBackend::new_memory(LEDGER_MIGRATIONS).await?,
            write: Mutex::new(()),
        })
    }
}

/// Statements for one commit, wrapped in a single transaction.
///
/// Every interpolated value is an integer or a fixed identifier.
fn commit_batch(
    offset: Option<i64>,
    processed: Option<EventKey>,
    keep: usize,
    now: &str,
) -> Option<String> {
    let mut stmts = Vec::new();

    if let Some((peer, message_id)) = processed.filter(|_| keep > 0) {
        stmts.push(format!(
            "INSERT OR IGNORE INTO recent_events (peer_kind, peer_id, message_id, recorded_at)
             VALUES ('{}', {}, {}, '{now}');",
            peer.kind.as_str(),
            peer.id,
            message_id
        ));
        stmts.push(format!(
            "DELETE FROM recent_events WHERE seq NOT IN
                (SELECT seq FROM recent_events ORDER BY seq DESC LIMIT {keep});"
        ));
    }

    if let Some(offset) = offset {
        stmts.push(format!(
            "INSERT INTO update_state (key, value, updated_at) VALUES ('{OFFSET_KEY}', {offset}, '{now}')
             ON CONFLICT (key) DO UPDATE SET
                value = MAX(update_state.value, excluded.value),
                updated_at = excluded.updated_at;"
        ));
    }

    if stmts.is_empty() {
        return None;
    }
    Some(format!("BEGIN;\n{}\nCOMMIT;", stmts.join("\n")))
}

#[async_trait]
impl ResumeLedger for LibSqlLedger {
    async fn load_offset(&self) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT value FROM update_state WHERE key = ?1",
                params![OFFSET_KEY],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_offset: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let offset: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_offset: {e}")))?;
                Ok(Some(offset))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_offset: {e}"))),
        }
    }

    async fn commit(
        &self,
        offset: Option<i64>,
        processed: Option<EventKey>,
        keep: usize,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let Some(batch) = commit_batch(offset, processed, keep, &now) else {
            return Ok(());
        };

        let _guard = self.write.lock().await;
        if let Err(e) = self.backend.conn().execute_batch(&batch).await {
            // Leave the connection usable for the next commit.
            let _ = self.backend.conn().execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Query(format!("commit: {e}")));
        }

        debug!(offset = ?offset, processed = ?processed, "Ledger committed");
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventKey>, DatabaseError> {
        let query_err = |e: libsql::Error| DatabaseError::Query(format!("recent_events: {e}"));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT peer_kind, peer_id, message_id FROM recent_events
                 ORDER BY seq DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(query_err)?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let kind: String = row.get(0).map_err(query_err)?;
            let kind = PeerKind::parse(&kind)
                .ok_or_else(|| DatabaseError::Query(format!("unknown peer kind {kind:?}")))?;
            let peer_id: i64 = row.get(1).map_err(query_err)?;
            let message_id: i64 = row.get(2).map_err(query_err)?;
            keys.push((PeerKey::new(kind, peer_id), message_id));
        }
        keys.reverse();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(message_id: i64) -> EventKey {
        (PeerKey::new(PeerKind::Group, -1001), message_id)
    }

    #[tokio::test]
    async fn empty_ledger_has_no_offset() {
        let ledger = LibSqlLedger::in_memory().await.unwrap();
        assert_eq!(ledger.load_offset().await.unwrap(), None);
        assert!(ledger.recent_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_then_load() {
        let ledger = LibSqlLedger::in_memory().await.unwrap();
        ledger.commit(Some(101), None, 0).await.unwrap();
        ledger.commit(Some(102), None, 0).await.unwrap();
        assert_eq!(ledger.load_offset().await.unwrap(), Some(102));
    }

    #[tokio::test]
    async fn offset_never_moves_backwards() {
        let ledger = LibSqlLedger::in_memory().await.unwrap();
        ledger.commit(Some(50), None, 0).await.unwrap();
        ledger.commit(Some(20), None, 0).await.unwrap();
        assert_eq!(ledger.load_offset().await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn processed_keys_are_bounded_and_ordered() {
        let ledger = LibSqlLedger::in_memory().await.unwrap();
        for id in 1..=5 {
            ledger.commit(None, Some(key(id)), 3).await.unwrap();
        }
        // Re-recording a kept key does not reorder or duplicate it.
        ledger.commit(None, Some(key(4)), 3).await.unwrap();

        assert_eq!(
            ledger.recent_events(10).await.unwrap(),
            vec![key(3), key(4), key(5)]
        );
        assert_eq!(ledger.recent_events(2).await.unwrap(), vec![key(4), key(5)]);
        assert_eq!(ledger.load_offset().await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_keep_records_no_keys() {
        let ledger = LibSqlLedger::in_memory().await.unwrap();
        ledger.commit(Some(8), Some(key(1)), 0).await.unwrap();
        assert!(ledger.recent_events(10).await.unwrap().is_empty());
        assert_eq!(ledger.load_offset().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn offset_and_keys_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("updates.db");
        {
            let ledger = LibSqlLedger::open(&path).await.unwrap();
            ledger.commit(Some(777), Some(key(42)), 16).await.unwrap();
        }
        let ledger = LibSqlLedger::open(&path).await.unwrap();
        assert_eq!(ledger.load_offset().await.unwrap(), Some(777));
        assert_eq!(ledger.recent_events(16).await.unwrap(), vec![key(42)]);
    }

    #[test]
    fn nothing_to_write_yields_no_batch() {
        assert!(commit_batch(None, None, 8, "now").is_none());
        assert!(commit_batch(None, Some(key(1)), 0, "now").is_none());
        let batch = commit_batch(Some(3), Some(key(1)), 8, "now").unwrap();
        assert!(batch.starts_with("BEGIN;"));
        assert!(batch.ends_with("COMMIT;"));
        assert!(batch.contains("'group', -1001, 1"));
    }
}
