//! Entity cache backed by the `peers` table.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::types::{CacheEntry, PeerKey, PeerKind};
use crate::store::libsql_backend::{LibSqlBackend, opt_text};
use crate::store::migrations::PEER_MIGRATIONS;
use crate::store::traits::EntityStore;

/// libSQL implementation of [`EntityStore`].
pub struct LibSqlPeerStore {
    backend: LibSqlBackend,
}

impl LibSqlPeerStore {
    /// Open (or create) the peer database at `path`.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            backend: LibSqlBackend::new_local(path, PEER_MIGRATIONS).await?,
        })
    }

    /// In-memory peer store (for tests).
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self {
            backend: LibSqlBackend::new_memory(PEER_MIGRATIONS).await?,
        })
    }
}

/// Parse an RFC 3339 timestamp, falling back to the epoch on garbage.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Column order: 0:kind, 1:id, 2:handle, 3:created_at, 4:version
fn row_to_entry(row: &libsql::Row) -> Result<CacheEntry, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let kind: String = row.get(0).map_err(parse)?;
    let kind = PeerKind::parse(&kind)
        .ok_or_else(|| DatabaseError::Query(format!("unknown peer kind {kind:?}")))?;
    let id: i64 = row.get(1).map_err(parse)?;
    let handle: Option<String> = row.get(2).ok();
    let created_at: String = row.get(3).map_err(parse)?;
    let version: i64 = row.get(4).map_err(parse)?;

    Ok(CacheEntry {
        key: PeerKey::new(kind, id),
        handle,
        created_at: parse_datetime(&created_at),
        version,
    })
}

#[async_trait]
impl EntityStore for LibSqlPeerStore {
    async fn lookup(&self, key: PeerKey) -> Result<Option<CacheEntry>, DatabaseError> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT kind, id, handle, created_at, version FROM peers WHERE kind = ?1 AND id = ?2",
                params![key.kind.as_str(), key.id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("lookup: {e}"))),
        }
    }

    async fn store(&self, entry: &CacheEntry) -> Result<(), DatabaseError> {
        self.backend
            .conn()
            .execute(
                "INSERT INTO peers (kind, id, handle, created_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (kind, id) DO UPDATE SET
                    handle = excluded.handle,
                    version = excluded.version",
                params![
                    entry.key.kind.as_str(),
                    entry.key.id,
                    opt_text(entry.handle.as_deref()),
                    entry.created_at.to_rfc3339(),
                    entry.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store: {e}")))?;

        debug!(key = %entry.key, "Peer stored");
        Ok(())
    }

    async fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, DatabaseError> {
        let changed = self
            .backend
            .conn()
            .execute(
                "INSERT OR IGNORE INTO peers (kind, id, handle, created_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.key.kind.as_str(),
                    entry.key.id,
                    opt_text(entry.handle.as_deref()),
                    entry.created_at.to_rfc3339(),
                    entry.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_if_absent: {e}")))?;

        Ok(changed > 0)
    }

    async fn count(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .backend
            .conn()
            .query("SELECT COUNT(*) FROM peers", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
                Ok(n.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::CACHE_SCHEMA_VERSION;

    async fn test_store() -> LibSqlPeerStore {
        LibSqlPeerStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let store = test_store().await;
        let entry = CacheEntry::new(PeerKey::user(42), Some("alice".into()));

        store.store(&entry).await.unwrap();

        let fetched = store.lookup(PeerKey::user(42)).await.unwrap().unwrap();
        assert_eq!(fetched.key, entry.key);
        assert_eq!(fetched.handle.as_deref(), Some("alice"));
        assert_eq!(fetched.version, CACHE_SCHEMA_VERSION);
        assert_eq!(fetched.created_at.timestamp(), entry.created_at.timestamp());
    }

    #[tokio::test]
    async fn lookup_missing_returns_none() {
        let store = test_store().await;
        assert!(store.lookup(PeerKey::user(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_includes_kind() {
        let store = test_store().await;
        store
            .store(&CacheEntry::new(PeerKey::user(7), Some("user7".into())))
            .await
            .unwrap();

        let channel = PeerKey::new(PeerKind::Channel, 7);
        assert!(store.lookup(channel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_is_idempotent_and_upserts() {
        let store = test_store().await;
        let first = CacheEntry::new(PeerKey::user(5), None);
        store.store(&first).await.unwrap();
        store.store(&first).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let mut renamed = first.clone();
        renamed.handle = Some("bob".into());
        renamed.created_at = Utc::now() + chrono::Duration::days(1);
        store.store(&renamed).await.unwrap();

        let fetched = store.lookup(PeerKey::user(5)).await.unwrap().unwrap();
        assert_eq!(fetched.handle.as_deref(), Some("bob"));
        // Creation time belongs to the first observation.
        assert_eq!(fetched.created_at.timestamp(), first.created_at.timestamp());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_if_absent_does_not_overwrite() {
        let store = test_store().await;
        let live = CacheEntry::new(PeerKey::user(9), Some("live".into()));
        store.store(&live).await.unwrap();

        let synced = CacheEntry::new(PeerKey::user(9), Some("synced".into()));
        assert!(!store.insert_if_absent(&synced).await.unwrap());

        let fetched = store.lookup(PeerKey::user(9)).await.unwrap().unwrap();
        assert_eq!(fetched.handle.as_deref(), Some("live"));

        let fresh = CacheEntry::new(PeerKey::user(10), None);
        assert!(store.insert_if_absent(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn reopen_keeps_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.db");
        {
            let store = LibSqlPeerStore::open(&path).await.unwrap();
            store
                .store(&CacheEntry::new(PeerKey::user(3), Some("carol".into())))
                .await
                .unwrap();
        }
        let store = LibSqlPeerStore::open(&path).await.unwrap();
        let fetched = store.lookup(PeerKey::user(3)).await.unwrap().unwrap();
        assert_eq!(fetched.handle.as_deref(), Some("carol"));
    }

    #[test]
    fn parse_datetime_falls_back() {
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
