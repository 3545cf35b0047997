//! Storage traits — backend-agnostic interfaces for the two durable stores.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::types::{CacheEntry, EventKey, PeerKey};

/// Durable identity cache keyed by (kind, id).
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch the entry for `key`, if any.
    async fn lookup(&self, key: PeerKey) -> Result<Option<CacheEntry>, DatabaseError>;

    /// Insert or update an entry. The original `created_at` is kept on update.
    async fn store(&self, entry: &CacheEntry) -> Result<(), DatabaseError>;

    /// Insert only if no entry exists for the key. Returns whether a row was written.
    async fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, DatabaseError>;

    /// Number of cached identities.
    async fn count(&self) -> Result<u64, DatabaseError>;
}

/// Durable record of the transport's resume position, plus the most recently
/// processed messages for the redelivery guard.
#[async_trait]
pub trait ResumeLedger: Send + Sync {
    /// Next offset to request from the transport, if one was recorded.
    async fn load_offset(&self) -> Result<Option<i64>, DatabaseError>;

    /// Record a new resume offset and/or a processed message in one write.
    ///
    /// The offset never moves backwards. Only the newest `keep` processed
    /// messages are retained; `keep == 0` records none.
    async fn commit(
        &self,
        offset: Option<i64>,
        processed: Option<EventKey>,
        keep: usize,
    ) -> Result<(), DatabaseError>;

    /// Up to `limit` most recently processed messages, oldest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<EventKey>, DatabaseError>;
}
