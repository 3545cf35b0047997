//! Entity cache — fail-open wrapper over the durable peer store.
//!
//! Storage errors during steady state are logged and reported as a miss, so
//! the pipeline keeps going with placeholder metadata.

use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::pipeline::types::{CACHE_SCHEMA_VERSION, CacheEntry, PeerKey};
use crate::store::EntityStore;

/// A contact listed by the transport during the startup sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownContact {
    pub key: PeerKey,
    pub handle: Option<String>,
}

/// Outcome counts of a bulk sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub inserted: usize,
    pub already_present: usize,
    pub failed: usize,
}

pub struct EntityCache {
    store: Arc<dyn EntityStore>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Cached entry for `key`; `None` on a miss or a storage error.
    pub async fn lookup(&self, key: PeerKey) -> Option<CacheEntry> {
        match self.store.lookup(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Upsert `entry`. Errors are logged; returns whether the write succeeded.
    pub async fn store(&self, entry: &CacheEntry) -> bool {
        match self.store.store(entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Cache write failed");
                false
            }
        }
    }

    /// Insert every listed contact that is not cached yet.
    ///
    /// Entries already present (e.g. from live observation) are left alone.
    /// Individual failures, from the listing or the store, are logged and
    /// skipped.
    pub async fn bulk_sync<S>(&self, contacts: S) -> SyncSummary
    where
        S: Stream<Item = Result<KnownContact, ChannelError>>,
    {
        let synced_at = Utc::now();
        let mut summary = SyncSummary::default();
        let mut contacts = std::pin::pin!(contacts);

        while let Some(item) = contacts.next().await {
            let contact = match item {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "Skipping contact that failed to load");
                    summary.failed += 1;
                    continue;
                }
            };

            let entry = CacheEntry {
                key: contact.key,
                handle: contact.handle.filter(|h| !h.is_empty()),
                created_at: synced_at,
                version: CACHE_SCHEMA_VERSION,
            };

            match self.store.insert_if_absent(&entry).await {
                Ok(true) => {
                    debug!(key = %entry.key, "Synced contact");
                    summary.inserted += 1;
                }
                Ok(false) => summary.already_present += 1,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "Failed to store synced contact");
                    summary.failed += 1;
                }
            }
        }

        info!(
            inserted = summary.inserted,
            already_present = summary.already_present,
            failed = summary.failed,
            "Contact sync complete"
        );
        summary
    }
}
