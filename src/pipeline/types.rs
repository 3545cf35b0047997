//! Shared types for the update-processing pipeline.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ChannelError, ResolveError};

/// Current cache entry schema version.
pub const CACHE_SCHEMA_VERSION: i64 = 1;

/// Display label used when an identity has no known handle.
pub const UNKNOWN_HANDLE: &str = "unknown";

// ── Identity ────────────────────────────────────────────────────────

/// Kind of a stream identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    User,
    Group,
    Channel,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// Composite cache key: one entry per (kind, id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey {
    pub kind: PeerKind,
    pub id: i64,
}

impl PeerKey {
    pub fn new(kind: PeerKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn user(id: i64) -> Self {
        Self::new(PeerKind::User, id)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Identity of one stream message: the chat it arrived in and its id there.
pub type EventKey = (PeerKey, i64);

// ── Stream event ────────────────────────────────────────────────────

/// One inbound "new message" notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Chat the message was posted in.
    pub peer: PeerKey,
    /// Message id, unique within `peer`.
    pub message_id: i64,
    /// Message text (empty for media-only messages).
    pub text: String,
    /// True if this process sent the message itself.
    pub outbound: bool,
    /// Author; differs from `peer` in groups, absent for channel posts.
    pub sender: Option<PeerKey>,
    /// Handle of the author as observed on the wire, without `@`.
    pub sender_handle: Option<String>,
}

impl StreamEvent {
    /// Structurally irrelevant events are dropped before any I/O.
    pub fn is_structurally_irrelevant(&self) -> bool {
        self.text.is_empty() || self.outbound
    }

    pub fn key(&self) -> EventKey {
        (self.peer, self.message_id)
    }

    /// Identity used for cache lookups and the notification body.
    pub fn author_key(&self) -> PeerKey {
        self.sender.unwrap_or(self.peer)
    }

    /// Numeric user id of the author, 0 when the author is not a user.
    pub fn sender_user_id(&self) -> i64 {
        match self.sender {
            Some(PeerKey {
                kind: PeerKind::User,
                id,
            }) => id,
            _ => 0,
        }
    }

    /// Short stable digest of the text for log correlation.
    pub fn text_hash(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.text.as_bytes()));
        digest[..12].to_string()
    }
}

// ── Cache entry ─────────────────────────────────────────────────────

/// Cached metadata for a previously observed or synced identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: PeerKey,
    /// Handle without the leading `@`.
    pub handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl CacheEntry {
    pub fn new(key: PeerKey, handle: Option<String>) -> Self {
        Self {
            key,
            handle: handle.filter(|h| !h.is_empty()),
            created_at: Utc::now(),
            version: CACHE_SCHEMA_VERSION,
        }
    }

    /// Best-effort entry built from what the event itself carries.
    pub fn placeholder(event: &StreamEvent) -> Self {
        Self::new(event.author_key(), event.sender_handle.clone())
    }

    /// `@handle`, or `unknown` when no handle is cached.
    pub fn display_handle(&self) -> String {
        match &self.handle {
            Some(h) => format!("@{h}"),
            None => UNKNOWN_HANDLE.to_string(),
        }
    }
}

// ── Verdict & notification ──────────────────────────────────────────

/// Result of classifying one event's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationVerdict {
    pub relevant: bool,
    pub text: String,
}

/// Concrete address a notification can be delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverableAddress {
    pub chat_id: i64,
}

/// A composed notification, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub address: DeliverableAddress,
    pub body: String,
}

// ── Seams ───────────────────────────────────────────────────────────

/// Relevance classification of message text.
///
/// Implementations never fail: any backend problem is logged and
/// reported as "not relevant".
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> bool;
}

/// Resolves a human-readable handle to a deliverable address.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(&self, handle: &str) -> Result<DeliverableAddress, ResolveError>;
}

/// Sends plain text to an address on the messaging network.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, address: &DeliverableAddress, text: &str) -> Result<(), ChannelError>;
}

/// Strip an optional leading `@` from a handle.
pub fn trim_at(handle: &str) -> &str {
    handle.strip_prefix('@').unwrap_or(handle)
}
