//! Error types for lead-watch.

use std::time::Duration;

/// Top-level error type for the watcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Messaging-network errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}, retry after {retry_after:?}")]
    RateLimited { name: String, retry_after: Duration },

    #[error("Channel {name} API error {code}: {description}")]
    Api {
        name: String,
        code: i64,
        description: String,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ChannelError {
    /// Flood-wait duration carried by this error, if it is a rate-limit signal.
    pub fn flood_wait(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Recipient resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Recipient {handle} not found")]
    NotFound { handle: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Result type alias for the watcher.
pub type Result<T> = std::result::Result<T, Error>;
