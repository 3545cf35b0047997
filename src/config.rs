//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default classification model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Watcher configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Telegram Bot API token.
    pub bot_token: SecretString,
    /// OpenAI API key for the classifier.
    pub openai_api_key: SecretString,
    /// Handle of the notification recipient (leading `@` optional).
    pub admin_username: String,
    /// Classification model identifier.
    pub model: String,
    /// Root directory for per-account session state.
    pub session_root: PathBuf,
    /// Maximum number of events classified/delivered concurrently.
    pub max_in_flight: usize,
    /// Governor settings for outbound Telegram calls.
    pub rate: RateConfig,
    /// Size of the recent-processed set; 0 disables the redelivery guard.
    pub dedup_window: usize,
    /// Chats to pull into the entity cache at startup.
    pub sync_chat_ids: Vec<i64>,
    /// Long-poll timeout for `getUpdates`.
    pub poll_timeout: Duration,
}

/// Token bucket and flood-wait settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    /// One token is added every `interval`.
    pub interval: Duration,
    /// Bucket capacity.
    pub burst: u32,
    /// How many flood waits a single call sits out before giving up.
    pub max_flood_retries: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            burst: 5,
            max_flood_retries: 5,
        }
    }
}

impl WatchConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| ConfigError::MissingRequired {
            key: "TELEGRAM_BOT_TOKEN".into(),
            hint: "Create a bot with @BotFather and export its token".into(),
        })?;
        let openai_api_key = get("OPENAI_API_KEY").ok_or_else(|| ConfigError::MissingRequired {
            key: "OPENAI_API_KEY".into(),
            hint: "export OPENAI_API_KEY=sk-...".into(),
        })?;
        let admin_username = get("ADMIN_USERNAME").ok_or_else(|| ConfigError::MissingRequired {
            key: "ADMIN_USERNAME".into(),
            hint: "e.g. ADMIN_USERNAME=@someone".into(),
        })?;

        let model = get("LEAD_WATCH_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let session_root = get("LEAD_WATCH_SESSION_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("session"));

        let max_in_flight: usize = parse_or(&get, "LEAD_WATCH_MAX_IN_FLIGHT", 16)?;
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_WATCH_MAX_IN_FLIGHT".into(),
                message: "must be at least 1".into(),
            });
        }

        let defaults = RateConfig::default();
        let interval_ms: u64 = parse_or(
            &get,
            "LEAD_WATCH_RATE_INTERVAL_MS",
            defaults.interval.as_millis() as u64,
        )?;
        let burst: u32 = parse_or(&get, "LEAD_WATCH_RATE_BURST", defaults.burst)?;
        if burst == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_WATCH_RATE_BURST".into(),
                message: "must be at least 1".into(),
            });
        }

        let dedup_window: usize = parse_or(&get, "LEAD_WATCH_DEDUP_WINDOW", 0)?;
        let poll_timeout_secs: u64 = parse_or(&get, "LEAD_WATCH_POLL_TIMEOUT_SECS", 30)?;

        let sync_chat_ids = match get("LEAD_WATCH_SYNC_CHAT_IDS") {
            Some(raw) => parse_id_list(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            openai_api_key: SecretString::from(openai_api_key),
            admin_username,
            model,
            session_root,
            max_in_flight,
            rate: RateConfig {
                interval: Duration::from_millis(interval_ms),
                burst,
                max_flood_retries: defaults.max_flood_retries,
            },
            dedup_window,
            sync_chat_ids,
            poll_timeout: Duration::from_secs(poll_timeout_secs),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: "LEAD_WATCH_SYNC_CHAT_IDS".into(),
                message: format!("{s}: {e}"),
            })
        })
        .collect()
}

/// Session folder name for an account identifier: `bot-` plus its digits.
///
/// `"+1 (234) 567"` and `"1234567"` map to the same folder, so re-running
/// against the same account reuses prior state.
pub fn session_folder(identifier: &str) -> String {
    let digits: String = identifier.chars().filter(char::is_ascii_digit).collect();
    format!("bot-{digits}")
}

/// Account identifier embedded in a bot token (the part before `:`).
pub fn account_identifier(bot_token: &str) -> &str {
    bot_token.split(':').next().unwrap_or_default()
}
