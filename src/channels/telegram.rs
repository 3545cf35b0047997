//! Telegram Bot API client.
//!
//! Every call goes through the shared [`Governor`]. A `429` answer carrying
//! `retry_after` becomes [`ChannelError::RateLimited`], which the governor
//! turns into a suspension window before re-issuing the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::channels::UpdateSource;
use crate::error::{ChannelError, ResolveError};
use crate::governor::Governor;
use crate::pipeline::cache::KnownContact;
use crate::pipeline::types::{
    DeliverableAddress, MessageSender, PeerKey, PeerKind, RecipientResolver, trim_at,
};

const CHANNEL_NAME: &str = "telegram";

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Maximum message length for Telegram's sendMessage API, in UTF-16 code units.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Headroom on top of the long-poll timeout before the HTTP request gives up.
const HTTP_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub username: Option<String>,
}

impl Chat {
    pub fn peer_kind(&self) -> PeerKind {
        match self.kind.as_str() {
            "private" => PeerKind::User,
            "channel" => PeerKind::Channel,
            _ => PeerKind::Group,
        }
    }

    pub fn peer_key(&self) -> PeerKey {
        PeerKey::new(self.peer_kind(), self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub sender_chat: Option<Chat>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

/// Decode a Bot API envelope, mapping failures to [`ChannelError`].
fn decode<T: DeserializeOwned>(method: &str, status: u16, body: &str) -> Result<T, ChannelError> {
    let envelope: ApiResponse<T> = serde_json::from_str(body).map_err(|e| {
        ChannelError::InvalidResponse(format!("{method}: HTTP {status}: {e}"))
    })?;

    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| ChannelError::InvalidResponse(format!("{method}: ok without result")));
    }

    let code = envelope.error_code.unwrap_or(i64::from(status));
    let retry_after = envelope.parameters.and_then(|p| p.retry_after);
    if code == 429 || retry_after.is_some() {
        return Err(ChannelError::RateLimited {
            name: CHANNEL_NAME.into(),
            retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
        });
    }

    Err(ChannelError::Api {
        name: CHANNEL_NAME.into(),
        code,
        description: envelope.description.unwrap_or_default(),
    })
}

// ── Client ──────────────────────────────────────────────────────────

/// Bot API client shared by the poller, resolver and dispatcher.
pub struct TelegramClient {
    bot_token: SecretString,
    api_base: String,
    http: reqwest::Client,
    governor: Arc<Governor>,
    poll_timeout: Duration,
}

impl TelegramClient {
    pub fn new(bot_token: SecretString, governor: Arc<Governor>, poll_timeout: Duration) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            http: reqwest::Client::new(),
            governor,
            poll_timeout,
        }
    }

    /// Point the client at another Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    async fn request_once<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, ChannelError> {
        let resp = self
            .http
            .post(self.api_url(method))
            .timeout(self.poll_timeout + HTTP_TIMEOUT_MARGIN)
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {}", e.without_url())))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {}", e.without_url())))?;

        decode(method, status, &text)
    }

    /// Issue `method` under the governor.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ChannelError> {
        let body = &body;
        self.governor
            .call(method, || self.request_once(method, body))
            .await
    }

    /// Verify the token with `getMe` and return the bot's user id.
    pub async fn authenticate(&self) -> Result<i64, ChannelError> {
        let me: User = self
            .call("getMe", serde_json::json!({}))
            .await
            .map_err(|e| match e {
                ChannelError::Api { code, description, .. } => ChannelError::AuthFailed {
                    name: CHANNEL_NAME.into(),
                    reason: format!("getMe returned {code}: {description}"),
                },
                other => other,
            })?;

        info!(bot_id = me.id, username = ?me.username, "Authenticated with Telegram");
        Ok(me.id)
    }

    /// Look up a chat by numeric id or `@username`.
    pub async fn get_chat(&self, chat_id: serde_json::Value) -> Result<Chat, ChannelError> {
        self.call("getChat", serde_json::json!({ "chat_id": chat_id }))
            .await
    }

    /// Send a plain-text message, split to fit Telegram's length limit.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let _: Message = self
                .call(
                    "sendMessage",
                    serde_json::json!({ "chat_id": chat_id, "text": chunk }),
                )
                .await
                .map_err(|e| match e {
                    ChannelError::Api { description, .. } => ChannelError::SendFailed {
                        name: CHANNEL_NAME.into(),
                        reason: description,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    /// Contacts for the startup sync: one `getChat` per listed chat id.
    pub fn known_contacts<'a>(
        &'a self,
        chat_ids: &'a [i64],
    ) -> impl Stream<Item = Result<KnownContact, ChannelError>> + 'a {
        futures::stream::iter(chat_ids.iter().copied()).then(move |id| async move {
            let chat = self.get_chat(serde_json::Value::from(id)).await?;
            debug!(chat_id = id, kind = %chat.kind, "Loaded contact");
            Ok::<_, ChannelError>(KnownContact {
                key: chat.peer_key(),
                handle: chat.username,
            })
        })
    }
}

#[async_trait]
impl UpdateSource for TelegramClient {
    /// Long-poll `getUpdates` starting at `offset`.
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, ChannelError> {
        let mut body = serde_json::json!({
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = serde_json::Value::from(offset);
        }
        self.call("getUpdates", body).await
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send_text(&self, address: &DeliverableAddress, text: &str) -> Result<(), ChannelError> {
        self.send_message(address.chat_id, text).await
    }
}

#[async_trait]
impl RecipientResolver for TelegramClient {
    async fn resolve(&self, handle: &str) -> Result<DeliverableAddress, ResolveError> {
        let handle = trim_at(handle);
        if handle.is_empty() {
            return Err(ResolveError::NotFound {
                handle: handle.to_string(),
            });
        }

        let chat = match self.get_chat(serde_json::Value::from(format!("@{handle}"))).await {
            Ok(chat) => chat,
            Err(ChannelError::Api { code: 400, .. }) => {
                return Err(ResolveError::NotFound {
                    handle: handle.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if chat.peer_kind() != PeerKind::User {
            debug!(handle, kind = %chat.kind, "Handle resolves to a non-user chat");
            return Err(ResolveError::NotFound {
                handle: handle.to_string(),
            });
        }

        Ok(DeliverableAddress { chat_id: chat.id })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Split a message into chunks of at most `max_units` UTF-16 code units.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_units: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        let Some(limit) = utf16_limit(remaining, max_units) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

/// Byte index of the first char that takes `s` past `max_units` UTF-16
/// code units, or `None` if all of `s` fits.
fn utf16_limit(s: &str, max_units: usize) -> Option<usize> {
    let mut units = 0;
    for (i, c) in s.char_indices() {
        units += c.len_utf16();
        if units > max_units {
            // A single char wider than the limit still forms its own chunk.
            return Some(if i == 0 { c.len_utf8() } else { i });
        }
    }
    None
}

// ── Tests ───────────────────────────────────────────────────────────
