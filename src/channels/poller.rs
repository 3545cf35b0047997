//! Update poller — the stream session's intake loop.
//!
//! Long-polls the [`UpdateSource`] from the low watermark kept by the
//! [`ProgressTracker`] and hands each new message to the [`UpdateHandler`]
//! together with its [`Ack`]. Updates still in flight are served again by
//! the source and skipped. A crash may re-deliver an update whose work had
//! already run, never skip one.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::progress::{Ack, ProgressTracker};
use crate::channels::telegram::Update;
use crate::channels::{UpdateHandler, UpdateSource};
use crate::error::ChannelError;
use crate::pipeline::types::{PeerKey, StreamEvent};

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Longest wait for an in-flight update when a poll returned nothing new.
const STALL_RECHECK: Duration = Duration::from_secs(1);
/// Convert a Bot API update into a stream event.
///
/// Returns `None` for updates that carry no message. Messages posted on
/// behalf of a chat (anonymous admins, linked channels) are attributed to
/// that chat rather than to the placeholder bot in `from`.
pub fn to_stream_event(update: Update, self_id: i64) -> Option<StreamEvent> {
    let message = update.message?;

    let (sender, sender_handle) = match (&message.sender_chat, &message.from) {
        (Some(chat), _) => (Some(chat.peer_key()), chat.username.clone()),
        (None, Some(user)) => (Some(PeerKey::user(user.id)), user.username.clone()),
        (None, None) => (None, None),
    };
    let outbound = message.from.as_ref().is_some_and(|u| u.id == self_id);

    Some(StreamEvent {
        peer: message.chat.peer_key(),
        message_id: message.message_id,
        text: message.text.unwrap_or_default(),
        outbound,
        sender,
        sender_handle,
    })
}

/// Errors after which polling cannot make progress.
fn is_fatal(err: &ChannelError) -> bool {
    match err {
        ChannelError::AuthFailed { .. } => true,
        // 401/404: token revoked; 409: webhook set or another poller running.
        ChannelError::Api { code, .. } => matches!(code, 401 | 404 | 409),
        _ => false,
    }
}

pub struct UpdatePoller {
    source: Arc<dyn UpdateSource>,
    progress: Arc<ProgressTracker>,
    self_id: i64,
}

impl UpdatePoller {
    pub fn new(source: Arc<dyn UpdateSource>, progress: Arc<ProgressTracker>, self_id: i64) -> Self {
        Self {
            source,
            progress,
            self_id,
        }
    }

    /// Poll until `cancel` fires or a fatal transport error occurs.
    pub async fn run(
        &self,
        handler: Arc<dyn UpdateHandler>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        info!(
            offset = ?self.progress.next_offset(),
            bot_id = self.self_id,
            "Listening for updates"
        );

        loop {
            let offset = self.progress.next_offset();
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.source.get_updates(offset) => polled,
            };

            let updates = match polled {
                Ok(updates) => updates,
                Err(e) if is_fatal(&e) => {
                    error!(error = %e, "Update polling failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Update polling failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let batch = updates.len();
            let mut fresh = 0;
            for update in updates {
                if cancel.is_cancelled() {
                    break;
                }
                if !self.progress.is_new(update.update_id) {
                    continue;
                }
                fresh += 1;
                self.dispatch(update, handler.as_ref()).await;
            }
            if batch > 0 {
                debug!(count = batch, fresh, "Received updates");
            }

            if batch > 0 && fresh == 0 {
                // Only in-flight updates came back; wait for one to finish.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = self.progress.changed() => {}
                    _ = tokio::time::sleep(STALL_RECHECK) => {}
                }
            }
        }

        info!(
            offset = ?self.progress.next_offset(),
            pending = self.progress.pending(),
            "Update polling stopped"
        );
        Ok(())
    }

    async fn dispatch(&self, update: Update, handler: &dyn UpdateHandler) {
        let ack: Ack = self.progress.begin(update.update_id);
        match to_stream_event(update, self.self_id) {
            Some(event) => handler.on_new_message(event, ack).await,
            None => ack.complete(None).await,
        }
    }
}
