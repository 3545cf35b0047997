//! Notification dispatcher — formats a match and sends it to the recipient.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::ChannelError;
use crate::pipeline::types::{CacheEntry, DeliverableAddress, MessageSender, NotificationRecord, StreamEvent};

/// Build the summary sent to the recipient for a relevant message.
pub fn format_summary(event: &StreamEvent, author: &CacheEntry) -> String {
    format!(
        "🔍 Найден запрос на разработку!\n\n👤 {} (ID: {})\n\n💬 {}",
        author.display_handle(),
        event.sender_user_id(),
        event.text,
    )
}

/// Delivers summaries through a [`MessageSender`].
pub struct Dispatcher {
    sender: Arc<dyn MessageSender>,
}

impl Dispatcher {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    /// Compose the notification for `event`.
    pub fn compose(
        &self,
        address: DeliverableAddress,
        event: &StreamEvent,
        author: &CacheEntry,
    ) -> NotificationRecord {
        NotificationRecord {
            address,
            body: format_summary(event, author),
        }
    }

    /// Send once. Failures are logged and returned; nothing is retried or queued.
    pub async fn deliver(&self, record: &NotificationRecord) -> Result<(), ChannelError> {
        match self.sender.send_text(&record.address, &record.body).await {
            Ok(()) => {
                info!(chat_id = record.address.chat_id, "Notification delivered");
                Ok(())
            }
            Err(e) => {
                warn!(chat_id = record.address.chat_id, error = %e, "Notification delivery failed");
                Err(e)
            }
        }
    }
}
