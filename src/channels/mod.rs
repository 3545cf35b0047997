//! Transport adapters for the watched message stream.

pub mod poller;
pub mod progress;
pub mod telegram;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::pipeline::types::StreamEvent;

pub use poller::UpdatePoller;
pub use progress::{Ack, ProgressTracker};
pub use telegram::{TelegramClient, Update};

/// Receives every new message from the stream session.
///
/// Implementations must return quickly; slow work belongs in tasks the
/// handler spawns itself. The event's update is committed once `ack`
/// completes.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn on_new_message(&self, event: StreamEvent, ack: Ack);
}

/// Where the poller fetches updates from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Updates with `update_id >= offset`, waiting for new ones if none are queued.
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, ChannelError>;
}
