//! lead-watch — watches a Telegram bot's chats for development requests and
//! forwards matches to an admin.

pub mod channels;
pub mod config;
pub mod error;
pub mod governor;
pub mod llm;
pub mod pipeline;
pub mod store;
