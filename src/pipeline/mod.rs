//! Update-processing pipeline.
//!
//! Every message from the stream session flows through:
//! 1. `Coordinator::handle()` — structural filter, redelivery guard, spawn
//! 2. `EntityCache` — author metadata, placeholder on a miss
//! 3. `Classifier::classify()` — LLM relevance verdict
//! 4. `RecipientResolver::resolve()` — admin handle to address
//! 5. `Dispatcher::deliver()` — one notification, no retry

pub mod cache;
pub mod classifier;
pub mod dedup;
pub mod notify;
pub mod processor;
pub mod types;
