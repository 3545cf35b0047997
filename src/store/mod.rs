//! Persistence layer — libSQL-backed entity cache and resume ledger.
//!
//! The two stores live in separate database files so either can be reset
//! without touching the other.

pub mod ledger;
pub mod libsql_backend;
pub mod migrations;
pub mod peers;
pub mod traits;

pub use ledger::LibSqlLedger;
pub use libsql_backend::LibSqlBackend;
pub use peers::LibSqlPeerStore;
pub use traits::{EntityStore, ResumeLedger};
