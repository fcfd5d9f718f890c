//! Storage backends for the notification ledger, task snapshots and identity links.

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;
