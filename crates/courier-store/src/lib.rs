//! Task persistence for courier
//!
//! SQLite holds one JSON record per task plus a settings table. On open, every
//! task is loaded into an in-memory mirror indexed by source chat, which serves
//! all reads on the forwarding path.

pub mod persistence;
pub mod store;

pub use store::SqliteTaskStore;
