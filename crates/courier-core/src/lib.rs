//! Core types and collaborator interfaces for courier
//!
//! This crate defines:
//! - Forwarding tasks and their correlation maps
//! - Relay events delivered by channel adapters
//! - The messaging-client and task-store traits the engine is written against

pub mod client;
pub mod store;
pub mod task;
pub mod types;

pub use client::MessagingClient;
pub use store::{IdentityStore, StoreError, TaskStore};
pub use task::{Correlations, DestinationMap, DestinationRecord, Task, TaskUpdate};
pub use types::{ChatId, DeletedMessages, Identity, IncomingMessage, Message, MessageId, RelayEvent};
