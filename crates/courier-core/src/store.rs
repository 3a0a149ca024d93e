//! Task persistence interface used by the relay engine

use crate::task::{Task, TaskUpdate};
use crate::types::{ChatId, Identity};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("task '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid task name '{0}'")]
    InvalidName(String),

    /// The in-memory state changed but the durable write failed
    #[error("failed to persist task '{name}': {source}")]
    Persist {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Lookup and partial update of tasks.
///
/// The engine never creates, deletes or renames tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks whose source set contains `chat_id`
    async fn find_tasks_by_source(&self, chat_id: ChatId) -> Vec<Task>;

    async fn all_tasks(&self) -> Vec<Task>;

    /// Merge `update` into the named task. `Ok(false)` if no such task exists.
    ///
    /// On `Err(StoreError::Persist)` the in-memory copy already reflects the change.
    async fn update(&self, name: &str, update: TaskUpdate) -> Result<bool, StoreError>;

    /// Re-read every task from durable storage, picking up changes written by
    /// other processes. Returns the number of tasks.
    async fn reload(&self) -> anyhow::Result<usize>;
}

/// Durable storage for the active forwarding identity
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load_identity(&self) -> anyhow::Result<Option<Identity>>;

    async fn save_identity(&self, identity: Identity) -> anyhow::Result<()>;
}
