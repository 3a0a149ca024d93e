//! Task store: SQLite rows mirrored in memory with a source-chat index

use crate::persistence::{self, FORWARD_MODE_KEY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_core::{ChatId, Identity, IdentityStore, StoreError, Task, TaskStore, TaskUpdate};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// In-memory copy of every task plus chat id -> task names
#[derive(Default)]
struct Mirror {
    tasks: BTreeMap<String, Task>,
    by_source: HashMap<ChatId, BTreeSet<String>>,
}

impl Mirror {
    fn index_add(&mut self, name: &str, sources: &BTreeSet<ChatId>) {
        for source in sources {
            self.by_source
                .entry(*source)
                .or_default()
                .insert(name.to_string());
        }
    }

    fn index_remove(&mut self, name: &str, sources: &BTreeSet<ChatId>) {
        for source in sources {
            if let Some(bucket) = self.by_source.get_mut(source) {
                bucket.remove(name);
                if bucket.is_empty() {
                    self.by_source.remove(source);
                }
            }
        }
    }

    fn insert(&mut self, task: Task) {
        self.index_add(&task.name, &task.sources);
        self.tasks.insert(task.name.clone(), task);
    }

    fn remove(&mut self, name: &str) -> Option<Task> {
        let task = self.tasks.remove(name)?;
        self.index_remove(name, &task.sources);
        Some(task)
    }

    fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut mirror = Self::default();
        for task in tasks {
            mirror.insert(task);
        }
        mirror
    }
}

/// SQLite-backed task store.
///
/// Reads are served from the mirror. Writes take the connection lock first and
/// the mirror lock second, and start from the durable row rather than the
/// mirror: the admin CLI writes the same database from another process, so
/// the mirror may be behind. `reload` brings the whole mirror up to date.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    mirror: RwLock<Mirror>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and load all tasks
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Opening task store at {:?}", path.as_ref());
        // The daemon and the admin CLI share this file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL mode")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        persistence::init_tables(&conn)?;
        let mirror = Mirror::from_tasks(persistence::load_tasks(&conn)?);
        info!(
            "Loaded {} tasks covering {} source chats",
            mirror.tasks.len(),
            mirror.by_source.len()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            mirror: RwLock::new(mirror),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Mirror> {
        self.mirror.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Mirror> {
        self.mirror.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The durable copy of `name`, or the mirror's when the row can't be read.
    /// `None` when the row is gone.
    fn current(&self, conn: &Connection, name: &str) -> Option<Task> {
        match persistence::load_task(conn, name) {
            Ok(task) => task,
            Err(e) => {
                warn!("Failed to read task '{}', using cached copy: {:#}", name, e);
                self.read().tasks.get(name).cloned()
            }
        }
    }

    fn exists(&self, conn: &Connection, name: &str) -> bool {
        if self.read().tasks.contains_key(name) {
            return true;
        }
        persistence::task_exists(conn, name).unwrap_or_else(|e| {
            warn!("Failed to check for task '{}': {:#}", name, e);
            false
        })
    }

    /// Drop a mirror entry whose row was removed by another process
    fn forget(&self, name: &str) {
        if self.write().remove(name).is_some() {
            info!("Task {} was removed from the database, dropping it", name);
        }
    }

    /// Re-read every task from the database, replacing the mirror.
    /// Returns the number of tasks loaded.
    pub fn reload(&self) -> Result<usize> {
        let conn = self.conn();
        let mirror = Mirror::from_tasks(persistence::load_tasks(&conn)?);
        let count = mirror.tasks.len();
        *self.write() = mirror;
        debug!("Reloaded {} tasks", count);
        Ok(count)
    }

    fn persist(conn: &Connection, task: &Task) -> Result<(), StoreError> {
        persistence::save_task(conn, task).map_err(|source| {
            error!("Failed to persist task '{}': {:#}", task.name, source);
            StoreError::Persist {
                name: task.name.clone(),
                source,
            }
        })
    }

    /// Create a task with default settings
    pub fn create(
        &self,
        name: &str,
        sources: impl IntoIterator<Item = ChatId>,
        targets: impl IntoIterator<Item = ChatId>,
    ) -> Result<Task, StoreError> {
        let task = Task::new(name.trim(), sources, targets);
        self.insert(task.clone())?;
        Ok(task)
    }

    /// Insert a complete task record (used by create and by imports)
    pub fn insert(&self, task: Task) -> Result<(), StoreError> {
        if task.name.trim().is_empty() {
            return Err(StoreError::InvalidName(task.name));
        }

        let conn = self.conn();
        if self.exists(&conn, &task.name) {
            return Err(StoreError::AlreadyExists(task.name));
        }
        self.write().insert(task.clone());
        info!("Created task {}", task.name);
        Self::persist(&conn, &task)
    }

    pub fn get(&self, name: &str) -> Option<Task> {
        self.read().tasks.get(name).cloned()
    }

    /// All tasks, ordered by name
    pub fn list(&self) -> Vec<Task> {
        self.read().tasks.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().tasks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks whose source set contains `chat_id`, ordered by name
    pub fn tasks_for_source(&self, chat_id: ChatId) -> Vec<Task> {
        let mirror = self.read();
        match mirror.by_source.get(&chat_id) {
            Some(names) => names
                .iter()
                .filter_map(|name| mirror.tasks.get(name).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Merge a partial update into the stored task and persist it. Returns the
    /// updated task. Fields the update leaves unset keep their durable values.
    pub fn apply(&self, name: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let conn = self.conn();
        let Some(mut updated) = self.current(&conn, name) else {
            self.forget(name);
            return Err(StoreError::NotFound(name.to_string()));
        };
        update.apply_to(&mut updated);
        {
            let mut mirror = self.write();
            mirror.remove(name);
            mirror.insert(updated.clone());
        }
        debug!("Updated task {}", name);
        Self::persist(&conn, &updated)?;
        Ok(updated)
    }

    pub fn delete(&self, name: &str) -> Result<Task, StoreError> {
        let conn = self.conn();
        let durable = self.current(&conn, name);
        let cached = self.write().remove(name);
        let removed = durable
            .or(cached)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        persistence::delete_task(&conn, name).map_err(|source| {
            error!("Failed to delete task '{}' from database: {:#}", name, source);
            StoreError::Persist {
                name: name.to_string(),
                source,
            }
        })?;
        info!("Deleted task {}", name);
        Ok(removed)
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<Task, StoreError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(StoreError::InvalidName(new_name.to_string()));
        }

        let mut conn = self.conn();
        if self.exists(&conn, new_name) {
            return Err(StoreError::AlreadyExists(new_name.to_string()));
        }
        let Some(mut renamed) = self.current(&conn, old_name) else {
            self.forget(old_name);
            return Err(StoreError::NotFound(old_name.to_string()));
        };
        renamed.name = new_name.to_string();
        {
            let mut mirror = self.write();
            mirror.remove(old_name);
            mirror.insert(renamed.clone());
        }

        persistence::rename_task(&mut conn, old_name, &renamed).map_err(|source| {
            error!("Failed to rename task '{}' in database: {:#}", old_name, source);
            StoreError::Persist {
                name: new_name.to_string(),
                source,
            }
        })?;
        Ok(renamed)
    }

    /// Persisted forwarding identity; unknown values read as unset
    pub fn identity(&self) -> Result<Option<Identity>> {
        let value = persistence::get_setting(&self.conn(), FORWARD_MODE_KEY)?;
        Ok(value.and_then(|v| match v.parse() {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Ignoring stored forward mode: {}", e);
                None
            }
        }))
    }

    pub fn set_identity(&self, identity: Identity) -> Result<()> {
        persistence::set_setting(&self.conn(), FORWARD_MODE_KEY, identity.as_str())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn find_tasks_by_source(&self, chat_id: ChatId) -> Vec<Task> {
        self.tasks_for_source(chat_id)
    }

    async fn all_tasks(&self) -> Vec<Task> {
        self.list()
    }

    async fn update(&self, name: &str, update: TaskUpdate) -> Result<bool, StoreError> {
        match self.apply(name, update) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn reload(&self) -> Result<usize> {
        SqliteTaskStore::reload(self)
    }
}

#[async_trait]
impl IdentityStore for SqliteTaskStore {
    async fn load_identity(&self) -> Result<Option<Identity>> {
        self.identity()
    }

    async fn save_identity(&self, identity: Identity) -> Result<()> {
        self.set_identity(identity)
    }
}
