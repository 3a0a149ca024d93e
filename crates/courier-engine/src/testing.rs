//! In-memory collaborators for engine tests

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
    ChatId, Identity, IdentityStore, IncomingMessage, Message, MessageId, MessagingClient,
    StoreError, Task, TaskStore, TaskUpdate,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Send {
        identity: Identity,
        chat: ChatId,
        id: MessageId,
    },
    Forward {
        identity: Identity,
        chat: ChatId,
    },
    Edit {
        identity: Identity,
        chat: ChatId,
        id: MessageId,
        text: String,
    },
    Delete {
        identity: Identity,
        chat: ChatId,
        ids: Vec<MessageId>,
    },
}

/// Messaging client that keeps destination messages in memory
pub struct RecordingClient {
    identities: Vec<Identity>,
    next_id: AtomicI64,
    messages: Mutex<HashMap<(ChatId, MessageId), Option<String>>>,
    failing: Mutex<HashSet<ChatId>>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingClient {
    pub fn new(identities: &[Identity]) -> Self {
        Self {
            identities: identities.to_vec(),
            next_id: AtomicI64::new(1000),
            messages: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call touching `chat` fails from now on
    pub fn fail_chat(&self, chat: ChatId) {
        self.failing.lock().unwrap().insert(chat);
    }

    fn check(&self, chat: ChatId) -> Result<()> {
        if self.failing.lock().unwrap().contains(&chat) {
            return Err(anyhow!("chat {} unreachable", chat));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Send { .. }))
            .collect()
    }

    pub fn edits(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Edit { .. }))
            .collect()
    }

    pub fn text_of(&self, chat: ChatId, id: MessageId) -> Option<String> {
        self.messages
            .lock()
            .unwrap()
            .get(&(chat, id))
            .cloned()
            .flatten()
    }

    pub fn exists(&self, chat: ChatId, id: MessageId) -> bool {
        self.messages.lock().unwrap().contains_key(&(chat, id))
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl MessagingClient for RecordingClient {
    fn available_identities(&self) -> Vec<Identity> {
        self.identities.clone()
    }

    async fn send_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        source: &IncomingMessage,
    ) -> Result<MessageId> {
        self.check(chat_id)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .insert((chat_id, id), source.text.clone());
        self.calls.lock().unwrap().push(Call::Send {
            identity,
            chat: chat_id,
            id,
        });
        Ok(id)
    }

    async fn forward_with_attribution(
        &self,
        identity: Identity,
        chat_id: ChatId,
        source: &IncomingMessage,
    ) -> Result<()> {
        self.check(chat_id)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .insert((chat_id, id), source.text.clone());
        self.calls.lock().unwrap().push(Call::Forward {
            identity,
            chat: chat_id,
        });
        Ok(())
    }

    async fn get_message(
        &self,
        _identity: Identity,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<Message>> {
        self.check(chat_id)?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(&(chat_id, message_id))
            .map(|text| Message {
                chat_id,
                id: message_id,
                text: text.clone(),
            }))
    }

    async fn edit_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<()> {
        self.check(chat_id)?;
        let mut messages = self.messages.lock().unwrap();
        let slot = messages
            .get_mut(&(chat_id, message_id))
            .ok_or_else(|| anyhow!("message {} not found in {}", message_id, chat_id))?;
        *slot = Some(text.to_string());
        self.calls.lock().unwrap().push(Call::Edit {
            identity,
            chat: chat_id,
            id: message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_messages(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_ids: &[MessageId],
    ) -> Result<()> {
        self.check(chat_id)?;
        let mut messages = self.messages.lock().unwrap();
        for id in message_ids {
            messages.remove(&(chat_id, *id));
        }
        self.calls.lock().unwrap().push(Call::Delete {
            identity,
            chat: chat_id,
            ids: message_ids.to_vec(),
        });
        Ok(())
    }
}

/// Task store kept in a map, counting writes
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<String, Task>>,
    updates: AtomicUsize,
    reloads: AtomicUsize,
    fail_persist: AtomicBool,
}

impl MemoryTaskStore {
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::default();
        {
            let mut map = store.tasks.lock().unwrap();
            for task in tasks {
                map.insert(task.name.clone(), task);
            }
        }
        store
    }

    pub fn get(&self, name: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(name).cloned()
    }

    /// Number of successful or attempted `update` calls on existing tasks
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Updates still apply in memory but report a persistence failure
    pub fn fail_persist(&self) {
        self.fail_persist.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn find_tasks_by_source(&self, chat_id: ChatId) -> Vec<Task> {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.matches_source(chat_id))
            .cloned()
            .collect()
    }

    async fn all_tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    async fn update(&self, name: &str, update: TaskUpdate) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(name) else {
            return Ok(false);
        };
        update.apply_to(task);
        self.updates.fetch_add(1, Ordering::SeqCst);

        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StoreError::Persist {
                name: name.to_string(),
                source: anyhow!("disk full"),
            });
        }
        Ok(true)
    }

    async fn reload(&self) -> Result<usize> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.tasks.lock().unwrap().len())
    }
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    value: Mutex<Option<Identity>>,
    fail_saves: AtomicBool,
}

impl MemoryIdentityStore {
    pub fn with(identity: Identity) -> Self {
        Self {
            value: Mutex::new(Some(identity)),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> Option<Identity> {
        *self.value.lock().unwrap()
    }

    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load_identity(&self) -> Result<Option<Identity>> {
        Ok(self.get())
    }

    async fn save_identity(&self, identity: Identity) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("read-only"));
        }
        *self.value.lock().unwrap() = Some(identity);
        Ok(())
    }
}

/// A new text message in `chat` received by `identity`
pub fn incoming(identity: Identity, chat: ChatId, id: MessageId, text: &str) -> IncomingMessage {
    IncomingMessage {
        identity,
        chat_id: chat,
        message_id: id,
        text: Some(text.to_string()),
        is_outgoing: false,
        is_channel_post: false,
        timestamp: Utc::now(),
    }
}

/// The scenario task: sources [100], targets [200, 201]
pub fn task_t1() -> Task {
    let mut task = Task::new("T1", [100], [200, 201]);
    task.edit_sync_enabled = true;
    task
}
