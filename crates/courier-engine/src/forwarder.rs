//! Fan-out forwarding and edit/delete mirroring
//!
//! One `Forwarder` serves every task. Each call handles a single event for a
//! single task: destinations are dispatched concurrently and failures are
//! isolated per destination. Correlation changes are merged into the freshest
//! copy of the task and written back with one store update.

use crate::identity::IdentitySelector;
use crate::report::{Report, Skip};
use anyhow::Result;
use chrono::Utc;
use courier_core::{
    ChatId, Correlations, DestinationRecord, Identity, IncomingMessage, MessageId,
    MessagingClient, StoreError, Task, TaskStore, TaskUpdate,
};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Forwarder {
    client: Arc<dyn MessagingClient>,
    store: Arc<dyn TaskStore>,
    identity: Arc<IdentitySelector>,
}

impl Forwarder {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        store: Arc<dyn TaskStore>,
        identity: Arc<IdentitySelector>,
    ) -> Self {
        Self {
            client,
            store,
            identity,
        }
    }

    /// Relay a new source message to every target of `task`
    pub async fn forward(&self, message: &IncomingMessage, task: &Task) -> Result<Report> {
        if task.delay_secs > 0 {
            debug!(
                "Task {}: delaying {}/{} by {}s",
                task.name, message.chat_id, message.message_id, task.delay_secs
            );
            tokio::time::sleep(Duration::from_secs(task.delay_secs)).await;
        }

        if let Some(word) = task.blacklist_hit(&message.normalized_text()) {
            info!(
                "Task {}: skipping {}/{}, contains blacklisted word '{}'",
                task.name, message.chat_id, message.message_id, word
            );
            return Ok(Report::skipped(Skip::Blacklisted(word.to_string())));
        }

        // Read after the delay so a mode switch in the meantime applies
        let identity = self.identity.active();
        let attributed = task.show_origin_header;

        let dispatches = task.targets.iter().map(|&target| async move {
            let result = if attributed {
                self.client
                    .forward_with_attribution(identity, target, message)
                    .await
                    .map(|()| None)
            } else {
                self.client
                    .send_message(identity, target, message)
                    .await
                    .map(Some)
            };
            (target, result)
        });
        let results = join_all(dispatches).await;

        let now = Utc::now().timestamp();
        let mut report = Report::default();
        let mut records = Vec::new();
        for (target, result) in results {
            match result {
                Ok(copy) => {
                    report.applied += 1;
                    if let Some(id) = copy {
                        records.push((target, DestinationRecord::new(id, now)));
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "Task {}: failed to relay {}/{} to {}: {:#}",
                        task.name, message.chat_id, message.message_id, target, e
                    );
                }
            }
        }

        if records.is_empty() {
            return Ok(report);
        }

        let count = records.len();
        let written = self
            .commit(&task.name, message.chat_id, |correlations| {
                correlations.merge(message.chat_id, message.message_id, records);
                true
            })
            .await?;
        if written {
            report.recorded = count;
        }

        debug!(
            "Task {}: relayed {}/{} via {}: {}",
            task.name, message.chat_id, message.message_id, identity, report
        );
        Ok(report)
    }

    /// Re-apply an edited source message to every tracked destination copy
    pub async fn propagate_edit(&self, message: &IncomingMessage, task: &Task) -> Result<Report> {
        let Some(destinations) = task.correlations.get(message.chat_id, message.message_id)
        else {
            debug!(
                "Task {}: edit of untracked message {}/{}",
                task.name, message.chat_id, message.message_id
            );
            return Ok(Report::skipped(Skip::Untracked));
        };

        if let Some(word) = task.blacklist_hit(&message.normalized_text()) {
            info!(
                "Task {}: not propagating edit of {}/{}, contains blacklisted word '{}'",
                task.name, message.chat_id, message.message_id, word
            );
            return Ok(Report::skipped(Skip::Blacklisted(word.to_string())));
        }

        let Some(text) = message.text.as_deref() else {
            return Ok(Report::skipped(Skip::NoText));
        };

        let identity = self.identity.active();
        let edits = destinations.iter().map(|(&chat, record)| {
            let id = record.id();
            async move { (chat, id, self.apply_edit(identity, chat, id, text).await) }
        });

        let mut report = Report::default();
        for (chat, id, result) in join_all(edits).await {
            match result {
                Ok(true) => report.applied += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "Task {}: failed to edit {}/{} (copy of {}/{}): {:#}",
                        task.name, chat, id, message.chat_id, message.message_id, e
                    );
                }
            }
        }

        debug!(
            "Task {}: edit of {}/{}: {}",
            task.name, message.chat_id, message.message_id, report
        );
        Ok(report)
    }

    /// Returns whether an edit call was made
    async fn apply_edit(
        &self,
        identity: Identity,
        chat: ChatId,
        id: MessageId,
        text: &str,
    ) -> Result<bool> {
        match self.client.get_message(identity, chat, id).await? {
            None => {
                debug!("Destination copy {}/{} is gone", chat, id);
                Ok(false)
            }
            Some(current) if current.text.as_deref() == Some(text) => Ok(false),
            Some(_) => {
                self.client.edit_message(identity, chat, id, text).await?;
                Ok(true)
            }
        }
    }

    /// Delete the destination copies of deleted source messages and forget them
    pub async fn propagate_delete(
        &self,
        source_chat: ChatId,
        message_ids: &[MessageId],
        task: &Task,
    ) -> Result<Report> {
        let tracked: Vec<MessageId> = message_ids
            .iter()
            .copied()
            .filter(|&id| task.correlations.get(source_chat, id).is_some())
            .collect();
        if tracked.is_empty() {
            debug!(
                "Task {}: deletion of untracked messages {:?} in {}",
                task.name, message_ids, source_chat
            );
            return Ok(Report::skipped(Skip::Untracked));
        }

        // One delete call per destination chat
        let mut by_chat: BTreeMap<ChatId, Vec<MessageId>> = BTreeMap::new();
        for &id in &tracked {
            if let Some(destinations) = task.correlations.get(source_chat, id) {
                for (&chat, record) in destinations {
                    by_chat.entry(chat).or_default().push(record.id());
                }
            }
        }

        let identity = self.identity.active();
        let deletes = by_chat.iter().map(|(&chat, ids)| async move {
            (
                chat,
                ids,
                self.client.delete_messages(identity, chat, ids).await,
            )
        });

        let mut report = Report::default();
        for (chat, ids, result) in join_all(deletes).await {
            match result {
                Ok(()) => report.applied += ids.len(),
                Err(e) => {
                    report.failed += ids.len();
                    warn!(
                        "Task {}: failed to delete {:?} in {} (copies from {}): {:#}",
                        task.name, ids, chat, source_chat, e
                    );
                }
            }
        }

        let written = self
            .commit(&task.name, source_chat, |correlations| {
                let mut changed = false;
                for &id in &tracked {
                    changed |= correlations.remove(source_chat, id).is_some();
                }
                changed
            })
            .await?;
        if written {
            report.recorded = tracked.len();
        }

        debug!(
            "Task {}: deletion of {:?} in {}: {}",
            task.name, tracked, source_chat, report
        );
        Ok(report)
    }

    /// Apply `mutate` to the current correlations of `task_name` and write
    /// them back once. Skipped when the task is gone or `mutate` reports no
    /// change. A failed durable write is logged; the mirror keeps the change.
    async fn commit(
        &self,
        task_name: &str,
        source_chat: ChatId,
        mutate: impl FnOnce(&mut Correlations) -> bool,
    ) -> Result<bool> {
        let fresh = self
            .store
            .find_tasks_by_source(source_chat)
            .await
            .into_iter()
            .find(|t| t.name == task_name);
        let Some(mut task) = fresh else {
            debug!(
                "Task {} no longer relays from {}, dropping correlation update",
                task_name, source_chat
            );
            return Ok(false);
        };

        if !mutate(&mut task.correlations) {
            return Ok(false);
        }

        match self
            .store
            .update(task_name, TaskUpdate::correlations(task.correlations))
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                debug!("Task {} was removed before its correlations were saved", task_name);
                Ok(false)
            }
            Err(e @ StoreError::Persist { .. }) => {
                error!("Task {}: {:#}", task_name, anyhow::Error::from(e));
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        Call, MemoryIdentityStore, MemoryTaskStore, RecordingClient, incoming, task_t1,
    };
    use courier_store::SqliteTaskStore;

    async fn setup(tasks: Vec<Task>) -> (Arc<RecordingClient>, Arc<SqliteTaskStore>, Forwarder) {
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        for task in tasks {
            store.insert(task).unwrap();
        }
        let selector = Arc::new(IdentitySelector::load(client.clone(), store.clone()).await);
        let forwarder = Forwarder::new(client.clone(), store.clone(), selector);
        (client, store, forwarder)
    }

    async fn setup_counting(
        task: Task,
        client: Arc<RecordingClient>,
    ) -> (Arc<MemoryTaskStore>, Forwarder) {
        let store = Arc::new(MemoryTaskStore::with_tasks([task]));
        let selector = Arc::new(
            IdentitySelector::load(client.clone(), Arc::new(MemoryIdentityStore::default())).await,
        );
        let forwarder = Forwarder::new(client, store.clone(), selector);
        (store, forwarder)
    }

    fn edited(chat: ChatId, id: MessageId, text: &str) -> IncomingMessage {
        incoming(Identity::Primary, chat, id, text)
    }

    #[tokio::test]
    async fn test_t1_forward_edit_delete() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;

        let task = store.get("T1").unwrap();
        let report = forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "hello"), &task)
            .await
            .unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.recorded, 2);

        let task = store.get("T1").unwrap();
        let entry = task.correlations.get(100, 5).unwrap().clone();
        assert_eq!(entry.keys().copied().collect::<Vec<_>>(), vec![200, 201]);
        for (&chat, record) in &entry {
            assert_eq!(client.text_of(chat, record.id()).as_deref(), Some("hello"));
            assert!(record.created_at().is_some());
        }

        let report = forwarder
            .propagate_edit(&edited(100, 5, "hello, edited"), &task)
            .await
            .unwrap();
        assert_eq!(report.applied, 2);
        for (&chat, record) in &entry {
            assert_eq!(
                client.text_of(chat, record.id()).as_deref(),
                Some("hello, edited")
            );
        }

        let report = forwarder.propagate_delete(100, &[5], &task).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.recorded, 1);
        for (&chat, record) in &entry {
            assert!(!client.exists(chat, record.id()));
        }
        assert!(store.get("T1").unwrap().correlations.get(100, 5).is_none());
    }

    #[tokio::test]
    async fn test_blacklisted_message_produces_no_writes() {
        let mut task = task_t1();
        task.blacklist_enabled = true;
        task.blacklist_words.insert("spam".to_string());
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        let (store, forwarder) = setup_counting(task.clone(), client.clone()).await;

        let report = forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "SPAM offer"), &task)
            .await
            .unwrap();
        assert_eq!(report.skipped, Some(Skip::Blacklisted("spam".to_string())));
        assert!(client.calls().is_empty());
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_blacklist_disabled_lets_words_through() {
        let mut task = task_t1();
        task.blacklist_words.insert("spam".to_string());
        let (client, store, forwarder) = setup(vec![task]).await;

        let task = store.get("T1").unwrap();
        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "SPAM offer"), &task)
            .await
            .unwrap();
        assert_eq!(client.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_destination_is_isolated() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        client.fail_chat(201);

        let task = store.get("T1").unwrap();
        let report = forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "hello"), &task)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);

        let entry = store.get("T1").unwrap().correlations.get(100, 5).unwrap().clone();
        assert!(entry.contains_key(&200));
        assert!(!entry.contains_key(&201));
    }

    #[tokio::test]
    async fn test_all_destinations_failing_writes_nothing() {
        let task = task_t1();
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        client.fail_chat(200);
        client.fail_chat(201);
        let (store, forwarder) = setup_counting(task.clone(), client.clone()).await;

        let report = forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "hello"), &task)
            .await
            .unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_origin_header_forwards_without_tracking() {
        let mut task = task_t1();
        task.show_origin_header = true;
        let (client, store, forwarder) = setup(vec![task]).await;

        let task = store.get("T1").unwrap();
        let report = forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "hello"), &task)
            .await
            .unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.recorded, 0);
        assert!(
            client
                .calls()
                .iter()
                .all(|c| matches!(c, Call::Forward { .. }))
        );
        assert!(store.get("T1").unwrap().correlations.is_empty());
    }

    #[tokio::test]
    async fn test_forward_persists_once() {
        let task = task_t1();
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        let (store, forwarder) = setup_counting(task.clone(), client.clone()).await;

        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "hello"), &task)
            .await
            .unwrap();
        assert_eq!(store.update_count(), 1);
        assert_eq!(store.get("T1").unwrap().correlations.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_mirror_change() {
        let task = task_t1();
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        let (store, forwarder) = setup_counting(task.clone(), client.clone()).await;
        store.fail_persist();

        let report = forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "hello"), &task)
            .await
            .unwrap();
        assert_eq!(report.recorded, 2);
        assert!(store.get("T1").unwrap().correlations.get(100, 5).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_suspends_before_dispatch() {
        let mut task = task_t1();
        task.delay_secs = 30;
        let (client, store, forwarder) = setup(vec![task]).await;
        let forwarder = Arc::new(forwarder);

        let task = store.get("T1").unwrap();
        let handle = tokio::spawn({
            let forwarder = forwarder.clone();
            async move {
                forwarder
                    .forward(&incoming(Identity::Primary, 100, 5, "later"), &task)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(client.calls().is_empty());

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(client.sends().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_keeps_correlations_recorded_during_delay() {
        let mut task = task_t1();
        task.delay_secs = 5;
        let (_client, store, forwarder) = setup(vec![task]).await;
        let forwarder = Arc::new(forwarder);

        let delayed = store.get("T1").unwrap();
        let handle = tokio::spawn({
            let forwarder = forwarder.clone();
            async move {
                forwarder
                    .forward(&incoming(Identity::Primary, 100, 5, "first"), &delayed)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut correlations = store.get("T1").unwrap().correlations;
        correlations.merge(100, 6, [(200, DestinationRecord::new(77, 1))]);
        store
            .apply("T1", TaskUpdate::correlations(correlations))
            .unwrap();

        handle.await.unwrap().unwrap();
        let task = store.get("T1").unwrap();
        assert!(task.correlations.get(100, 5).is_some());
        assert!(task.correlations.get(100, 6).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_deleted_during_delay_writes_nothing() {
        let mut task = task_t1();
        task.delay_secs = 5;
        let (client, store, forwarder) = setup(vec![task]).await;
        let forwarder = Arc::new(forwarder);

        let delayed = store.get("T1").unwrap();
        let handle = tokio::spawn({
            let forwarder = forwarder.clone();
            async move {
                forwarder
                    .forward(&incoming(Identity::Primary, 100, 5, "orphan"), &delayed)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.delete("T1").unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.recorded, 0);
        assert_eq!(client.sends().len(), 2);
        assert!(store.get("T1").is_none());
    }

    #[tokio::test]
    async fn test_edit_is_idempotent() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        let task = store.get("T1").unwrap();
        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "v1"), &task)
            .await
            .unwrap();
        let task = store.get("T1").unwrap();

        let first = forwarder
            .propagate_edit(&edited(100, 5, "v2"), &task)
            .await
            .unwrap();
        let second = forwarder
            .propagate_edit(&edited(100, 5, "v2"), &task)
            .await
            .unwrap();

        assert_eq!(first.applied, 2);
        assert_eq!(second.applied, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(client.edits().len(), 2);
    }

    #[tokio::test]
    async fn test_edit_of_untracked_message_is_noop() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        let task = store.get("T1").unwrap();

        let report = forwarder
            .propagate_edit(&edited(100, 9, "whatever"), &task)
            .await
            .unwrap();
        assert_eq!(report.skipped, Some(Skip::Untracked));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_edit_matching_blacklist_is_skipped() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        let task = store.get("T1").unwrap();
        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "clean"), &task)
            .await
            .unwrap();

        let mut task = store.get("T1").unwrap();
        task.blacklist_enabled = true;
        task.blacklist_words.insert("spam".to_string());

        let report = forwarder
            .propagate_edit(&edited(100, 5, "now with Spam"), &task)
            .await
            .unwrap();
        assert!(matches!(report.skipped, Some(Skip::Blacklisted(_))));
        assert!(client.edits().is_empty());
        let entry = task.correlations.get(100, 5).unwrap();
        for (&chat, record) in entry {
            assert_eq!(client.text_of(chat, record.id()).as_deref(), Some("clean"));
        }
    }

    #[tokio::test]
    async fn test_edit_failure_is_isolated() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        let task = store.get("T1").unwrap();
        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "v1"), &task)
            .await
            .unwrap();
        client.fail_chat(200);

        let task = store.get("T1").unwrap();
        let report = forwarder
            .propagate_edit(&edited(100, 5, "v2"), &task)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_edit_after_delete_is_noop() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        let task = store.get("T1").unwrap();
        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "v1"), &task)
            .await
            .unwrap();
        let task = store.get("T1").unwrap();
        forwarder.propagate_delete(100, &[5], &task).await.unwrap();

        let task = store.get("T1").unwrap();
        let report = forwarder
            .propagate_edit(&edited(100, 5, "v2"), &task)
            .await
            .unwrap();
        assert_eq!(report.skipped, Some(Skip::Untracked));
        assert!(client.edits().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_untracked_messages_persists_nothing() {
        let task = task_t1();
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        let (store, forwarder) = setup_counting(task.clone(), client.clone()).await;

        let report = forwarder.propagate_delete(100, &[1, 2], &task).await.unwrap();
        assert_eq!(report.skipped, Some(Skip::Untracked));
        assert!(client.calls().is_empty());
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_of_several_messages_persists_once() {
        let task = task_t1();
        let client = Arc::new(RecordingClient::new(&[Identity::Primary]));
        let (store, forwarder) = setup_counting(task.clone(), client.clone()).await;

        for id in [5, 6] {
            let task = store.get("T1").unwrap();
            forwarder
                .forward(&incoming(Identity::Primary, 100, id, "x"), &task)
                .await
                .unwrap();
        }
        assert_eq!(store.update_count(), 2);

        let task = store.get("T1").unwrap();
        let report = forwarder
            .propagate_delete(100, &[5, 6, 7], &task)
            .await
            .unwrap();
        assert_eq!(report.applied, 4);
        assert_eq!(report.recorded, 2);
        assert_eq!(store.update_count(), 3);
        assert!(store.get("T1").unwrap().correlations.is_empty());
        assert_eq!(client.message_count(), 0);

        // One call per destination chat
        let deletes = client
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn test_delete_failure_still_clears_entry() {
        let (client, store, forwarder) = setup(vec![task_t1()]).await;
        let task = store.get("T1").unwrap();
        forwarder
            .forward(&incoming(Identity::Primary, 100, 5, "v1"), &task)
            .await
            .unwrap();
        client.fail_chat(201);

        let task = store.get("T1").unwrap();
        let report = forwarder.propagate_delete(100, &[5], &task).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert!(store.get("T1").unwrap().correlations.is_empty());
    }
}
