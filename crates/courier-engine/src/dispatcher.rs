//! Routes relay events to the forwarder, one tracked unit per matching task

use crate::forwarder::Forwarder;
use crate::identity::IdentitySelector;
use courier_core::{RelayEvent, TaskStore};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    identity: Arc<IdentitySelector>,
    forwarder: Arc<Forwarder>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        identity: Arc<IdentitySelector>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            store,
            identity,
            forwarder,
            tracker: TaskTracker::new(),
        }
    }

    /// Submit one unit of work per task the event applies to and return the
    /// number submitted. Never waits for the units themselves.
    pub async fn dispatch(&self, event: RelayEvent) -> usize {
        if !self.identity.should_process(event.identity()) {
            return 0;
        }
        if self.tracker.is_closed() {
            warn!("Dispatcher is shutting down, dropping {} event", event.kind());
            return 0;
        }

        match event {
            RelayEvent::NewMessage(message) => {
                if message.is_echo() {
                    debug!(
                        "Ignoring own outgoing message {}/{}",
                        message.chat_id, message.message_id
                    );
                    return 0;
                }
                let tasks = self.store.find_tasks_by_source(message.chat_id).await;
                let message = Arc::new(message);
                let mut submitted = 0;
                for task in tasks.into_iter().filter(|t| t.forwarding_enabled) {
                    let forwarder = self.forwarder.clone();
                    let message = message.clone();
                    self.submit(async move {
                        if let Err(e) = forwarder.forward(&message, &task).await {
                            error!(
                                "Task {}: forwarding {}/{} failed: {:#}",
                                task.name, message.chat_id, message.message_id, e
                            );
                        }
                    });
                    submitted += 1;
                }
                submitted
            }
            RelayEvent::Edited(message) => {
                if message.is_echo() {
                    debug!(
                        "Ignoring edit of own message {}/{}",
                        message.chat_id, message.message_id
                    );
                    return 0;
                }
                let tasks = self.store.find_tasks_by_source(message.chat_id).await;
                let message = Arc::new(message);
                let mut submitted = 0;
                for task in tasks.into_iter().filter(|t| t.edit_sync_enabled) {
                    let forwarder = self.forwarder.clone();
                    let message = message.clone();
                    self.submit(async move {
                        if let Err(e) = forwarder.propagate_edit(&message, &task).await {
                            error!(
                                "Task {}: propagating edit of {}/{} failed: {:#}",
                                task.name, message.chat_id, message.message_id, e
                            );
                        }
                    });
                    submitted += 1;
                }
                submitted
            }
            RelayEvent::Deleted(deleted) => {
                let Some(chat_id) = deleted.chat_id else {
                    debug!(
                        "Ignoring deletion of {:?} without a chat",
                        deleted.message_ids
                    );
                    return 0;
                };
                let tasks = self.store.find_tasks_by_source(chat_id).await;
                let message_ids = Arc::new(deleted.message_ids);
                let mut submitted = 0;
                for task in tasks.into_iter().filter(|t| t.forwarding_enabled) {
                    let forwarder = self.forwarder.clone();
                    let message_ids = message_ids.clone();
                    self.submit(async move {
                        if let Err(e) = forwarder
                            .propagate_delete(chat_id, &message_ids, &task)
                            .await
                        {
                            error!(
                                "Task {}: propagating deletion of {:?} in {} failed: {:#}",
                                task.name, message_ids, chat_id, e
                            );
                        }
                    });
                    submitted += 1;
                }
                submitted
            }
        }
    }

    fn submit<F>(&self, unit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(unit);
    }

    /// Dispatch events until cancelled or the channel closes, then drain
    pub async fn run(&self, mut events: mpsc::Receiver<RelayEvent>, cancel: CancellationToken) {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            let kind = event.kind();
                            let chat = event.chat_id();
                            let submitted = self.dispatch(event).await;
                            if submitted > 0 {
                                debug!("{} in {:?}: {} unit(s) submitted", kind, chat, submitted);
                            }
                        }
                        None => {
                            info!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Stop accepting events and wait for in-flight units
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} in-flight relay unit(s)", self.tracker.len());
        }
        self.tracker.wait().await;
        info!("Dispatcher stopped");
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
