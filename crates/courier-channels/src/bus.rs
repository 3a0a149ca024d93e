//! Identity-keyed channel bus
//!
//! Each identity is served by one channel adapter. The bus starts the
//! adapters, funnels their events into a single receiver, and routes
//! outgoing operations to the adapter of the requested identity.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use courier_core::{
    ChatId, Identity, IncomingMessage, Message, MessageId, MessagingClient, RelayEvent,
};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Trait that all channel adapters implement
#[async_trait]
pub trait IdentityChannel: Send + Sync {
    /// Verify credentials and start listening, pushing events into `tx` until
    /// `cancel` fires
    async fn start(&self, tx: mpsc::Sender<RelayEvent>, cancel: CancellationToken) -> Result<()>;

    /// Which identity this adapter acts as
    fn identity(&self) -> Identity;

    async fn send_message(&self, chat_id: ChatId, source: &IncomingMessage) -> Result<MessageId>;

    async fn forward_message(&self, chat_id: ChatId, source: &IncomingMessage) -> Result<()>;

    async fn get_message(&self, chat_id: ChatId, message_id: MessageId)
    -> Result<Option<Message>>;

    async fn edit_message(&self, chat_id: ChatId, message_id: MessageId, text: &str)
    -> Result<()>;

    async fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()>;
}

/// Central bus connecting identity channels to the relay engine
pub struct ChannelBus {
    channels: HashMap<Identity, Box<dyn IdentityChannel>>,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
}

impl ChannelBus {
    /// Create a new bus with the specified buffer size for incoming events
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        info!("Created channel bus with buffer size {}", buffer_size);
        Self {
            channels: HashMap::new(),
            events_tx: tx,
            events_rx: rx,
        }
    }

    /// Register a channel adapter, replacing any adapter for the same identity
    pub fn register(&mut self, channel: Box<dyn IdentityChannel>) {
        let identity = channel.identity();
        info!("Registering channel for identity: {}", identity);
        if self.channels.insert(identity, channel).is_some() {
            warn!("Replaced existing channel for identity {}", identity);
        }
    }

    /// Start every registered channel, primary first.
    ///
    /// The primary identity is required: a missing or failing primary channel
    /// is an error. A secondary channel that fails to start is dropped and the
    /// bus continues with the primary only.
    pub async fn start_all(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.channels.contains_key(&Identity::Primary) {
            return Err(anyhow!("No channel registered for the primary identity"));
        }

        info!("Starting {} registered channel(s)", self.channels.len());
        let mut failed = Vec::new();

        for identity in Identity::ALL {
            let Some(channel) = self.channels.get(&identity) else {
                continue;
            };
            debug!("Starting channel: {}", identity);

            match channel.start(self.events_tx.clone(), cancel.clone()).await {
                Ok(()) => info!("Successfully started channel: {}", identity),
                Err(e) if identity == Identity::Primary => {
                    error!("Failed to start primary channel: {:#}", e);
                    return Err(e.context("Failed to start primary channel"));
                }
                Err(e) => {
                    warn!(
                        "Failed to start {} channel, continuing without it: {:#}",
                        identity, e
                    );
                    failed.push(identity);
                }
            }
        }

        for identity in failed {
            self.channels.remove(&identity);
        }
        Ok(())
    }

    /// Get the number of registered channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_identity(&self, identity: Identity) -> bool {
        self.channels.contains_key(&identity)
    }

    /// Split the bus into the event receiver and a sender handle.
    ///
    /// The receiver closes once every started channel has stopped.
    pub fn split(self) -> (mpsc::Receiver<RelayEvent>, BusSender) {
        let sender = BusSender {
            channels: self.channels,
        };
        (self.events_rx, sender)
    }
}

/// Send-only handle for the bus, used as the engine's messaging client
pub struct BusSender {
    channels: HashMap<Identity, Box<dyn IdentityChannel>>,
}

impl BusSender {
    fn channel(&self, identity: Identity) -> Result<&dyn IdentityChannel> {
        self.channels
            .get(&identity)
            .map(|c| c.as_ref())
            .ok_or_else(|| anyhow!("No channel registered for identity: {}", identity))
    }

    pub fn has_identity(&self, identity: Identity) -> bool {
        self.channels.contains_key(&identity)
    }
}

#[async_trait]
impl MessagingClient for BusSender {
    fn available_identities(&self) -> Vec<Identity> {
        Identity::ALL
            .into_iter()
            .filter(|identity| self.channels.contains_key(identity))
            .collect()
    }

    async fn send_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        source: &IncomingMessage,
    ) -> Result<MessageId> {
        self.channel(identity)?.send_message(chat_id, source).await
    }

    async fn forward_with_attribution(
        &self,
        identity: Identity,
        chat_id: ChatId,
        source: &IncomingMessage,
    ) -> Result<()> {
        self.channel(identity)?.forward_message(chat_id, source).await
    }

    async fn get_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<Message>> {
        self.channel(identity)?.get_message(chat_id, message_id).await
    }

    async fn edit_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<()> {
        self.channel(identity)?
            .edit_message(chat_id, message_id, text)
            .await
    }

    async fn delete_messages(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_ids: &[MessageId],
    ) -> Result<()> {
        self.channel(identity)?
            .delete_messages(chat_id, message_ids)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock channel for testing
    struct MockChannel {
        identity: Identity,
        fail_start: bool,
        sent: Arc<AtomicUsize>,
    }

    impl MockChannel {
        fn new(identity: Identity) -> Self {
            Self {
                identity,
                fail_start: false,
                sent: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(identity: Identity) -> Self {
            Self {
                fail_start: true,
                ..Self::new(identity)
            }
        }
    }

    #[async_trait]
    impl IdentityChannel for MockChannel {
        async fn start(
            &self,
            _tx: mpsc::Sender<RelayEvent>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            if self.fail_start {
                return Err(anyhow!("bad token"));
            }
            Ok(())
        }

        fn identity(&self) -> Identity {
            self.identity
        }

        async fn send_message(
            &self,
            _chat_id: ChatId,
            _source: &IncomingMessage,
        ) -> Result<MessageId> {
            Ok(self.sent.fetch_add(1, Ordering::SeqCst) as MessageId + 1)
        }

        async fn forward_message(&self, _chat_id: ChatId, _source: &IncomingMessage) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_message(
            &self,
            chat_id: ChatId,
            message_id: MessageId,
        ) -> Result<Option<Message>> {
            Ok(Some(Message {
                chat_id,
                id: message_id,
                text: Some(format!("from {}", self.identity)),
            }))
        }

        async fn edit_message(
            &self,
            _chat_id: ChatId,
            _message_id: MessageId,
            _text: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete_messages(&self, _chat_id: ChatId, _message_ids: &[MessageId]) -> Result<()> {
            Ok(())
        }
    }

    fn source() -> IncomingMessage {
        IncomingMessage {
            identity: Identity::Primary,
            chat_id: 100,
            message_id: 5,
            text: Some("hello".to_string()),
            is_outgoing: false,
            is_channel_post: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_bus_register() {
        let mut bus = ChannelBus::new(32);
        assert_eq!(bus.channel_count(), 0);
        bus.register(Box::new(MockChannel::new(Identity::Primary)));
        assert_eq!(bus.channel_count(), 1);
        assert!(bus.has_identity(Identity::Primary));
        assert!(!bus.has_identity(Identity::Secondary));
    }

    #[tokio::test]
    async fn test_start_requires_primary() {
        let mut bus = ChannelBus::new(32);
        bus.register(Box::new(MockChannel::new(Identity::Secondary)));
        assert!(bus.start_all(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_primary_is_fatal() {
        let mut bus = ChannelBus::new(32);
        bus.register(Box::new(MockChannel::failing(Identity::Primary)));
        bus.register(Box::new(MockChannel::new(Identity::Secondary)));
        assert!(bus.start_all(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_secondary_is_dropped() {
        let mut bus = ChannelBus::new(32);
        bus.register(Box::new(MockChannel::new(Identity::Primary)));
        bus.register(Box::new(MockChannel::failing(Identity::Secondary)));
        bus.start_all(&CancellationToken::new()).await.unwrap();

        let (_rx, sender) = bus.split();
        assert_eq!(sender.available_identities(), vec![Identity::Primary]);
    }

    #[tokio::test]
    async fn test_sender_routes_by_identity() {
        let mut bus = ChannelBus::new(32);
        let primary = MockChannel::new(Identity::Primary);
        let secondary = MockChannel::new(Identity::Secondary);
        let primary_sent = primary.sent.clone();
        let secondary_sent = secondary.sent.clone();
        bus.register(Box::new(primary));
        bus.register(Box::new(secondary));
        bus.start_all(&CancellationToken::new()).await.unwrap();

        let (_rx, sender) = bus.split();
        assert_eq!(
            sender.available_identities(),
            vec![Identity::Primary, Identity::Secondary]
        );

        sender
            .send_message(Identity::Secondary, 200, &source())
            .await
            .unwrap();
        sender
            .forward_with_attribution(Identity::Secondary, 200, &source())
            .await
            .unwrap();
        assert_eq!(primary_sent.load(Ordering::SeqCst), 0);
        assert_eq!(secondary_sent.load(Ordering::SeqCst), 2);

        let fetched = sender
            .get_message(Identity::Primary, 200, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.text.as_deref(), Some("from primary"));
    }

    #[tokio::test]
    async fn test_sender_unknown_identity() {
        let mut bus = ChannelBus::new(32);
        bus.register(Box::new(MockChannel::new(Identity::Primary)));
        let (_rx, sender) = bus.split();

        assert!(!sender.has_identity(Identity::Secondary));
        let result = sender.send_message(Identity::Secondary, 200, &source()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bus_incoming_events() {
        let mut bus = ChannelBus::new(32);
        bus.register(Box::new(MockChannel::new(Identity::Primary)));

        let tx = bus.events_tx.clone();
        bus.start_all(&CancellationToken::new()).await.unwrap();
        let (mut rx, _sender) = bus.split();

        tx.send(RelayEvent::NewMessage(source())).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "new_message");
        assert_eq!(event.chat_id(), Some(100));
    }
}
