//! Messaging-network operations the relay engine depends on

use crate::types::{ChatId, Identity, IncomingMessage, Message, MessageId};
use anyhow::Result;
use async_trait::async_trait;

/// Operations performed on the messaging network on behalf of one identity.
///
/// Implemented by the channel bus in production and by recording fakes in tests.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Identities that are configured and connected
    fn available_identities(&self) -> Vec<Identity>;

    fn is_available(&self, identity: Identity) -> bool {
        self.available_identities().contains(&identity)
    }

    /// Send a fresh, unattributed copy of `source` to `chat_id`, returning the new message id
    async fn send_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        source: &IncomingMessage,
    ) -> Result<MessageId>;

    /// Forward `source` to `chat_id`, keeping the "forwarded from" attribution
    async fn forward_with_attribution(
        &self,
        identity: Identity,
        chat_id: ChatId,
        source: &IncomingMessage,
    ) -> Result<()>;

    /// Fetch a message; `None` if it no longer exists
    async fn get_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<Message>>;

    async fn edit_message(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
    ) -> Result<()>;

    async fn delete_messages(
        &self,
        identity: Identity,
        chat_id: ChatId,
        message_ids: &[MessageId],
    ) -> Result<()>;
}
