//! Shared types for courier-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Chat identifier on the messaging network (channels and groups are negative)
pub type ChatId = i64;

/// Message identifier, unique within one chat
pub type MessageId = i64;

/// One of the two network accounts that can perform relaying
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    #[default]
    Primary,
    Secondary,
}

impl Identity {
    pub const ALL: [Identity; 2] = [Identity::Primary, Identity::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Identity {
    type Err = anyhow::Error;

    /// Accepts the legacy "bot"/"userbot" mode values as well
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" | "bot" => Ok(Self::Primary),
            "secondary" | "userbot" => Ok(Self::Secondary),
            other => Err(anyhow::anyhow!(
                "Unknown identity '{}' (expected 'primary' or 'secondary')",
                other
            )),
        }
    }
}

/// A message as returned by a fetch on the messaging network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub chat_id: ChatId,
    pub id: MessageId,
    /// Text or caption; `None` when unknown or the message has none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A new or edited message observed by one identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Which identity received this event
    pub identity: Identity,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Sent by the receiving identity itself
    #[serde(default)]
    pub is_outgoing: bool,
    /// Posted in a broadcast channel
    #[serde(default)]
    pub is_channel_post: bool,
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    /// Own traffic echoed back to the sender. Channel posts are let through
    /// because the transport cannot tell them apart from echoes.
    pub fn is_echo(&self) -> bool {
        self.is_outgoing && !self.is_channel_post
    }

    /// Lowercased text for blacklist matching
    pub fn normalized_text(&self) -> String {
        self.text.as_deref().unwrap_or_default().to_lowercase()
    }
}

/// One or more messages removed from a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedMessages {
    pub identity: Identity,
    /// Some transports report deletions without the chat they happened in
    pub chat_id: Option<ChatId>,
    pub message_ids: Vec<MessageId>,
}

/// Event delivered by a channel adapter to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    NewMessage(IncomingMessage),
    Edited(IncomingMessage),
    Deleted(DeletedMessages),
}

impl RelayEvent {
    /// The identity that received this event
    pub fn identity(&self) -> Identity {
        match self {
            Self::NewMessage(m) | Self::Edited(m) => m.identity,
            Self::Deleted(d) => d.identity,
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Self::NewMessage(m) | Self::Edited(m) => Some(m.chat_id),
            Self::Deleted(d) => d.chat_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::Edited(_) => "edited",
            Self::Deleted(_) => "deleted",
        }
    }
}
