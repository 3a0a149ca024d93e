//! Telegram channel adapter using the Bot HTTP API with long polling

use crate::bus::IdentityChannel;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{ChatId, Identity, IncomingMessage, Message, MessageId, RelayEvent};
use lru::LruCache;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

/// Messages remembered for `get_message` lookups
const MAX_CACHED_MESSAGES: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();

/// deleteMessages accepts at most this many ids per call
const DELETE_BATCH: usize = 100;

const ALLOWED_UPDATES: [&str; 4] = [
    "message",
    "edited_message",
    "channel_post",
    "edited_channel_post",
];

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram {method} request failed: {source}")]
    Http {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("Telegram {method} error {code}: {description}")]
    Api {
        method: &'static str,
        code: i64,
        description: String,
    },

    #[error("Telegram {method} returned an unexpected result: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl TelegramError {
    fn description(&self) -> &str {
        match self {
            Self::Api { description, .. } => description,
            _ => "",
        }
    }

    /// The edit would not change the message
    pub fn is_not_modified(&self) -> bool {
        self.description().contains("message is not modified")
    }

    /// The message carries a caption rather than text
    pub fn is_captioned(&self) -> bool {
        self.description().contains("no text in the message")
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<Value>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: Chat,
    from: Option<User>,
    date: i64,
    edit_date: Option<i64>,
    text: Option<String>,
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessageId {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<TgMessage>,
    edited_message: Option<TgMessage>,
    channel_post: Option<TgMessage>,
    edited_channel_post: Option<TgMessage>,
}

impl Update {
    /// Convert to a relay event as seen by `identity`, whose bot user id is `bot_id`
    fn into_event(self, identity: Identity, bot_id: i64) -> Option<RelayEvent> {
        let (message, edited, is_channel_post) = if let Some(m) = self.message {
            (m, false, false)
        } else if let Some(m) = self.edited_message {
            (m, true, false)
        } else if let Some(m) = self.channel_post {
            (m, false, true)
        } else {
            (self.edited_channel_post?, true, true)
        };

        let is_outgoing = message.from.as_ref().is_some_and(|user| user.id == bot_id);
        let timestamp = DateTime::from_timestamp(message.edit_date.unwrap_or(message.date), 0)
            .unwrap_or_else(Utc::now);

        let incoming = IncomingMessage {
            identity,
            chat_id: message.chat.id,
            message_id: message.message_id,
            text: message.text.or(message.caption),
            is_outgoing,
            is_channel_post,
            timestamp,
        };

        Some(if edited {
            RelayEvent::Edited(incoming)
        } else {
            RelayEvent::NewMessage(incoming)
        })
    }
}

#[derive(Clone)]
struct BotApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl BotApi {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &Value,
    ) -> Result<T, TelegramError> {
        let url = format!(
            "{}/bot{}/{}",
            self.base_url.trim_end_matches('/'),
            self.token,
            method
        );

        // Errors carry the request URL, which contains the token
        let response = self
            .client
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(|e| TelegramError::Http {
                method,
                source: e.without_url(),
            })?;

        let status = response.status();
        let body: ApiResponse = response.json().await.map_err(|e| TelegramError::Http {
            method,
            source: e.without_url(),
        })?;

        if !body.ok {
            return Err(TelegramError::Api {
                method,
                code: body.error_code.unwrap_or(i64::from(status.as_u16())),
                description: body.description.unwrap_or_else(|| "unknown".to_string()),
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|source| TelegramError::Decode { method, source })
    }
}

type MessageCache = Arc<Mutex<LruCache<(ChatId, MessageId), Option<String>>>>;

/// Telegram Bot API adapter acting as one identity
pub struct TelegramChannel {
    identity: Identity,
    api: BotApi,
    poll_timeout: Duration,
    /// Text of messages this adapter has sent or observed. The Bot API has no
    /// fetch-by-id, so this is what `get_message` answers from.
    messages: MessageCache,
}

impl TelegramChannel {
    pub fn new(
        identity: Identity,
        token: String,
        api_base_url: &str,
        poll_timeout: Duration,
    ) -> Result<Self> {
        // Long polls hold the request open for up to poll_timeout
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client for Telegram")?;

        Ok(Self {
            identity,
            api: BotApi {
                client,
                base_url: api_base_url.to_string(),
                token,
            },
            poll_timeout,
            messages: Arc::new(Mutex::new(LruCache::new(MAX_CACHED_MESSAGES))),
        })
    }

    async fn remember(&self, chat_id: ChatId, message_id: MessageId, text: Option<String>) {
        self.messages.lock().await.put((chat_id, message_id), text);
    }

    async fn poll_updates(
        api: BotApi,
        identity: Identity,
        bot_id: i64,
        poll_timeout: Duration,
        cache: MessageCache,
        tx: mpsc::Sender<RelayEvent>,
        cancel: CancellationToken,
    ) {
        info!("Telegram polling task started for {}", identity);
        let mut offset: Option<i64> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut params = json!({
                "timeout": poll_timeout.as_secs(),
                "allowed_updates": ALLOWED_UPDATES,
            });
            if let Some(offset) = offset {
                params["offset"] = json!(offset);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = api.call::<Vec<Value>>("getUpdates", &params) => result,
            };

            let updates = match result {
                Ok(updates) => {
                    backoff = INITIAL_BACKOFF;
                    updates
                }
                Err(e) => {
                    warn!(
                        "Telegram {} poll failed, retrying in {}s: {}",
                        identity,
                        backoff.as_secs(),
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            for raw in updates {
                if let Some(update_id) = raw.get("update_id").and_then(|v| v.as_i64()) {
                    offset = Some(offset.map_or(update_id + 1, |o| o.max(update_id + 1)));
                }

                let update = match serde_json::from_value::<Update>(raw) {
                    Ok(update) => update,
                    Err(e) => {
                        debug!("Skipping unreadable Telegram update: {}", e);
                        continue;
                    }
                };
                let Some(event) = update.into_event(identity, bot_id) else {
                    continue;
                };

                if let RelayEvent::NewMessage(m) | RelayEvent::Edited(m) = &event {
                    cache
                        .lock()
                        .await
                        .put((m.chat_id, m.message_id), m.text.clone());
                }

                if tx.send(event).await.is_err() {
                    error!("Event channel closed, stopping Telegram {} poller", identity);
                    return;
                }
            }
        }

        info!("Telegram polling task for {} stopped", identity);
    }
}

#[async_trait]
impl IdentityChannel for TelegramChannel {
    async fn start(&self, tx: mpsc::Sender<RelayEvent>, cancel: CancellationToken) -> Result<()> {
        info!("Starting Telegram channel for {}", self.identity);

        if self.api.token.is_empty() {
            return Err(anyhow!("Telegram bot token for {} is empty", self.identity));
        }

        let me: User = self
            .api
            .call("getMe", &json!({}))
            .await
            .with_context(|| format!("Failed to verify Telegram token for {}", self.identity))?;
        info!(
            "Telegram {} authenticated as @{} ({})",
            self.identity,
            me.username.as_deref().unwrap_or("unknown"),
            me.id
        );

        tokio::spawn(Self::poll_updates(
            self.api.clone(),
            self.identity,
            me.id,
            self.poll_timeout,
            self.messages.clone(),
            tx,
            cancel,
        ));

        Ok(())
    }

    fn identity(&self) -> Identity {
        self.identity
    }

    async fn send_message(&self, chat_id: ChatId, source: &IncomingMessage) -> Result<MessageId> {
        let sent: SentMessageId = self
            .api
            .call(
                "copyMessage",
                &json!({
                    "chat_id": chat_id,
                    "from_chat_id": source.chat_id,
                    "message_id": source.message_id,
                }),
            )
            .await?;

        self.remember(chat_id, sent.message_id, source.text.clone())
            .await;
        debug!(
            "Copied {}/{} to {}/{}",
            source.chat_id, source.message_id, chat_id, sent.message_id
        );
        Ok(sent.message_id)
    }

    async fn forward_message(&self, chat_id: ChatId, source: &IncomingMessage) -> Result<()> {
        let _: Value = self
            .api
            .call(
                "forwardMessage",
                &json!({
                    "chat_id": chat_id,
                    "from_chat_id": source.chat_id,
                    "message_id": source.message_id,
                }),
            )
            .await?;
        debug!(
            "Forwarded {}/{} to {}",
            source.chat_id, source.message_id, chat_id
        );
        Ok(())
    }

    /// Answers from the local cache; unknown messages come back with no text
    async fn get_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<Message>> {
        let text = self
            .messages
            .lock()
            .await
            .get(&(chat_id, message_id))
            .cloned()
            .flatten();
        Ok(Some(Message {
            chat_id,
            id: message_id,
            text,
        }))
    }

    async fn edit_message(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<()> {
        let params = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });

        match self.api.call::<Value>("editMessageText", &params).await {
            Ok(_) => {}
            Err(e) if e.is_not_modified() => {
                debug!("{}/{} already up to date", chat_id, message_id);
            }
            Err(e) if e.is_captioned() => {
                let params = json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "caption": text,
                });
                match self.api.call::<Value>("editMessageCaption", &params).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_modified() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.remember(chat_id, message_id, Some(text.to_string()))
            .await;
        Ok(())
    }

    async fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()> {
        for batch in message_ids.chunks(DELETE_BATCH) {
            let _: Value = self
                .api
                .call(
                    "deleteMessages",
                    &json!({
                        "chat_id": chat_id,
                        "message_ids": batch,
                    }),
                )
                .await?;
        }

        let mut cache = self.messages.lock().await;
        for id in message_ids {
            cache.pop(&(chat_id, *id));
        }
        Ok(())
    }
}
