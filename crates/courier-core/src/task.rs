//! Forwarding tasks and their source-to-destination correlations
//!
//! A task is one named route from a set of source chats to an ordered list of
//! destination chats. Tasks are stored as flat JSON records; records written
//! by older deployments use different field names, which are accepted as
//! aliases on load.

use crate::types::{ChatId, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where one source message landed in one destination chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DestinationRecord {
    /// Recorded with a creation time (epoch seconds)
    Timestamped { id: MessageId, ts: i64 },
    /// Stored as a bare message id before timestamps were recorded
    Legacy(MessageId),
}

impl DestinationRecord {
    pub fn new(id: MessageId, ts: i64) -> Self {
        Self::Timestamped { id, ts }
    }

    pub fn id(&self) -> MessageId {
        match self {
            Self::Timestamped { id, .. } | Self::Legacy(id) => *id,
        }
    }

    pub fn created_at(&self) -> Option<i64> {
        match self {
            Self::Timestamped { ts, .. } => Some(*ts),
            Self::Legacy(_) => None,
        }
    }
}

/// Destination chat -> record, for one source message
pub type DestinationMap = BTreeMap<ChatId, DestinationRecord>;

/// Source chat -> source message -> destination chat -> record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Correlations(BTreeMap<ChatId, BTreeMap<MessageId, DestinationMap>>);

impl Correlations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destinations recorded for a source message
    pub fn get(&self, source_chat: ChatId, source_message: MessageId) -> Option<&DestinationMap> {
        self.0
            .get(&source_chat)
            .and_then(|messages| messages.get(&source_message))
    }

    /// Merge destination records into the entry for a source message
    pub fn merge(
        &mut self,
        source_chat: ChatId,
        source_message: MessageId,
        records: impl IntoIterator<Item = (ChatId, DestinationRecord)>,
    ) {
        let mut records = records.into_iter().peekable();
        if records.peek().is_none() {
            return;
        }
        self.0
            .entry(source_chat)
            .or_default()
            .entry(source_message)
            .or_default()
            .extend(records);
    }

    /// Remove the entry for a source message, dropping the chat bucket once empty
    pub fn remove(
        &mut self,
        source_chat: ChatId,
        source_message: MessageId,
    ) -> Option<DestinationMap> {
        let messages = self.0.get_mut(&source_chat)?;
        let removed = messages.remove(&source_message);
        if messages.is_empty() {
            self.0.remove(&source_chat);
        }
        removed
    }

    /// Drop every entry whose records are all timestamped and older than
    /// `cutoff` (epoch seconds). Returns the number of entries removed.
    pub fn prune_expired(&mut self, cutoff: i64) -> usize {
        let mut removed = 0;
        self.0.retain(|_, messages| {
            messages.retain(|_, destinations| {
                let keep = !entry_expired(destinations, cutoff);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !messages.is_empty()
        });
        removed
    }

    /// Number of tracked source messages
    pub fn len(&self) -> usize {
        self.0.values().map(|messages| messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChatId, MessageId, &DestinationMap)> {
        self.0.iter().flat_map(|(chat, messages)| {
            messages
                .iter()
                .map(move |(message, destinations)| (*chat, *message, destinations))
        })
    }
}

/// Legacy records carry no age and are never expired
fn entry_expired(destinations: &DestinationMap, cutoff: i64) -> bool {
    let mut newest: Option<i64> = None;
    for record in destinations.values() {
        match record.created_at() {
            Some(ts) => newest = Some(newest.map_or(ts, |n| n.max(ts))),
            None => return false,
        }
    }
    newest.is_none_or(|ts| ts < cutoff)
}

fn default_true() -> bool {
    true
}

/// A named forwarding route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "work_name")]
    pub name: String,

    #[serde(default, alias = "source")]
    pub sources: BTreeSet<ChatId>,

    #[serde(default, alias = "target")]
    pub targets: Vec<ChatId>,

    #[serde(default = "default_true", alias = "has_to_forward")]
    pub forwarding_enabled: bool,

    #[serde(default, alias = "has_to_edit")]
    pub edit_sync_enabled: bool,

    #[serde(default, alias = "has_to_blacklist")]
    pub blacklist_enabled: bool,

    /// Relay as an attributed forward instead of a tracked copy
    #[serde(default, alias = "show_forward_header")]
    pub show_origin_header: bool,

    #[serde(default, alias = "delay")]
    pub delay_secs: u64,

    #[serde(default)]
    pub blacklist_words: BTreeSet<String>,

    #[serde(default, alias = "crossids")]
    pub correlations: Correlations,
}

impl Task {
    /// Create a task with forwarding on and every other switch off
    pub fn new(
        name: impl Into<String>,
        sources: impl IntoIterator<Item = ChatId>,
        targets: impl IntoIterator<Item = ChatId>,
    ) -> Self {
        Self {
            name: name.into(),
            sources: sources.into_iter().collect(),
            targets: targets.into_iter().collect(),
            forwarding_enabled: true,
            edit_sync_enabled: false,
            blacklist_enabled: false,
            show_origin_header: false,
            delay_secs: 0,
            blacklist_words: BTreeSet::new(),
            correlations: Correlations::new(),
        }
    }

    pub fn matches_source(&self, chat_id: ChatId) -> bool {
        self.sources.contains(&chat_id)
    }

    /// Whether destination copies are tracked for edit/delete mirroring
    pub fn tracks_copies(&self) -> bool {
        !self.show_origin_header
    }

    /// The first blacklisted word found in `text`, if filtering is enabled
    pub fn blacklist_hit(&self, text: &str) -> Option<&str> {
        if !self.blacklist_enabled {
            return None;
        }
        let lowered = text.to_lowercase();
        self.blacklist_words
            .iter()
            .find(|word| !word.is_empty() && lowered.contains(word.as_str()))
            .map(String::as_str)
    }

    /// Human-readable one-line summary
    pub fn summary(&self) -> String {
        let on_off = |b: bool| if b { "on" } else { "off" };
        format!(
            "{}: {:?} -> {:?} (forward {}, edit sync {}, blacklist {} [{} words], origin header {}, delay {}s, {} tracked)",
            self.name,
            self.sources,
            self.targets,
            on_off(self.forwarding_enabled),
            on_off(self.edit_sync_enabled),
            on_off(self.blacklist_enabled),
            self.blacklist_words.len(),
            on_off(self.show_origin_header),
            self.delay_secs,
            self.correlations.len(),
        )
    }
}

/// Normalize a blacklist word; `None` if nothing is left
pub fn normalize_word(word: &str) -> Option<String> {
    let word = word.trim().to_lowercase();
    if word.is_empty() { None } else { Some(word) }
}

/// A partial set of task fields to merge into a stored task
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub sources: Option<BTreeSet<ChatId>>,
    pub targets: Option<Vec<ChatId>>,
    pub forwarding_enabled: Option<bool>,
    pub edit_sync_enabled: Option<bool>,
    pub blacklist_enabled: Option<bool>,
    pub show_origin_header: Option<bool>,
    pub delay_secs: Option<u64>,
    pub blacklist_words: Option<BTreeSet<String>>,
    pub correlations: Option<Correlations>,
}

impl TaskUpdate {
    pub fn correlations(correlations: Correlations) -> Self {
        Self {
            correlations: Some(correlations),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_none()
            && self.targets.is_none()
            && self.forwarding_enabled.is_none()
            && self.edit_sync_enabled.is_none()
            && self.blacklist_enabled.is_none()
            && self.show_origin_header.is_none()
            && self.delay_secs.is_none()
            && self.blacklist_words.is_none()
            && self.correlations.is_none()
    }

    pub fn apply_to(self, task: &mut Task) {
        if let Some(sources) = self.sources {
            task.sources = sources;
        }
        if let Some(targets) = self.targets {
            task.targets = targets;
        }
        if let Some(v) = self.forwarding_enabled {
            task.forwarding_enabled = v;
        }
        if let Some(v) = self.edit_sync_enabled {
            task.edit_sync_enabled = v;
        }
        if let Some(v) = self.blacklist_enabled {
            task.blacklist_enabled = v;
        }
        if let Some(v) = self.show_origin_header {
            task.show_origin_header = v;
        }
        if let Some(v) = self.delay_secs {
            task.delay_secs = v;
        }
        if let Some(words) = self.blacklist_words {
            task.blacklist_words = words;
        }
        if let Some(correlations) = self.correlations {
            task.correlations = correlations;
        }
    }
}
