//! Task administration: edit flags, imports, status

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use courier_core::task::normalize_word;
use courier_core::{ChatId, Correlations, Identity, Task, TaskUpdate};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> bool {
        switch == Switch::On
    }
}

#[derive(Debug, Default, Args)]
pub struct EditArgs {
    /// Replace the source chats (comma separated)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub sources: Option<Vec<ChatId>>,

    /// Replace the destination chats (comma separated, in order)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub targets: Option<Vec<ChatId>>,

    /// Relay new messages
    #[arg(long, value_enum)]
    pub forward: Option<Switch>,

    /// Mirror edits onto relayed copies
    #[arg(long, value_enum)]
    pub edit_sync: Option<Switch>,

    /// Skip messages containing a blacklisted word
    #[arg(long, value_enum)]
    pub blacklist: Option<Switch>,

    /// Relay as attributed forwards (copies are not tracked)
    #[arg(long, value_enum)]
    pub origin_header: Option<Switch>,

    /// Seconds to wait before relaying
    #[arg(long)]
    pub delay: Option<u64>,

    /// Add a blacklist word (repeatable)
    #[arg(long = "add-word")]
    pub add_words: Vec<String>,

    /// Remove a blacklist word (repeatable)
    #[arg(long = "remove-word")]
    pub remove_words: Vec<String>,

    /// Forget every recorded source-to-copy correlation
    #[arg(long)]
    pub clear_correlations: bool,
}

/// Turn edit flags into an update against the current task
pub fn build_update(args: &EditArgs, current: &Task) -> Result<TaskUpdate> {
    let mut update = TaskUpdate {
        sources: args.sources.as_ref().map(|s| s.iter().copied().collect()),
        targets: args.targets.clone(),
        forwarding_enabled: args.forward.map(bool::from),
        edit_sync_enabled: args.edit_sync.map(bool::from),
        blacklist_enabled: args.blacklist.map(bool::from),
        show_origin_header: args.origin_header.map(bool::from),
        delay_secs: args.delay,
        ..Default::default()
    };

    if !args.add_words.is_empty() || !args.remove_words.is_empty() {
        let mut words = current.blacklist_words.clone();
        for word in &args.add_words {
            let Some(word) = normalize_word(word) else {
                bail!("Blacklist words must not be empty");
            };
            words.insert(word);
        }
        for word in &args.remove_words {
            if let Some(word) = normalize_word(word)
                && !words.remove(&word)
            {
                println!("'{}' was not blacklisted", word);
            }
        }
        update.blacklist_words = Some(words);
    }

    if args.clear_correlations {
        update.correlations = Some(Correlations::new());
    }

    if update.is_empty() {
        bail!("Nothing to change. See `courier task edit --help`.");
    }
    Ok(update)
}

/// Parse an import file: either an array of task records or an object
/// mapping task name to record. Records may use the legacy field names.
pub fn parse_import(content: &str) -> Result<Vec<Task>> {
    let value: Value = serde_json::from_str(content).context("Import file is not valid JSON")?;

    let records: Vec<Value> = match value {
        Value::Array(records) => records,
        Value::Object(map) => map
            .into_iter()
            .map(|(name, mut record)| {
                if let Value::Object(fields) = &mut record
                    && !fields.contains_key("name")
                    && !fields.contains_key("work_name")
                {
                    fields.insert("name".to_string(), Value::String(name));
                }
                record
            })
            .collect(),
        _ => bail!("Import file must hold an array or an object of task records"),
    };

    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let mut task: Task = serde_json::from_value(record)
                .with_context(|| format!("Task record #{} is invalid", i + 1))?;
            for word in std::mem::take(&mut task.blacklist_words) {
                if let Some(word) = normalize_word(&word) {
                    task.blacklist_words.insert(word);
                }
            }
            Ok(task)
        })
        .collect()
}

/// Overview printed by `courier status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub total: usize,
    pub active: usize,
    pub stopped: usize,
    pub mode: Identity,
    pub secondary_configured: bool,
}

impl Status {
    pub fn new(tasks: &[Task], mode: Identity, secondary_configured: bool) -> Self {
        let active = tasks.iter().filter(|t| t.forwarding_enabled).count();
        Self {
            total: tasks.len(),
            active,
            stopped: tasks.len() - active,
            mode,
            secondary_configured,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tasks:      {}", self.total)?;
        writeln!(f, "  active:   {}", self.active)?;
        writeln!(f, "  stopped:  {}", self.stopped)?;
        writeln!(f, "Mode:       {}", self.mode)?;
        write!(
            f,
            "Secondary:  {}",
            if self.secondary_configured {
                "configured"
            } else {
                "not configured"
            }
        )
    }
}
