//! Outcome summaries returned by the propagators

/// Why a propagator did nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// Text matched this blacklist word
    Blacklisted(String),
    /// No correlation entry for the source message
    Untracked,
    /// Edited message carries no text
    NoText,
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blacklisted(word) => write!(f, "blacklisted word '{}'", word),
            Self::Untracked => write!(f, "message not tracked"),
            Self::NoText => write!(f, "no text"),
        }
    }
}

/// What one propagation did across a task's destinations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Destination calls that succeeded
    pub applied: usize,
    /// Destination calls that failed (logged)
    pub failed: usize,
    /// Destinations left alone (already up to date or gone)
    pub unchanged: usize,
    /// Correlation entries written (forward) or cleared (delete)
    pub recorded: usize,
    pub skipped: Option<Skip>,
}

impl Report {
    pub fn skipped(reason: Skip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(reason) = &self.skipped {
            return write!(f, "skipped ({})", reason);
        }
        write!(
            f,
            "{} applied, {} failed, {} unchanged, {} correlations",
            self.applied, self.failed, self.unchanged, self.recorded
        )
    }
}
