//! Relay engine for courier
//!
//! Decides which events to handle (dual-identity dedup), fans new messages
//! out to each task's destinations, mirrors edits and deletions onto the
//! recorded copies, prunes old correlations, and follows changes written by
//! the admin CLI.

pub mod dispatcher;
pub mod forwarder;
pub mod identity;
pub mod reaper;
pub mod refresher;
pub mod report;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use forwarder::Forwarder;
pub use identity::{IdentityError, IdentitySelector};
pub use reaper::{CorrelationReaper, ReaperConfig, SweepReport};
pub use refresher::StateRefresher;
pub use report::{Report, Skip};
