//! Active forwarding identity and the dual-identity dedup rule

use courier_core::{Identity, IdentityStore, MessagingClient};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity '{0}' is not available (not configured or not connected)")]
    Unavailable(Identity),

    /// The switch took effect in memory but was not saved
    #[error("switched to '{identity}' but failed to save the choice: {source}")]
    Persist {
        identity: Identity,
        #[source]
        source: anyhow::Error,
    },
}

/// Holds which identity performs relaying and decides which events to handle.
///
/// Both identities may observe the same chats, so every handler asks the
/// selector before acting on an event.
pub struct IdentitySelector {
    active: RwLock<Identity>,
    client: Arc<dyn MessagingClient>,
    store: Arc<dyn IdentityStore>,
}

impl IdentitySelector {
    /// Restore the persisted choice, falling back to the primary identity when
    /// the stored one is unavailable (the correction is persisted).
    pub async fn load(client: Arc<dyn MessagingClient>, store: Arc<dyn IdentityStore>) -> Self {
        let stored = match store.load_identity().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read stored forward mode, using primary: {:#}", e);
                None
            }
        };

        let active = match stored {
            Some(identity) if client.is_available(identity) => identity,
            Some(identity) => {
                warn!(
                    "Stored forward mode '{}' is not available, falling back to primary",
                    identity
                );
                Identity::Primary
            }
            None => Identity::Primary,
        };

        if stored != Some(active)
            && let Err(e) = store.save_identity(active).await
        {
            warn!("Failed to save forward mode '{}': {:#}", active, e);
        }

        info!("Forwarding identity: {}", active);
        Self {
            active: RwLock::new(active),
            client,
            store,
        }
    }

    pub fn active(&self) -> Identity {
        *self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switch the forwarding identity. Rejected, with the current value kept,
    /// when the requested identity is not available.
    pub async fn set_active(&self, identity: Identity) -> Result<(), IdentityError> {
        if !self.client.is_available(identity) {
            warn!("Rejected switch to unavailable identity '{}'", identity);
            return Err(IdentityError::Unavailable(identity));
        }

        let previous = {
            let mut active = self
                .active
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *active, identity)
        };
        info!("Forwarding identity switched: {} -> {}", previous, identity);

        self.store
            .save_identity(identity)
            .await
            .map_err(|source| IdentityError::Persist { identity, source })
    }

    /// Adopt a forwarding identity saved by another process (`courier mode set`).
    ///
    /// An unavailable stored identity is rejected: the current one stays active
    /// and is written back. Returns the new identity when it changed.
    pub async fn refresh(&self) -> anyhow::Result<Option<Identity>> {
        let Some(stored) = self.store.load_identity().await? else {
            return Ok(None);
        };
        let current = self.active();
        if stored == current {
            return Ok(None);
        }

        if !self.client.is_available(stored) {
            warn!(
                "Stored forward mode '{}' is not available, keeping '{}'",
                stored, current
            );
            if let Err(e) = self.store.save_identity(current).await {
                warn!("Failed to save forward mode '{}': {:#}", current, e);
            }
            return Ok(None);
        }

        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = stored;
        info!("Forwarding identity switched: {} -> {}", current, stored);
        Ok(Some(stored))
    }

    /// Whether an event received by `received_by` should be handled.
    ///
    /// With a single identity available every event is handled, whatever the
    /// stored mode says.
    pub fn should_process(&self, received_by: Identity) -> bool {
        if self.client.available_identities().len() < 2 {
            return true;
        }
        let active = self.active();
        if received_by != active {
            debug!(
                "Ignoring event received by {} (forwarding identity is {})",
                received_by, active
            );
            return false;
        }
        true
    }
}
