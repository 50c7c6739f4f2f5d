//! Stable per-client and per-context identity
//!
//! The coordination protocol distinguishes two identity layers: a durable
//! `client_id` shared by every context of one operator profile, and a
//! `tab_id` unique to each running context. Two tabs of the same operator
//! therefore present the same client identity but different tab identities,
//! which is what lets the coordinator tell "my other tab holds this" apart
//! from a genuinely foreign holder.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identity of one browsing context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Durable identifier shared across every context of this profile
    pub client_id: String,

    /// Identifier of this specific running context
    pub tab_id: String,
}

impl Identity {
    /// Whether another identity belongs to the same profile
    pub fn same_client(&self, other_client_id: &str) -> bool {
        self.client_id == other_client_id
    }
}

/// Derives and persists context identity
///
/// The client id is stored under the user data directory so it survives
/// restarts; the tab id is fresh for each provider. No network calls are
/// involved. If the durable store is unavailable the provider falls back to
/// an in-memory client id and logs the degraded mode.
#[derive(Debug)]
pub struct IdentityProvider {
    identity: Identity,
    persistent: bool,
}

impl IdentityProvider {
    const CLIENT_ID_FILE: &'static str = "client-id";

    /// Create a provider using the default data directory
    pub fn new() -> Self {
        let dir = dirs::data_dir().map(|d| d.join("edlock"));
        Self::with_store_dir(dir)
    }

    /// Create a provider storing the client id under the given directory
    ///
    /// `None` (or an unwritable directory) degrades to a non-persistent
    /// in-memory client id.
    pub fn with_store_dir(dir: Option<PathBuf>) -> Self {
        let (client_id, persistent) = match dir {
            Some(dir) => match load_or_create_client_id(&dir) {
                Ok(id) => (id, true),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Identity store unavailable, using non-persistent client id"
                    );
                    (Uuid::new_v4().to_string(), false)
                }
            },
            None => {
                warn!("No data directory, using non-persistent client id");
                (Uuid::new_v4().to_string(), false)
            }
        };

        let identity = Identity {
            client_id,
            tab_id: Uuid::new_v4().to_string(),
        };
        debug!(
            client_id = %identity.client_id,
            tab_id = %identity.tab_id,
            persistent,
            "Derived context identity"
        );

        Self {
            identity,
            persistent,
        }
    }

    /// The identity for this context; stable for the provider's lifetime
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the client id survives restarts
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Default display name for this context, derived from the hostname
    pub fn default_display_name() -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn load_or_create_client_id(dir: &Path) -> Result<String> {
    let path = dir.join(IdentityProvider::CLIENT_ID_FILE);

    if let Ok(contents) = fs::read_to_string(&path) {
        let id = contents.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    fs::create_dir_all(dir)
        .map_err(|e| Error::Identity(format!("cannot create {}: {}", dir.display(), e)))?;

    let id = Uuid::new_v4().to_string();
    fs::write(&path, &id)
        .map_err(|e| Error::Identity(format!("cannot write {}: {}", path.display(), e)))?;

    Ok(id)
}
