//! Coordinator state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::PeerInfo;

/// The coordinator's view of the lock, exactly one variant at a time
///
/// The tagged union replaces the ad hoc boolean flags a lock client tends to
/// accrete; combinations like "held and blocked" are simply not
/// representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Initial status probe in flight
    Checking,
    /// Acquire attempt in flight
    Acquiring,
    /// This context holds the lock
    Held {
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        /// Whether ownership came from a deliberate steal
        stolen: bool,
    },
    /// Someone else holds the lock; this context spectates
    Blocked {
        holder: Option<PeerInfo>,
        /// Same client id, different tab: the operator's own other tab
        same_owner: bool,
        /// The holder identity is exactly this context (duplicate
        /// coordinator in one tab)
        same_tab: bool,
    },
    /// Ownership was lost: stolen, expired, or the token was rejected
    Lost,
    /// Ownership was given up voluntarily
    Released,
    /// A transport failure interrupted checking or acquiring; retried on
    /// the next scheduled check
    Error { message: String },
}

impl CoordinatorState {
    /// Short name for logging and diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Acquiring => "acquiring",
            Self::Held { .. } => "held",
            Self::Blocked { .. } => "blocked",
            Self::Lost => "lost",
            Self::Released => "released",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this context currently holds the lock
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }

    /// Whether the state is terminal until an explicit restart
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Lost | Self::Released)
    }

    /// Whether this context is spectating someone else's lock
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Confidence in the connection to the lock service
///
/// `Uncertain` means the lock is nominally held but recent transport or
/// channel failures make the server's view unverifiable; the UI shows this
/// rather than hiding the problem or prematurely declaring loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Ok,
    Uncertain,
}

/// Summary of an outbound ownership request in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub request_id: Uuid,
    pub decision_deadline: DateTime<Utc>,
}

/// Everything an observer needs to render lock state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub state: CoordinatorState,
    pub connectivity: Connectivity,
    /// Our own pending ownership request, while blocked
    pub outbound_request: Option<OutboundRequest>,
}

impl LockSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            state: CoordinatorState::Checking,
            connectivity: Connectivity::Ok,
            outbound_request: None,
        }
    }
}
