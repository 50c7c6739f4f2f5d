//! Lock service transport
//!
//! `LockApi` abstracts the server-side lock store: request/response
//! endpoints plus a push subscription held while the lock is owned.
//! `HttpLockApi` is the production implementation; the in-memory double in
//! [`crate::testing`] implements the same trait for tests.
//!
//! Every operation is an independent network call whose failure never
//! silently mutates local held/blocked assumptions; the coordinator decides
//! what an error means in its current state.

mod http;
pub(crate) mod push;

pub use http::{HttpLockApi, HttpLockApiBuilder};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::identity::Identity;

/// Opaque identifier of the protected record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a resource key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity and display name of some other context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub client_id: String,
    pub tab_id: String,
    pub display_name: String,
}

impl PeerInfo {
    /// Build peer info for our own context
    pub fn own(identity: &Identity, display_name: &str) -> Self {
        Self {
            client_id: identity.client_id.clone(),
            tab_id: identity.tab_id.clone(),
            display_name: display_name.to_string(),
        }
    }

    /// Whether this peer is exactly the given context
    pub fn is_identity(&self, identity: &Identity) -> bool {
        self.client_id == identity.client_id && self.tab_id == identity.tab_id
    }
}

/// Read-only lock status for a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub locked: bool,
    /// Whether the caller's own identity (client and tab) holds the lock
    pub mine: bool,
    pub holder: Option<PeerInfo>,
    pub expires_in_secs: Option<u64>,
}

/// Outcome of an acquire or steal attempt
///
/// A refusal (`acquired: false`) is an expected outcome, not an error; the
/// holder details say who to blame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub acquired: bool,
    pub token: Option<String>,
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub stolen: bool,
    pub reason: Option<String>,
    pub holder: Option<PeerInfo>,
}

/// Outcome of a release call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// Outcome of a heartbeat renewal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub renewed: bool,
    pub expires_in_secs: Option<u64>,
}

/// Outcome of an ownership request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAccessResponse {
    pub request_id: Uuid,
    /// Seconds until the holder's decision window closes
    pub decision_in_secs: u64,
    /// Wall-clock deadline, for display only
    pub decision_deadline: DateTime<Utc>,
    /// True when an earlier request already existed; the deadline above is
    /// the existing one and is never extended
    #[serde(default)]
    pub already_pending: bool,
}

/// Outcome of a grant/decline response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondResponse {
    pub ok: bool,
}

/// An active ownership request as the server reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: Uuid,
    pub requester: PeerInfo,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub decision_deadline: DateTime<Utc>,
    /// Seconds remaining in the decision window at response time
    pub decision_in_secs: u64,
}

/// Named event from the push subscription
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Channel established; carries the server's advertised maximum
    /// connection duration, if any
    Connected { max_duration_secs: Option<u64> },
    /// The lock was reassigned away from the subscriber
    LockStolen { holder: Option<PeerInfo> },
    /// The lock was released server-side
    LockReleased,
    /// Keep-alive from the server
    Heartbeat,
    /// A spectator asked for ownership
    OwnershipRequested(PendingRequest),
    /// The server is closing the channel after its maximum duration
    Timeout,
    /// Server-reported channel error
    ChannelError { message: String },
}

impl PushEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::LockStolen { .. } => "lock_stolen",
            Self::LockReleased => "lock_released",
            Self::Heartbeat => "heartbeat",
            Self::OwnershipRequested(_) => "ownership_requested",
            Self::Timeout => "timeout",
            Self::ChannelError { .. } => "error",
        }
    }
}

/// Stream of push events for one subscription
pub type PushStream = BoxStream<'static, Result<PushEvent>>;

/// The lock service endpoints
///
/// `subscribe` is opened only after a successful acquire and must be dropped
/// the instant the lock is no longer held; all other operations are
/// independent request/response calls.
#[async_trait]
pub trait LockApi: Send + Sync {
    /// Read lock status; never mutates server state
    async fn status(&self, key: &ResourceKey, identity: &Identity) -> Result<StatusResponse>;

    /// Atomic test-and-set acquire
    async fn acquire(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
    ) -> Result<AcquireResponse>;

    /// Forced reassignment; only ever issued on explicit user action
    async fn steal(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
    ) -> Result<AcquireResponse>;

    /// Idempotent release; requires the ownership token
    async fn release(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        token: &str,
    ) -> Result<ReleaseResponse>;

    /// Renew the lease TTL; requires the ownership token
    async fn heartbeat(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        token: &str,
    ) -> Result<HeartbeatResponse>;

    /// Open the push subscription for a held lock
    async fn subscribe(&self, key: &ResourceKey, identity: &Identity) -> Result<PushStream>;

    /// Ask the current holder for ownership
    async fn request_access(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        message: &str,
    ) -> Result<RequestAccessResponse>;

    /// Grant or decline a pending ownership request
    async fn respond(
        &self,
        request_id: Uuid,
        identity: &Identity,
        granted: bool,
    ) -> Result<RespondResponse>;

    /// List active ownership requests for a resource
    async fn pending_requests(&self, key: &ResourceKey) -> Result<Vec<PendingRequest>>;
}
