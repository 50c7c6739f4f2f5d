//! Host-facing lock event callbacks

use chrono::{DateTime, Utc};

use crate::transport::{PeerInfo, PendingRequest, ResourceKey};

/// Details handed to the host when the lock is acquired
#[derive(Debug, Clone, PartialEq)]
pub struct HeldInfo {
    pub resource_key: ResourceKey,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stolen: bool,
}

/// Details handed to the host when the lock is held elsewhere
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOnlyInfo {
    pub resource_key: ResourceKey,
    pub holder: Option<PeerInfo>,
    pub same_owner: bool,
    pub same_tab: bool,
}

/// Callbacks the host page registers with a coordinator
///
/// All methods default to no-ops so hosts implement only what they render.
/// Callbacks run on the coordinator's driver task and must not block.
pub trait LockEventHandler: Send + Sync {
    /// The lock is now held by this context
    fn on_lock_acquired(&self, _info: &HeldInfo) {}

    /// The lock was lost: stolen, expired, or the token was rejected
    fn on_lock_lost(&self) {}

    /// A spectator is asking this holder for ownership
    fn on_lock_requested(&self, _request: &PendingRequest) {}

    /// The record is read-only; someone else holds the lock
    fn on_read_only_mode(&self, _info: &ReadOnlyInfo) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl LockEventHandler for NoopHandler {}
