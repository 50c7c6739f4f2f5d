//! Cross-tab broadcast of lock transitions
//!
//! Fire-and-forget pub/sub scoped to a resource key. Messages carry the
//! sending tab id so every tab can ignore its own. Delivery is a pure
//! optimization: an inbound message only makes the coordinator reverify
//! earlier than its next scheduled poll, never flips state directly, and
//! environments without a shared channel degrade silently to polling alone.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::transport::ResourceKey;

/// A lock transition announced to sibling tabs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabMessage {
    LockAcquired {
        tab_id: String,
        owner_id: String,
        stolen: bool,
    },
    LockReleased {
        tab_id: String,
    },
}

impl TabMessage {
    /// Tab id of the sender
    pub fn sender_tab_id(&self) -> &str {
        match self {
            Self::LockAcquired { tab_id, .. } | Self::LockReleased { tab_id } => tab_id,
        }
    }
}

/// Cross-tab fan-out channel
pub trait TabBroadcast: Send + Sync {
    /// Publish fire-and-forget; delivery is never guaranteed
    fn publish(&self, key: &ResourceKey, message: TabMessage);

    /// Subscribe to messages for one resource key
    fn subscribe(&self, key: &ResourceKey) -> broadcast::Receiver<TabMessage>;
}

/// In-process hub: one broadcast channel per resource key
///
/// Serves hosts running several coordinators in one process, and is the
/// test stand-in for a same-browser channel.
#[derive(Debug, Default)]
pub struct LocalBroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<TabMessage>>>,
}

impl LocalBroadcastHub {
    const CHANNEL_CAPACITY: usize = 32;

    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, key: &ResourceKey) -> broadcast::Sender<TabMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(key.as_str().to_string())
            .or_insert_with(|| broadcast::channel(Self::CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl TabBroadcast for LocalBroadcastHub {
    fn publish(&self, key: &ResourceKey, message: TabMessage) {
        debug!(resource_key = %key, message = ?message, "Broadcasting tab message");
        // No receivers is fine; nobody is listening yet.
        let _ = self.sender(key).send(message);
    }

    fn subscribe(&self, key: &ResourceKey) -> broadcast::Receiver<TabMessage> {
        self.sender(key).subscribe()
    }
}

/// Broadcaster for environments without any cross-tab channel
///
/// Publishes vanish and subscriptions never yield; the coordinator then
/// relies on polling alone.
#[derive(Debug, Default)]
pub struct NoopBroadcast {
    // Kept alive so subscribers see a silent channel, not a closed one.
    sender: Mutex<Option<broadcast::Sender<TabMessage>>>,
}

impl NoopBroadcast {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TabBroadcast for NoopBroadcast {
    fn publish(&self, _key: &ResourceKey, _message: TabMessage) {}

    fn subscribe(&self, _key: &ResourceKey) -> broadcast::Receiver<TabMessage> {
        let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get_or_insert_with(|| broadcast::channel(1).0)
            .subscribe()
    }
}
