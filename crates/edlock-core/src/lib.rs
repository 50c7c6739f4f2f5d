//! Edlock Core Library
//!
//! This crate provides distributed single-writer lock coordination for
//! shared business records, including:
//! - Lock coordinator state machine (acquire, hold, spectate, lose, release)
//! - Identity model (durable client id plus per-context tab id)
//! - HTTP transport with an SSE push channel and polling fallback
//! - Cross-tab broadcast of lock transitions
//! - Ownership negotiation with a bounded decision window
//! - Presentation mapping from lock state to UI affordances
//! - Diagnostics capture for support tickets
//!
//! A coordinator attaches to one resource key and guarantees that exactly
//! one browsing context edits the record while every other context
//! spectates in read-only mode.

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod identity;
pub mod negotiation;
pub mod presentation;
pub mod testing;
pub mod transport;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broadcast::{LocalBroadcastHub, TabBroadcast, TabMessage};
    pub use crate::config::{CoordinatorConfig, HttpConfig};
    pub use crate::coordinator::{
        Connectivity, CoordinatorBuilder, CoordinatorState, LockCoordinator, LockSnapshot,
    };
    pub use crate::error::{Error, Result};
    pub use crate::events::{HeldInfo, LockEventHandler, ReadOnlyInfo};
    pub use crate::identity::{Identity, IdentityProvider};
    pub use crate::negotiation::{IncomingRequest, OwnershipTicket};
    pub use crate::presentation::{ViewState, view_state};
    pub use crate::transport::{HttpLockApi, LockApi, PushEvent, ResourceKey};
}
