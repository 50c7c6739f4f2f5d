//! Diagnostics: bounded event ring plus an on-demand server cross-check
//!
//! Read-only by construction; nothing here feeds back into coordinator
//! behavior.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::LockSnapshot;
use crate::error::Result;
use crate::identity::Identity;
use crate::transport::{LockApi, ResourceKey, StatusResponse};

/// Category of a recorded diagnostic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    StateChange,
    Transport,
    Channel,
    Broadcast,
    Negotiation,
    Teardown,
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: DiagnosticKind,
    pub detail: String,
}

/// Bounded ring of recent diagnostic events, most-recent-first on read
#[derive(Debug)]
pub struct DiagnosticsRecorder {
    capacity: usize,
    events: Mutex<VecDeque<DiagnosticEvent>>,
}

impl DiagnosticsRecorder {
    /// Create a recorder keeping at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Record one event, evicting the oldest when full
    pub fn record(&self, kind: DiagnosticKind, detail: impl Into<String>) {
        let event = DiagnosticEvent {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        };
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Recorded events, most recent first
    pub fn recent(&self) -> Vec<DiagnosticEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().rev().cloned().collect()
    }

    /// Number of events currently retained
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local state and recent events combined with a fresh server cross-check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub recorded_at: DateTime<Utc>,
    pub resource_key: ResourceKey,
    pub snapshot: LockSnapshot,
    pub events: Vec<DiagnosticEvent>,
    /// The server's answer, when reachable
    pub server: Option<StatusResponse>,
    pub server_error: Option<String>,
}

/// Build a report by pairing local state with a fresh `status` call
///
/// The status call is read-only; a failure is reported, not propagated.
pub async fn report(
    recorder: &DiagnosticsRecorder,
    api: &dyn LockApi,
    key: &ResourceKey,
    identity: &Identity,
    snapshot: LockSnapshot,
) -> DiagnosticsReport {
    let (server, server_error) = match probe(api, key, identity).await {
        Ok(status) => (Some(status), None),
        Err(e) => (None, Some(e.to_string())),
    };

    DiagnosticsReport {
        recorded_at: Utc::now(),
        resource_key: key.clone(),
        snapshot,
        events: recorder.recent(),
        server,
        server_error,
    }
}

async fn probe(
    api: &dyn LockApi,
    key: &ResourceKey,
    identity: &Identity,
) -> Result<StatusResponse> {
    api.status(key, identity).await
}
