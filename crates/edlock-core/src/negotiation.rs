//! Ownership negotiation: bounded-time request / grant / decline / expire
//!
//! A spectator asks the holder for the lock; the holder gets a fixed
//! decision window and may grant, decline, or simply do nothing. Silence is
//! legitimate: when the deadline passes the request counts as implicitly
//! granted and the requester proceeds to acquire directly.
//!
//! Countdowns derive from a stored deadline recomputed per tick, never from
//! a decrementing counter, so they survive context suspension without drift.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::{PendingRequest, RequestAccessResponse};

/// A requester's view of its own ownership request
#[derive(Debug, Clone)]
pub struct OwnershipTicket {
    pub request_id: Uuid,
    pub message: String,
    /// Wall-clock deadline, for display
    pub decision_deadline: DateTime<Utc>,
    /// True when the server attached us to an earlier request's deadline
    pub already_pending: bool,
    deadline: Instant,
}

impl OwnershipTicket {
    /// Build a ticket from the server's response, anchoring the deadline to
    /// the local monotonic clock
    pub fn from_response(response: &RequestAccessResponse, message: impl Into<String>) -> Self {
        Self {
            request_id: response.request_id,
            message: message.into(),
            decision_deadline: response.decision_deadline,
            already_pending: response.already_pending,
            deadline: Instant::now() + Duration::from_secs(response.decision_in_secs),
        }
    }

    /// Monotonic deadline for timer scheduling
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left in the decision window, recomputed from the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the decision window has closed
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// A holder's view of an inbound ownership request
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    request: PendingRequest,
    deadline: Instant,
}

impl IncomingRequest {
    /// Wrap a server-reported request, anchoring its deadline locally
    pub fn new(request: PendingRequest) -> Self {
        let deadline = Instant::now() + Duration::from_secs(request.decision_in_secs);
        Self { request, deadline }
    }

    pub fn request(&self) -> &PendingRequest {
        &self.request
    }

    pub fn request_id(&self) -> Uuid {
        self.request.request_id
    }

    /// Time left for the holder to decide
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the window closed without a decision; the requester will
    /// take the lock on its own from here
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerInfo;

    fn response(secs: u64, already_pending: bool) -> RequestAccessResponse {
        let now = Utc::now();
        RequestAccessResponse {
            request_id: Uuid::new_v4(),
            decision_in_secs: secs,
            decision_deadline: now + chrono::Duration::seconds(secs as i64),
            already_pending,
        }
    }

    fn pending(secs: u64) -> PendingRequest {
        let now = Utc::now();
        PendingRequest {
            request_id: Uuid::new_v4(),
            requester: PeerInfo {
                client_id: "c2".into(),
                tab_id: "t2".into(),
                display_name: "desk-2".into(),
            },
            message: "need access".into(),
            created_at: now,
            decision_deadline: now + chrono::Duration::seconds(secs as i64),
            decision_in_secs: secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_countdown_derives_from_deadline() {
        let ticket = OwnershipTicket::from_response(&response(60, false), "need access");
        assert!(!ticket.is_expired());
        assert_eq!(ticket.remaining(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(ticket.remaining(), Duration::from_secs(15));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(ticket.is_expired());
        assert_eq!(ticket.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_request_expiry() {
        let incoming = IncomingRequest::new(pending(60));
        assert!(!incoming.is_expired());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(incoming.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_pending_keeps_existing_deadline() {
        let ticket = OwnershipTicket::from_response(&response(25, true), "me too");
        assert!(ticket.already_pending);
        assert_eq!(ticket.remaining(), Duration::from_secs(25));
    }
}
