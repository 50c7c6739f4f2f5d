//! Push subscription: SSE event parsing and the reconnecting channel task
//!
//! Server-Sent Events arrive as named `event:`/`data:` pairs terminated by a
//! blank line. The channel task owns the reconnect policy: on failure it
//! retries a bounded number of times with a short fixed backoff, but only
//! while the connection's age is below the server's advertised maximum
//! duration. Past that it reports degradation and exits; the coordinator
//! then lives on heartbeat and periodic reverification alone. The
//! coordinator aborts the task the instant the lock is no longer held.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;

use super::{LockApi, PeerInfo, PendingRequest, PushEvent, ResourceKey};

/// Incremental parser for one SSE event
///
/// Feed lines one at a time; a blank line completes the pending event.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event_name: Option<String>,
    data: String,
}

#[derive(Deserialize)]
struct ConnectedPayload {
    max_duration_secs: Option<u64>,
}

#[derive(Deserialize)]
struct StolenPayload {
    holder: Option<PeerInfo>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a completed event when the line is blank
    pub(crate) fn push_line(&mut self, line: &str) -> Option<Result<PushEvent>> {
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            return self.finish();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
            return None;
        }
        if let Some(data) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(data.trim_start());
        }
        None
    }

    /// Complete the pending event, if any
    pub(crate) fn finish(&mut self) -> Option<Result<PushEvent>> {
        let name = self.event_name.take();
        let data = std::mem::take(&mut self.data);

        let name = name?;
        Some(decode_event(&name, &data))
    }
}

/// Decode one named event with its JSON payload
fn decode_event(name: &str, data: &str) -> Result<PushEvent> {
    match name {
        "connected" => {
            let payload: ConnectedPayload = parse_payload(name, data)?;
            Ok(PushEvent::Connected {
                max_duration_secs: payload.max_duration_secs,
            })
        }
        "lock_stolen" => {
            let payload: StolenPayload = parse_payload(name, data)?;
            Ok(PushEvent::LockStolen {
                holder: payload.holder,
            })
        }
        "lock_released" => Ok(PushEvent::LockReleased),
        "heartbeat" => Ok(PushEvent::Heartbeat),
        "ownership_requested" => {
            let payload: PendingRequest = parse_payload(name, data)?;
            Ok(PushEvent::OwnershipRequested(payload))
        }
        "timeout" => Ok(PushEvent::Timeout),
        "error" => {
            let payload: ErrorPayload = parse_payload(name, data)?;
            Ok(PushEvent::ChannelError {
                message: payload.message,
            })
        }
        other => Err(Error::Protocol(format!("unknown push event '{}'", other))),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(name: &str, data: &str) -> Result<T> {
    let data = if data.trim().is_empty() { "{}" } else { data };
    serde_json::from_str(data)
        .map_err(|e| Error::Protocol(format!("malformed '{}' payload: {}", name, e)))
}

/// Reconnect policy for the push channel
#[derive(Debug, Clone)]
pub(crate) struct ChannelPolicy {
    pub retry_limit: u32,
    pub retry_backoff: Duration,
}

/// Signal from the push channel task to the coordinator
#[derive(Debug)]
pub(crate) enum PushSignal {
    Event(PushEvent),
    /// The channel gave up; the coordinator is on heartbeat and
    /// reverification alone from here
    Degraded { reason: String },
}

/// Spawn the push channel task for a held lock
///
/// The returned handle must be aborted as soon as the lock is no longer
/// believed held.
pub(crate) fn spawn_push_channel(
    api: Arc<dyn LockApi>,
    key: ResourceKey,
    identity: Identity,
    policy: ChannelPolicy,
    signal_tx: mpsc::Sender<PushSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let opened_at = Instant::now();
        let mut failures = 0u32;
        let mut max_age: Option<Duration> = None;

        loop {
            match api.subscribe(&key, &identity).await {
                Ok(mut stream) => {
                    debug!(resource_key = %key, "Push channel connected");
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => {
                                failures = 0;
                                if let PushEvent::Connected { max_duration_secs } = &event {
                                    max_age = max_duration_secs.map(Duration::from_secs);
                                }
                                if signal_tx.send(PushSignal::Event(event)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(resource_key = %key, error = %e, "Push channel read failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(resource_key = %key, error = %e, "Push channel connect failed");
                }
            }

            failures += 1;
            let within_age = max_age.is_none_or(|m| opened_at.elapsed() < m);
            if failures > policy.retry_limit || !within_age {
                let reason = if within_age {
                    format!("gave up after {} attempts", failures)
                } else {
                    "connection exceeded server's maximum duration".to_string()
                };
                let _ = signal_tx.send(PushSignal::Degraded { reason }).await;
                return;
            }
            sleep(policy.retry_backoff).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(lines: &[&str]) -> Vec<Result<PushEvent>> {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = parser.push_line(line) {
                events.push(event);
            }
        }
        if let Some(event) = parser.finish() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_connected_event() {
        let events = parse_all(&["event: connected", r#"data: {"max_duration_secs":300}"#, ""]);
        assert_eq!(events.len(), 1);
        match events[0].as_ref().expect("event") {
            PushEvent::Connected { max_duration_secs } => {
                assert_eq!(*max_duration_secs, Some(300));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_named_events_without_payload() {
        let events = parse_all(&[
            "event: lock_released",
            "",
            "event: heartbeat",
            "",
            "event: timeout",
            "",
        ]);
        let names: Vec<_> = events
            .iter()
            .map(|e| e.as_ref().expect("event").name())
            .collect();
        assert_eq!(names, vec!["lock_released", "heartbeat", "timeout"]);
    }

    #[test]
    fn test_parse_stolen_with_holder() {
        let events = parse_all(&[
            "event: lock_stolen",
            r#"data: {"holder":{"client_id":"c2","tab_id":"t2","display_name":"desk-2"}}"#,
            "",
        ]);
        match events[0].as_ref().expect("event") {
            PushEvent::LockStolen { holder } => {
                assert_eq!(holder.as_ref().expect("holder").client_id, "c2");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_comments_and_unknown_events() {
        let events = parse_all(&[": keep-alive comment", "event: mystery", "data: {}", ""]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unterminated_final_event() {
        let events = parse_all(&["event: lock_released", "data: {}"]);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().expect("event"),
            PushEvent::LockReleased
        ));
    }
}
