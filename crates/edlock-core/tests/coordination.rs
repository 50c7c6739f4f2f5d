//! End-to-end coordination scenarios against the in-memory lock server
//!
//! All tests run under a paused tokio clock, so the real-world intervals
//! (90s TTL, 30s heartbeats, 60s decision window) elapse instantly while
//! ordering stays deterministic.

use std::sync::Arc;
use std::time::Duration;

use edlock_core::broadcast::LocalBroadcastHub;
use edlock_core::config::CoordinatorConfig;
use edlock_core::coordinator::{Connectivity, CoordinatorState, LockCoordinator, LockSnapshot};
use edlock_core::diagnostics::DiagnosticKind;
use edlock_core::events::LockEventHandler;
use edlock_core::identity::Identity;
use edlock_core::presentation::{Badge, PrimaryAction, view_state};
use edlock_core::testing::InMemoryLockServer;
use edlock_core::transport::{PendingRequest, ResourceKey};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

const WAIT_LIMIT: Duration = Duration::from_secs(600);

fn identity(client: &str, tab: &str) -> Identity {
    Identity {
        client_id: client.into(),
        tab_id: tab.into(),
    }
}

fn coordinator(
    server: &Arc<InMemoryLockServer>,
    key: &ResourceKey,
    client: &str,
    tab: &str,
    hub: Option<Arc<LocalBroadcastHub>>,
) -> LockCoordinator {
    let mut builder = LockCoordinator::builder(server.clone(), key.clone())
        .identity(identity(client, tab))
        .display_name(format!("desk-{client}"));
    if let Some(hub) = hub {
        builder = builder.broadcast(hub);
    }
    builder.build().expect("build coordinator")
}

async fn wait_for(c: &LockCoordinator, pred: impl FnMut(&LockSnapshot) -> bool) -> LockSnapshot {
    tokio::time::timeout(WAIT_LIMIT, c.wait_for(pred))
        .await
        .expect("state never reached")
}

/// Handler that forwards inbound ownership request ids to the test
struct RequestLog {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl LockEventHandler for RequestLog {
    fn on_lock_requested(&self, request: &PendingRequest) {
        let _ = self.tx.send(request.request_id);
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_context_holds_second_spectates() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    let held = wait_for(&a, |s| s.state.is_held()).await;
    assert!(matches!(
        held.state,
        CoordinatorState::Held { stolen: false, .. }
    ));
    assert_eq!(
        server.holder_of(&key).expect("holder").client_id,
        "alice"
    );

    let b = coordinator(&server, &key, "bob", "t2", None);
    let blocked = wait_for(&b, |s| s.state.is_blocked()).await;
    let CoordinatorState::Blocked {
        holder,
        same_owner,
        same_tab,
    } = blocked.state
    else {
        panic!("expected blocked");
    };
    assert!(!same_owner);
    assert!(!same_tab);
    assert_eq!(holder.expect("holder info").display_name, "desk-alice");

    // The spectator never disturbed the lock.
    assert_eq!(server.holder_of(&key).expect("holder").client_id, "alice");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_reacquires_same_token() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("invoice:12");

    let first = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&first, |s| s.state.is_held()).await;
    let token = server.token_of(&key).expect("token");

    // Same identity attaching again, as after a page reload.
    let second = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&second, |s| s.state.is_held()).await;
    assert_eq!(server.token_of(&key).expect("token"), token);
    assert_eq!(server.holder_of(&key).expect("holder").tab_id, "t1");

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silence_grants_implicitly_after_decision_window() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    let b = coordinator(&server, &key, "bob", "t2", None);
    wait_for(&b, |s| s.state.is_blocked()).await;

    let ticket = b.request_ownership("need access").await.expect("request");
    assert!(!ticket.already_pending);
    wait_for(&b, |s| s.outbound_request.is_some()).await;

    // The holder stays silent; the window closes on its own.
    let asked_at = Instant::now();
    let held = wait_for(&b, |s| s.state.is_held()).await;
    let waited = asked_at.elapsed();
    assert!(waited >= Duration::from_secs(59), "granted too early: {waited:?}");
    assert!(waited <= Duration::from_secs(65), "granted too late: {waited:?}");
    assert!(held.outbound_request.is_none());

    wait_for(&a, |s| s.state == CoordinatorState::Lost).await;
    assert_eq!(server.holder_of(&key).expect("holder").client_id, "bob");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_grant_releases_before_requester_acquires() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    let b = coordinator(&server, &key, "bob", "t2", None);
    wait_for(&b, |s| s.state.is_blocked()).await;
    let ticket = b.request_ownership("need access").await.expect("request");

    // Let the push event reach the holder.
    tokio::time::sleep(Duration::from_millis(10)).await;

    a.respond_to_request(ticket.request_id, true)
        .await
        .expect("grant");

    // By the time the grant call returns, the holder has already left held
    // and the lock is free; the requester can only ever win a released lock.
    assert_eq!(a.state(), CoordinatorState::Released);
    assert!(server.holder_of(&key).is_none());

    wait_for(&b, |s| s.state.is_held()).await;
    assert_eq!(server.holder_of(&key).expect("holder").client_id, "bob");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_decline_settles_request_without_transfer() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    // Poll finer than the decision window so the requester notices the
    // decline before its deadline would fire.
    let b = LockCoordinator::builder(server.clone(), key.clone())
        .identity(identity("bob", "t2"))
        .display_name("desk-bob")
        .config(CoordinatorConfig::default().with_poll_interval(Duration::from_secs(20)))
        .build()
        .expect("build coordinator");
    wait_for(&b, |s| s.state.is_blocked()).await;
    let ticket = b.request_ownership("need access").await.expect("request");
    wait_for(&b, |s| s.outbound_request.is_some()).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    a.respond_to_request(ticket.request_id, false)
        .await
        .expect("decline");

    // The requester has no decline push; its poll notices the request is
    // gone while the lock is still held.
    wait_for(&b, |s| s.outbound_request.is_none() && s.state.is_blocked()).await;

    // Well past the original decision deadline nothing changes hands.
    tokio::time::sleep(Duration::from_secs(70)).await;
    assert!(b.state().is_blocked());
    assert!(a.state().is_held());
    assert_eq!(server.holder_of(&key).expect("holder").client_id, "alice");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_release_broadcast_beats_spectator_poll() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("order:9");
    let hub = Arc::new(LocalBroadcastHub::new());

    let a = coordinator(&server, &key, "alice", "t1", Some(hub.clone()));
    wait_for(&a, |s| s.state.is_held()).await;

    let b = coordinator(&server, &key, "alice", "t2", Some(hub.clone()));
    let blocked = wait_for(&b, |s| s.state.is_blocked()).await;
    assert!(matches!(
        blocked.state,
        CoordinatorState::Blocked {
            same_owner: true,
            same_tab: false,
            ..
        }
    ));

    let released_at = Instant::now();
    a.release().await.expect("release");
    assert_eq!(a.state(), CoordinatorState::Released);

    // The broadcast brings the sibling's recheck forward; it must not need
    // to wait out a full poll interval.
    wait_for(&b, |s| s.state.is_held()).await;
    assert!(
        released_at.elapsed() < Duration::from_secs(5),
        "sibling waited for the poll instead of the broadcast"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_own_other_tab_can_take_over() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("order:9");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    let b = coordinator(&server, &key, "alice", "t2", None);
    let blocked = wait_for(&b, |s| s.state.is_blocked()).await;

    let view = view_state(&blocked);
    assert_eq!(view.badge, Badge::OwnElsewhere);
    assert_eq!(view.primary_action, Some(PrimaryAction::TakeOver));

    b.steal().await.expect("steal");
    let held = wait_for(&b, |s| s.state.is_held()).await;
    assert!(matches!(
        held.state,
        CoordinatorState::Held { stolen: true, .. }
    ));

    // The previous tab learns of the theft from the push channel.
    wait_for(&a, |s| s.state == CoordinatorState::Lost).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_heartbeat_failure_is_uncertainty_not_loss() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    server.fail_next_heartbeats(1);
    let uncertain = wait_for(&a, |s| s.connectivity == Connectivity::Uncertain).await;
    assert!(uncertain.state.is_held());

    let view = view_state(&uncertain);
    assert_eq!(view.badge, Badge::EditingUncertain);

    // The next successful heartbeat restores confidence.
    wait_for(&a, |s| s.connectivity == Connectivity::Ok).await;
    assert!(a.state().is_held());

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_heartbeat_failures_concede_the_lock() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    server.fail_next_heartbeats(3);
    wait_for(&a, |s| s.state == CoordinatorState::Lost).await;

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_degraded_channel_holds_on_heartbeats_and_polls_requests() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");
    server.set_refuse_subscribes(true);

    let (request_tx, mut request_rx) = mpsc::unbounded_channel();
    let a = LockCoordinator::builder(server.clone(), key.clone())
        .identity(identity("alice", "t1"))
        .display_name("desk-alice")
        .handler(Arc::new(RequestLog { tx: request_tx }))
        .build()
        .expect("build coordinator");
    wait_for(&a, |s| s.state.is_held()).await;

    // Let the channel exhaust its reconnect attempts and a heartbeat land.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let snapshot = a.snapshot();
    assert!(snapshot.state.is_held(), "degraded channel must not cost the lock");
    assert_eq!(snapshot.connectivity, Connectivity::Ok);
    assert_eq!(server.subscriber_count(&key), 0);
    assert!(
        a.diagnostics()
            .recent()
            .iter()
            .any(|e| e.kind == DiagnosticKind::Channel && e.detail.contains("degraded")),
        "channel degradation must be recorded"
    );

    let b = coordinator(&server, &key, "bob", "t2", None);
    wait_for(&b, |s| s.state.is_blocked()).await;
    let ticket = b.request_ownership("need access").await.expect("request");

    // No push can deliver the request; reverification discovers it by poll.
    let discovered = tokio::time::timeout(WAIT_LIMIT, request_rx.recv())
        .await
        .expect("request never discovered")
        .expect("handler dropped");
    assert_eq!(discovered, ticket.request_id);

    a.respond_to_request(ticket.request_id, false)
        .await
        .expect("decline");
    assert!(a.state().is_held());

    // Well past the decision deadline the holder is undisturbed.
    tokio::time::sleep(Duration::from_secs(70)).await;
    assert!(a.state().is_held());
    assert!(b.state().is_blocked());
    assert_eq!(server.holder_of(&key).expect("holder").client_id, "alice");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_state_retries_until_the_service_returns() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    server.set_offline(true);
    let a = coordinator(&server, &key, "alice", "t1", None);
    let snapshot = wait_for(&a, |s| matches!(s.state, CoordinatorState::Error { .. })).await;

    let view = view_state(&snapshot);
    assert_eq!(view.badge, Badge::Unavailable);
    assert_eq!(view.primary_action, Some(PrimaryAction::Retry));

    server.set_offline(false);
    wait_for(&a, |s| s.state.is_held()).await;

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_release_is_idempotent_and_restart_reacquires() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("invoice:12");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    a.release().await.expect("first release");
    a.release().await.expect("second release");
    assert_eq!(a.state(), CoordinatorState::Released);
    assert!(server.holder_of(&key).is_none());

    a.restart().await.expect("restart");
    wait_for(&a, |s| s.state.is_held()).await;

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_the_lock() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("order:9");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;
    assert!(server.holder_of(&key).is_some());

    a.shutdown().await;
    assert!(server.holder_of(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_manual_refresh_is_throttled() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("order:9");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    assert!(a.refresh().await.expect("refresh"));
    assert!(!a.refresh().await.expect("refresh"), "throttle let it through");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(a.refresh().await.expect("refresh"));

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_requester_attaches_to_pending_request() {
    let server = Arc::new(InMemoryLockServer::new());
    let key = ResourceKey::new("transfer:500");

    let a = coordinator(&server, &key, "alice", "t1", None);
    wait_for(&a, |s| s.state.is_held()).await;

    let b = coordinator(&server, &key, "bob", "t2", None);
    wait_for(&b, |s| s.state.is_blocked()).await;
    let c = coordinator(&server, &key, "carol", "t3", None);
    wait_for(&c, |s| s.state.is_blocked()).await;

    let first = b.request_ownership("need access").await.expect("request");
    tokio::time::sleep(Duration::from_secs(10)).await;
    let second = c.request_ownership("me too").await.expect("request");

    assert!(second.already_pending);
    assert_eq!(second.request_id, first.request_id);
    // The existing deadline is never extended by the second requester.
    assert!(second.remaining() <= Duration::from_secs(50));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}
