//! In-memory lock server double
//!
//! Implements [`LockApi`] with the server-side semantics the client counts
//! on: atomic test-and-set acquire, TTL expiry, token-checked mutation,
//! serialized ownership requests with implicit grant after the decision
//! deadline, and a push channel per resource. All arbitration happens under
//! one mutex, mirroring a server that serializes lock mutations.
//!
//! Fault injection knobs simulate outages for connectivity tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::transport::{
    AcquireResponse, HeartbeatResponse, LockApi, PeerInfo, PendingRequest, PushEvent, PushStream,
    ReleaseResponse, RequestAccessResponse, ResourceKey, RespondResponse, StatusResponse,
};

#[derive(Debug, Clone)]
struct ServerLock {
    holder: PeerInfo,
    token: String,
    acquired_at: DateTime<Utc>,
    deadline: Instant,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct ServerRequest {
    request_id: Uuid,
    requester: PeerInfo,
    message: String,
    created_at: DateTime<Utc>,
    wall_deadline: DateTime<Utc>,
    deadline: Instant,
}

impl ServerRequest {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn to_pending(&self) -> PendingRequest {
        PendingRequest {
            request_id: self.request_id,
            requester: self.requester.clone(),
            message: self.message.clone(),
            created_at: self.created_at,
            decision_deadline: self.wall_deadline,
            decision_in_secs: self
                .deadline
                .saturating_duration_since(Instant::now())
                .as_secs(),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    locks: HashMap<String, ServerLock>,
    // One active request per resource; concurrency is serialized here.
    requests: HashMap<String, ServerRequest>,
    channels: HashMap<String, broadcast::Sender<PushEvent>>,
}

/// In-memory [`LockApi`] implementation for tests
#[derive(Debug, Default)]
pub struct InMemoryLockServer {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    fail_heartbeats: AtomicU32,
    refuse_subscribes: AtomicBool,
    /// Advertised maximum push connection duration, if any
    max_channel_secs: Mutex<Option<u64>>,
}

impl InMemoryLockServer {
    const CHANNEL_CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate total unreachability; every call fails with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` heartbeat calls with a network error
    pub fn fail_next_heartbeats(&self, n: u32) {
        self.fail_heartbeats.store(n, Ordering::SeqCst);
    }

    /// Refuse every subscribe call while other endpoints keep working
    pub fn set_refuse_subscribes(&self, refuse: bool) {
        self.refuse_subscribes.store(refuse, Ordering::SeqCst);
    }

    /// Advertise a maximum push connection duration on `connected`
    pub fn set_max_channel_secs(&self, secs: Option<u64>) {
        *self.max_channel_secs.lock().unwrap_or_else(|e| e.into_inner()) = secs;
    }

    /// Current holder of a resource, if locked
    pub fn holder_of(&self, key: &ResourceKey) -> Option<PeerInfo> {
        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());
        state.locks.get(key.as_str()).map(|l| l.holder.clone())
    }

    /// Current ownership token of a resource, if locked
    pub fn token_of(&self, key: &ResourceKey) -> Option<String> {
        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());
        state.locks.get(key.as_str()).map(|l| l.token.clone())
    }

    /// Live push subscriber count for a resource
    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        let state = self.lock_state();
        state
            .channels
            .get(key.as_str())
            .map(|c| c.receiver_count())
            .unwrap_or(0)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Network("lock server unreachable".into()))
        } else {
            Ok(())
        }
    }

    /// Drop an expired lock for this key
    fn prune(state: &mut ServerState, key: &str) {
        if let Some(lock) = state.locks.get(key) {
            if Instant::now() >= lock.deadline {
                state.locks.remove(key);
            }
        }
    }

    fn push(state: &mut ServerState, key: &str, event: PushEvent) {
        if let Some(channel) = state.channels.get(key) {
            let _ = channel.send(event);
        }
    }

    fn grant_lock(
        state: &mut ServerState,
        key: &str,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
        stolen: bool,
    ) -> AcquireResponse {
        let lock = ServerLock {
            holder: PeerInfo::own(identity, display_name),
            token: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
            deadline: Instant::now() + ttl,
            ttl,
        };
        let response = AcquireResponse {
            acquired: true,
            token: Some(lock.token.clone()),
            expires_in_secs: Some(ttl.as_secs()),
            stolen,
            reason: None,
            holder: None,
        };
        state.locks.insert(key.to_string(), lock);
        response
    }
}

#[async_trait]
impl LockApi for InMemoryLockServer {
    async fn status(&self, key: &ResourceKey, identity: &Identity) -> Result<StatusResponse> {
        self.check_online()?;
        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());

        Ok(match state.locks.get(key.as_str()) {
            Some(lock) => StatusResponse {
                locked: true,
                mine: lock.holder.is_identity(identity),
                holder: Some(lock.holder.clone()),
                expires_in_secs: Some(
                    lock.deadline.saturating_duration_since(Instant::now()).as_secs(),
                ),
            },
            None => StatusResponse {
                locked: false,
                mine: false,
                holder: None,
                expires_in_secs: None,
            },
        })
    }

    async fn acquire(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
    ) -> Result<AcquireResponse> {
        self.check_online()?;
        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());

        if let Some(lock) = state.locks.get_mut(key.as_str()) {
            if lock.holder.is_identity(identity) {
                // Idempotent re-acquire: same token, refreshed lease.
                lock.deadline = Instant::now() + ttl;
                lock.ttl = ttl;
                return Ok(AcquireResponse {
                    acquired: true,
                    token: Some(lock.token.clone()),
                    expires_in_secs: Some(ttl.as_secs()),
                    stolen: false,
                    reason: None,
                    holder: None,
                });
            }

            // A request whose decision window closed without an answer is an
            // implicit grant: the requester's own acquire now wins.
            let implicit_grant = state
                .requests
                .get(key.as_str())
                .map(|r| r.is_expired() && r.requester.is_identity(identity))
                .unwrap_or(false);

            if implicit_grant {
                state.requests.remove(key.as_str());
                let previous = state.locks.remove(key.as_str());
                let response =
                    Self::grant_lock(&mut state, key.as_str(), identity, display_name, ttl, false);
                if previous.is_some() {
                    Self::push(
                        &mut state,
                        key.as_str(),
                        PushEvent::LockStolen {
                            holder: Some(PeerInfo::own(identity, display_name)),
                        },
                    );
                }
                return Ok(response);
            }

            let holder = state.locks.get(key.as_str()).map(|l| l.holder.clone());
            return Ok(AcquireResponse {
                acquired: false,
                token: None,
                expires_in_secs: None,
                stolen: false,
                reason: Some("locked".into()),
                holder,
            });
        }

        Ok(Self::grant_lock(
            &mut state,
            key.as_str(),
            identity,
            display_name,
            ttl,
            false,
        ))
    }

    async fn steal(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
    ) -> Result<AcquireResponse> {
        self.check_online()?;
        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());

        let previous = state.locks.remove(key.as_str());
        let response =
            Self::grant_lock(&mut state, key.as_str(), identity, display_name, ttl, true);
        if previous.is_some() {
            Self::push(
                &mut state,
                key.as_str(),
                PushEvent::LockStolen {
                    holder: Some(PeerInfo::own(identity, display_name)),
                },
            );
        }
        Ok(response)
    }

    async fn release(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        token: &str,
    ) -> Result<ReleaseResponse> {
        self.check_online()?;
        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());

        match state.locks.get(key.as_str()) {
            // Already gone; release is idempotent.
            None => Ok(ReleaseResponse { released: true }),
            Some(lock) if lock.token == token && lock.holder.is_identity(identity) => {
                state.locks.remove(key.as_str());
                Self::push(&mut state, key.as_str(), PushEvent::LockReleased);
                Ok(ReleaseResponse { released: true })
            }
            Some(_) => Err(Error::TokenInvalid(
                "release token does not match current lock".into(),
            )),
        }
    }

    async fn heartbeat(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        token: &str,
    ) -> Result<HeartbeatResponse> {
        self.check_online()?;

        let failing = self
            .fail_heartbeats
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Network("heartbeat lost".into()));
        }

        let mut state = self.lock_state();
        Self::prune(&mut state, key.as_str());

        match state.locks.get_mut(key.as_str()) {
            Some(lock) if lock.token == token && lock.holder.is_identity(identity) => {
                lock.deadline = Instant::now() + lock.ttl;
                Ok(HeartbeatResponse {
                    renewed: true,
                    expires_in_secs: Some(lock.ttl.as_secs()),
                })
            }
            _ => Err(Error::TokenInvalid(
                "heartbeat token does not match current lock".into(),
            )),
        }
    }

    async fn subscribe(&self, key: &ResourceKey, _identity: &Identity) -> Result<PushStream> {
        self.check_online()?;
        if self.refuse_subscribes.load(Ordering::SeqCst) {
            return Err(Error::Channel("subscribe refused".into()));
        }
        let max_duration_secs = *self.max_channel_secs.lock().unwrap_or_else(|e| e.into_inner());

        let mut rx = {
            let mut state = self.lock_state();
            state
                .channels
                .entry(key.as_str().to_string())
                .or_insert_with(|| broadcast::channel(Self::CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let stream = async_stream::stream! {
            yield Ok(PushEvent::Connected { max_duration_secs });
            loop {
                match rx.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn request_access(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        message: &str,
    ) -> Result<RequestAccessResponse> {
        self.check_online()?;
        let mut state = self.lock_state();

        // One active request per resource; a second requester attaches to
        // the existing deadline, which is never extended.
        if let Some(existing) = state.requests.get(key.as_str()) {
            if !existing.is_expired() {
                return Ok(RequestAccessResponse {
                    request_id: existing.request_id,
                    decision_in_secs: existing
                        .deadline
                        .saturating_duration_since(Instant::now())
                        .as_secs(),
                    decision_deadline: existing.wall_deadline,
                    already_pending: true,
                });
            }
        }

        let window = Duration::from_secs(60);
        let now = Utc::now();
        let request = ServerRequest {
            request_id: Uuid::new_v4(),
            requester: PeerInfo::own(identity, display_name),
            message: message.to_string(),
            created_at: now,
            wall_deadline: now + chrono::Duration::seconds(window.as_secs() as i64),
            deadline: Instant::now() + window,
        };
        let response = RequestAccessResponse {
            request_id: request.request_id,
            decision_in_secs: window.as_secs(),
            decision_deadline: request.wall_deadline,
            already_pending: false,
        };
        let pending = request.to_pending();
        state.requests.insert(key.as_str().to_string(), request);
        Self::push(
            &mut state,
            key.as_str(),
            PushEvent::OwnershipRequested(pending),
        );
        Ok(response)
    }

    async fn respond(
        &self,
        request_id: Uuid,
        _identity: &Identity,
        _granted: bool,
    ) -> Result<RespondResponse> {
        self.check_online()?;
        let mut state = self.lock_state();

        let key = state
            .requests
            .iter()
            .find(|(_, r)| r.request_id == request_id)
            .map(|(k, _)| k.clone());

        match key {
            Some(key) => {
                // Either way the request is settled; a granted requester
                // finds the lock free, a declined one finds it still held.
                state.requests.remove(&key);
                Ok(RespondResponse { ok: true })
            }
            None => Ok(RespondResponse { ok: false }),
        }
    }

    async fn pending_requests(&self, key: &ResourceKey) -> Result<Vec<PendingRequest>> {
        self.check_online()?;
        let state = self.lock_state();

        Ok(state
            .requests
            .get(key.as_str())
            .filter(|r| !r.is_expired())
            .map(|r| vec![r.to_pending()])
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(client: &str, tab: &str) -> Identity {
        Identity {
            client_id: client.into(),
            tab_id: tab.into(),
        }
    }

    const TTL: Duration = Duration::from_secs(90);

    #[tokio::test]
    async fn test_acquire_is_test_and_set() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");
        let b = identity("b", "t1");

        let first = server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        assert!(first.acquired);

        let second = server.acquire(&key, &b, "B", TTL).await.expect("acquire");
        assert!(!second.acquired);
        assert_eq!(second.holder.expect("holder").client_id, "a");
    }

    #[tokio::test]
    async fn test_reacquire_same_tab_reuses_token() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");

        let first = server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        let second = server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        assert_eq!(first.token, second.token);
    }

    #[tokio::test]
    async fn test_refused_subscribe_leaves_other_endpoints_working() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");

        server.set_refuse_subscribes(true);
        server.acquire(&key, &a, "A", TTL).await.expect("acquire");

        let refused = server.subscribe(&key, &a).await;
        assert!(matches!(refused, Err(Error::Channel(_))));
        assert_eq!(server.subscriber_count(&key), 0);

        let status = server.status(&key, &a).await.expect("status");
        assert!(status.mine);

        server.set_refuse_subscribes(false);
        assert!(server.subscribe(&key, &a).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_without_heartbeat() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");

        server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        tokio::time::advance(Duration::from_secs(91)).await;

        let status = server.status(&key, &a).await.expect("status");
        assert!(!status.locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_renews_lease() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");

        let resp = server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        let token = resp.token.expect("token");

        tokio::time::advance(Duration::from_secs(60)).await;
        server.heartbeat(&key, &a, &token).await.expect("renew");
        tokio::time::advance(Duration::from_secs(60)).await;

        let status = server.status(&key, &a).await.expect("status");
        assert!(status.locked, "renewed lease must outlive the original ttl");
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");

        server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        let err = server.release(&key, &a, "bogus").await.expect_err("reject");
        assert!(matches!(err, Error::TokenInvalid(_)));
    }

    #[tokio::test]
    async fn test_steal_notifies_previous_holder() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");
        let b = identity("a", "t2");

        server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        let mut stream = server.subscribe(&key, &a).await.expect("subscribe");

        use futures_util::StreamExt;
        let connected = stream.next().await.expect("event").expect("ok");
        assert!(matches!(connected, PushEvent::Connected { .. }));

        let resp = server.steal(&key, &b, "A2", TTL).await.expect("steal");
        assert!(resp.stolen);

        let stolen = stream.next().await.expect("event").expect("ok");
        assert!(matches!(stolen, PushEvent::LockStolen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_request_grants_implicitly() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");
        let b = identity("b", "t1");

        server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        server
            .request_access(&key, &b, "B", "need access")
            .await
            .expect("request");

        // Before the deadline the acquire is refused.
        let early = server.acquire(&key, &b, "B", TTL).await.expect("try");
        assert!(!early.acquired);

        tokio::time::advance(Duration::from_secs(61)).await;

        let late = server.acquire(&key, &b, "B", TTL).await.expect("try");
        assert!(late.acquired, "post-deadline acquire must succeed");
    }

    #[tokio::test]
    async fn test_second_request_attaches_to_existing_deadline() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");
        let b = identity("b", "t1");
        let c = identity("c", "t1");

        server.acquire(&key, &a, "A", TTL).await.expect("acquire");
        let first = server
            .request_access(&key, &b, "B", "need access")
            .await
            .expect("request");
        let second = server
            .request_access(&key, &c, "C", "me too")
            .await
            .expect("request");

        assert!(second.already_pending);
        assert_eq!(first.request_id, second.request_id);
    }

    #[tokio::test]
    async fn test_offline_mode_fails_all_calls() {
        let server = InMemoryLockServer::new();
        let key = ResourceKey::new("transfer:500");
        let a = identity("a", "t1");

        server.set_offline(true);
        let err = server.status(&key, &a).await.expect_err("offline");
        assert!(matches!(err, Error::Network(_)));

        server.set_offline(false);
        assert!(server.status(&key, &a).await.is_ok());
    }
}
