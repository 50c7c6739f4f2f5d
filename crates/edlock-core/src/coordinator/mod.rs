//! Lock coordinator: the state machine owning lock state for one resource
//!
//! One driver task per coordinator owns every piece of mutable state. The
//! three wake-up sources (push channel, cross-tab broadcast, polling) and
//! host commands all funnel into a single trigger channel, so every state
//! mutation flows through one serialized reconciliation path; a poll tick
//! landing mid-acquire queues behind it instead of issuing a duplicate
//! network call. Server responses are authoritative and override any
//! locally-inferred state; broadcasts only bring reverification forward in
//! time, never flip state directly.

mod state;

pub use state::{Connectivity, CoordinatorState, LockSnapshot, OutboundRequest};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::{NoopBroadcast, TabBroadcast, TabMessage};
use crate::config::CoordinatorConfig;
use crate::diagnostics::{self, DiagnosticKind, DiagnosticsRecorder, DiagnosticsReport};
use crate::error::{Error, Result};
use crate::events::{HeldInfo, LockEventHandler, NoopHandler, ReadOnlyInfo};
use crate::identity::{Identity, IdentityProvider};
use crate::negotiation::{IncomingRequest, OwnershipTicket};
use crate::transport::push::{ChannelPolicy, PushSignal, spawn_push_channel};
use crate::transport::{AcquireResponse, LockApi, PeerInfo, PushEvent, ResourceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickKind {
    Heartbeat,
    Reverify,
    Poll,
}

enum Command {
    Release(oneshot::Sender<Result<()>>),
    Steal(oneshot::Sender<Result<()>>),
    Refresh(oneshot::Sender<Result<bool>>),
    RequestOwnership {
        message: String,
        reply: oneshot::Sender<Result<OwnershipTicket>>,
    },
    Respond {
        request_id: Uuid,
        granted: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart(oneshot::Sender<Result<()>>),
    Shutdown(Option<oneshot::Sender<()>>),
}

enum Trigger {
    Tick(TickKind),
    Push(PushSignal),
    TabMessage(TabMessage),
    DecisionDeadline(Uuid),
    Command(Command),
}

/// Builder for a [`LockCoordinator`]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    api: Arc<dyn LockApi>,
    key: ResourceKey,
    identity: Option<Identity>,
    display_name: Option<String>,
    handler: Arc<dyn LockEventHandler>,
    broadcast: Arc<dyn TabBroadcast>,
}

impl CoordinatorBuilder {
    /// Create a builder for the given transport and resource
    pub fn new(api: Arc<dyn LockApi>, key: ResourceKey) -> Self {
        Self {
            config: CoordinatorConfig::default(),
            api,
            key,
            identity: None,
            display_name: None,
            handler: Arc::new(NoopHandler),
            broadcast: Arc::new(NoopBroadcast::new()),
        }
    }

    /// Set the coordinator configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set an explicit identity instead of deriving one
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the display name other contexts see
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Register host callbacks
    pub fn handler(mut self, handler: Arc<dyn LockEventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Attach a cross-tab broadcaster
    pub fn broadcast(mut self, broadcast: Arc<dyn TabBroadcast>) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Spawn the coordinator; it immediately begins its initial check
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Result<LockCoordinator> {
        self.config.validate()?;

        let identity = self
            .identity
            .unwrap_or_else(|| IdentityProvider::new().identity().clone());
        let display_name = self
            .display_name
            .unwrap_or_else(IdentityProvider::default_display_name);

        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(LockSnapshot::initial());
        let diagnostics = Arc::new(DiagnosticsRecorder::new(self.config.diagnostics_capacity));

        let broadcast_task = spawn_broadcast_forwarder(
            self.broadcast.as_ref(),
            &self.key,
            identity.tab_id.clone(),
            trigger_tx.clone(),
        );

        let driver = Driver {
            config: self.config,
            key: self.key.clone(),
            identity: identity.clone(),
            display_name,
            api: self.api.clone(),
            handler: self.handler,
            broadcast: self.broadcast,
            diagnostics: diagnostics.clone(),
            snapshot_tx,
            trigger_tx: trigger_tx.clone(),
            broadcast_task,
            lease: None,
            heartbeat_task: None,
            reverify_task: None,
            poll_task: None,
            push_tasks: None,
            channel_degraded: false,
            heartbeat_failures: 0,
            outbound: None,
            inbound: None,
            last_refresh: None,
        };
        tokio::spawn(driver.run(trigger_rx));

        Ok(LockCoordinator {
            shared: Arc::new(Shared {
                trigger_tx,
                key: self.key,
                identity,
                api: self.api,
                diagnostics,
            }),
            snapshot_rx,
        })
    }
}

fn spawn_broadcast_forwarder(
    hub: &dyn TabBroadcast,
    key: &ResourceKey,
    own_tab_id: String,
    trigger_tx: mpsc::Sender<Trigger>,
) -> JoinHandle<()> {
    let mut rx = hub.subscribe(key);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                // A tab ignores its own messages.
                Ok(msg) if msg.sender_tab_id() == own_tab_id => continue,
                Ok(msg) => {
                    if trigger_tx.send(Trigger::TabMessage(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

struct Shared {
    trigger_tx: mpsc::Sender<Trigger>,
    key: ResourceKey,
    identity: Identity,
    api: Arc<dyn LockApi>,
    diagnostics: Arc<DiagnosticsRecorder>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone; ask the driver to tear down.
        let _ = self
            .trigger_tx
            .try_send(Trigger::Command(Command::Shutdown(None)));
    }
}

/// Handle to a running coordinator
///
/// Cloneable and cheap; all clones drive the same state machine. When the
/// last clone drops, the driver tears down (best-effort release included),
/// but hosts that can await should call [`shutdown`](Self::shutdown)
/// explicitly.
#[derive(Clone)]
pub struct LockCoordinator {
    shared: Arc<Shared>,
    snapshot_rx: watch::Receiver<LockSnapshot>,
}

impl LockCoordinator {
    /// Start building a coordinator
    pub fn builder(api: Arc<dyn LockApi>, key: ResourceKey) -> CoordinatorBuilder {
        CoordinatorBuilder::new(api, key)
    }

    /// The resource this coordinator protects
    pub fn resource_key(&self) -> &ResourceKey {
        &self.shared.key
    }

    /// This context's identity
    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> LockSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Current coordinator state
    pub fn state(&self) -> CoordinatorState {
        self.snapshot_rx.borrow().state.clone()
    }

    /// Watch channel of state snapshots
    pub fn watch(&self) -> watch::Receiver<LockSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until the snapshot satisfies the predicate
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&LockSnapshot) -> bool,
    ) -> LockSnapshot {
        let mut rx = self.snapshot_rx.clone();
        match rx.wait_for(|s| predicate(s)).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Voluntarily release the lock; idempotent
    pub async fn release(&self) -> Result<()> {
        self.send(Command::Release).await
    }

    /// Deliberately reclaim the lock, typically from our own other tab
    ///
    /// Never issued automatically; two tabs of one operator silently
    /// fighting over a record is exactly what this subsystem prevents.
    pub async fn steal(&self) -> Result<()> {
        self.send(Command::Steal).await
    }

    /// Manually re-check lock state, throttled to a minimum interval
    ///
    /// Returns false when the call was swallowed by the throttle.
    pub async fn refresh(&self) -> Result<bool> {
        self.send(Command::Refresh).await
    }

    /// Ask the current holder for ownership
    pub async fn request_ownership(&self, message: impl Into<String>) -> Result<OwnershipTicket> {
        let message = message.into();
        self.send(|reply| Command::RequestOwnership { message, reply })
            .await
    }

    /// Grant or decline a pending ownership request
    pub async fn respond_to_request(&self, request_id: Uuid, granted: bool) -> Result<()> {
        self.send(|reply| Command::Respond {
            request_id,
            granted,
            reply,
        })
        .await
    }

    /// Restart after a terminal state
    pub async fn restart(&self) -> Result<()> {
        self.send(Command::Restart).await
    }

    /// Tear down: stop all timers and subscriptions and issue a
    /// best-effort, bounded-time release
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .trigger_tx
            .send(Trigger::Command(Command::Shutdown(Some(tx))))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// The diagnostics recorder for this coordinator
    pub fn diagnostics(&self) -> Arc<DiagnosticsRecorder> {
        self.shared.diagnostics.clone()
    }

    /// Local state and recent events combined with a fresh server check
    pub async fn diagnostics_report(&self) -> DiagnosticsReport {
        diagnostics::report(
            &self.shared.diagnostics,
            self.shared.api.as_ref(),
            &self.shared.key,
            &self.shared.identity,
            self.snapshot(),
        )
        .await
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .trigger_tx
            .send(Trigger::Command(make(tx)))
            .await
            .map_err(|_| Error::InvalidState("coordinator is shut down".into()))?;
        rx.await
            .map_err(|_| Error::InvalidState("coordinator is shut down".into()))?
    }
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("resource_key", &self.shared.key)
            .field("state", &self.snapshot_rx.borrow().state.name())
            .finish()
    }
}

#[derive(Debug)]
struct Lease {
    token: String,
}

struct Driver {
    config: CoordinatorConfig,
    key: ResourceKey,
    identity: Identity,
    display_name: String,
    api: Arc<dyn LockApi>,
    handler: Arc<dyn LockEventHandler>,
    broadcast: Arc<dyn TabBroadcast>,
    diagnostics: Arc<DiagnosticsRecorder>,
    snapshot_tx: watch::Sender<LockSnapshot>,
    trigger_tx: mpsc::Sender<Trigger>,
    broadcast_task: JoinHandle<()>,
    lease: Option<Lease>,
    heartbeat_task: Option<JoinHandle<()>>,
    reverify_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    /// Push channel task plus its signal forwarder
    push_tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
    channel_degraded: bool,
    heartbeat_failures: u32,
    /// Our own ownership request plus its deadline task
    outbound: Option<(OwnershipTicket, JoinHandle<()>)>,
    /// A spectator's request against our held lock
    inbound: Option<IncomingRequest>,
    last_refresh: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::Receiver<Trigger>) {
        self.run_check().await;

        while let Some(trigger) = rx.recv().await {
            match trigger {
                Trigger::Tick(kind) => self.on_tick(kind).await,
                Trigger::Push(signal) => self.on_push(signal).await,
                Trigger::TabMessage(msg) => self.on_tab_message(msg).await,
                Trigger::DecisionDeadline(id) => self.on_decision_deadline(id).await,
                Trigger::Command(Command::Shutdown(reply)) => {
                    self.teardown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
                Trigger::Command(cmd) => self.on_command(cmd).await,
            }
        }

        // All senders gone without an explicit shutdown.
        self.teardown().await;
    }

    // ───────────────────────── state publication ─────────────────────────

    fn set_state(&mut self, state: CoordinatorState) {
        let previous = self.snapshot_tx.borrow().state.name();
        if self.snapshot_tx.borrow().state == state {
            return;
        }
        info!(
            resource_key = %self.key,
            from = previous,
            to = state.name(),
            "Lock state transition"
        );
        self.diagnostics.record(
            DiagnosticKind::StateChange,
            format!("{} -> {}", previous, state.name()),
        );
        self.snapshot_tx.send_modify(|s| s.state = state);
    }

    fn set_connectivity(&mut self, connectivity: Connectivity) {
        if self.snapshot_tx.borrow().connectivity == connectivity {
            return;
        }
        self.diagnostics.record(
            DiagnosticKind::Transport,
            format!("connectivity {:?}", connectivity),
        );
        self.snapshot_tx.send_modify(|s| s.connectivity = connectivity);
    }

    fn set_outbound_summary(&mut self, summary: Option<OutboundRequest>) {
        self.snapshot_tx.send_modify(|s| s.outbound_request = summary);
    }

    fn current_state(&self) -> CoordinatorState {
        self.snapshot_tx.borrow().state.clone()
    }

    // ─────────────────────────── transitions ────────────────────────────

    async fn run_check(&mut self) {
        self.set_state(CoordinatorState::Checking);

        match self.api.status(&self.key, &self.identity).await {
            Ok(status) if status.locked && !status.mine => {
                self.enter_blocked(status.holder);
            }
            // Free, or a leftover same-tab lock from a previous page load;
            // acquire is idempotent for our own identity either way.
            Ok(_) => self.run_acquire().await,
            Err(e) => self.enter_error(e),
        }
    }

    async fn run_acquire(&mut self) {
        self.set_state(CoordinatorState::Acquiring);

        match self
            .api
            .acquire(&self.key, &self.identity, &self.display_name, self.config.ttl)
            .await
        {
            Ok(resp) if resp.acquired => self.enter_held(resp),
            Ok(resp) => self.enter_blocked(resp.holder),
            Err(e) => self.enter_error(e),
        }
    }

    fn enter_held(&mut self, resp: AcquireResponse) {
        let Some(token) = resp.token else {
            self.enter_error(Error::Protocol("acquired without a token".into()));
            return;
        };
        let expires_in = Duration::from_secs(
            resp.expires_in_secs.unwrap_or(self.config.ttl.as_secs()),
        );

        // Idempotent re-acquire keeps the running machinery; no duplicate
        // subscription, no re-broadcast.
        if self.lease.as_ref().is_some_and(|l| l.token == token) {
            let expires_at =
                Utc::now() + chrono::Duration::from_std(expires_in).unwrap_or_default();
            self.snapshot_tx.send_modify(|s| {
                if let CoordinatorState::Held { expires_at: e, .. } = &mut s.state {
                    *e = expires_at;
                }
            });
            return;
        }

        self.stop_poll();
        self.stop_held_machinery();

        let acquired_at = Utc::now();
        let expires_at =
            acquired_at + chrono::Duration::from_std(expires_in).unwrap_or_default();
        self.lease = Some(Lease { token });
        self.heartbeat_failures = 0;
        self.channel_degraded = false;

        self.heartbeat_task = Some(self.spawn_ticker(TickKind::Heartbeat, self.config.heartbeat_interval));
        self.reverify_task = Some(self.spawn_ticker(TickKind::Reverify, self.config.reverify_interval));
        self.start_push_channel();

        self.broadcast.publish(
            &self.key,
            TabMessage::LockAcquired {
                tab_id: self.identity.tab_id.clone(),
                owner_id: self.identity.client_id.clone(),
                stolen: resp.stolen,
            },
        );

        self.clear_outbound();
        self.set_connectivity(Connectivity::Ok);
        self.set_state(CoordinatorState::Held {
            acquired_at,
            expires_at,
            stolen: resp.stolen,
        });
        self.handler.on_lock_acquired(&HeldInfo {
            resource_key: self.key.clone(),
            acquired_at,
            expires_at,
            stolen: resp.stolen,
        });
    }

    fn enter_blocked(&mut self, holder: Option<PeerInfo>) {
        self.stop_held_machinery();
        self.lease = None;

        let same_tab = holder
            .as_ref()
            .map(|h| h.is_identity(&self.identity))
            .unwrap_or(false);
        let same_owner = !same_tab
            && holder
                .as_ref()
                .map(|h| self.identity.same_client(&h.client_id))
                .unwrap_or(false);

        self.ensure_poll();
        self.set_state(CoordinatorState::Blocked {
            holder: holder.clone(),
            same_owner,
            same_tab,
        });
        self.handler.on_read_only_mode(&ReadOnlyInfo {
            resource_key: self.key.clone(),
            holder,
            same_owner,
            same_tab,
        });
    }

    fn to_lost(&mut self, reason: &str) {
        warn!(resource_key = %self.key, reason, "Lock lost");
        self.diagnostics
            .record(DiagnosticKind::StateChange, format!("lost: {}", reason));
        self.stop_held_machinery();
        self.stop_poll();
        self.lease = None;
        self.inbound = None;
        self.set_connectivity(Connectivity::Ok);
        self.set_state(CoordinatorState::Lost);
        self.handler.on_lock_lost();
    }

    fn enter_error(&mut self, e: Error) {
        // Transport exceptions during check/acquire only; a failure while
        // held goes through the heartbeat failure counter instead, so a
        // transient blip never turns into a false loss.
        error!(resource_key = %self.key, error = %e, code = e.code(), "Lock check failed");
        self.diagnostics
            .record(DiagnosticKind::Transport, format!("{} ({})", e, e.code()));
        self.ensure_poll();
        self.set_state(CoordinatorState::Error {
            message: e.to_string(),
        });
    }

    // ────────────────────────────── ticks ───────────────────────────────

    async fn on_tick(&mut self, kind: TickKind) {
        match kind {
            TickKind::Heartbeat => self.heartbeat_now().await,
            TickKind::Reverify => self.reverify_now().await,
            TickKind::Poll => self.poll_now().await,
        }
    }

    async fn heartbeat_now(&mut self) {
        let Some(token) = self.lease.as_ref().map(|l| l.token.clone()) else {
            return;
        };

        match self.api.heartbeat(&self.key, &self.identity, &token).await {
            Ok(resp) => {
                self.heartbeat_failures = 0;
                if let Some(secs) = resp.expires_in_secs {
                    let renewed = Utc::now() + chrono::Duration::seconds(secs as i64);
                    self.snapshot_tx.send_modify(|s| {
                        if let CoordinatorState::Held { expires_at, .. } = &mut s.state {
                            *expires_at = renewed;
                        }
                    });
                }
                self.set_connectivity(Connectivity::Ok);
            }
            Err(Error::TokenInvalid(msg)) => {
                self.diagnostics
                    .record(DiagnosticKind::Transport, format!("heartbeat rejected: {}", msg));
                self.to_lost("heartbeat token rejected");
            }
            Err(e) => {
                self.heartbeat_failures += 1;
                warn!(
                    resource_key = %self.key,
                    failures = self.heartbeat_failures,
                    error = %e,
                    "Heartbeat failed"
                );
                self.diagnostics
                    .record(DiagnosticKind::Transport, format!("heartbeat failed: {}", e));
                self.set_connectivity(Connectivity::Uncertain);
                if self.heartbeat_failures >= self.config.heartbeat_failure_limit {
                    self.to_lost("repeated heartbeat failures");
                }
            }
        }
    }

    async fn reverify_now(&mut self) {
        if self.lease.is_none() {
            return;
        }

        match self.api.status(&self.key, &self.identity).await {
            Ok(status) if status.locked && status.mine => {
                self.set_connectivity(Connectivity::Ok);
                self.sweep_inbound().await;
            }
            Ok(_) => self.to_lost("reverification found another holder"),
            Err(e) => {
                // Heartbeat failure counting decides when to concede.
                self.diagnostics
                    .record(DiagnosticKind::Transport, format!("reverify failed: {}", e));
                self.set_connectivity(Connectivity::Uncertain);
            }
        }
    }

    /// Drop an expired inbound request and, when the push channel is down,
    /// discover pending requests by polling
    async fn sweep_inbound(&mut self) {
        if self.inbound.as_ref().is_some_and(|r| r.is_expired()) {
            // The requester takes the lock on its own from here.
            self.inbound = None;
        }
        if self.inbound.is_none() && self.channel_degraded {
            if let Ok(requests) = self.api.pending_requests(&self.key).await {
                if let Some(request) = requests.into_iter().next() {
                    self.diagnostics.record(
                        DiagnosticKind::Negotiation,
                        format!("pending request {} discovered by poll", request.request_id),
                    );
                    self.handler.on_lock_requested(&request);
                    self.inbound = Some(IncomingRequest::new(request));
                }
            }
        }
    }

    async fn poll_now(&mut self) {
        match self.current_state() {
            CoordinatorState::Error { .. } => self.run_check().await,
            CoordinatorState::Blocked { holder, .. } => {
                match self.api.status(&self.key, &self.identity).await {
                    Ok(status) if !status.locked => self.run_acquire().await,
                    Ok(status) if status.mine => self.run_acquire().await,
                    Ok(status) => {
                        if status.holder != holder {
                            self.enter_blocked(status.holder);
                        }
                        self.check_outbound_decline().await;
                    }
                    Err(e) => {
                        // Stay blocked; the next poll retries.
                        self.diagnostics
                            .record(DiagnosticKind::Transport, format!("poll failed: {}", e));
                    }
                }
            }
            _ => {}
        }
    }

    /// While our own request is pending, its disappearance with the lock
    /// still held means the holder declined
    async fn check_outbound_decline(&mut self) {
        let Some((ticket, _)) = &self.outbound else {
            return;
        };
        if ticket.is_expired() {
            return;
        }
        let request_id = ticket.request_id;

        if let Ok(requests) = self.api.pending_requests(&self.key).await {
            if !requests.iter().any(|r| r.request_id == request_id) {
                info!(resource_key = %self.key, %request_id, "Ownership request declined");
                self.diagnostics.record(
                    DiagnosticKind::Negotiation,
                    format!("request {} declined", request_id),
                );
                self.clear_outbound();
            }
        }
    }

    // ─────────────────────── push and broadcasts ────────────────────────

    async fn on_push(&mut self, signal: PushSignal) {
        match signal {
            PushSignal::Degraded { reason } => {
                warn!(resource_key = %self.key, reason = %reason, "Push channel degraded");
                self.diagnostics
                    .record(DiagnosticKind::Channel, format!("degraded: {}", reason));
                self.channel_degraded = true;
                self.stop_push_channel();
            }
            PushSignal::Event(event) => {
                if self.lease.is_none() {
                    // Stale event from a channel we already tore down.
                    return;
                }
                debug!(resource_key = %self.key, event = event.name(), "Push event");
                match event {
                    PushEvent::Connected { .. } => {
                        self.channel_degraded = false;
                        self.diagnostics
                            .record(DiagnosticKind::Channel, "connected");
                    }
                    PushEvent::LockStolen { .. } => self.to_lost("lock stolen"),
                    PushEvent::LockReleased => {
                        // Our lock vanished server-side; confirm before
                        // conceding.
                        self.reverify_now().await;
                    }
                    PushEvent::Heartbeat => {}
                    PushEvent::OwnershipRequested(request) => {
                        self.diagnostics.record(
                            DiagnosticKind::Negotiation,
                            format!(
                                "request {} from {}",
                                request.request_id, request.requester.display_name
                            ),
                        );
                        self.handler.on_lock_requested(&request);
                        self.inbound = Some(IncomingRequest::new(request));
                    }
                    PushEvent::Timeout => {
                        self.diagnostics
                            .record(DiagnosticKind::Channel, "server closing channel");
                    }
                    PushEvent::ChannelError { message } => {
                        self.diagnostics
                            .record(DiagnosticKind::Channel, format!("server error: {}", message));
                    }
                }
            }
        }
    }

    async fn on_tab_message(&mut self, msg: TabMessage) {
        self.diagnostics.record(
            DiagnosticKind::Broadcast,
            format!("{:?} from tab {}", msg, msg.sender_tab_id()),
        );

        // Never authoritative: a broadcast only brings the next
        // verification forward.
        match self.current_state() {
            CoordinatorState::Blocked { .. } => self.poll_now().await,
            CoordinatorState::Held { .. } => self.reverify_now().await,
            _ => {}
        }
    }

    async fn on_decision_deadline(&mut self, request_id: Uuid) {
        let matches = self
            .outbound
            .as_ref()
            .is_some_and(|(t, _)| t.request_id == request_id);
        if !matches {
            return;
        }

        info!(
            resource_key = %self.key,
            %request_id,
            "Decision window expired; proceeding to acquire"
        );
        self.diagnostics.record(
            DiagnosticKind::Negotiation,
            format!("request {} window expired, acquiring", request_id),
        );
        self.clear_outbound();

        if self.current_state().is_blocked() {
            self.run_acquire().await;
        }
    }

    // ───────────────────────────── commands ─────────────────────────────

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Release(reply) => {
                let result = self.do_release().await;
                let _ = reply.send(result);
            }
            Command::Steal(reply) => {
                let result = self.do_steal().await;
                let _ = reply.send(result);
            }
            Command::Refresh(reply) => {
                let result = self.do_refresh().await;
                let _ = reply.send(Ok(result));
            }
            Command::RequestOwnership { message, reply } => {
                let result = self.do_request_ownership(message).await;
                let _ = reply.send(result);
            }
            Command::Respond {
                request_id,
                granted,
                reply,
            } => {
                let result = self.do_respond(request_id, granted).await;
                let _ = reply.send(result);
            }
            Command::Restart(reply) => {
                let result = self.do_restart().await;
                let _ = reply.send(result);
            }
            Command::Shutdown(_) => unreachable!("handled in run()"),
        }
    }

    async fn do_release(&mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };

        self.stop_held_machinery();
        self.inbound = None;

        let result = self
            .api
            .release(&self.key, &self.identity, &lease.token)
            .await;
        if let Err(e) = &result {
            // The token is gone either way; the lease will expire on its
            // own server-side.
            warn!(resource_key = %self.key, error = %e, "Release call failed");
            self.diagnostics
                .record(DiagnosticKind::Transport, format!("release failed: {}", e));
        }

        self.broadcast.publish(
            &self.key,
            TabMessage::LockReleased {
                tab_id: self.identity.tab_id.clone(),
            },
        );
        self.set_state(CoordinatorState::Released);
        result.map(|_| ())
    }

    async fn do_steal(&mut self) -> Result<()> {
        if self.lease.is_some() {
            return Ok(());
        }

        match self
            .api
            .steal(&self.key, &self.identity, &self.display_name, self.config.ttl)
            .await
        {
            Ok(resp) if resp.acquired => {
                self.stop_poll();
                self.enter_held(resp);
                Ok(())
            }
            Ok(resp) => {
                self.enter_blocked(resp.holder.clone());
                Err(Error::Conflict {
                    reason: resp.reason.unwrap_or_else(|| "steal refused".into()),
                    holder: resp.holder,
                })
            }
            // No state change; blocked polling carries on.
            Err(e) => Err(e),
        }
    }

    async fn do_refresh(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_refresh {
            if now.duration_since(last) < self.config.refresh_min_interval {
                debug!(resource_key = %self.key, "Manual refresh throttled");
                return false;
            }
        }
        self.last_refresh = Some(now);

        match self.current_state() {
            CoordinatorState::Held { .. } => self.reverify_now().await,
            CoordinatorState::Blocked { .. } | CoordinatorState::Error { .. } => {
                self.poll_now().await
            }
            // In-flight or terminal; nothing to refresh.
            _ => return false,
        }
        true
    }

    async fn do_request_ownership(&mut self, message: String) -> Result<OwnershipTicket> {
        match self.current_state() {
            CoordinatorState::Blocked { same_tab: false, .. } => {}
            CoordinatorState::Blocked { .. } => {
                return Err(Error::InvalidState(
                    "a duplicate coordinator in this tab already holds the lock".into(),
                ));
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot request ownership while {}",
                    other.name()
                )));
            }
        }

        let response = self
            .api
            .request_access(&self.key, &self.identity, &self.display_name, &message)
            .await?;
        let ticket = OwnershipTicket::from_response(&response, message);

        info!(
            resource_key = %self.key,
            request_id = %ticket.request_id,
            already_pending = ticket.already_pending,
            "Ownership requested"
        );
        self.diagnostics.record(
            DiagnosticKind::Negotiation,
            format!("requested ownership ({})", ticket.request_id),
        );

        let deadline_task = {
            let tx = self.trigger_tx.clone();
            let request_id = ticket.request_id;
            let deadline = ticket.deadline();
            tokio::spawn(async move {
                sleep_until(deadline).await;
                let _ = tx.send(Trigger::DecisionDeadline(request_id)).await;
            })
        };

        self.clear_outbound();
        self.set_outbound_summary(Some(OutboundRequest {
            request_id: ticket.request_id,
            decision_deadline: ticket.decision_deadline,
        }));
        self.outbound = Some((ticket.clone(), deadline_task));
        Ok(ticket)
    }

    async fn do_respond(&mut self, request_id: Uuid, granted: bool) -> Result<()> {
        if self.lease.is_none() {
            return Err(Error::InvalidState(
                "cannot respond to a request without holding the lock".into(),
            ));
        }
        let matches = self
            .inbound
            .as_ref()
            .is_some_and(|r| r.request_id() == request_id);
        if !matches {
            return Err(Error::InvalidState(format!(
                "no pending request {}",
                request_id
            )));
        }
        self.inbound = None;

        if granted {
            // Leave held strictly before answering, so the requester can
            // only ever observe success against a released lock.
            self.do_release().await?;
            self.api.respond(request_id, &self.identity, true).await?;
            self.diagnostics.record(
                DiagnosticKind::Negotiation,
                format!("granted request {}", request_id),
            );
        } else {
            self.api.respond(request_id, &self.identity, false).await?;
            self.diagnostics.record(
                DiagnosticKind::Negotiation,
                format!("declined request {}", request_id),
            );
        }
        Ok(())
    }

    async fn do_restart(&mut self) -> Result<()> {
        if self.lease.is_some() {
            return Err(Error::InvalidState("already holding the lock".into()));
        }
        self.clear_outbound();
        self.inbound = None;
        self.run_check().await;
        Ok(())
    }

    // ───────────────────────── task management ──────────────────────────

    fn spawn_ticker(&self, kind: TickKind, period: Duration) -> JoinHandle<()> {
        let tx = self.trigger_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(Trigger::Tick(kind)).await.is_err() {
                    break;
                }
            }
        })
    }

    fn start_push_channel(&mut self) {
        if self.push_tasks.is_some() {
            return;
        }
        let (signal_tx, mut signal_rx) = mpsc::channel(16);
        let channel_task = spawn_push_channel(
            self.api.clone(),
            self.key.clone(),
            self.identity.clone(),
            ChannelPolicy {
                retry_limit: self.config.channel_retry_limit,
                retry_backoff: self.config.channel_retry_backoff,
            },
            signal_tx,
        );
        let trigger_tx = self.trigger_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                if trigger_tx.send(Trigger::Push(signal)).await.is_err() {
                    break;
                }
            }
        });
        self.push_tasks = Some((channel_task, forwarder));
    }

    fn stop_push_channel(&mut self) {
        if let Some((channel, forwarder)) = self.push_tasks.take() {
            channel.abort();
            forwarder.abort();
        }
    }

    fn stop_held_machinery(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = self.reverify_task.take() {
            task.abort();
        }
        self.stop_push_channel();
        self.channel_degraded = false;
        self.heartbeat_failures = 0;
    }

    fn ensure_poll(&mut self) {
        if self.poll_task.is_none() {
            self.poll_task = Some(self.spawn_ticker(TickKind::Poll, self.config.poll_interval));
        }
    }

    fn stop_poll(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }

    fn clear_outbound(&mut self) {
        if let Some((_, task)) = self.outbound.take() {
            task.abort();
        }
        self.set_outbound_summary(None);
    }

    async fn teardown(&mut self) {
        self.stop_held_machinery();
        self.stop_poll();
        self.clear_outbound();
        self.broadcast_task.abort();

        if let Some(lease) = self.lease.take() {
            // Best-effort and bounded; teardown never blocks on the server.
            let released = tokio::time::timeout(
                self.config.teardown_release_timeout,
                self.api.release(&self.key, &self.identity, &lease.token),
            )
            .await;
            match released {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(resource_key = %self.key, error = %e, "Teardown release failed");
                }
                Err(_) => {
                    warn!(resource_key = %self.key, "Teardown release timed out");
                }
            }
            self.broadcast.publish(
                &self.key,
                TabMessage::LockReleased {
                    tab_id: self.identity.tab_id.clone(),
                },
            );
        }

        self.diagnostics
            .record(DiagnosticKind::Teardown, "coordinator shut down");
        debug!(resource_key = %self.key, "Coordinator torn down");
    }
}
