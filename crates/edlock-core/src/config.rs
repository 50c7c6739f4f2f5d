//! Coordinator and transport configuration

use std::time::Duration;

/// Configuration for a lock coordinator
///
/// Defaults are tuned so at least two heartbeats land before the lease
/// expires under normal latency, reverification runs on its own longer
/// cadence, and spectators poll at a coarser interval still.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lease time-to-live requested on acquire
    pub ttl: Duration,

    /// Heartbeat renewal cadence while holding the lock
    pub heartbeat_interval: Duration,

    /// Holder self-reverification cadence, independent of heartbeat
    pub reverify_interval: Duration,

    /// Spectator polling cadence while blocked
    pub poll_interval: Duration,

    /// Decision window granted to the holder on an ownership request
    pub decision_window: Duration,

    /// Minimum spacing between manual refresh calls
    pub refresh_min_interval: Duration,

    /// Consecutive heartbeat failures tolerated before conceding the lock
    pub heartbeat_failure_limit: u32,

    /// Push channel reconnect attempts before degrading to polling
    pub channel_retry_limit: u32,

    /// Fixed backoff between push channel reconnect attempts
    pub channel_retry_backoff: Duration,

    /// Bound on the best-effort release issued during teardown
    pub teardown_release_timeout: Duration,

    /// Diagnostics ring buffer capacity
    pub diagnostics_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(90);
        Self {
            ttl,
            heartbeat_interval: ttl / 3,
            reverify_interval: Duration::from_secs(45),
            poll_interval: Duration::from_secs(60),
            decision_window: Duration::from_secs(60),
            refresh_min_interval: Duration::from_secs(5),
            heartbeat_failure_limit: 3,
            channel_retry_limit: 5,
            channel_retry_backoff: Duration::from_secs(2),
            teardown_release_timeout: Duration::from_secs(2),
            diagnostics_capacity: 128,
        }
    }
}

impl CoordinatorConfig {
    /// Set the lease TTL and re-derive the heartbeat cadence from it
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self.heartbeat_interval = ttl / 3;
        self
    }

    /// Set the heartbeat cadence explicitly
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the holder reverification cadence
    pub fn with_reverify_interval(mut self, interval: Duration) -> Self {
        self.reverify_interval = interval;
        self
    }

    /// Set the spectator polling cadence
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the ownership decision window
    pub fn with_decision_window(mut self, window: Duration) -> Self {
        self.decision_window = window;
        self
    }

    /// Set the manual refresh throttle
    pub fn with_refresh_min_interval(mut self, interval: Duration) -> Self {
        self.refresh_min_interval = interval;
        self
    }

    /// Validate interval relationships
    pub fn validate(&self) -> crate::Result<()> {
        if self.ttl.is_zero() {
            return Err(crate::Error::Config("ttl must be non-zero".into()));
        }
        if self.heartbeat_interval >= self.ttl {
            return Err(crate::Error::Config(
                "heartbeat interval must be shorter than ttl".into(),
            ));
        }
        if self.heartbeat_failure_limit == 0 {
            return Err(crate::Error::Config(
                "heartbeat failure limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL of the lock service, e.g. `https://api.example.com/locks`
    pub base_url: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl HttpConfig {
    /// Create a config for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
