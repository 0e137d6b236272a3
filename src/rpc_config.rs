//! Public, transport-agnostic engine configuration.
//!
//! This type intentionally contains no transport-specific concepts
//! (socket options, listener addresses). Transport layers are responsible
//! for their own connection settings; this config drives the protocol
//! engine: call timeouts, the pending-call sweep, heartbeat cadence and
//! the reconnect schedule.

use std::time::Duration;

/// Protocol engine configuration shared by clients and servers.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a pending call may wait for its correlated response before
    /// the sweep rejects it with a timeout error.
    ///
    /// Default: 30 seconds
    pub call_timeout: Duration,

    /// Cadence of the pending-call timeout sweep.
    ///
    /// Sweeping is best-effort: a call is rejected at the first sweep tick
    /// after its deadline, trading slight timing slack for O(1) timer
    /// overhead regardless of call volume.
    ///
    /// Default: 1 second
    pub sweep_interval: Duration,

    /// Heartbeat interval. On an idle connection a ping is sent every
    /// `ping_interval`; silence for 1.5 × the interval closes the socket
    /// and enters the reconnect path. `None` disables the heartbeat.
    ///
    /// Default: 30 seconds
    pub ping_interval: Option<Duration>,

    /// Base delay before a reconnect attempt.
    ///
    /// Default: 1 second
    pub reconnect_delay: Duration,

    /// Upper bound for the random extra delay added to reconnect attempts
    /// after a failed attempt. The extra delay is zero on the first attempt
    /// after any successful connection and freshly randomized on each
    /// subsequent failure, so a fleet of clients doesn't reconnect in
    /// lockstep.
    ///
    /// Default: 15 seconds
    pub max_error_delay: Duration,

    /// When set, outbound calls on a connection are dispatched strictly
    /// FIFO: call N+1 is not sent until call N's response (or timeout) has
    /// been observed.
    ///
    /// Default: false
    pub sync_remote_calls: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        // ---
        Self {
            call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            ping_interval: Some(Duration::from_secs(30)),
            reconnect_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(15),
            sync_remote_calls: false,
        }
    }
}

impl RpcConfig {
    /// Create a config with the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call response timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the timeout-sweep cadence.
    ///
    /// Lowering this tightens how promptly expired calls are rejected; it
    /// does not change the deadline itself.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the heartbeat interval, or disable the heartbeat with `None`.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the base reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the bound for the randomized post-failure reconnect delay.
    pub fn with_max_error_delay(mut self, delay: Duration) -> Self {
        self.max_error_delay = delay;
        self
    }

    /// Enable strict FIFO dispatch of outbound calls.
    pub fn with_sync_remote_calls(mut self, enabled: bool) -> Self {
        self.sync_remote_calls = enabled;
        self
    }
}
