//! Connection manager: connect/retry/backoff, heartbeat liveness and
//! resubscribe-on-reconnect.
//!
//! One background task owns the whole life cycle
//! (`Disconnected → Connecting → Connected → Disconnected …`); the public
//! handle talks to it over a command channel, so concurrent `connect()`
//! callers share a single in-flight attempt and observe exactly one
//! resolution per connection generation.
//!
//! After a drop, a reconnect is scheduled after
//! `reconnect_delay + error_delay`: the error delay is zero on the first
//! attempt after any successful connection and a fresh random value
//! (bounded by `max_error_delay`) on each subsequent failure, so fleets of
//! clients don't storm the server in lockstep. An explicit [`close`]
//! permanently suppresses reconnection for this manager.
//!
//! [`close`]: ConnectionManager::close

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::client::remote::RemoteSubscriptions;
use crate::domain::{Connector, TransportPtr};
use crate::error::{Result, RpcError};
use crate::lock_ignore_poison;
use crate::macros::{log_debug, log_info, log_warn};
use crate::rpc_config::RpcConfig;
use crate::session::{Session, SessionEvent};

/// Effectively "never" for disabled heartbeat deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Connection life cycle states, observable via
/// [`ConnectionManager::state_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum ConnCmd {
    Connect(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

/// Why the connected phase ended.
enum ConnectedOutcome {
    /// Transport dropped or heartbeat failed; reconnect.
    Lost,
    /// Explicit close; reply on the sender and stop for good.
    UserClosed(oneshot::Sender<()>),
    /// Every handle to the manager is gone; stop.
    HandlesDropped,
}

/// Handle to the connection life cycle task. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ConnectionManager {
    cmd_tx: mpsc::Sender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    session_slot: Arc<Mutex<Option<Session>>>,
}

impl ConnectionManager {
    /// Start the life cycle task. No connection is attempted until
    /// [`connect`](Self::connect) is called.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: RpcConfig,
        remote: Arc<RemoteSubscriptions>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let session_slot: Arc<Mutex<Option<Session>>> = Arc::new(Mutex::new(None));

        let task = ManagerTask {
            connector,
            config,
            remote,
            cmd_rx,
            state_tx,
            session_slot: session_slot.clone(),
        };
        tokio::spawn(task.run());

        Self {
            cmd_tx,
            state_rx,
            session_slot,
        }
    }

    /// Establish a connection, sharing any attempt already in flight.
    ///
    /// Resolves when the current generation's attempt settles. A failed
    /// attempt resolves with an error while the manager keeps retrying in
    /// the background.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Connect(tx))
            .await
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Close the connection and permanently suppress reconnection.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ConnCmd::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// The live session, if currently connected.
    pub fn session(&self) -> Result<Session> {
        lock_ignore_poison(&self.session_slot)
            .clone()
            .ok_or(RpcError::Disconnected)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch life cycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

struct ManagerTask {
    connector: Arc<dyn Connector>,
    config: RpcConfig,
    remote: Arc<RemoteSubscriptions>,
    cmd_rx: mpsc::Receiver<ConnCmd>,
    state_tx: watch::Sender<ConnectionState>,
    session_slot: Arc<Mutex<Option<Session>>>,
}

impl ManagerTask {
    async fn run(mut self) {
        let mut waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();
        // Failed attempts since the last successful connection; drives the
        // randomized part of the backoff.
        let mut failed_attempts: u32 = 0;
        let mut auto_reconnect = false;

        loop {
            if !auto_reconnect && waiters.is_empty() {
                // Idle: nothing to do until someone asks for a connection.
                match self.cmd_rx.recv().await {
                    Some(ConnCmd::Connect(tx)) => waiters.push(tx),
                    Some(ConnCmd::Close(tx)) => {
                        let _ = tx.send(());
                        return;
                    }
                    None => return,
                }
            }

            if auto_reconnect {
                let delay = self.config.reconnect_delay + self.error_delay(failed_attempts);
                log_debug!("reconnecting in {delay:?}");
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = self.cmd_rx.recv() => match cmd {
                            Some(ConnCmd::Connect(tx)) => waiters.push(tx),
                            Some(ConnCmd::Close(tx)) => {
                                let _ = tx.send(());
                                return;
                            }
                            None => return,
                        },
                    }
                }
            }

            let _ = self.state_tx.send(ConnectionState::Connecting);

            match self.connector.connect().await {
                Err(e) => {
                    log_warn!("connect attempt failed: {e}");
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    failed_attempts += 1;
                    let reason = e.to_string();
                    for tx in waiters.drain(..) {
                        let _ = tx.send(Err(RpcError::Transport(reason.clone())));
                    }
                    auto_reconnect = true;
                }
                Ok((transport, inbox)) => {
                    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
                    let session = Session::spawn(
                        self.config.clone(),
                        transport.clone(),
                        inbox,
                        None,
                        Some(self.remote.clone()),
                        Value::Null,
                        Some(ev_tx),
                    );
                    *lock_ignore_poison(&self.session_slot) = Some(session.clone());

                    // Re-establish every active subscription before letting
                    // pushes flow; queued pushes flush in arrival order.
                    self.remote.pause_all();
                    self.resubscribe(&session).await;
                    self.remote.resume_and_flush_all();

                    failed_attempts = 0;
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    for tx in waiters.drain(..) {
                        let _ = tx.send(Ok(()));
                    }
                    log_info!("connected");

                    let outcome = self.run_connected(&session, &mut ev_rx, &transport).await;

                    *lock_ignore_poison(&self.session_slot) = None;
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    // No pushes can arrive while disconnected; pausing keeps
                    // delivery deterministic around the next resubscribe.
                    self.remote.pause_all();

                    match outcome {
                        ConnectedOutcome::Lost => auto_reconnect = true,
                        ConnectedOutcome::UserClosed(tx) => {
                            let _ = tx.send(());
                            return;
                        }
                        ConnectedOutcome::HandlesDropped => return,
                    }
                }
            }
        }
    }

    /// Serve the connected phase: heartbeat plus command handling. Returns
    /// how the connection ended.
    async fn run_connected(
        &mut self,
        session: &Session,
        ev_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        transport: &TransportPtr,
    ) -> ConnectedOutcome {
        let ping_interval = self.config.ping_interval;
        let heartbeat = ping_interval.unwrap_or(FAR_FUTURE);

        let mut last_activity = Instant::now();
        let mut ping_deadline = last_activity + heartbeat;
        // Liveness window: 1.5 × the ping interval.
        let mut dead_deadline = last_activity + heartbeat + heartbeat / 2;

        loop {
            let ping_sleep = tokio::time::sleep_until(ping_deadline);
            let dead_sleep = tokio::time::sleep_until(dead_deadline);
            tokio::pin!(ping_sleep);
            tokio::pin!(dead_sleep);

            tokio::select! {
                biased;

                _ = &mut dead_sleep, if ping_interval.is_some() => {
                    log_warn!(
                        "no heartbeat within 1.5 x {heartbeat:?}; closing connection"
                    );
                    session.close("heartbeat timeout").await;
                    return ConnectedOutcome::Lost;
                }

                ev = ev_rx.recv() => match ev {
                    Some(SessionEvent::Activity) => {
                        last_activity = Instant::now();
                        ping_deadline = last_activity + heartbeat;
                        dead_deadline = last_activity + heartbeat + heartbeat / 2;
                    }
                    Some(SessionEvent::Closed(reason)) => {
                        log_info!("connection lost: {reason}");
                        return ConnectedOutcome::Lost;
                    }
                    None => return ConnectedOutcome::Lost,
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    // Already connected: this generation resolved.
                    Some(ConnCmd::Connect(tx)) => {
                        let _ = tx.send(Ok(()));
                    }
                    Some(ConnCmd::Close(tx)) => {
                        session.close("closed by client").await;
                        return ConnectedOutcome::UserClosed(tx);
                    }
                    None => {
                        session.close("client dropped").await;
                        return ConnectedOutcome::HandlesDropped;
                    }
                },

                _ = &mut ping_sleep, if ping_interval.is_some() => {
                    if let Err(e) = transport.ping().await {
                        log_warn!("heartbeat ping failed: {e}");
                        session.close("ping failed").await;
                        return ConnectedOutcome::Lost;
                    }
                    ping_deadline = Instant::now() + heartbeat;
                }
            }
        }
    }

    /// Re-issue every active subscription on a fresh session, feeding
    /// returned values back into the registry. An entry whose resubscribe
    /// fails has its consumers dropped without affecting the others.
    async fn resubscribe(&self, session: &Session) {
        let subscriptions = self.remote.get_all();
        if subscriptions.is_empty() {
            return;
        }
        log_info!("resubscribing {} subscription(s)", subscriptions.len());

        for (item, filter, consumers) in subscriptions {
            match session.subscribe_remote(&item, filter.clone()).await {
                Ok(data) => self.remote.consume(&item, &filter, data),
                Err(e) => {
                    log_warn!(
                        "resubscribe of {item} failed ({e}); dropping {consumers} consumer(s)"
                    );
                    self.remote.remove_entry(&item, &filter);
                }
            }
        }
    }

    fn error_delay(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        random_delay(self.config.max_error_delay)
    }
}

/// Fresh random duration in `0..max`, derived by hashing the clock so no
/// RNG dependency is needed.
fn random_delay(max: Duration) -> Duration {
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());
    let factor = (hash % 1000) as f64 / 1000.0;
    Duration::from_secs_f64(max.as_secs_f64() * factor)
}
