//! Per-connection protocol engine.
//!
//! A session owns one transport connection and translates between the wire
//! envelope and in-process calls/events: it correlates responses to pending
//! calls, dispatches inbound calls into the server core, funnels `Data`
//! pushes into the client-side subscription registry, and sweeps timed-out
//! calls on a fixed cadence.
//!
//! # Concurrency
//!
//! All protocol state for the connection lives behind this type's mutexes
//! and is touched by the one receive task plus whatever callers issue
//! outbound calls. Inbound invocations run in their own spawned tasks so a
//! slow handler never stalls the receive loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cache::InvokeResult;
use crate::client::remote::RemoteSubscriptions;
use crate::domain::{TransportEvent, TransportInbox, TransportPtr};
use crate::error::{ErrorBody, Result, RpcError};
use crate::lock_ignore_poison;
use crate::macros::{log_debug, log_error, log_warn};
use crate::middleware::InvocationKind;
use crate::protocol::{CallIdSequence, Envelope, SessionId};
use crate::rpc_config::RpcConfig;
use crate::server::ServerCore;

/// Notifications a session reports to its owner.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// An inbound event arrived; counts as connection liveness.
    Activity,
    /// The session tore down, with a human-readable reason. Terminal.
    Closed(String),
}

struct PendingCall {
    item_name: String,
    created_at: Instant,
    complete: oneshot::Sender<Result<Value>>,
}

struct SessionInner {
    id: SessionId,
    config: RpcConfig,
    transport: TransportPtr,
    ctx: Value,
    pending: Mutex<HashMap<u64, PendingCall>>,
    call_ids: CallIdSequence,
    /// Inbound dispatch target; absent on pure clients.
    server: Option<Arc<ServerCore>>,
    /// `Data` push target; absent on pure servers.
    remote: Option<Arc<RemoteSubscriptions>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    /// FIFO gate for `sync_remote_calls`; the lock is queue-fair, so calls
    /// dispatch strictly in arrival order.
    sync_gate: Option<tokio::sync::Mutex<()>>,
    closed: AtomicBool,
}

/// One live connection's protocol state. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start a session over an established transport: spawns the receive
    /// loop and the timeout sweep.
    pub fn spawn(
        config: RpcConfig,
        transport: TransportPtr,
        inbox: TransportInbox,
        server: Option<Arc<ServerCore>>,
        remote: Option<Arc<RemoteSubscriptions>>,
        ctx: Value,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        let sync_gate = config.sync_remote_calls.then(|| tokio::sync::Mutex::new(()));
        let session = Self {
            inner: Arc::new(SessionInner {
                id: SessionId::generate(),
                config,
                transport,
                ctx,
                pending: Mutex::new(HashMap::new()),
                call_ids: CallIdSequence::new(),
                server,
                remote,
                events,
                sync_gate,
                closed: AtomicBool::new(false),
            }),
        };

        session.spawn_receive_loop(inbox);
        session.spawn_sweep_loop();
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Connection context produced by the accepting side's factory.
    pub fn ctx(&self) -> &Value {
        &self.inner.ctx
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // --- outbound calls -----------------------------------------------------

    /// Invoke a remote item and await its correlated result.
    pub async fn call_remote(&self, name: &str, params: Vec<Value>) -> Result<Value> {
        self.dispatch_call(name, |id| Envelope::Call {
            id,
            name: name.to_string(),
            params,
        })
        .await
    }

    /// One-shot fetch of a remote item's value for a filter.
    pub async fn get_remote(&self, name: &str, filter: Value) -> Result<Value> {
        self.dispatch_call(name, |id| Envelope::Get {
            id,
            name: name.to_string(),
            params: vec![filter],
        })
        .await
    }

    /// Register a subscription with the peer; resolves to the current value.
    pub async fn subscribe_remote(&self, name: &str, filter: Value) -> Result<Value> {
        self.dispatch_call(name, |id| Envelope::Subscribe {
            id,
            name: name.to_string(),
            filter,
        })
        .await
    }

    /// Withdraw a subscription from the peer.
    pub async fn unsubscribe_remote(&self, name: &str, filter: Value) -> Result<Value> {
        self.dispatch_call(name, |id| Envelope::Unsubscribe {
            id,
            name: name.to_string(),
            filter,
        })
        .await
    }

    async fn dispatch_call(
        &self,
        name: &str,
        make_envelope: impl FnOnce(u64) -> Envelope,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }

        // In FIFO mode the gate is held until this call's response (or
        // rejection) has been observed, so call N+1 cannot dispatch before
        // call N settles.
        let _gate = match &self.inner.sync_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let id = self.inner.call_ids.next();
        let frame = make_envelope(id).encode()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.insert(
                id,
                PendingCall {
                    item_name: name.to_string(),
                    created_at: Instant::now(),
                    complete: tx,
                },
            );
        }

        if let Err(e) = self.inner.transport.send(frame).await {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict: the session went away.
            Err(_) => Err(RpcError::Disconnected),
        }
    }

    // --- background tasks ---------------------------------------------------

    fn spawn_receive_loop(&self, mut inbox: TransportInbox) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match inbox.events.recv().await {
                    Some(TransportEvent::Message(frame)) => {
                        session.notify(SessionEvent::Activity);
                        session.handle_frame(&frame);
                    }
                    Some(TransportEvent::Pong) => {
                        session.notify(SessionEvent::Activity);
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        session.teardown(&reason);
                        break;
                    }
                    None => {
                        session.teardown("transport dropped");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_sweep_loop(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(session.inner.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if session.is_closed() {
                    break;
                }
                session.sweep();
            }
        });
    }

    /// Reject every pending call older than the configured timeout.
    fn sweep(&self) {
        let timeout = self.inner.config.call_timeout;
        let now = Instant::now();

        let mut pending = lock_ignore_poison(&self.inner.pending);
        let expired: Vec<u64> = pending
            .iter()
            .filter(|(_, call)| now.duration_since(call.created_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(call) = pending.remove(&id) {
                log_debug!(
                    "call {id} ({}) timed out after {:?}",
                    call.item_name,
                    timeout
                );
                let _ = call.complete.send(Err(RpcError::Timeout));
            }
        }
    }

    // --- inbound dispatch ---------------------------------------------------

    fn handle_frame(&self, frame: &Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Decode failures are isolated per message.
                log_warn!("session {}: dropping frame: {e}", self.inner.id);
                return;
            }
        };

        match envelope {
            Envelope::Result { id, data } => self.complete(id, Ok(data)),
            Envelope::Error { id, body } => self.complete(id, Err(body.into_error())),
            Envelope::Call { id, name, params } => {
                self.dispatch_invoke(InvocationKind::Call, id, name, params)
            }
            Envelope::Get { id, name, params } => {
                self.dispatch_invoke(InvocationKind::Get, id, name, params)
            }
            Envelope::Subscribe { id, name, filter } => {
                let session = self.clone();
                tokio::spawn(async move {
                    let result = match &session.inner.server {
                        Some(core) => core.subscribe(&session, &name, filter).await,
                        None => Err(ErrorBody::not_found(&name)),
                    };
                    session.reply(id, result).await;
                });
            }
            Envelope::Unsubscribe { id, name, filter } => {
                let result = match &self.inner.server {
                    Some(core) => {
                        core.local().unsubscribe(&self.inner.id, &name, &filter);
                        Ok(Value::Null)
                    }
                    None => Err(ErrorBody::not_found(&name)),
                };
                let session = self.clone();
                tokio::spawn(async move { session.reply(id, result).await });
            }
            Envelope::Data { name, filter, data } => match &self.inner.remote {
                Some(remote) => remote.consume(&name, &filter, data),
                None => log_debug!("unexpected data push for {name}"),
            },
        }
    }

    /// Correlate a response to its pending call. Unknown ids are ignored:
    /// late responses after a timeout sweep are expected.
    fn complete(&self, id: u64, result: Result<Value>) {
        let call = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.remove(&id)
        };
        match call {
            Some(call) => {
                let _ = call.complete.send(result);
            }
            None => log_debug!("no pending call for response id {id} (late or duplicate)"),
        }
    }

    fn dispatch_invoke(&self, kind: InvocationKind, id: u64, name: String, params: Vec<Value>) {
        let session = self.clone();
        tokio::spawn(async move {
            let result = match &session.inner.server {
                Some(core) => {
                    core.invoke(kind, session.id(), &name, params, &session.inner.ctx)
                        .await
                }
                None => Err(ErrorBody::not_found(&name)),
            };
            session.reply(id, result).await;
        });
    }

    async fn reply(&self, id: u64, result: InvokeResult) {
        let envelope = match result {
            Ok(data) => Envelope::Result { id, data },
            Err(body) => Envelope::Error { id, body },
        };
        self.send_envelope(envelope).await;
    }

    /// Push a fresh subscription value toward the peer.
    pub async fn send_data(&self, name: String, filter: Value, data: Value) {
        self.send_envelope(Envelope::Data { name, filter, data }).await;
    }

    async fn send_envelope(&self, envelope: Envelope) {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log_error!("session {}: encode failed: {e}", self.inner.id);
                return;
            }
        };
        if let Err(e) = self.inner.transport.send(frame).await {
            log_debug!("session {}: send failed: {e}", self.inner.id);
        }
    }

    // --- lifecycle ----------------------------------------------------------

    /// Close the transport and tear down. Safe to call more than once.
    pub async fn close(&self, reason: &str) {
        let _ = self.inner.transport.close().await;
        self.teardown(reason);
    }

    /// Reject all pending calls, detach from the server core and notify the
    /// owner. Runs exactly once.
    fn teardown(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log_debug!("session {} closed: {reason}", self.inner.id);

        let calls: Vec<PendingCall> = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            let _ = call.complete.send(Err(RpcError::Disconnected));
        }

        if let Some(core) = &self.inner.server {
            core.session_closed(&self.inner.id);
        }
        self.notify(SessionEvent::Closed(reason.to_string()));
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(event);
        }
    }
}
