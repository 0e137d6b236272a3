// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface the protocol
//! engine speaks through. It intentionally avoids any reference to concrete
//! protocols or socket libraries: a transport moves opaque byte frames and
//! reports lifecycle events, nothing more. Higher-level semantics such as
//! call correlation, subscriptions, heartbeats and reconnection are handled
//! elsewhere.
//!
//! Concrete implementations live under `src/transport/`; the in-memory
//! transport is the reference implementation of these semantics.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Events a transport reports to its owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound frame arrived.
    Message(Bytes),
    /// The peer answered a ping. Any event counts as liveness; `Pong`
    /// exists so push-only transports can surface heartbeat answers that
    /// carry no frame.
    Pong,
    /// The connection closed, with a human-readable reason. Terminal: no
    /// further events follow.
    Closed(String),
}

/// Receiving half of a transport: the stream of events for one connection.
///
/// Handed to exactly one session; dropping it detaches the session from the
/// transport without closing the peer.
pub struct TransportInbox {
    /// Ordered event stream for this connection.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Descriptive metadata about one connection, made available to the
/// connection-context factory on the accepting side.
#[derive(Debug, Clone, Default)]
pub struct TransportMeta {
    /// Transport-specific identifier (e.g. a remote address).
    pub transport_id: String,
}

/// Sending half of a transport.
///
/// Implementations must ensure that:
/// - `send()` either queues the frame for delivery or fails; it never
///   blocks on the peer consuming it.
/// - After `close()` (or a reported `Closed` event), `send()` fails.
/// - Frame boundaries are preserved: one `send()` is one
///   [`TransportEvent::Message`] at the peer.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Queue one frame for delivery to the peer.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Probe the peer for liveness. A reachable peer is reported back as a
    /// [`TransportEvent::Pong`] (or any other inbound event).
    async fn ping(&self) -> Result<()>;

    /// Close the connection. Both sides observe a `Closed` event.
    async fn close(&self) -> Result<()>;

    /// Metadata describing this connection.
    fn meta(&self) -> &TransportMeta;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;

/// Factory for outbound connections, used by the connection manager for
/// the initial connect and for every reconnect attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh connection, returning its sending half and event
    /// stream.
    async fn connect(&self) -> Result<(TransportPtr, TransportInbox)>;
}
