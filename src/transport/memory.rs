// src/transport/memory.rs

//! In-memory transport implementation.
//!
//! This transport links two endpoints entirely within the process. It is
//! the **reference implementation** of transport semantics: other
//! transports are expected to approximate this behavior as closely as
//! their underlying systems allow and to document any unavoidable
//! deviations.
//!
//! ## Semantics
//!
//! - One `send()` is delivered as exactly one `Message` event at the peer.
//! - `ping()` on a live pair surfaces a `Pong` event at the caller.
//! - `close()` delivers a terminal `Closed` event to both endpoints;
//!   subsequent sends fail.
//!
//! ## Non-Goals
//!
//! - Network behavior or latency simulation
//! - Backpressure beyond a bounded per-endpoint event queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::{Connector, Transport, TransportEvent, TransportInbox, TransportMeta};
use crate::server::RpcServer;
use crate::{Result, RpcError};

const EVENT_QUEUE_CAPACITY: usize = 64;

struct MemoryTransport {
    meta: TransportMeta,
    /// Events this endpoint pushes toward the peer's inbox.
    to_peer: mpsc::Sender<TransportEvent>,
    /// Events surfaced at this endpoint's own inbox (pong, local close).
    to_self: mpsc::Sender<TransportEvent>,
    /// Shared by both endpoints; flipped exactly once on close.
    open: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RpcError::Disconnected)
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.to_peer
            .send(TransportEvent::Message(frame))
            .await
            .map_err(|_| RpcError::Transport("peer inbox dropped".into()))
    }

    async fn ping(&self) -> Result<()> {
        // ---
        // The pair shares one process, so a live peer answers instantly.
        self.ensure_open()?;
        self.to_self
            .send(TransportEvent::Pong)
            .await
            .map_err(|_| RpcError::Transport("own inbox dropped".into()))
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .to_peer
                .send(TransportEvent::Closed("closed by peer".into()))
                .await;
            let _ = self
                .to_self
                .send(TransportEvent::Closed("closed locally".into()))
                .await;
        }
        Ok(())
    }

    fn meta(&self) -> &TransportMeta {
        &self.meta
    }
}

/// Create a linked pair of in-memory endpoints.
///
/// Each element is one endpoint's sending half plus its event stream.
pub fn memory_pair() -> (
    (crate::TransportPtr, TransportInbox),
    (crate::TransportPtr, TransportInbox),
) {
    let (a_tx, a_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let open = Arc::new(AtomicBool::new(true));

    let a = MemoryTransport {
        meta: TransportMeta {
            transport_id: "memory/a".into(),
        },
        to_peer: b_tx.clone(),
        to_self: a_tx.clone(),
        open: open.clone(),
    };
    let b = MemoryTransport {
        meta: TransportMeta {
            transport_id: "memory/b".into(),
        },
        to_peer: a_tx,
        to_self: b_tx,
        open,
    };

    let a: crate::TransportPtr = Arc::new(a);
    let b: crate::TransportPtr = Arc::new(b);
    (
        (a, TransportInbox { events: a_rx }),
        (b, TransportInbox { events: b_rx }),
    )
}

/// Connector that dials an in-process [`RpcServer`] directly.
///
/// Every `connect()` builds a fresh memory pair and hands the server-side
/// endpoint to the server, so reconnect behavior can be exercised without
/// a network.
pub struct MemoryConnector {
    server: RpcServer,
}

impl MemoryConnector {
    pub fn new(server: &RpcServer) -> Self {
        Self {
            server: server.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(crate::TransportPtr, TransportInbox)> {
        // ---
        let (client_end, server_end) = memory_pair();
        self.server.accept(server_end.0, server_end.1);
        Ok(client_end)
    }
}
