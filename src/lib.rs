//! RPC and publish/subscribe over pluggable byte transports.
//!
//! Callers invoke named remote items and can additionally subscribe to an
//! item's result, receiving pushed updates whenever the server-side owner
//! declares the value changed. This crate is the protocol engine: session
//! life cycle, call correlation and timeout sweeping, filtered
//! subscriptions with throttling and caching, reconnection with automatic
//! resubscription, and an interceptor chain around every invocation.
//!
//! Concrete wire transports are external collaborators behind the
//! [`Transport`]/[`Connector`] traits; the in-memory transport shipped here
//! is the reference implementation and the basis of the test suite.

// Import all sub modules once...
mod client;
mod domain;
mod server;
mod session;
mod transport;

mod rpc_config;

mod cache;
mod error;
mod filter;
mod middleware;
mod protocol;

mod macros;

// Re-export main types
pub use client::{ItemRef, RpcClient, SubscriptionHandle};
pub use server::{ItemHandle, RpcServer, RpcServerBuilder, ServicesBuilder};

pub use rpc_config::RpcConfig;

pub use client::ConnectionState;
pub use error::{ErrorBody, Result, RpcError};
pub use middleware::{interceptor, CallCtx, Interceptor, InvocationKind, Next};
pub use server::{ContextFactory, SubscriptionListener, ThrottleSettings, PATH_SEPARATOR};

pub use protocol::{Envelope, MessageType, SessionId};

pub use transport::{memory_pair, MemoryConnector};

// --- public re-exports
pub use domain::{
    //
    Connector,
    Transport,
    TransportEvent,
    TransportInbox,
    TransportMeta,
    TransportPtr,
};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The maps guarded this way (pending calls, subscription entries,
/// in-flight invocations) carry no invariants spanning multiple fields;
/// the worst outcome of continuing is a dropped or unmatched entry, while
/// propagating non-`Send` poison errors across async boundaries would be
/// far more disruptive.
pub(crate) fn lock_ignore_poison<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
