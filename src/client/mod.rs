//! RPC client: connection handling, remote item handles and subscriptions.
//!
//! # Architecture
//!
//! The client owns a [`ConnectionManager`] (one background task driving the
//! connect/reconnect life cycle) and a [`RemoteSubscriptions`] registry.
//! Remote items are addressed by path through [`RpcClient::item`], which
//! hands out cached [`ItemRef`]s; every ref is callable and additionally
//! exposes subscribe/unsubscribe.
//!
//! # Example
//!
//! ```no_run
//! use push_rpc::{MemoryConnector, RpcClient, RpcConfig};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn example(server: push_rpc::RpcServer) -> push_rpc::Result<()> {
//! let client = RpcClient::connect(
//!     Arc::new(MemoryConnector::new(&server)),
//!     RpcConfig::default(),
//! )
//! .await?;
//!
//! let sum: i64 = client.item("math/add").call((2, 3)).await?;
//!
//! let _sub = client
//!     .item("status")
//!     .subscribe(Value::Null, |value| println!("status: {value}"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod connection;
pub(crate) mod remote;

pub use connection::ConnectionState;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::client::connection::ConnectionManager;
use crate::client::remote::{ConsumerFn, RemoteSubscriptions};
use crate::domain::Connector;
use crate::error::Result;
use crate::lock_ignore_poison;
use crate::macros::log_debug;
use crate::rpc_config::RpcConfig;

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed). Dropping every clone stops the
/// connection life cycle task.
#[derive(Clone)]
pub struct RpcClient {
    conn: ConnectionManager,
    remote: Arc<RemoteSubscriptions>,
    /// Lazily populated handle cache, keyed by item path.
    items: Arc<Mutex<HashMap<String, ItemRef>>>,
}

impl RpcClient {
    /// Connect through the given connector.
    ///
    /// On failure the error is returned and no background reconnection is
    /// kept running. Once connected, lost connections are re-established
    /// automatically (with resubscription) until [`close`](Self::close).
    pub async fn connect(connector: Arc<dyn Connector>, config: RpcConfig) -> Result<Self> {
        let remote = Arc::new(RemoteSubscriptions::new());
        let conn = ConnectionManager::spawn(connector, config, remote.clone());
        conn.connect().await?;

        Ok(Self {
            conn,
            remote,
            items: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Handle for the remote item at `path`. Handles are cached per path
    /// and cheap to clone; no I/O happens until the handle is used.
    pub fn item(&self, path: &str) -> ItemRef {
        let mut items = lock_ignore_poison(&self.items);
        items
            .entry(path.to_string())
            .or_insert_with(|| ItemRef {
                name: path.to_string(),
                conn: self.conn.clone(),
                remote: self.remote.clone(),
            })
            .clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Watch connection state transitions (connected/disconnected events).
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.conn.state_changes()
    }

    /// Close the connection and permanently suppress reconnection.
    pub async fn close(&self) {
        self.conn.close().await;
    }
}

/// Serialize a parameter pack into positional wire parameters.
///
/// Tuples and sequences spread into positional parameters; `()`/`null`
/// means none; any other value is a single parameter.
fn to_params<P: Serialize>(params: P) -> Result<Vec<Value>> {
    match serde_json::to_value(params)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}

/// Handle to one remote item: callable, gettable and subscribable.
#[derive(Clone)]
pub struct ItemRef {
    name: String,
    conn: ConnectionManager,
    remote: Arc<RemoteSubscriptions>,
}

impl ItemRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the remote item.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Disconnected`](crate::RpcError::Disconnected) when no
    ///   connection is active
    /// - [`RpcError::Timeout`](crate::RpcError::Timeout) when no response
    ///   arrives within the configured call timeout
    /// - [`RpcError::NotFound`](crate::RpcError::NotFound) /
    ///   [`RpcError::Application`](crate::RpcError::Application) as reported
    ///   by the peer
    pub async fn call<P, R>(&self, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let session = self.conn.session()?;
        let value = session.call_remote(&self.name, to_params(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// One-shot fetch of the item's current value for a filter, without
    /// subscribing.
    pub async fn get<P, R>(&self, filter: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let session = self.conn.session()?;
        let value = session
            .get_remote(&self.name, serde_json::to_value(filter)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Subscribe to the item's value under a filter.
    ///
    /// The consumer runs for the initial value and for every subsequent
    /// push. When a locally cached value exists (another consumer already
    /// subscribed with the same filter), it is delivered synchronously
    /// before any network round trip. After a reconnect the subscription is
    /// re-established automatically.
    ///
    /// The subscription lives until the returned handle is dropped or
    /// explicitly unsubscribed.
    pub async fn subscribe<P, F>(&self, filter: P, consumer: F) -> Result<SubscriptionHandle>
    where
        P: Serialize,
        F: Fn(Value) + Send + Sync + 'static,
    {
        let filter = serde_json::to_value(filter)?;
        let consume: ConsumerFn = Arc::new(consumer);
        let outcome = self.remote.add(&self.name, &filter, consume);

        if outcome.first_for_entry {
            // First consumer for this (item, filter): issue the wire
            // subscribe. A failure must leave no consumer entry behind.
            let result = match self.conn.session() {
                Ok(session) => session.subscribe_remote(&self.name, filter.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(data) => {
                    self.remote
                        .mark_completed(&self.name, &filter, outcome.consumer_id);
                    self.remote.consume(&self.name, &filter, data);
                }
                Err(e) => {
                    self.remote.remove(&self.name, &filter, outcome.consumer_id);
                    return Err(e);
                }
            }
        } else {
            // Riding an existing wire subscription; acknowledged already.
            self.remote
                .mark_completed(&self.name, &filter, outcome.consumer_id);
        }

        Ok(SubscriptionHandle {
            item: self.clone(),
            filter,
            consumer_id: outcome.consumer_id,
            active: AtomicBool::new(true),
        })
    }
}

/// Live subscription owned by one consumer.
///
/// Dropping the handle unsubscribes; when the last consumer of an
/// `(item, filter)` pair leaves, a wire unsubscribe is sent.
pub struct SubscriptionHandle {
    item: ItemRef,
    filter: Value,
    consumer_id: u64,
    active: AtomicBool,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("item", &self.item.name)
            .field("filter", &self.filter)
            .field("consumer_id", &self.consumer_id)
            .field("active", &self.active)
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn item_name(&self) -> &str {
        &self.item.name
    }

    pub fn filter(&self) -> &Value {
        &self.filter
    }

    /// Withdraw this consumer, sending the wire unsubscribe if it was the
    /// last one.
    pub async fn unsubscribe(self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let outcome = self
            .item
            .remote
            .remove(&self.item.name, &self.filter, self.consumer_id);
        if outcome.entry_emptied {
            if let Ok(session) = self.item.conn.session() {
                if let Err(e) = session
                    .unsubscribe_remote(&self.item.name, self.filter.clone())
                    .await
                {
                    log_debug!("wire unsubscribe for {} failed: {e}", self.item.name);
                }
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let outcome = self
            .item
            .remote
            .remove(&self.item.name, &self.filter, self.consumer_id);
        if outcome.entry_emptied {
            if let Ok(session) = self.item.conn.session() {
                let name = self.item.name.clone();
                let filter = self.filter.clone();
                // Best-effort wire unsubscribe; outside a runtime (process
                // teardown) the registry cleanup above already happened.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = session.unsubscribe_remote(&name, filter).await;
                    });
                }
            }
        }
    }
}
