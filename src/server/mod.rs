//! RPC server: published items, session acceptance and the trigger surface.
//!
//! The server owns the item registry, the local subscription registry, the
//! middleware chain and the invocation cache. It does not listen for
//! connections itself: an external listener accepts transports and hands
//! them to [`RpcServer::accept`], which spawns a session per connection.
//!
//! # Example
//!
//! ```no_run
//! use push_rpc::{RpcServer, ServicesBuilder};
//! use serde_json::{json, Value};
//!
//! let server = RpcServer::builder()
//!     .services(ServicesBuilder::new().item("status", |_req: Value| async move {
//!         Ok(json!({"r": "1"}))
//!     }))
//!     .build();
//!
//! // Declare a data change; subscribers are pushed the new value.
//! # async fn example(server: RpcServer) -> push_rpc::Result<()> {
//! server.item("status")?.trigger(None, Some(json!({"r": "2"}))).await;
//! # Ok(())
//! # }
//! ```

mod local;
mod services;

pub use local::{SubscriptionListener, ThrottleSettings};
pub use services::{ServicesBuilder, PATH_SEPARATOR};

pub(crate) use local::{DeliverFn, LocalSubscriptions, SupplyFn};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::cache::{InvocationCache, InvokeResult};
use crate::domain::{TransportInbox, TransportMeta, TransportPtr};
use crate::error::{ErrorBody, Result, RpcError};
use crate::filter::invocation_key;
use crate::lock_ignore_poison;
use crate::macros::{log_debug, log_warn};
use crate::middleware::{CallCtx, Interceptor, InvocationKind, MiddlewareStack, TerminalFn};
use crate::protocol::SessionId;
use crate::rpc_config::RpcConfig;
use crate::server::local::SubscriptionEvent;
use crate::server::services::Services;
use crate::session::Session;

/// Factory producing the per-connection context value handed to handlers
/// and middleware.
pub type ContextFactory = Arc<dyn Fn(&TransportMeta) -> Value + Send + Sync>;

/// Shared server state: registry, subscriptions, middleware, cache and the
/// set of live sessions.
pub(crate) struct ServerCore {
    config: RpcConfig,
    services: Services,
    local: Arc<LocalSubscriptions>,
    middleware: MiddlewareStack,
    cache: InvocationCache,
    ctx_factory: ContextFactory,
    sessions: Mutex<HashMap<SessionId, Session>>,
    /// Handed to long-lived closures (supply hooks) so they never keep the
    /// core alive on their own.
    self_weak: Weak<ServerCore>,
}

impl ServerCore {
    pub fn local(&self) -> &Arc<LocalSubscriptions> {
        &self.local
    }

    /// Run one invocation through the middleware chain and the invocation
    /// cache down to the registered handler.
    pub async fn invoke(
        &self,
        kind: InvocationKind,
        session: &SessionId,
        name: &str,
        params: Vec<Value>,
        ctx: &Value,
    ) -> InvokeResult {
        let Some(item) = self.services.get(name) else {
            return Err(ErrorBody::not_found(name));
        };

        let key = invocation_key(name, &params);
        let call_ctx = Arc::new(CallCtx {
            session: session.clone(),
            item: name.to_string(),
            kind,
            connection: ctx.clone(),
        });
        let middleware = self.middleware.clone();

        self.cache
            .invoke(key, move || async move {
                let terminal: TerminalFn = Arc::new(move |call_ctx: Arc<CallCtx>, params| {
                    item.invoke(params, call_ctx.connection.clone())
                });
                middleware
                    .dispatch(call_ctx, params, terminal)
                    .await
                    .map_err(ErrorBody::from)
            })
            .await
    }

    /// Serve an inbound subscribe: supply the initial value, then register
    /// the session as a subscriber.
    ///
    /// The supply runs first so a failing supplier leaves nothing
    /// registered; the reply carries the supplied value.
    pub async fn subscribe(&self, session: &Session, name: &str, filter: Value) -> InvokeResult {
        if !self.services.contains(name) {
            return Err(ErrorBody::not_found(name));
        }

        let value = self
            .invoke(
                InvocationKind::Subscribe,
                session.id(),
                name,
                vec![filter.clone()],
                session.ctx(),
            )
            .await?;

        let deliver: DeliverFn = {
            let session = session.clone();
            let name = name.to_string();
            let filter = filter.clone();
            Arc::new(move |data: Value| {
                let session = session.clone();
                let name = name.clone();
                let filter = filter.clone();
                tokio::spawn(async move {
                    session.send_data(name, filter, data).await;
                });
            })
        };

        let supply: SupplyFn = {
            let core = self.self_weak.clone();
            let name = name.to_string();
            let session_id = session.id().clone();
            let ctx = session.ctx().clone();
            Arc::new(move |trigger_filter: Value| {
                let core = core.clone();
                let name = name.clone();
                let session_id = session_id.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    match core.upgrade() {
                        Some(core) => {
                            core.invoke(
                                InvocationKind::Trigger,
                                &session_id,
                                &name,
                                vec![trigger_filter],
                                &ctx,
                            )
                            .await
                        }
                        None => Err(ErrorBody::internal("server closed")),
                    }
                })
            })
        };

        // Duplicate subscribes from the same session are a registry no-op,
        // but the caller still got the current value above.
        self.local
            .subscribe(session.id(), name, filter, deliver, supply);
        Ok(value)
    }

    /// Session teardown hook: prune its subscriptions and forget it.
    pub fn session_closed(&self, id: &SessionId) {
        self.local.unsubscribe_all(id);
        let mut sessions = lock_ignore_poison(&self.sessions);
        sessions.remove(id);
    }
}

/// Running RPC server instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcServer {
    core: Arc<ServerCore>,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::default()
    }

    /// Adopt an accepted transport: build its connection context and spawn
    /// a session over it.
    pub fn accept(&self, transport: TransportPtr, inbox: TransportInbox) -> SessionId {
        let ctx = (self.core.ctx_factory)(transport.meta());
        let session = Session::spawn(
            self.core.config.clone(),
            transport,
            inbox,
            Some(self.core.clone()),
            None,
            ctx,
            None,
        );
        let id = session.id().clone();
        log_debug!("accepted session {id}");

        {
            let mut sessions = lock_ignore_poison(&self.core.sessions);
            sessions.insert(id.clone(), session.clone());
        }
        // The transport may have died between spawn and insert; a teardown
        // that already ran would have found nothing to remove.
        if session.is_closed() {
            self.core.session_closed(&id);
        }
        id
    }

    /// Handle to a published item's trigger/throttle/listener surface.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotFound`] if no item is registered under `path`.
    pub fn item(&self, path: &str) -> Result<ItemHandle> {
        if !self.core.services.contains(path) {
            return Err(RpcError::NotFound(path.to_string()));
        }
        Ok(ItemHandle {
            core: self.core.clone(),
            name: path.to_string(),
        })
    }

    /// Number of currently connected sessions.
    pub fn session_count(&self) -> usize {
        lock_ignore_poison(&self.core.sessions).len()
    }

    /// Forcibly close every connected session. The server keeps serving;
    /// clients with reconnect enabled will come back and resubscribe.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Session> = {
            let sessions = lock_ignore_poison(&self.core.sessions);
            sessions.values().cloned().collect()
        };
        for session in sessions {
            session.close("server disconnected").await;
        }
    }

    /// Shut the server down: every session is closed and its pending calls
    /// rejected. Accepting further transports is the listener's concern.
    pub async fn close(&self) {
        self.disconnect_all().await;
    }
}

/// Builder for [`RpcServer`].
#[derive(Default)]
pub struct RpcServerBuilder {
    services: Option<ServicesBuilder>,
    middleware: Vec<Arc<dyn Interceptor>>,
    ctx_factory: Option<ContextFactory>,
    config: Option<RpcConfig>,
}

impl RpcServerBuilder {
    /// Set the published item tree.
    pub fn services(mut self, services: ServicesBuilder) -> Self {
        self.services = Some(services);
        self
    }

    /// Append an interceptor; interceptors run in registration order.
    pub fn middleware(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.middleware.push(interceptor);
        self
    }

    /// Install the connection-context factory. Defaults to `Value::Null`
    /// for every connection.
    pub fn context_factory(
        mut self,
        factory: impl Fn(&TransportMeta) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.ctx_factory = Some(Arc::new(factory));
        self
    }

    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> RpcServer {
        let core = Arc::new_cyclic(|weak| ServerCore {
            config: self.config.unwrap_or_default(),
            services: self.services.unwrap_or_default().build(),
            local: Arc::new(LocalSubscriptions::new()),
            middleware: MiddlewareStack::new(self.middleware),
            cache: InvocationCache::new(),
            ctx_factory: self
                .ctx_factory
                .unwrap_or_else(|| Arc::new(|_| Value::Null)),
            sessions: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
        });
        RpcServer { core }
    }
}

/// Trigger/throttle/event-listener surface attached to one published item.
#[derive(Clone)]
pub struct ItemHandle {
    core: Arc<ServerCore>,
    name: String,
}

impl ItemHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare that this item's data changed.
    ///
    /// Every subscription whose filter is affected by `filter` (all of
    /// them, when `None`) receives an update: `data` directly when
    /// supplied, otherwise the item's supplier is re-invoked per affected
    /// filter. Delivery honors the item's throttle.
    pub async fn trigger(&self, filter: Option<Value>, data: Option<Value>) {
        let affected = self.core.local.matching(&self.name, filter.as_ref());
        for (key, entry_filter, supply) in affected {
            let value = match &data {
                Some(data) => Ok(data.clone()),
                None => supply(entry_filter).await,
            };
            match value {
                Ok(value) => {
                    self.core
                        .local
                        .clone()
                        .deliver(&self.name, &key, value)
                }
                Err(e) => {
                    log_warn!("re-supply for {} failed: {}", self.name, e.message);
                }
            }
        }
    }

    /// Install trailing-edge throttling for this item's updates.
    pub fn throttle(&self, settings: ThrottleSettings) {
        self.core.local.set_throttle(&self.name, settings);
    }

    /// Listen for sessions subscribing to this item.
    pub fn on_subscribe(&self, listener: impl Fn(&SessionId, &Value) + Send + Sync + 'static) {
        self.core
            .local
            .add_listener(&self.name, SubscriptionEvent::Subscribe, Arc::new(listener));
    }

    /// Listen for sessions unsubscribing (including disconnect pruning).
    pub fn on_unsubscribe(&self, listener: impl Fn(&SessionId, &Value) + Send + Sync + 'static) {
        self.core.local.add_listener(
            &self.name,
            SubscriptionEvent::Unsubscribe,
            Arc::new(listener),
        );
    }

    /// Whether any session currently subscribes to this item under the
    /// given filter.
    pub fn is_subscribed(&self, filter: &Value) -> bool {
        self.core.local.has_entry(&self.name, filter)
    }

    /// Number of distinct filters currently subscribed on this item.
    pub fn subscription_count(&self) -> usize {
        self.core.local.entry_count(&self.name)
    }
}
