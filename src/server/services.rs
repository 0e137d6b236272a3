//! Item registry: the published service surface.
//!
//! Items are addressed by canonical slash-joined paths (`"math/add"`,
//! `"todo/byUser"`). The registry is an explicit map from path to a
//! type-erased handler, built once at startup through [`ServicesBuilder`];
//! there is no runtime tree walk and no reflective method discovery.
//!
//! Positional parameters travel as a JSON array. Typed handlers receive a
//! single `TReq` decoded from that array: an empty array decodes from
//! `null`, a one-element array from its element, and a longer array from
//! the array itself (so a tuple request type captures multiple positional
//! parameters).

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::middleware::BoxFuture;

/// Path segments are joined with this separator.
pub const PATH_SEPARATOR: char = '/';

/// Type-erased item handler.
pub(crate) trait ItemFn: Send + Sync {
    fn invoke(&self, params: Vec<Value>, ctx: Value) -> BoxFuture<'static, Result<Value>>;
}

pub(crate) type ItemPtr = Arc<dyn ItemFn>;

/// Immutable item registry produced by [`ServicesBuilder::build`].
#[derive(Default)]
pub(crate) struct Services {
    items: HashMap<String, ItemPtr>,
}

impl Services {
    pub fn get(&self, name: &str) -> Option<ItemPtr> {
        self.items.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }
}

/// Builder for the published item tree.
///
/// # Example
///
/// ```
/// use push_rpc::ServicesBuilder;
/// use serde_json::{json, Value};
///
/// let services = ServicesBuilder::new()
///     .item("ping", |_req: Value| async move { Ok(json!("pong")) })
///     .scope("math", |s| {
///         s.item("add", |req: (i64, i64)| async move { Ok(req.0 + req.1) })
///     });
/// ```
#[derive(Default)]
pub struct ServicesBuilder {
    prefix: String,
    items: HashMap<String, ItemPtr>,
}

impl ServicesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an item whose handler ignores the connection context.
    pub fn item<TReq, TResp, F, Fut>(self, name: &str, handler: F) -> Self
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        self.item_with_ctx(name, move |req: TReq, _ctx: Value| handler(req))
    }

    /// Register an item whose handler receives the connection context as a
    /// trailing argument.
    pub fn item_with_ctx<TReq, TResp, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TReq, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let path = self.join(name);
        self.items.insert(
            path,
            Arc::new(TypedItem {
                func: handler,
                _phantom: PhantomData,
            }),
        );
        self
    }

    /// Register a nested scope; every item inside gets `name/` prefixed to
    /// its path.
    pub fn scope(mut self, name: &str, build: impl FnOnce(ServicesBuilder) -> ServicesBuilder) -> Self {
        let child = build(ServicesBuilder {
            prefix: self.join(name),
            items: HashMap::new(),
        });
        self.items.extend(child.items);
        self
    }

    fn join(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}{}{}", self.prefix, PATH_SEPARATOR, name)
        }
    }

    pub(crate) fn build(self) -> Services {
        Services { items: self.items }
    }
}

struct TypedItem<F, Fut, TReq, TResp>
where
    F: Fn(TReq, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TResp>> + Send,
    TReq: DeserializeOwned,
    TResp: Serialize,
{
    func: F,
    _phantom: PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> ItemFn for TypedItem<F, Fut, TReq, TResp>
where
    F: Fn(TReq, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn invoke(&self, params: Vec<Value>, ctx: Value) -> BoxFuture<'static, Result<Value>> {
        // Recombine positional parameters into the request shape.
        let request = match params.len() {
            0 => Value::Null,
            1 => params.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(params),
        };

        let req: TReq = match serde_json::from_value(request) {
            Ok(req) => req,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let fut = (self.func)(req, ctx);
        Box::pin(async move {
            let resp = fut.await?;
            Ok(serde_json::to_value(resp)?)
        })
    }
}
