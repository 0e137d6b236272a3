//! Interceptor (middleware) chain wrapped around every invocation.
//!
//! A chain is an ordered, immutable list of interceptors composed
//! onion-style around a terminal invocation. Each interceptor receives the
//! call context, a [`Next`] continuation and the positional parameters; it
//! may transform the parameters before driving `next`, or skip `next`
//! entirely to short-circuit.
//!
//! Dispatch is an explicit index walked by value. A shared watermark tracks
//! the deepest index already entered, so driving `next` a second time at
//! the same or a lower depth is reported as a
//! [`RpcError::BadDispatch`] result instead of silently double-invoking
//! the tail of the chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, RpcError};
use crate::protocol::SessionId;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which operation an invocation is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// A plain remote call.
    Call,
    /// A one-shot value fetch.
    Get,
    /// The initial supply for a new subscription.
    Subscribe,
    /// A re-supply caused by a server-side trigger.
    Trigger,
}

/// Per-invocation context visible to every interceptor.
#[derive(Debug, Clone)]
pub struct CallCtx {
    /// Session the invocation arrived on (or subscribed from, for
    /// trigger-driven re-supplies).
    pub session: SessionId,
    /// Canonical item path.
    pub item: String,
    /// Operation being served.
    pub kind: InvocationKind,
    /// Connection context produced by the server's context factory.
    pub connection: Value,
}

/// One interceptor in the chain.
pub trait Interceptor: Send + Sync {
    fn call(
        &self,
        ctx: Arc<CallCtx>,
        next: Next,
        params: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value>>;
}

/// Wrap an async closure as an [`Interceptor`].
pub fn interceptor<F, Fut>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(Arc<CallCtx>, Next, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    struct FnInterceptor<F>(F);

    impl<F, Fut> Interceptor for FnInterceptor<F>
    where
        F: Fn(Arc<CallCtx>, Next, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        fn call(
            &self,
            ctx: Arc<CallCtx>,
            next: Next,
            params: Vec<Value>,
        ) -> BoxFuture<'static, Result<Value>> {
            Box::pin((self.0)(ctx, next, params))
        }
    }

    Arc::new(FnInterceptor(f))
}

/// The terminal invocation at the end of the chain.
pub(crate) type TerminalFn =
    Arc<dyn Fn(Arc<CallCtx>, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Continuation handed to each interceptor.
///
/// Driving it resumes the chain at the next index; passing `None` reuses
/// the parameters the current interceptor received.
#[derive(Clone)]
pub struct Next {
    chain: Arc<Vec<Arc<dyn Interceptor>>>,
    terminal: TerminalFn,
    ctx: Arc<CallCtx>,
    index: usize,
    /// Deepest index already entered for this dispatch.
    watermark: Arc<AtomicUsize>,
    /// Parameters of the previous invocation, reused when `run(None)`.
    prev_params: Vec<Value>,
}

impl Next {
    /// Resume the chain.
    pub fn run(self, params: Option<Vec<Value>>) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            let entered = self.watermark.fetch_max(self.index + 1, Ordering::SeqCst);
            if entered >= self.index + 1 {
                return Err(RpcError::BadDispatch(
                    "next() called multiple times".into(),
                ));
            }

            let params = params.unwrap_or_else(|| self.prev_params.clone());

            match self.chain.get(self.index) {
                Some(interceptor) => {
                    let next = Next {
                        chain: self.chain.clone(),
                        terminal: self.terminal.clone(),
                        ctx: self.ctx.clone(),
                        index: self.index + 1,
                        watermark: self.watermark.clone(),
                        prev_params: params.clone(),
                    };
                    interceptor.call(self.ctx, next, params).await
                }
                None => (self.terminal)(self.ctx, params).await,
            }
        })
    }
}

/// An immutable, ordered interceptor list.
#[derive(Clone, Default)]
pub(crate) struct MiddlewareStack {
    chain: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl MiddlewareStack {
    pub fn new(chain: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            chain: Arc::new(chain),
        }
    }

    /// Run the whole chain down to `terminal`.
    pub async fn dispatch(
        &self,
        ctx: Arc<CallCtx>,
        params: Vec<Value>,
        terminal: TerminalFn,
    ) -> Result<Value> {
        let entry = Next {
            chain: self.chain.clone(),
            terminal,
            ctx,
            index: 0,
            watermark: Arc::new(AtomicUsize::new(0)),
            prev_params: params.clone(),
        };
        entry.run(Some(params)).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn test_ctx() -> Arc<CallCtx> {
        Arc::new(CallCtx {
            session: SessionId::generate(),
            item: "test/item".into(),
            kind: InvocationKind::Call,
            connection: Value::Null,
        })
    }

    fn echo_terminal() -> TerminalFn {
        Arc::new(|_ctx, params| Box::pin(async move { Ok(Value::Array(params)) }))
    }

    #[tokio::test]
    async fn test_params_transformed_through_chain() {
        // ---
        let double = interceptor(|_ctx, next: Next, params: Vec<Value>| async move {
            let doubled = params
                .into_iter()
                .map(|v| json!(v.as_i64().unwrap() * 2))
                .collect();
            next.run(Some(doubled)).await
        });
        let stack = MiddlewareStack::new(vec![double]);

        let out = stack
            .dispatch(test_ctx(), vec![json!(1), json!(2)], echo_terminal())
            .await
            .unwrap();
        assert_eq!(out, json!([2, 4]));
    }

    #[tokio::test]
    async fn test_omitted_params_are_reused() {
        // ---
        let passthrough =
            interceptor(|_ctx, next: Next, _params| async move { next.run(None).await });
        let stack = MiddlewareStack::new(vec![passthrough]);

        let out = stack
            .dispatch(test_ctx(), vec![json!("kept")], echo_terminal())
            .await
            .unwrap();
        assert_eq!(out, json!(["kept"]));
    }

    #[tokio::test]
    async fn test_second_next_call_is_an_error() {
        // ---
        let greedy = interceptor(|_ctx, next: Next, _params| async move {
            let first = next.clone().run(None).await;
            assert!(first.is_ok());
            next.run(None).await
        });
        let stack = MiddlewareStack::new(vec![greedy]);

        let err = stack
            .dispatch(test_ctx(), vec![], echo_terminal())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::BadDispatch(_)));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        // ---
        let gate = interceptor(|_ctx, _next: Next, _params| async move {
            Err(RpcError::app(403, "denied"))
        });
        let stack = MiddlewareStack::new(vec![gate]);

        let err = stack
            .dispatch(test_ctx(), vec![], echo_terminal())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Application { code: 403, .. }));
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        // ---
        let tag = |label: &'static str| {
            interceptor(move |_ctx, next: Next, mut params: Vec<Value>| async move {
                params.push(json!(label));
                next.run(Some(params)).await
            })
        };
        let stack = MiddlewareStack::new(vec![tag("outer"), tag("inner")]);

        let out = stack
            .dispatch(test_ctx(), vec![], echo_terminal())
            .await
            .unwrap();
        assert_eq!(out, json!(["outer", "inner"]));
    }
}
