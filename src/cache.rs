//! Invocation cache: coalesces concurrent identical invocations.
//!
//! If N callers invoke the same item with the same canonicalized parameters
//! while an execution is already in flight, the underlying implementation
//! runs exactly once and every caller receives a copy of the settled
//! result. The entry is removed the instant the execution settles (success
//! or failure), so a later call always re-executes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ErrorBody;
use crate::lock_ignore_poison;

/// Result shape shared between the leader and its coalesced followers.
pub(crate) type InvokeResult = std::result::Result<Value, ErrorBody>;

type Waiters = Vec<oneshot::Sender<InvokeResult>>;

#[derive(Default)]
pub(crate) struct InvocationCache {
    /// In-flight executions keyed by canonical `(item, params)` string.
    /// The value holds the followers waiting on the leader.
    inflight: Mutex<HashMap<String, Waiters>>,
}

impl InvocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `supplier` unless an identical invocation is already in flight,
    /// in which case await that one's result instead.
    pub async fn invoke<F, Fut>(&self, key: String, supplier: F) -> InvokeResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = InvokeResult>,
    {
        let existing = {
            let mut inflight = lock_ignore_poison(&self.inflight);
            if let Some(waiters) = inflight.get_mut(&key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                inflight.insert(key.clone(), Vec::new());
                None
            }
        };
        if let Some(rx) = existing {
            return match rx.await {
                Ok(result) => result,
                // Leader future dropped before settling.
                Err(_) => Err(ErrorBody::internal("coalesced call abandoned")),
            };
        }

        // This caller is the leader; the guard clears the entry even if the
        // future is dropped mid-execution so followers are not stranded.
        let guard = SettleGuard {
            cache: self,
            key: &key,
            settled: false,
        };

        let result = supplier().await;
        guard.settle(result.clone());
        result
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        lock_ignore_poison(&self.inflight).len()
    }
}

struct SettleGuard<'a> {
    cache: &'a InvocationCache,
    key: &'a str,
    settled: bool,
}

impl SettleGuard<'_> {
    fn settle(mut self, result: InvokeResult) {
        // ---
        self.settled = true;
        let waiters = {
            let mut inflight = lock_ignore_poison(&self.cache.inflight);
            inflight.remove(self.key).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut inflight = lock_ignore_poison(&self.cache.inflight);
            // Dropping the waiters' senders wakes every follower with the
            // "abandoned" error.
            inflight.remove(self.key);
        }
    }
}
