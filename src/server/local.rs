//! Server-side subscription registry.
//!
//! Tracks, per item and per filter value, which sessions are subscribed and
//! how to push updates to them. Entries are keyed by the canonical filter
//! key; an `(item, filter)` entry exists iff at least one session is
//! subscribed to it and is removed the instant its subscriber set empties.
//!
//! Throttle *settings* attach per item, independent of any particular
//! filter; throttle *state* is per `(item, filter)` so merged values never
//! leak between filters. Throttling is trailing-edge: within `timeout` of
//! the last delivery, further updates are merged via the reducer
//! (last-value-wins by default) and flushed once when the window ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::error::ErrorBody;
use crate::filter::{filter_contains, filter_key};
use crate::lock_ignore_poison;
use crate::macros::log_debug;
use crate::middleware::BoxFuture;
use crate::protocol::SessionId;

/// Pushes one data value toward a subscriber. Must not block: wire writes
/// are spawned, not awaited.
pub(crate) type DeliverFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Re-invokes an item's supplier for a subscription filter.
pub(crate) type SupplyFn = Arc<
    dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, ErrorBody>> + Send + Sync,
>;

/// Listener invoked when a session subscribes to or unsubscribes from an
/// item; receives the session id and the subscription filter.
pub type SubscriptionListener = Arc<dyn Fn(&SessionId, &Value) + Send + Sync>;

/// Trailing-edge throttle configuration for one item.
#[derive(Clone)]
pub struct ThrottleSettings {
    /// Minimum spacing between delivered updates.
    pub timeout: Duration,
    reducer: Option<Arc<dyn Fn(Value, Value) -> Value + Send + Sync>>,
}

impl ThrottleSettings {
    /// Throttle with last-value-wins merging.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            reducer: None,
        }
    }

    /// Merge coalesced updates with `reducer(previous, next)` instead of
    /// keeping only the most recent value.
    pub fn with_reducer(
        mut self,
        reducer: impl Fn(Value, Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    fn reduce(&self, prev: Value, next: Value) -> Value {
        match &self.reducer {
            Some(reducer) => reducer(prev, next),
            None => next,
        }
    }
}

struct Subscriber {
    session: SessionId,
    deliver: DeliverFn,
}

struct ThrottleState {
    window_until: Instant,
    pending: Option<Value>,
    flush_scheduled: bool,
}

struct FilterEntry {
    filter: Value,
    /// Captured when the entry is created; re-used for every trigger-driven
    /// re-supply of this filter.
    supply: SupplyFn,
    subscribers: Vec<Subscriber>,
    throttle: Option<ThrottleState>,
}

#[derive(Default)]
struct ItemSubs {
    throttle: Option<ThrottleSettings>,
    on_subscribe: Vec<SubscriptionListener>,
    on_unsubscribe: Vec<SubscriptionListener>,
    filters: HashMap<String, FilterEntry>,
}

/// Which listener list an event targets.
#[derive(Clone, Copy)]
pub(crate) enum SubscriptionEvent {
    Subscribe,
    Unsubscribe,
}

#[derive(Default)]
pub(crate) struct LocalSubscriptions {
    items: Mutex<HashMap<String, ItemSubs>>,
}

impl LocalSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Idempotent per `(session, item, filter)`:
    /// a duplicate registration leaves the registry untouched and returns
    /// false.
    pub fn subscribe(
        &self,
        session: &SessionId,
        item: &str,
        filter: Value,
        deliver: DeliverFn,
        supply: SupplyFn,
    ) -> bool {
        let key = filter_key(&filter);
        let listeners;
        {
            let mut items = lock_ignore_poison(&self.items);
            let subs = items.entry(item.to_string()).or_default();
            let settings = subs.throttle.clone();

            let entry = subs.filters.entry(key).or_insert_with(|| FilterEntry {
                filter: filter.clone(),
                supply,
                subscribers: Vec::new(),
                throttle: None,
            });

            if entry.subscribers.iter().any(|s| &s.session == session) {
                return false;
            }
            entry.subscribers.push(Subscriber {
                session: session.clone(),
                deliver,
            });

            // The initial value handed back by the subscribe call counts as
            // a delivery, so it opens the throttle window for this filter.
            if let Some(settings) = settings {
                let state = entry.throttle.get_or_insert_with(|| ThrottleState {
                    window_until: Instant::now(),
                    pending: None,
                    flush_scheduled: false,
                });
                if !state.flush_scheduled {
                    state.window_until = Instant::now() + settings.timeout;
                }
            }

            listeners = subs.on_subscribe.clone();
        }

        for listener in listeners {
            listener(session, &filter);
        }
        true
    }

    /// Remove one subscriber pairing; prunes the filter entry when it was
    /// the last one. Returns whether a pairing was removed.
    pub fn unsubscribe(&self, session: &SessionId, item: &str, filter: &Value) -> bool {
        let key = filter_key(filter);
        let listeners;
        {
            let mut items = lock_ignore_poison(&self.items);
            let Some(subs) = items.get_mut(item) else {
                return false;
            };
            let Some(entry) = subs.filters.get_mut(&key) else {
                return false;
            };

            let before = entry.subscribers.len();
            entry.subscribers.retain(|s| &s.session != session);
            if entry.subscribers.len() == before {
                return false;
            }
            if entry.subscribers.is_empty() {
                subs.filters.remove(&key);
            }
            listeners = subs.on_unsubscribe.clone();
        }

        for listener in listeners {
            listener(session, filter);
        }
        true
    }

    /// Drop every subscription held by one session, pruning emptied
    /// entries. One walk over the active subscriptions; called on session
    /// teardown.
    pub fn unsubscribe_all(&self, session: &SessionId) {
        let mut fired: Vec<(SubscriptionListener, Value)> = Vec::new();
        {
            let mut items = lock_ignore_poison(&self.items);
            for subs in items.values_mut() {
                subs.filters.retain(|_, entry| {
                    let before = entry.subscribers.len();
                    entry.subscribers.retain(|s| &s.session != session);
                    if entry.subscribers.len() != before {
                        for listener in &subs.on_unsubscribe {
                            fired.push((listener.clone(), entry.filter.clone()));
                        }
                    }
                    !entry.subscribers.is_empty()
                });
            }
        }

        for (listener, filter) in fired {
            listener(session, &filter);
        }
    }

    /// Install trailing-edge throttling for an item.
    pub fn set_throttle(&self, item: &str, settings: ThrottleSettings) {
        let mut items = lock_ignore_poison(&self.items);
        items.entry(item.to_string()).or_default().throttle = Some(settings);
    }

    /// Attach a subscribe/unsubscribe listener to an item.
    pub fn add_listener(
        &self,
        item: &str,
        event: SubscriptionEvent,
        listener: SubscriptionListener,
    ) {
        let mut items = lock_ignore_poison(&self.items);
        let subs = items.entry(item.to_string()).or_default();
        match event {
            SubscriptionEvent::Subscribe => subs.on_subscribe.push(listener),
            SubscriptionEvent::Unsubscribe => subs.on_unsubscribe.push(listener),
        }
    }

    /// Every stored filter on `item` affected by a trigger scoped with
    /// `trigger_filter` (`None` broadcasts).
    pub fn matching(
        &self,
        item: &str,
        trigger_filter: Option<&Value>,
    ) -> Vec<(String, Value, SupplyFn)> {
        let items = lock_ignore_poison(&self.items);
        let Some(subs) = items.get(item) else {
            return Vec::new();
        };
        subs.filters
            .iter()
            .filter(|(_, entry)| match trigger_filter {
                None => true,
                Some(trigger) => filter_contains(&entry.filter, trigger),
            })
            .map(|(key, entry)| (key.clone(), entry.filter.clone(), entry.supply.clone()))
            .collect()
    }

    /// Deliver a fresh value to every subscriber of `(item, filter_key)`,
    /// honoring the item's throttle.
    pub fn deliver(self: Arc<Self>, item: &str, key: &str, data: Value) {
        let targets: Vec<DeliverFn>;
        {
            let mut items = lock_ignore_poison(&self.items);
            let Some(subs) = items.get_mut(item) else {
                return;
            };
            let settings = subs.throttle.clone();
            let Some(entry) = subs.filters.get_mut(key) else {
                return;
            };

            match settings {
                None => {
                    targets = entry.subscribers.iter().map(|s| s.deliver.clone()).collect();
                }
                Some(settings) => {
                    let now = Instant::now();
                    let state = entry.throttle.get_or_insert_with(|| ThrottleState {
                        window_until: now,
                        pending: None,
                        flush_scheduled: false,
                    });

                    if state.flush_scheduled || now < state.window_until {
                        // Inside the window: merge and wait for the flush.
                        state.pending = Some(match state.pending.take() {
                            Some(prev) => settings.reduce(prev, data),
                            None => data,
                        });
                        if !state.flush_scheduled {
                            state.flush_scheduled = true;
                            let registry = Arc::clone(&self);
                            let item = item.to_string();
                            let key = key.to_string();
                            let deadline = state.window_until;
                            tokio::spawn(async move {
                                tokio::time::sleep_until(deadline).await;
                                registry.flush(&item, &key);
                            });
                        }
                        return;
                    }

                    state.window_until = now + settings.timeout;
                    targets = entry.subscribers.iter().map(|s| s.deliver.clone()).collect();
                }
            }
        }

        for deliver in targets {
            deliver(data.clone());
        }
    }

    /// Trailing-edge flush for one throttled filter entry.
    fn flush(self: Arc<Self>, item: &str, key: &str) {
        let mut pending = None;
        let mut targets: Vec<DeliverFn> = Vec::new();
        {
            let mut items = lock_ignore_poison(&self.items);
            let Some(subs) = items.get_mut(item) else {
                return;
            };
            let Some(settings) = subs.throttle.clone() else {
                return;
            };
            let Some(entry) = subs.filters.get_mut(key) else {
                // Every subscriber left while the flush was pending.
                log_debug!("throttle flush for pruned entry {item}");
                return;
            };
            if let Some(state) = entry.throttle.as_mut() {
                state.flush_scheduled = false;
                pending = state.pending.take();
                if pending.is_some() {
                    state.window_until = Instant::now() + settings.timeout;
                    targets = entry.subscribers.iter().map(|s| s.deliver.clone()).collect();
                }
            }
        }

        if let Some(data) = pending {
            for deliver in targets {
                deliver(data.clone());
            }
        }
    }

    /// Whether an `(item, filter)` entry currently exists.
    pub fn has_entry(&self, item: &str, filter: &Value) -> bool {
        let key = filter_key(filter);
        let items = lock_ignore_poison(&self.items);
        items
            .get(item)
            .map(|subs| subs.filters.contains_key(&key))
            .unwrap_or(false)
    }

    /// Number of filter entries currently registered for an item.
    pub fn entry_count(&self, item: &str) -> usize {
        let items = lock_ignore_poison(&self.items);
        items.get(item).map(|subs| subs.filters.len()).unwrap_or(0)
    }
}
