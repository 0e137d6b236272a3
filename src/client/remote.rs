//! Client-side subscription registry.
//!
//! Tracks, per `(item, filter)`, the local consumers sharing one wire
//! subscription, the last received value (cache) and a pause/replay queue
//! used around reconnects. Consumer identity, not subscription identity,
//! determines fan-out: many consumers may ride one wire subscription, and
//! the entry disappears the moment its consumer list empties.
//!
//! A consumer only becomes "completed" once its initial subscribe
//! acknowledgment has returned; pushed data is withheld from incomplete
//! consumers so a push can never race a consumer whose subscribe call has
//! not yet resolved.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::filter::filter_key;
use crate::lock_ignore_poison;
use crate::macros::log_debug;

/// Callback receiving pushed values for one consumer.
pub(crate) type ConsumerFn = Arc<dyn Fn(Value) + Send + Sync>;

struct RemoteConsumer {
    id: u64,
    completed: bool,
    consume: ConsumerFn,
}

struct RemoteEntry {
    filter: Value,
    cached: Option<Value>,
    consumers: Vec<RemoteConsumer>,
    paused: bool,
    queue: VecDeque<Value>,
}

/// Result of registering a consumer.
pub(crate) struct AddOutcome {
    pub consumer_id: u64,
    /// True when this consumer created the entry, i.e. the owner must
    /// issue a wire subscribe.
    pub first_for_entry: bool,
    /// Cached value that was delivered synchronously during registration.
    pub cached: Option<Value>,
}

/// Result of removing a consumer.
pub(crate) struct RemoveOutcome {
    pub removed: bool,
    /// True when the entry emptied, i.e. the owner must issue a wire
    /// unsubscribe.
    pub entry_emptied: bool,
}

#[derive(Default)]
pub(crate) struct RemoteSubscriptions {
    entries: Mutex<HashMap<String, HashMap<String, RemoteEntry>>>,
    consumer_ids: AtomicU64,
}

impl RemoteSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under `(item, filter)`.
    ///
    /// When a cached value exists the consumer sees it synchronously,
    /// before any network round trip.
    pub fn add(&self, item: &str, filter: &Value, consume: ConsumerFn) -> AddOutcome {
        let key = filter_key(filter);
        let consumer_id = self.consumer_ids.fetch_add(1, Ordering::Relaxed);

        let (first_for_entry, cached) = {
            let mut entries = lock_ignore_poison(&self.entries);
            let filters = entries.entry(item.to_string()).or_default();
            let first = !filters.contains_key(&key);
            let entry = filters.entry(key).or_insert_with(|| RemoteEntry {
                filter: filter.clone(),
                cached: None,
                consumers: Vec::new(),
                paused: false,
                queue: VecDeque::new(),
            });
            entry.consumers.push(RemoteConsumer {
                id: consumer_id,
                completed: false,
                consume: consume.clone(),
            });
            (first, entry.cached.clone())
        };

        if let Some(value) = &cached {
            consume(value.clone());
        }

        AddOutcome {
            consumer_id,
            first_for_entry,
            cached,
        }
    }

    /// Mark a consumer eligible for pushed data: its subscribe call has
    /// been acknowledged.
    pub fn mark_completed(&self, item: &str, filter: &Value, consumer_id: u64) {
        let key = filter_key(filter);
        let mut entries = lock_ignore_poison(&self.entries);
        if let Some(entry) = entries.get_mut(item).and_then(|f| f.get_mut(&key)) {
            if let Some(consumer) = entry.consumers.iter_mut().find(|c| c.id == consumer_id) {
                consumer.completed = true;
            }
        }
    }

    /// Accept a pushed value: update the cache and fan out to completed
    /// consumers, or queue it while the entry is paused.
    pub fn consume(&self, item: &str, filter: &Value, data: Value) {
        let key = filter_key(filter);
        let targets: Vec<ConsumerFn>;
        {
            let mut entries = lock_ignore_poison(&self.entries);
            let Some(entry) = entries.get_mut(item).and_then(|f| f.get_mut(&key)) else {
                log_debug!("push for unknown subscription {item}");
                return;
            };
            if entry.paused {
                entry.queue.push_back(data);
                return;
            }
            entry.cached = Some(data.clone());
            targets = entry
                .consumers
                .iter()
                .filter(|c| c.completed)
                .map(|c| c.consume.clone())
                .collect();
        }

        for consume in targets {
            consume(data.clone());
        }
    }

    /// Defer delivery for every entry; pushes queue up instead of fanning
    /// out. Used while a resubscribe is in flight.
    pub fn pause_all(&self) {
        let mut entries = lock_ignore_poison(&self.entries);
        for entry in entries.values_mut().flat_map(|f| f.values_mut()) {
            entry.paused = true;
        }
    }

    /// Resume delivery, flushing each entry's queued updates in arrival
    /// order.
    pub fn resume_and_flush_all(&self) {
        // (entry targets, queued values) collected under the lock, fanned
        // out after.
        let mut deliveries: Vec<(Vec<ConsumerFn>, Vec<Value>)> = Vec::new();
        {
            let mut entries = lock_ignore_poison(&self.entries);
            for entry in entries.values_mut().flat_map(|f| f.values_mut()) {
                entry.paused = false;
                if entry.queue.is_empty() {
                    continue;
                }
                let queued: Vec<Value> = entry.queue.drain(..).collect();
                if let Some(last) = queued.last() {
                    entry.cached = Some(last.clone());
                }
                let targets: Vec<ConsumerFn> = entry
                    .consumers
                    .iter()
                    .filter(|c| c.completed)
                    .map(|c| c.consume.clone())
                    .collect();
                deliveries.push((targets, queued));
            }
        }

        for (targets, queued) in deliveries {
            for value in queued {
                for consume in &targets {
                    consume(value.clone());
                }
            }
        }
    }

    /// Drop queued updates without delivering them.
    pub fn empty_queues(&self) {
        let mut entries = lock_ignore_poison(&self.entries);
        for entry in entries.values_mut().flat_map(|f| f.values_mut()) {
            entry.queue.clear();
        }
    }

    /// Remove one consumer. The caller sends a wire unsubscribe when the
    /// entry emptied.
    pub fn remove(&self, item: &str, filter: &Value, consumer_id: u64) -> RemoveOutcome {
        let key = filter_key(filter);
        let mut entries = lock_ignore_poison(&self.entries);
        let Some(filters) = entries.get_mut(item) else {
            return RemoveOutcome {
                removed: false,
                entry_emptied: false,
            };
        };
        let Some(entry) = filters.get_mut(&key) else {
            return RemoveOutcome {
                removed: false,
                entry_emptied: false,
            };
        };

        let before = entry.consumers.len();
        entry.consumers.retain(|c| c.id != consumer_id);
        let removed = entry.consumers.len() != before;

        let entry_emptied = entry.consumers.is_empty();
        if entry_emptied {
            filters.remove(&key);
            if filters.is_empty() {
                entries.remove(item);
            }
        }

        RemoveOutcome {
            removed,
            entry_emptied: removed && entry_emptied,
        }
    }

    /// Drop a whole entry (all consumers), used when its resubscribe
    /// failed. Returns how many consumers were detached.
    pub fn remove_entry(&self, item: &str, filter: &Value) -> usize {
        let key = filter_key(filter);
        let mut entries = lock_ignore_poison(&self.entries);
        let Some(filters) = entries.get_mut(item) else {
            return 0;
        };
        let dropped = filters
            .remove(&key)
            .map(|entry| entry.consumers.len())
            .unwrap_or(0);
        if filters.is_empty() {
            entries.remove(item);
        }
        dropped
    }

    /// Snapshot of every active `(item, filter, consumer count)` triple,
    /// used by resubscribe-on-reconnect.
    pub fn get_all(&self) -> Vec<(String, Value, usize)> {
        let entries = lock_ignore_poison(&self.entries);
        entries
            .iter()
            .flat_map(|(item, filters)| {
                filters.values().map(move |entry| {
                    (item.clone(), entry.filter.clone(), entry.consumers.len())
                })
            })
            .collect()
    }

    pub fn has_entry(&self, item: &str, filter: &Value) -> bool {
        let key = filter_key(filter);
        let entries = lock_ignore_poison(&self.entries);
        entries
            .get(item)
            .map(|filters| filters.contains_key(&key))
            .unwrap_or(false)
    }

    /// Last received value for `(item, filter)`, if any.
    pub fn cached(&self, item: &str, filter: &Value) -> Option<Value> {
        let key = filter_key(filter);
        let entries = lock_ignore_poison(&self.entries);
        entries
            .get(item)
            .and_then(|filters| filters.get(&key))
            .and_then(|entry| entry.cached.clone())
    }
}
