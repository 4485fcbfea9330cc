use crate::observable::ObservableQuery;
use crate::prelude::graphql::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Opaque, process-unique token identifying one watched operation. Minted by
/// the engine, never reused while active.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub(crate) u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An explicit cancellation token.
///
/// `cancel` is idempotent; a token that was never cancelled does nothing on
/// drop, so ownership must stay with whoever is responsible for teardown.
pub struct Cancellation {
    inner: Option<Box<dyn FnOnce() + Send>>,
}

impl Cancellation {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Cancellation {
        Cancellation {
            inner: Some(Box::new(f)),
        }
    }

    /// A token that cancels nothing.
    pub fn noop() -> Cancellation {
        Cancellation { inner: None }
    }

    pub fn cancel(&mut self) {
        if let Some(f) = self.inner.take() {
            f();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_none()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

/// Notification callback registered by an observable query. Receives a
/// snapshot of the query's store entry, the last cache diff, and a flag
/// telling it whether local field resolution must run before results are
/// derived.
pub type QueryListener = Arc<dyn Fn(QueryStoreEntry, Option<CacheDiff>, bool) + Send + Sync>;

/// Mutable lifecycle state for one query id.
pub(crate) struct QueryLifecycle {
    pub(crate) document: Arc<Document>,
    pub(crate) variables: Object,
    pub(crate) listeners: Vec<QueryListener>,
    /// True when cache or network state changed since the last dispatch.
    pub(crate) invalidated: bool,
    pub(crate) pending_diff: Option<CacheDiff>,
    /// Used to discard stale responses: only the most recently issued
    /// request for this id may write its result.
    pub(crate) last_request_id: u64,
    /// Non-owning back-reference; the observable owns this record's
    /// existence, the record never outlives it.
    pub(crate) observable: Weak<ObservableQuery>,
    pub(crate) cancel_watch: Cancellation,
    pub(crate) network_subscriptions: Vec<Cancellation>,
    /// Precomputed: the document selects local fields, so listeners must run
    /// the resolvers before deriving results.
    pub(crate) force_local_resolve: bool,
}

impl QueryLifecycle {
    pub(crate) fn new(document: Arc<Document>, variables: Object) -> QueryLifecycle {
        let force_local_resolve = document.has_client_fields();
        QueryLifecycle {
            document,
            variables,
            listeners: Vec::new(),
            invalidated: false,
            pending_diff: None,
            last_request_id: 0,
            observable: Weak::new(),
            cancel_watch: Cancellation::noop(),
            network_subscriptions: Vec::new(),
            force_local_resolve,
        }
    }
}

impl fmt::Debug for QueryLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryLifecycle")
            .field("document", &self.document.operation_name())
            .field("variables", &self.variables.len())
            .field("listeners", &self.listeners.len())
            .field("invalidated", &self.invalidated)
            .field("last_request_id", &self.last_request_id)
            .field("network_subscriptions", &self.network_subscriptions.len())
            .finish()
    }
}

/// Central map from query id to lifecycle state. Owns the dispatch of
/// cache-driven notifications to listeners.
#[derive(Debug, Default)]
pub(crate) struct QueryRegistry {
    records: Mutex<HashMap<QueryId, QueryLifecycle>>,
}

impl QueryRegistry {
    pub(crate) fn register(&self, id: QueryId, lifecycle: QueryLifecycle) {
        self.records.lock().insert(id, lifecycle);
    }

    pub(crate) fn contains(&self, id: QueryId) -> bool {
        self.records.lock().contains_key(&id)
    }

    /// Structural update preserving unspecified fields. Unknown ids are
    /// ignored rather than treated as an error.
    pub(crate) fn mutate(&self, id: QueryId, update: impl FnOnce(&mut QueryLifecycle)) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            update(record);
        }
    }

    /// Read access to a record; returns `None` for unknown ids.
    pub(crate) fn with<R>(&self, id: QueryId, read: impl FnOnce(&QueryLifecycle) -> R) -> Option<R> {
        self.records.lock().get(&id).map(read)
    }

    pub(crate) fn add_listener(&self, id: QueryId, listener: QueryListener) {
        self.mutate(id, |record| record.listeners.push(listener));
    }

    pub(crate) fn push_network_subscription(&self, id: QueryId, cancellation: Cancellation) {
        self.mutate(id, |record| record.network_subscriptions.push(cancellation));
    }

    pub(crate) fn last_request_id(&self, id: QueryId) -> Option<u64> {
        self.with(id, |record| record.last_request_id)
    }

    /// Store a fresh cache diff and mark the record for dispatch.
    pub(crate) fn set_diff(&self, id: QueryId, diff: CacheDiff) {
        self.mutate(id, |record| {
            record.pending_diff = Some(diff);
            record.invalidated = true;
        });
    }

    /// Mark a record for dispatch without touching its diff.
    pub(crate) fn invalidate(&self, id: QueryId) {
        self.mutate(id, |record| record.invalidated = true);
    }

    /// Notify the listeners of every invalidated record. A dispatch can be
    /// triggered by a cache-watch callback or by a network response; the
    /// listener cannot assume which one fired.
    ///
    /// Listeners run outside the registry lock so they may re-enter the
    /// engine, and a panicking listener does not prevent the others from
    /// running.
    pub(crate) fn broadcast(&self, store: &Mutex<QueryStore>) {
        let mut dispatches: Vec<(Vec<QueryListener>, QueryStoreEntry, Option<CacheDiff>, bool)> =
            Vec::new();
        {
            let store = store.lock();
            let mut records = self.records.lock();
            for (id, record) in records.iter_mut() {
                if !record.invalidated || record.listeners.is_empty() {
                    continue;
                }
                record.invalidated = false;
                let entry = store.get(*id).cloned().unwrap_or_default();
                dispatches.push((
                    record.listeners.clone(),
                    entry,
                    record.pending_diff.clone(),
                    record.force_local_resolve,
                ));
            }
        }

        for (listeners, entry, diff, force_local_resolve) in dispatches {
            for listener in listeners {
                let entry = entry.clone();
                let diff = diff.clone();
                if catch_unwind(AssertUnwindSafe(|| {
                    listener(entry, diff, force_local_resolve)
                }))
                .is_err()
                {
                    failfast_error!("query listener panicked during broadcast");
                }
            }
        }
    }

    /// Cancel the record's cache watch and network-stream subscriptions,
    /// then delete it. Idempotent.
    pub(crate) fn remove(&self, id: QueryId) {
        let record = self.records.lock().remove(&id);
        if let Some(mut record) = record {
            record.cancel_watch.cancel();
            for mut subscription in record.network_subscriptions.drain(..) {
                subscription.cancel();
            }
        }
    }

    /// Tear down every record. In-flight network continuations observe their
    /// cancellation and reject with a designated "stopped while in flight"
    /// failure, so no orphaned task can write into a disposed registry.
    pub(crate) fn stop(&self) {
        for id in self.ids() {
            self.remove(id);
        }
    }

    pub(crate) fn ids(&self) -> Vec<QueryId> {
        self.records.lock().keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }
}
