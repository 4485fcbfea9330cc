use crate::client::ClientInner;
use crate::prelude::graphql::*;
use crate::registry::QueryLifecycle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A point-in-time projection of a query's state, as delivered to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// The query data, when the cache/network could provide it.
    pub data: Option<Value>,

    /// GraphQL errors delivered alongside data under `ErrorPolicy::All`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,

    /// Terminal failure for this request cycle, when one occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,

    pub loading: bool,

    pub network_status: NetworkStatus,

    /// True when partial-data behavior is in effect and the cache could not
    /// satisfy the full selection.
    #[serde(default)]
    pub partial: bool,

    /// True when the data shown still belongs to previously set variables.
    #[serde(default)]
    pub stale: bool,
}

impl Default for QueryResult {
    fn default() -> Self {
        QueryResult {
            data: None,
            errors: Vec::new(),
            error: None,
            loading: false,
            network_status: NetworkStatus::Ready,
            partial: false,
            stale: false,
        }
    }
}

/// A sink for the results of one observable query.
pub trait QueryObserver: Send + Sync {
    fn next(&self, result: QueryResult);

    fn error(&self, error: QueryError) {
        let _ = error;
    }
}

/// The per-subscription view over one watched query.
///
/// Many observers may subscribe to the same instance; each instance owns its
/// own query id and lifecycle record. The instance is `inactive` until the
/// first observer arrives, `active` while at least one remains, and
/// `torn-down` once the last one leaves; re-subscribing reactivates it.
pub struct ObservableQuery {
    id: QueryId,
    /// Self-reference handed to listeners and cancellation tokens.
    this: Weak<ObservableQuery>,
    client: Arc<ClientInner>,
    options: Mutex<WatchQueryOptions>,
    /// Current variables; may drift from `options.variables` through
    /// `set_variables` and `refetch`.
    variables: Mutex<Object>,
    observers: Mutex<Vec<(u64, Arc<dyn QueryObserver>)>>,
    observer_seq: AtomicU64,
    /// Deep snapshot of the last delivered result, for change detection.
    last_result: Mutex<Option<QueryResult>>,
    last_error: Mutex<Option<QueryError>>,
    torn_down: AtomicBool,
}

impl ObservableQuery {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        id: QueryId,
        options: WatchQueryOptions,
    ) -> Arc<ObservableQuery> {
        let mut variables = options.document.default_variables();
        for (key, value) in options.variables.clone() {
            variables.insert(key, value);
        }
        Arc::new_cyclic(|this| ObservableQuery {
            id,
            this: this.clone(),
            client,
            options: Mutex::new(options),
            variables: Mutex::new(variables),
            observers: Mutex::new(Vec::new()),
            observer_seq: AtomicU64::new(0),
            last_result: Mutex::new(None),
            last_error: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn variables(&self) -> Object {
        self.variables.lock().clone()
    }

    /// The watch options with the instance's current variables folded in.
    pub fn current_options(&self) -> WatchQueryOptions {
        let mut options = self.options.lock().clone();
        options.variables = self.variables.lock().clone();
        options
    }

    pub fn operation_name(&self) -> Option<String> {
        self.options
            .lock()
            .document
            .operation_name()
            .map(|s| s.to_string())
    }

    pub(crate) fn fetch_policy(&self) -> FetchPolicy {
        self.options.lock().fetch_policy(&self.client.defaults)
    }

    /// Register an observer. The first observer activates the query: the
    /// lifecycle record is created and an initial fetch is issued. A late
    /// subscriber immediately receives the last known result, if any, so it
    /// is never silently stuck at "no data".
    pub fn subscribe(&self, observer: Arc<dyn QueryObserver>) -> Cancellation {
        let observer_id = self.observer_seq.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut observers = self.observers.lock();
            let first = observers.is_empty();
            observers.push((observer_id, Arc::clone(&observer)));
            first
        };
        if first {
            self.activate();
        }
        if let Some(last) = self.last_result.lock().clone() {
            observer.next(last);
        }

        let this = self.this.clone();
        Cancellation::new(move || {
            if let Some(this) = this.upgrade() {
                this.unsubscribe(observer_id);
            }
        })
    }

    fn activate(&self) {
        self.torn_down.store(false, Ordering::SeqCst);

        let options = self.current_options();
        let mut record = QueryLifecycle::new(
            Arc::clone(&options.document),
            self.variables.lock().clone(),
        );
        record.observable = self.this.clone();
        self.client.registry.register(self.id, record);

        let weak = self.this.clone();
        self.client.registry.add_listener(
            self.id,
            Arc::new(move |entry, diff, force_local_resolve| {
                if let Some(this) = weak.upgrade() {
                    this.on_broadcast(entry, diff, force_local_resolve);
                }
            }),
        );

        if let Some(this) = self.this.upgrade() {
            let fetch_options = options.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let client = Arc::clone(&this.client);
                        if let Err(error) = client
                            .fetch_query(this.id, fetch_options, FetchKind::Normal, None)
                            .await
                        {
                            // observers were already notified through the
                            // broadcast path
                            tracing::debug!(query = %this.id, %error, "initial fetch failed");
                        }
                    });
                }
                Err(_) => {
                    failfast_debug!("no runtime available for the initial fetch");
                }
            }
        }

        if let Some(interval) = options.poll_interval {
            if let Err(error) = self.start_polling(interval) {
                failfast_debug!("cannot honor poll_interval: {}", error);
            }
        }
    }

    fn unsubscribe(&self, observer_id: u64) {
        let removed_last = {
            let mut observers = self.observers.lock();
            let before = observers.len();
            observers.retain(|(id, _)| *id != observer_id);
            before > observers.len() && observers.is_empty()
        };
        if removed_last {
            self.stop_polling();
            self.client.registry.remove(self.id);
            self.client.store.lock().remove(self.id);
            self.torn_down.store(true, Ordering::SeqCst);
        }
    }

    /// Synchronous projection of the current store and cache state. Has no
    /// side effects and never re-runs local resolvers.
    pub fn get_current_result(&self) -> QueryResult {
        if self.torn_down.load(Ordering::SeqCst) {
            let mut result = self.last_result.lock().clone().unwrap_or_default();
            result.network_status = NetworkStatus::Error;
            result.loading = false;
            return result;
        }

        let entry = self.client.store.lock().get(self.id).cloned();
        let diff = self
            .client
            .registry
            .with(self.id, |record| record.pending_diff.clone())
            .flatten();
        match entry {
            Some(entry) => self.build_result(&entry, diff.as_ref(), Vec::new()),
            None => QueryResult {
                loading: true,
                network_status: NetworkStatus::Loading,
                ..Default::default()
            },
        }
    }

    /// Force a network round trip, optionally merging new variables over the
    /// current ones. The fetch policy is overridden to `network-only` for
    /// this call only, except for `no-cache` queries which keep their policy.
    pub async fn refetch(&self, variables: Option<Object>) -> Result<QueryResult, QueryError> {
        let policy = self.fetch_policy();
        if policy == FetchPolicy::CacheOnly {
            return Err(FetchError::UnsupportedOperation {
                reason: "refetch is meaningless for a cache-only query".to_string(),
            }
            .into());
        }

        if let Some(new_variables) = variables {
            let mut current = self.variables.lock();
            for (key, value) in new_variables {
                current.insert(key, value);
            }
        }

        let mut options = self.current_options();
        options.fetch_policy = Some(if policy == FetchPolicy::NoCache {
            FetchPolicy::NoCache
        } else {
            FetchPolicy::NetworkOnly
        });
        Arc::clone(&self.client)
            .fetch_query(self.id, options, FetchKind::Refetch, None)
            .await
    }

    /// Replace the query variables. No network traffic is produced when the
    /// variables are unchanged (unless forced) or when nobody is observing;
    /// in both cases the previous result is returned and a deferred fetch
    /// happens on the next subscribe.
    pub async fn set_variables(
        &self,
        variables: Object,
        force_fetch: bool,
    ) -> Result<QueryResult, QueryError> {
        let changed = *self.variables.lock() != variables;
        let observed = !self.observers.lock().is_empty();
        *self.variables.lock() = variables.clone();

        if (!changed && !force_fetch) || !observed {
            return Ok(self.get_current_result());
        }

        let mut options = self.current_options();
        options.variables = variables;
        Arc::clone(&self.client)
            .fetch_query(self.id, options, FetchKind::SetVariables, None)
            .await
    }

    /// Replace the watch options wholesale. Leaving `standby`, or moving to
    /// a network-bound policy, starts a fresh fetch cycle; poll-interval
    /// changes are forwarded to the shared scheduler.
    pub async fn set_options(
        &self,
        new_options: WatchQueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let old_policy = self.fetch_policy();
        {
            let mut variables = self.variables.lock();
            for (key, value) in new_options.variables.clone() {
                variables.insert(key, value);
            }
        }
        let poll_interval = new_options.poll_interval;
        *self.options.lock() = new_options;

        match poll_interval {
            Some(interval) => {
                if let Err(error) = self.start_polling(interval) {
                    failfast_debug!("cannot honor poll_interval: {}", error);
                }
            }
            None => self.stop_polling(),
        }

        let new_policy = self.fetch_policy();
        let needs_fetch = old_policy != new_policy
            && (old_policy == FetchPolicy::Standby
                || matches!(
                    new_policy,
                    FetchPolicy::NetworkOnly
                        | FetchPolicy::NoCache
                        | FetchPolicy::CacheAndNetwork
                ));
        if needs_fetch && !self.observers.lock().is_empty() {
            let options = self.current_options();
            Arc::clone(&self.client)
                .fetch_query(self.id, options, FetchKind::Normal, None)
                .await
        } else {
            Ok(self.get_current_result())
        }
    }

    /// Fetch a further page through a separate query id, then merge it into
    /// this query's result with the supplied `update_query` function. The
    /// merged value flows through the update-query path, never a raw cache
    /// write of the page itself.
    pub async fn fetch_more(&self, options: FetchMoreOptions) -> Result<QueryResult, QueryError> {
        let watch_options = self.current_options();
        let document = options
            .document
            .unwrap_or_else(|| Arc::clone(&watch_options.document));
        let mut variables = self.variables.lock().clone();
        for (key, value) in options.variables {
            variables.insert(key, value);
        }

        let fetch_id = self.client.next_query_id();
        self.client
            .registry
            .register(fetch_id, QueryLifecycle::new(Arc::clone(&document), variables.clone()));

        let mut fetch_options = watch_options;
        fetch_options.document = document;
        fetch_options.variables = variables;
        // the page is merged into the main query, never cached on its own
        fetch_options.fetch_policy = Some(FetchPolicy::NoCache);

        let result = Arc::clone(&self.client)
            .fetch_query(fetch_id, fetch_options, FetchKind::FetchMore, Some(self.id))
            .await;
        self.client.registry.remove(fetch_id);
        self.client.store.lock().remove(fetch_id);

        match result {
            Ok(result) => {
                if let Some(more) = &result.data {
                    // the merged value updates this query's derived result;
                    // the page response itself never lands in the cache
                    let previous = self.current_data();
                    if let Some(merged) = (options.update_query)(&previous, more) {
                        if merged != Value::Null {
                            self.client.registry.set_diff(
                                self.id,
                                CacheDiff {
                                    result: merged,
                                    complete: true,
                                },
                            );
                        }
                    }
                }
                self.client.store.lock().mark_ready(self.id);
                self.client.registry.invalidate(self.id);
                self.client.broadcast();
                Ok(result)
            }
            Err(error) => {
                self.client.store.lock().mark_ready(self.id);
                self.client.registry.invalidate(self.id);
                self.client.broadcast();
                Err(error)
            }
        }
    }

    /// The best currently known data for this query: the pending diff when
    /// one exists, a fresh cache diff otherwise.
    fn current_data(&self) -> Value {
        self.client
            .registry
            .with(self.id, |record| record.pending_diff.clone())
            .flatten()
            .map(|diff| diff.result)
            .unwrap_or_else(|| {
                let options = self.options.lock();
                let variables = self.variables.lock();
                self.client
                    .cache
                    .diff(&options.document, &variables, true, false)
                    .result
            })
    }

    /// Map this query's previous result to a new one and publish it through
    /// a query-scoped cache update. Returning `None` (or null) bails out.
    pub fn update_query(&self, map: impl FnOnce(&Value, &Object) -> Option<Value>) {
        let variables = self.variables.lock().clone();
        let options = self.options.lock().clone();
        let previous = self.current_data();

        match map(&previous, &variables) {
            Some(data) if data != Value::Null => {
                if !options.fetch_policy(&self.client.defaults).skips_cache() {
                    self.client.cache.write(&options.document, &variables, &data);
                }
                self.client.registry.set_diff(
                    self.id,
                    CacheDiff {
                        result: data,
                        complete: true,
                    },
                );
                self.client.broadcast();
            }
            _ => {}
        }
    }

    /// Start delivering subscription payloads into this query's result via
    /// the update-query path. The returned token cancels just this
    /// subscription; tearing down the last observer cancels it as well.
    pub fn subscribe_to_more(&self, options: SubscribeToMoreOptions) -> Cancellation {
        let client = Arc::clone(&self.client);
        let update = Arc::clone(&options.update_query);
        let weak = self.this.clone();
        let subscription_options = SubscriptionOptions {
            document: options.document,
            variables: options.variables,
            error_policy: None,
            context: options.context,
        };

        let (abort_handle, abort_registration) = futures::future::AbortHandle::new_pair();
        let task = async move {
            use futures::StreamExt;
            let mut stream = Arc::clone(&client).subscribe_stream(subscription_options).await;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(result) => {
                        let observable = match weak.upgrade() {
                            Some(observable) => observable,
                            None => break,
                        };
                        if let Some(data) = result.data {
                            observable
                                .update_query(|previous, _variables| update(previous, &data));
                        }
                    }
                    Err(error) => {
                        if error.is_store_reset() {
                            break;
                        }
                        tracing::debug!(%error, "subscription produced an error");
                    }
                }
            }
        };
        tokio::spawn(futures::future::Abortable::new(task, abort_registration));

        let registered = abort_handle.clone();
        self.client
            .registry
            .push_network_subscription(self.id, Cancellation::new(move || registered.abort()));
        Cancellation::new(move || abort_handle.abort())
    }

    /// Start polling at the given interval through the engine's shared poll
    /// scheduler. Polling implies a network need, so cache-bound policies
    /// refuse it.
    pub fn start_polling(&self, interval: Duration) -> Result<(), QueryError> {
        let policy = self.fetch_policy();
        if matches!(policy, FetchPolicy::CacheFirst | FetchPolicy::CacheOnly) {
            return Err(FetchError::UnsupportedOperation {
                reason: format!("polling is not supported with fetch policy {:?}", policy),
            }
            .into());
        }
        self.client.poll.start(self.id, interval);
        Ok(())
    }

    pub fn stop_polling(&self) {
        self.client.poll.stop(self.id);
    }

    /// Listener entry point: turn a broadcast payload into a typed result
    /// for this instance's observers. Every observer sees the same snapshot.
    fn on_broadcast(
        self: Arc<Self>,
        entry: QueryStoreEntry,
        diff: Option<CacheDiff>,
        force_local_resolve: bool,
    ) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }

        if force_local_resolve && !self.client.link_resolves_client_fields {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let this = Arc::clone(&self);
                    handle.spawn(async move {
                        let options = this.current_options();
                        let variables = this.variables.lock().clone();
                        let seed = diff.as_ref().map(|d| d.result.clone());
                        let complete = diff.as_ref().map_or(true, |d| d.complete);
                        let resolution = this
                            .client
                            .local
                            .run_resolvers(&options.document, seed, &variables, &options.context)
                            .await;
                        let diff = Some(CacheDiff {
                            result: resolution.data,
                            complete,
                        });
                        this.report(entry, diff, resolution.errors);
                    });
                }
                Err(_) => {
                    failfast_debug!("no runtime available for local resolution");
                    self.report(entry, diff, Vec::new());
                }
            }
        } else {
            self.report(entry, diff, Vec::new());
        }
    }

    fn report(&self, entry: QueryStoreEntry, diff: Option<CacheDiff>, resolver_errors: Vec<Error>) {
        let result = self.build_result(&entry, diff.as_ref(), resolver_errors);

        if let Some(error) = result.error.clone() {
            let repeated = self.last_error.lock().as_ref() == Some(&error);
            *self.last_error.lock() = Some(error.clone());
            *self.last_result.lock() = Some(result);
            if !repeated {
                let observers = self.observers.lock().clone();
                for (_, observer) in observers {
                    observer.error(error.clone());
                }
            }
            return;
        }

        let notify_on_status = self
            .options
            .lock()
            .notify_on_network_status_change(&self.client.defaults);
        let deliver = {
            let last = self.last_result.lock();
            match last.as_ref() {
                None => true,
                Some(last) => {
                    last.data != result.data
                        || last.stale != result.stale
                        || last.errors != result.errors
                        || last.error != result.error
                        || (last.network_status != result.network_status
                            && (notify_on_status || !result.loading))
                }
            }
        };
        if deliver {
            *self.last_result.lock() = Some(result.clone());
            *self.last_error.lock() = None;
            let observers = self.observers.lock().clone();
            for (_, observer) in observers {
                observer.next(result.clone());
            }
        }
    }

    fn build_result(
        &self,
        entry: &QueryStoreEntry,
        diff: Option<&CacheDiff>,
        resolver_errors: Vec<Error>,
    ) -> QueryResult {
        let (error_policy, return_partial_data) = {
            let options = self.options.lock();
            (
                options.error_policy(&self.client.defaults),
                options.return_partial_data,
            )
        };

        let (data, partial) = match diff {
            Some(diff) if diff.complete => (Some(diff.result.clone()), false),
            Some(diff) if return_partial_data => (Some(diff.result.clone()), true),
            Some(_) => (None, true),
            None => (None, false),
        };

        let mut errors = resolver_errors;
        if error_policy == ErrorPolicy::All {
            errors.extend(entry.graphql_errors.iter().cloned());
        }

        let error = if let Some(network_error) = &entry.network_error {
            Some(QueryError::Network {
                source: network_error.clone(),
            })
        } else if !entry.graphql_errors.is_empty() && error_policy == ErrorPolicy::None {
            Some(QueryError::Graphql {
                errors: entry.graphql_errors.clone(),
            })
        } else {
            None
        };

        let stale = entry.network_status == NetworkStatus::SetVariables
            && entry.previous_variables.is_some();

        QueryResult {
            data,
            errors,
            error,
            loading: entry.network_status.is_in_flight(),
            network_status: entry.network_status,
            partial,
            stale,
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl std::fmt::Debug for ObservableQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableQuery")
            .field("id", &self.id)
            .field("observers", &self.observers.lock().len())
            .field("torn_down", &self.torn_down.load(Ordering::SeqCst))
            .finish()
    }
}
