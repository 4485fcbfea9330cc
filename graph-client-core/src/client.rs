use crate::polling::PollScheduler;
use crate::prelude::graphql::*;
use crate::registry::{QueryLifecycle, QueryRegistry};
use futures::prelude::*;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;
use tokio::sync::oneshot;

/// A stream of typed results, as produced by `subscribe`.
pub type QueryResultStream = Pin<Box<dyn Stream<Item = Result<QueryResult, QueryError>> + Send>>;

/// The query orchestration engine.
///
/// Owns the query registry and store, coordinates the cache and the link
/// chain, and hands out [`ObservableQuery`] views. Cheap to clone handles are
/// not provided; wrap it in an `Arc` if it must be shared.
#[derive(Debug)]
pub struct GraphClient {
    inner: Arc<ClientInner>,
}

/// State shared between the client facade, observable queries, the poll
/// scheduler and in-flight fetch tasks.
#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) link: Arc<dyn Link>,
    pub(crate) local: LocalState,
    pub(crate) registry: QueryRegistry,
    pub(crate) store: Mutex<QueryStore>,
    pub(crate) defaults: DefaultOptions,
    /// When set, `@client` fields stay in the outgoing document and the link
    /// chain is expected to resolve them.
    pub(crate) link_resolves_client_fields: bool,
    pub(crate) poll: PollScheduler,
    query_id_seq: AtomicU64,
    /// Engine-global monotonically increasing request counter; per-query
    /// `last_request_id` values are comparable across queries.
    request_id_seq: AtomicU64,
    stopped: AtomicBool,
}

impl ClientInner {
    pub(crate) fn next_query_id(&self) -> QueryId {
        QueryId(self.query_id_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_id_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Dispatch every invalidated query's listeners.
    pub(crate) fn broadcast(&self) {
        self.registry.broadcast(&self.store);
    }

    /// Cache-watch entry point: a region covered by `id` changed, possibly
    /// because of another query's write.
    pub(crate) fn on_cache_updated(&self, id: QueryId, diff: CacheDiff) {
        // guard against writes into a disposed record
        if !self.registry.contains(id) {
            return;
        }
        self.registry.set_diff(id, diff);
        self.broadcast();
    }

    fn spawn_poll(self: Arc<Self>, id: QueryId) {
        tokio::spawn(async move {
            let in_flight = self
                .store
                .lock()
                .get(id)
                .map_or(false, |entry| entry.network_status.is_in_flight());
            if in_flight {
                // skip this tick; the previous cycle is still outstanding
                return;
            }
            let observable = self
                .registry
                .with(id, |record| record.observable.clone())
                .and_then(|weak| weak.upgrade());
            if let Some(observable) = observable {
                let options = observable.current_options();
                if let Err(error) = Arc::clone(&self)
                    .fetch_query(id, options, FetchKind::Poll, None)
                    .await
                {
                    tracing::debug!(query = %id, %error, "poll fetch failed");
                }
            }
        });
    }

    /// Shared by `subscribe` and `subscribe_to_more`: execute a subscription
    /// operation and surface each payload as a typed result. The stream ends
    /// with a store-reset error when the engine stops.
    pub(crate) async fn subscribe_stream(
        self: Arc<Self>,
        options: SubscriptionOptions,
    ) -> QueryResultStream {
        if self.is_stopped() {
            return Box::pin(stream::once(future::ready(Err(
                FetchError::StoreReset.into()
            ))));
        }
        let error_policy = options.error_policy.unwrap_or(self.defaults.error_policy);
        let document = self.cache.transform_document(Arc::clone(&options.document));

        let mut variables = document.default_variables();
        for (key, value) in options.variables.clone() {
            variables.insert(key, value);
        }
        if let Err(error) = document.validate_variables(&variables) {
            return Box::pin(stream::once(future::ready(Err(error.into()))));
        }

        let outgoing = if self.link_resolves_client_fields {
            Some(document.as_ref().clone())
        } else {
            document.strip_client_fields()
        };
        let outgoing = match outgoing {
            Some(outgoing) => Arc::new(outgoing),
            None => {
                return Box::pin(stream::once(future::ready(Err(
                    FetchError::UnsupportedOperation {
                        reason: "subscription selects only local fields".to_string(),
                    }
                    .into(),
                ))))
            }
        };

        let id = self.next_query_id();
        self.registry
            .register(id, QueryLifecycle::new(Arc::clone(&document), variables.clone()));

        let cancelled = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let flag = Arc::clone(&cancelled);
        self.registry.push_network_subscription(
            id,
            Cancellation::new(move || {
                flag.store(true, Ordering::SeqCst);
                let _ = cancel_tx.send(());
            }),
        );

        let request = Request::builder()
            .document(outgoing)
            .operation_name(document.operation_name().map(|s| s.to_string()))
            .variables(Arc::new(variables.clone()))
            .context(options.context.clone())
            .build();
        let raw = self.link.execute(request).await;

        let inner = Arc::clone(&self);
        let context = options.context.clone();
        let payloads = raw.take_until(cancel_rx).then(move |item| {
            let inner = Arc::clone(&inner);
            let document = Arc::clone(&document);
            let variables = variables.clone();
            let context = context.clone();
            async move {
                let response = item.map_err(QueryError::from)?;
                if !response.errors.is_empty() && error_policy == ErrorPolicy::None {
                    return Err(QueryError::Graphql {
                        errors: response.errors,
                    });
                }
                let mut data = response.data;
                let mut errors = Vec::new();
                if document.has_client_fields() && !inner.link_resolves_client_fields {
                    let resolution = inner
                        .local
                        .run_resolvers(&document, Some(data), &variables, &context)
                        .await;
                    data = resolution.data;
                    errors.extend(resolution.errors);
                }
                if error_policy == ErrorPolicy::All {
                    errors.extend(response.errors);
                }
                Ok(QueryResult {
                    data: Some(data),
                    errors,
                    ..Default::default()
                })
            }
        });

        // when cancelled mid-stream, surface an explicit store-reset failure
        // instead of silently completing; the guard deregisters the record
        // whenever the consumer drops the stream
        let guard = RemoveOnDrop {
            inner: Arc::downgrade(&self),
            id,
        };
        let mut done = false;
        let tail = stream::poll_fn(move |_| {
            let _ = &guard;
            if !done && cancelled.load(Ordering::SeqCst) {
                done = true;
                Poll::Ready(Some(Err(FetchError::StoreReset.into())))
            } else {
                Poll::Ready(None)
            }
        });

        Box::pin(payloads.chain(tail))
    }
}

struct RemoveOnDrop {
    inner: Weak<ClientInner>,
    id: QueryId,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.registry.remove(self.id);
            inner.store.lock().remove(self.id);
        }
    }
}

/// Assembles a [`GraphClient`].
pub struct GraphClientBuilder {
    cache: Arc<dyn Cache>,
    link: Arc<dyn Link>,
    resolvers: ResolverMap,
    matcher: Arc<dyn FragmentMatcher>,
    defaults: DefaultOptions,
    link_resolves_client_fields: bool,
}

impl GraphClientBuilder {
    /// Register a local resolver for `type_name.field_name`.
    pub fn resolver(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        self.resolvers.insert(type_name, field_name, resolver);
        self
    }

    pub fn resolvers(mut self, resolvers: ResolverMap) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn fragment_matcher(mut self, matcher: Arc<dyn FragmentMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn defaults(mut self, defaults: DefaultOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Leave `@client` fields in outgoing documents for the link chain to
    /// resolve.
    pub fn link_resolves_client_fields(mut self, value: bool) -> Self {
        self.link_resolves_client_fields = value;
        self
    }

    pub fn build(self) -> GraphClient {
        let local = LocalState::new(self.resolvers, self.matcher);
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let poll_target = weak.clone();
            ClientInner {
                cache: self.cache,
                link: self.link,
                local,
                registry: QueryRegistry::default(),
                store: Mutex::new(QueryStore::default()),
                defaults: self.defaults,
                link_resolves_client_fields: self.link_resolves_client_fields,
                poll: PollScheduler::new(Arc::new(move |id| {
                    if let Some(inner) = poll_target.upgrade() {
                        inner.spawn_poll(id);
                    }
                })),
                query_id_seq: AtomicU64::new(0),
                request_id_seq: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }
        });
        GraphClient { inner }
    }
}

impl GraphClient {
    /// Start assembling a client over the given cache and link chain.
    pub fn builder(cache: Arc<dyn Cache>, link: Arc<dyn Link>) -> GraphClientBuilder {
        GraphClientBuilder {
            cache,
            link,
            resolvers: ResolverMap::new(),
            matcher: Arc::new(TypenameFragmentMatcher),
            defaults: DefaultOptions::default(),
            link_resolves_client_fields: false,
        }
    }

    /// Create a live view over a query. The view stays inert until its first
    /// observer subscribes.
    pub fn watch_query(&self, options: WatchQueryOptions) -> Arc<ObservableQuery> {
        let id = self.inner.next_query_id();
        ObservableQuery::new(Arc::clone(&self.inner), id, options)
    }

    /// One-shot query: a single asynchronous result, no ongoing view.
    pub async fn query(&self, options: QueryOptions) -> Result<QueryResult, QueryError> {
        let fetch_policy = options
            .fetch_policy
            .unwrap_or(self.inner.defaults.fetch_policy);
        if fetch_policy == FetchPolicy::CacheAndNetwork {
            return Err(FetchError::UnsupportedOperation {
                reason: "cache-and-network only makes sense for watched queries".to_string(),
            }
            .into());
        }

        let id = self.inner.next_query_id();
        self.inner.registry.register(
            id,
            QueryLifecycle::new(Arc::clone(&options.document), options.variables.clone()),
        );
        let result = Arc::clone(&self.inner)
            .fetch_query(id, options.into(), FetchKind::Normal, None)
            .await;
        self.inner.registry.remove(id);
        self.inner.store.lock().remove(id);
        result
    }

    /// Execute a mutation, write its result, then run the mutation's
    /// `update_queries` and `refetch_queries` against the active queries.
    pub async fn mutate(&self, options: MutationOptions) -> Result<QueryResult, QueryError> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(FetchError::StoreReset.into());
        }
        let error_policy = options.error_policy.unwrap_or(inner.defaults.error_policy);
        let document = inner.cache.transform_document(Arc::clone(&options.document));

        let mut variables = document.default_variables();
        for (key, value) in options.variables.clone() {
            variables.insert(key, value);
        }
        document.validate_variables(&variables)?;

        let id = inner.next_query_id();
        inner
            .registry
            .register(id, QueryLifecycle::new(Arc::clone(&document), variables.clone()));
        let result = self
            .execute_mutation(id, &document, variables, error_policy, options.no_cache)
            .await;
        inner.registry.remove(id);

        if let Ok(result) = &result {
            self.apply_mutation_side_effects(&options, result).await;
        }
        result
    }

    async fn execute_mutation(
        &self,
        id: QueryId,
        document: &Arc<Document>,
        variables: Object,
        error_policy: ErrorPolicy,
        no_cache: bool,
    ) -> Result<QueryResult, QueryError> {
        let inner = &self.inner;

        let outgoing = if inner.link_resolves_client_fields {
            Some(document.as_ref().clone())
        } else {
            document.strip_client_fields()
        };

        let mut accumulated: Option<Value> = None;
        let mut graphql_errors = Vec::new();
        if let Some(outgoing) = outgoing {
            let request = Request::builder()
                .document(Arc::new(outgoing))
                .operation_name(document.operation_name().map(|s| s.to_string()))
                .variables(Arc::new(variables.clone()))
                .build();

            let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
            inner.registry.push_network_subscription(
                id,
                Cancellation::new(move || {
                    let _ = cancel_tx.send(());
                }),
            );

            let mut stream = inner.link.execute(request).await;
            loop {
                let item = tokio::select! {
                    _ = &mut cancel_rx => return Err(FetchError::StoreReset.into()),
                    item = stream.next() => item,
                };
                let response = match item {
                    None => break,
                    Some(Ok(response)) => response,
                    Some(Err(error)) => return Err(error.into()),
                };
                graphql_errors.extend(response.errors);
                match &mut accumulated {
                    None => accumulated = Some(response.data),
                    Some(data) => data.deep_merge(response.data),
                }
            }

            if !graphql_errors.is_empty() && error_policy == ErrorPolicy::None {
                return Err(QueryError::Graphql {
                    errors: graphql_errors,
                });
            }
        }

        let mut data = accumulated.unwrap_or_default();
        let mut errors = Vec::new();
        if document.has_client_fields() && !inner.link_resolves_client_fields {
            let resolution = inner
                .local
                .run_resolvers(document, Some(data), &variables, &Context::new())
                .await;
            data = resolution.data;
            errors.extend(resolution.errors);
        }

        if !no_cache && !data.is_null() {
            inner.cache.write(document, &variables, &data);
            inner.broadcast();
        }

        if error_policy == ErrorPolicy::All {
            errors.extend(graphql_errors);
        }
        Ok(QueryResult {
            data: Some(data),
            errors,
            ..Default::default()
        })
    }

    async fn apply_mutation_side_effects(&self, options: &MutationOptions, result: &QueryResult) {
        let observables: Vec<(String, Arc<ObservableQuery>)> = self
            .inner
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.inner
                    .registry
                    .with(id, |record| {
                        (
                            record.document.operation_name().map(|s| s.to_string()),
                            record.observable.clone(),
                        )
                    })
                    .and_then(|(name, observable)| Some((name?, observable.upgrade()?)))
            })
            .collect();

        if let Some(mutation_data) = &result.data {
            for (name, update) in &options.update_queries {
                for (operation_name, observable) in &observables {
                    if operation_name == name {
                        let update = Arc::clone(update);
                        observable
                            .update_query(|previous, _variables| update(previous, mutation_data));
                    }
                }
            }
        }

        let refetches: Vec<_> = observables
            .iter()
            .filter(|(name, _)| options.refetch_queries.contains(name))
            .map(|(_, observable)| Arc::clone(observable))
            .collect();
        if refetches.is_empty() {
            return;
        }
        if options.await_refetch_queries {
            future::join_all(refetches.iter().map(|observable| async move {
                if let Err(error) = observable.refetch(None).await {
                    tracing::debug!(%error, "mutation-triggered refetch failed");
                }
            }))
            .await;
        } else {
            tokio::spawn(async move {
                future::join_all(refetches.iter().map(|observable| async move {
                    if let Err(error) = observable.refetch(None).await {
                        tracing::debug!(%error, "mutation-triggered refetch failed");
                    }
                }))
                .await;
            });
        }
    }

    /// Execute a subscription operation: a stream of typed results.
    pub async fn subscribe(&self, options: SubscriptionOptions) -> QueryResultStream {
        Arc::clone(&self.inner).subscribe_stream(options).await
    }

    /// Refetch every active watched query. `standby` and `cache-only`
    /// queries are skipped unless `include_standby` is set.
    pub async fn refetch_observable_queries(
        &self,
        include_standby: bool,
    ) -> Vec<Result<QueryResult, QueryError>> {
        let observables: Vec<Arc<ObservableQuery>> = self
            .inner
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.inner
                    .registry
                    .with(id, |record| record.observable.clone())
                    .and_then(|weak| weak.upgrade())
            })
            .filter(|observable| {
                include_standby || !observable.fetch_policy().forbids_network()
            })
            .collect();

        future::join_all(
            observables
                .iter()
                .map(|observable| observable.refetch(None)),
        )
        .await
    }

    /// Re-dispatch the listeners of every invalidated query.
    pub fn broadcast_queries(&self) {
        self.inner.broadcast();
    }

    /// Reject all in-flight requests with a store-reset failure and move the
    /// affected queries to an explicit error state. Active views stay
    /// registered and will refetch on their next cycle.
    pub fn clear_store(&self) {
        for id in self.inner.registry.ids() {
            self.inner.registry.mutate(id, |record| {
                for mut subscription in record.network_subscriptions.drain(..) {
                    subscription.cancel();
                }
                record.pending_diff = None;
            });
        }
        let affected = self.inner.store.lock().reset_in_flight();
        for id in affected {
            self.inner.registry.invalidate(id);
        }
        self.inner.broadcast();
    }

    /// Tear the engine down: every known query is removed, every pending
    /// network continuation is rejected, and polling stops. Subsequent
    /// operations fail with a store-reset error.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.poll.stop_all();
        let affected = self.inner.store.lock().reset_in_flight();
        for id in affected {
            self.inner.registry.invalidate(id);
        }
        self.inner.broadcast();
        self.inner.registry.stop();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    /// The number of live poll timer tasks (0 or 1).
    pub fn active_poll_timers(&self) -> usize {
        self.inner.poll.active_timers()
    }
}
