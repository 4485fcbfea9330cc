//! The request orchestrator: decides, for one fetch cycle, whether to consult
//! the cache, whether to go to the network, and how to reconcile whatever
//! comes back with the registry and the store.

use crate::client::ClientInner;
use crate::prelude::graphql::*;
use futures::prelude::*;
use std::sync::Arc;
use tokio::sync::oneshot;

impl ClientInner {
    /// Run one fetch cycle for `id`.
    ///
    /// `fetch_more_for` names the query on whose behalf a pagination fetch
    /// runs; that query's store entry reports `fetch-more` while this one is
    /// outstanding.
    #[tracing::instrument(skip(self, options), fields(query = %id), level = "debug")]
    pub(crate) async fn fetch_query(
        self: Arc<Self>,
        id: QueryId,
        options: WatchQueryOptions,
        kind: FetchKind,
        fetch_more_for: Option<QueryId>,
    ) -> Result<QueryResult, QueryError> {
        if self.is_stopped() {
            return Err(FetchError::StoreReset.into());
        }

        let fetch_policy = options.fetch_policy(&self.defaults);
        let error_policy = options.error_policy(&self.defaults);
        let document = self.cache.transform_document(Arc::clone(&options.document));

        // variable precedence: document defaults < caller < exported values
        let mut variables = document.default_variables();
        for (key, value) in options.variables.clone() {
            variables.insert(key, value);
        }
        let mut export_errors = Vec::new();
        if document.has_export_fields() && !self.link_resolves_client_fields {
            let seed = self.cache.diff(&document, &variables, true, false);
            let (exported, errors) = self
                .local
                .resolve_exports(&document, Some(seed.result), &variables, &options.context)
                .await;
            for (key, value) in exported {
                variables.insert(key, value);
            }
            export_errors = errors;
        }
        if let Err(error) = document.validate_variables(&variables) {
            self.store.lock().mark_error(id, error.clone());
            self.registry.invalidate(id);
            self.broadcast();
            return Err(error.into());
        }

        // a refetch that bypasses the cache has no use for a diff
        let skip_diff = kind == FetchKind::Refetch
            && matches!(
                fetch_policy,
                FetchPolicy::NetworkOnly | FetchPolicy::NoCache
            );
        let diff = if skip_diff {
            None
        } else {
            Some(self.cache.diff(&document, &variables, true, false))
        };
        let complete = diff.as_ref().map_or(false, |diff| diff.complete);

        let need_to_fetch = !complete
            || fetch_policy == FetchPolicy::CacheAndNetwork
            || matches!(
                fetch_policy,
                FetchPolicy::NetworkOnly | FetchPolicy::NoCache
            )
            || document.is_live();
        let should_fetch = need_to_fetch && !fetch_policy.forbids_network();

        // only the most recently issued request for this id may write
        let request_id = self.next_request_id();
        self.registry.mutate(id, |record| {
            record.last_request_id = request_id;
            record.document = Arc::clone(&document);
            record.variables = variables.clone();
        });

        // re-establish the cache watch so unrelated cache writes keep
        // triggering dispatches for this query
        if !fetch_policy.skips_cache() {
            let watch = {
                let this = Arc::downgrade(&self);
                let watch_id = id;
                self.cache.watch(
                    &document,
                    &variables,
                    false,
                    Arc::new(move |diff| {
                        if let Some(inner) = this.upgrade() {
                            inner.on_cache_updated(watch_id, diff);
                        }
                    }),
                )
            };
            self.registry.mutate(id, |record| {
                record.cancel_watch.cancel();
                record.cancel_watch = watch;
            });
        }

        if let Some(diff) = diff.clone() {
            self.registry.set_diff(id, diff);
        }
        {
            let mut store = self.store.lock();
            store.init_fetch(id, kind, variables.clone(), should_fetch);
            if let Some(main) = fetch_more_for {
                store.set_status(main, NetworkStatus::FetchMore);
            }
        }
        if let Some(main) = fetch_more_for {
            self.registry.invalidate(main);
        }
        // make any already-complete cache contribution visible without
        // waiting on the network
        self.broadcast();

        if !should_fetch {
            return self
                .resolve_from_cache(
                    id,
                    &document,
                    variables,
                    &options,
                    diff,
                    complete,
                    error_policy,
                    export_errors,
                )
                .await;
        }

        self.execute_network(
            id,
            document,
            variables,
            options,
            fetch_policy,
            error_policy,
            request_id,
            export_errors,
        )
        .await
    }

    /// Step 10: the cache alone answers; no network status transition beyond
    /// ready.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_from_cache(
        self: &Arc<Self>,
        id: QueryId,
        document: &Document,
        variables: Object,
        options: &WatchQueryOptions,
        diff: Option<CacheDiff>,
        complete: bool,
        error_policy: ErrorPolicy,
        mut errors: Vec<Error>,
    ) -> Result<QueryResult, QueryError> {
        let mut data = diff.map(|diff| diff.result).unwrap_or_default();
        if document.has_client_fields() && !self.link_resolves_client_fields {
            let resolution = self
                .local
                .run_resolvers(document, Some(data), &variables, &options.context)
                .await;
            data = resolution.data;
            errors.extend(resolution.errors);
            self.registry.set_diff(
                id,
                CacheDiff {
                    result: data.clone(),
                    complete,
                },
            );
            self.broadcast();
        }

        let partial = !complete;
        let data = if complete || options.return_partial_data {
            Some(data)
        } else {
            None
        };
        Ok(QueryResult {
            data,
            errors: if error_policy == ErrorPolicy::Ignore {
                Vec::new()
            } else {
                errors
            },
            error: None,
            loading: false,
            network_status: NetworkStatus::Ready,
            partial,
            stale: false,
        })
    }

    /// Step 9: go to the network and apply every received value in request-id
    /// order, discarding stale responses.
    #[allow(clippy::too_many_arguments)]
    async fn execute_network(
        self: &Arc<Self>,
        id: QueryId,
        document: Arc<Document>,
        variables: Object,
        options: WatchQueryOptions,
        fetch_policy: FetchPolicy,
        error_policy: ErrorPolicy,
        request_id: u64,
        export_errors: Vec<Error>,
    ) -> Result<QueryResult, QueryError> {
        // strip local-only fields from the outgoing document, unless the
        // link chain is configured to resolve them remotely
        let outgoing = if self.link_resolves_client_fields {
            Some(document.as_ref().clone())
        } else {
            document.strip_client_fields()
        };
        let outgoing = match outgoing {
            Some(outgoing) => Arc::new(outgoing),
            None => {
                // nothing left for the server: the document is local-only
                return self
                    .apply_local_only(id, &document, variables, &options, error_policy, export_errors)
                    .await;
            }
        };

        let request = Request::builder()
            .document(Arc::clone(&outgoing))
            .operation_name(document.operation_name().map(|s| s.to_string()))
            .variables(Arc::new(variables.clone()))
            .context(options.context.clone())
            .build();

        // in-flight cancellation: `remove`/`stop` reject this continuation
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.registry.push_network_subscription(
            id,
            Cancellation::new(move || {
                let _ = cancel_tx.send(());
            }),
        );

        let mut stream = self.link.execute(request).await;

        let mut accumulated: Option<Value> = None;
        let mut resolved: Option<Value> = None;
        let mut accumulated_errors = export_errors;
        let mut received_any = false;

        loop {
            let item = tokio::select! {
                _ = &mut cancel_rx => {
                    return Err(FetchError::StoreReset.into());
                }
                item = stream.next() => item,
            };

            let response = match item {
                None => break,
                Some(Ok(response)) => response,
                Some(Err(error)) => {
                    if self.request_is_stale(id, request_id) {
                        // a newer request owns this query; swallow
                        tracing::debug!(query = %id, %error, "stale request failed, ignoring");
                        break;
                    }
                    self.store.lock().mark_error(id, error.clone());
                    self.registry.invalidate(id);
                    self.broadcast();
                    return Err(error.into());
                }
            };

            if self.request_is_stale(id, request_id) {
                tracing::debug!(query = %id, "discarding response for superseded request");
                break;
            }
            received_any = true;

            let has_next = response.has_next.unwrap_or(false);
            let graphql_errors = response.errors.clone();

            // a GraphQL error list under `none` fails the whole cycle
            if !graphql_errors.is_empty() && error_policy == ErrorPolicy::None {
                {
                    let mut store = self.store.lock();
                    store.mark_result(id, graphql_errors.clone(), false);
                }
                self.registry.invalidate(id);
                self.broadcast();
                return Err(QueryError::Graphql {
                    errors: graphql_errors,
                });
            }

            // merge this value into the accumulated result
            let value = response.data.clone();
            match (&mut accumulated, &response.path) {
                (None, None) => accumulated = Some(value),
                (None, Some(path)) => {
                    let mut data = Value::Object(Object::new());
                    if !data.insert_at_path(path, value) {
                        failfast_debug!("patch response for unknown path {}", path);
                    }
                    accumulated = Some(data);
                }
                (Some(data), Some(path)) => {
                    if !data.insert_at_path(path, value) {
                        failfast_debug!("patch response for unknown path {}", path);
                    }
                }
                (Some(data), None) => data.deep_merge(value),
            }

            // local field resolution merges cache-or-remote values with
            // locally computed ones
            let mut data = accumulated.clone().unwrap_or_default();
            if document.has_client_fields() && !self.link_resolves_client_fields {
                let resolution = self
                    .local
                    .run_resolvers(&document, Some(data), &variables, &options.context)
                    .await;
                data = resolution.data;
                accumulated_errors.extend(resolution.errors);
            }
            resolved = Some(data.clone());

            // settle the store entry and pending diff first: the cache write
            // below synchronously re-enters through cache-watch callbacks,
            // and those echoes must observe the terminal state
            {
                let mut store = self.store.lock();
                let errors = if error_policy == ErrorPolicy::All {
                    graphql_errors.clone()
                } else {
                    Vec::new()
                };
                store.mark_result(id, errors, has_next);
            }
            self.registry.set_diff(
                id,
                CacheDiff {
                    result: data.clone(),
                    complete: true,
                },
            );

            let write_to_cache = !fetch_policy.skips_cache()
                && !data.is_null()
                && (graphql_errors.is_empty() || error_policy == ErrorPolicy::All);
            if write_to_cache {
                self.cache.write(&document, &variables, &data);
            }

            self.registry.invalidate(id);
            self.broadcast();
        }

        if !received_any && !self.request_is_stale(id, request_id) {
            // zero-value completion is an empty successful result
            self.store.lock().mark_result(id, Vec::new(), false);
            self.registry.invalidate(id);
            self.broadcast();
        }

        let graphql_errors = if error_policy == ErrorPolicy::All {
            self.store
                .lock()
                .get(id)
                .map(|entry| entry.graphql_errors.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut errors = accumulated_errors;
        errors.extend(graphql_errors);
        let network_status = self
            .store
            .lock()
            .get(id)
            .map(|entry| entry.network_status)
            .unwrap_or(NetworkStatus::Ready);

        Ok(QueryResult {
            data: resolved.or(accumulated),
            errors,
            error: None,
            loading: false,
            network_status,
            partial: false,
            stale: false,
        })
    }

    /// A document whose entire selection is local: resolve it without ever
    /// touching the link.
    async fn apply_local_only(
        self: &Arc<Self>,
        id: QueryId,
        document: &Document,
        variables: Object,
        options: &WatchQueryOptions,
        error_policy: ErrorPolicy,
        mut errors: Vec<Error>,
    ) -> Result<QueryResult, QueryError> {
        let resolution = self
            .local
            .run_resolvers(document, None, &variables, &options.context)
            .await;
        errors.extend(resolution.errors);
        self.registry.set_diff(
            id,
            CacheDiff {
                result: resolution.data.clone(),
                complete: true,
            },
        );
        self.store.lock().mark_result(id, Vec::new(), false);
        self.registry.invalidate(id);
        self.broadcast();
        Ok(QueryResult {
            data: Some(resolution.data),
            errors: if error_policy == ErrorPolicy::Ignore {
                Vec::new()
            } else {
                errors
            },
            error: None,
            loading: false,
            network_status: NetworkStatus::Ready,
            partial: false,
            stale: false,
        })
    }

    fn request_is_stale(&self, id: QueryId, request_id: u64) -> bool {
        match self.registry.last_request_id(id) {
            // the record is gone: whoever removed it owns the teardown
            None => true,
            Some(latest) => latest > request_id,
        }
    }
}
