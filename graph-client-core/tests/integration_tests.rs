//! End-to-end tests over the whole engine, with the cache and link seams
//! replaced by the in-memory test doubles.

use graph_client_core::prelude::graphql::*;
use graph_client_core::test_utils::*;
use serde_json_bytes::json;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

fn variables(value: serde_json_bytes::Value) -> Object {
    value.as_object().cloned().unwrap_or_default()
}

fn item_document() -> Arc<Document> {
    named_query(
        "Item",
        vec![Field::builder()
            .name("item")
            .selection_set(vec![scalar("id"), scalar("name")])
            .build()
            .into()],
    )
}

fn items_document() -> Arc<Document> {
    named_query(
        "Items",
        vec![Field::builder()
            .name("items")
            .selection_set(vec![scalar("id")])
            .build()
            .into()],
    )
}

fn subscription_document(name: &str, field: &str) -> Arc<Document> {
    Arc::new(
        Document::builder()
            .operation(
                Operation::builder()
                    .kind(OperationKind::Subscription)
                    .name(name.to_string())
                    .selection_set(vec![Field::builder()
                        .name(field)
                        .selection_set(vec![scalar("id")])
                        .build()
                        .into()])
                    .build(),
            )
            .build(),
    )
}

#[test(tokio::test)]
async fn cache_and_network_reports_loading_then_ready() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache, link).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .variables(variables(json!({"id": 1})))
            .fetch_policy(FetchPolicy::CacheAndNetwork)
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());

    wait_for(|| observer.result_count() >= 2).await;
    let results = observer.results();
    assert_eq!(results[0].network_status, NetworkStatus::Loading);
    assert!(results[0].loading);
    assert_eq!(results[0].data, None);

    let last = results.last().unwrap();
    assert_eq!(last.network_status, NetworkStatus::Ready);
    assert!(!last.loading);
    assert_eq!(last.data, Some(json!({"item": {"id": 1, "name": "A"}})));
}

#[test(tokio::test)]
async fn stale_responses_are_discarded() {
    let cache = MemoryCache::new();
    let link = ControlledLink::new();
    let client = GraphClient::builder(cache.clone(), link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| link.calls() == 1).await;

    // issue a second request while the first is still in flight
    let refetching = observable.clone();
    let refetch = tokio::spawn(async move { refetching.refetch(None).await });
    wait_for(|| link.calls() == 2).await;

    // the newer request resolves first
    link.resolve(
        1,
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "new"}}))
            .build(),
    );
    link.complete(1);
    let refetched = refetch.await.unwrap().unwrap();
    assert_eq!(refetched.data, Some(json!({"item": {"id": 1, "name": "new"}})));
    wait_for(|| observer.last_result().and_then(|r| r.data).is_some()).await;

    // the older request resolves afterwards and must not win
    link.resolve(
        0,
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "old"}}))
            .build(),
    );
    link.complete(0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let last = observer.last_result().unwrap();
    assert_eq!(last.data, Some(json!({"item": {"id": 1, "name": "new"}})));
    assert!(observer
        .results()
        .iter()
        .all(|result| result.data != Some(json!({"item": {"id": 1, "name": "old"}}))));
    assert_eq!(
        cache
            .read(&item_document(), &Object::new(), false)
            .unwrap(),
        json!({"item": {"id": 1, "name": "new"}})
    );
}

#[test(tokio::test)]
async fn cache_only_and_standby_never_hit_the_network() {
    for policy in [FetchPolicy::CacheOnly, FetchPolicy::Standby] {
        let cache = MemoryCache::new();
        let link = TestLink::new();
        let client = GraphClient::builder(cache.clone(), link.clone()).build();

        let observable = client.watch_query(
            WatchQueryOptions::builder()
                .document(item_document())
                .fetch_policy(policy)
                .build(),
        );
        let observer = RecordingObserver::new();
        let _subscription = observable.subscribe(observer.clone());
        wait_for(|| observer.result_count() >= 1).await;

        // cache writes keep notifying the watcher, still without any fetch
        cache.write(
            &item_document(),
            &Object::new(),
            &json!({"item": {"id": 1, "name": "A"}}),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.calls(), 0, "policy {:?} must not fetch", policy);
    }
}

#[test(tokio::test)]
async fn no_cache_results_never_reach_the_cache() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache.clone(), link.clone()).build();

    let result = client
        .query(
            QueryOptions::builder()
                .document(item_document())
                .fetch_policy(FetchPolicy::NoCache)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(result.data, Some(json!({"item": {"id": 1, "name": "A"}})));

    assert_eq!(cache.entry_count(), 0);
    assert!(cache.read(&item_document(), &Object::new(), false).is_err());
}

#[test(tokio::test)]
async fn identical_recomputed_results_are_suppressed() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache.clone(), link).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .build(),
    );
    let first = RecordingObserver::new();
    let second = RecordingObserver::new();
    let _first_subscription = observable.subscribe(first.clone());
    let _second_subscription = observable.subscribe(second.clone());

    wait_for(|| {
        first.last_result().map_or(false, |r| r.data.is_some())
            && second.last_result().map_or(false, |r| r.data.is_some())
    })
    .await;
    let first_count = first.result_count();
    let second_count = second.result_count();

    // an unrelated write re-fires the cache watch; the recomputed result is
    // byte-identical, so neither observer hears about it
    cache.write(
        &named_query("Other", vec![scalar("other")]),
        &Object::new(),
        &json!({"other": true}),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(first.result_count(), first_count);
    assert_eq!(second.result_count(), second_count);
}

#[tokio::test(start_paused = true)]
async fn polling_shares_a_single_timer() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    let client = GraphClient::builder(cache, link.clone()).build();
    assert_eq!(client.active_poll_timers(), 0);

    let fast = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::NetworkOnly)
            .poll_interval(Duration::from_millis(100))
            .build(),
    );
    let slow = client.watch_query(
        WatchQueryOptions::builder()
            .document(items_document())
            .fetch_policy(FetchPolicy::NetworkOnly)
            .poll_interval(Duration::from_millis(250))
            .build(),
    );
    let _fast_subscription = fast.subscribe(RecordingObserver::new());
    let _slow_subscription = slow.subscribe(RecordingObserver::new());
    assert_eq!(client.active_poll_timers(), 1);

    let initial = link.calls();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(link.calls() > initial, "poll ticks issue fetches");
    assert_eq!(client.active_poll_timers(), 1);

    fast.stop_polling();
    slow.stop_polling();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.active_poll_timers(), 0);
}

#[test(tokio::test)]
async fn polling_is_refused_for_cache_bound_policies() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    let client = GraphClient::builder(cache, link).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::CacheFirst)
            .build(),
    );
    let error = observable
        .start_polling(Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(
        error.network_error(),
        Some(FetchError::UnsupportedOperation { .. })
    ));
    // stopping is always safe
    observable.stop_polling();
}

#[test(tokio::test)]
async fn refetch_forces_network_only_for_that_call_only() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache, link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::CacheFirst)
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| observer.last_result().map_or(false, |r| r.data.is_some())).await;
    assert_eq!(link.calls(), 1);

    // the cache is complete, yet refetch still performs a round trip
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "B"}}))
            .build(),
    );
    let refetched = observable.refetch(None).await.unwrap();
    assert_eq!(link.calls(), 2);
    assert_eq!(refetched.data, Some(json!({"item": {"id": 1, "name": "B"}})));

    // the standing policy is untouched
    assert_eq!(
        observable.current_options().fetch_policy,
        Some(FetchPolicy::CacheFirst)
    );
    let _ = observable.get_current_result();
}

#[test(tokio::test)]
async fn refetch_is_refused_for_cache_only_queries() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    let client = GraphClient::builder(cache, link).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::CacheOnly)
            .build(),
    );
    let error = observable.refetch(None).await.unwrap_err();
    assert!(matches!(
        error.network_error(),
        Some(FetchError::UnsupportedOperation { .. })
    ));
}

#[test(tokio::test)]
async fn resolver_errors_null_the_field_and_keep_siblings() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(Response::builder().data(json!({"remote": "ok"})).build());
    let client = GraphClient::builder(cache, link)
        .resolver(
            "Query",
            "local",
            Arc::new(FnResolver(|_: &Value, _: &Object, _: &Context| {
                Err(FetchError::ResolverError {
                    field: "local".to_string(),
                    reason: "boom".to_string(),
                })
            })),
        )
        .build();

    let document = named_query(
        "Mixed",
        vec![
            scalar("remote"),
            Field::builder().name("local").client(true).build().into(),
        ],
    );
    let result = client
        .query(
            QueryOptions::builder()
                .document(document)
                .error_policy(ErrorPolicy::All)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(result.data, Some(json!({"remote": "ok", "local": null})));
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].message.contains("local"));
}

#[test(tokio::test)]
async fn watched_queries_resolve_client_fields() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(Response::builder().data(json!({"remote": "ok"})).build());
    let client = GraphClient::builder(cache, link)
        .resolver(
            "Query",
            "local",
            Arc::new(FnResolver(|_: &Value, _: &Object, _: &Context| {
                Ok(json!(42))
            })),
        )
        .build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(named_query(
                "Mixed",
                vec![
                    scalar("remote"),
                    Field::builder().name("local").client(true).build().into(),
                ],
            ))
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());

    wait_for(|| {
        observer
            .last_result()
            .map_or(false, |r| r.data == Some(json!({"remote": "ok", "local": 42})))
    })
    .await;
}

#[test(tokio::test)]
async fn export_variables_feed_the_outgoing_request() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"user": {"id": 7, "name": "Ada"}}))
            .build(),
    );
    let client = GraphClient::builder(cache, link.clone())
        .resolver(
            "Query",
            "currentUserId",
            Arc::new(FnResolver(|_: &Value, _: &Object, _: &Context| {
                Ok(json!(7))
            })),
        )
        .build();

    let mut arguments = indexmap::IndexMap::new();
    arguments.insert(
        "id".to_string(),
        ArgumentValue::Variable("userId".to_string()),
    );
    let document = named_query(
        "UserById",
        vec![
            Field::builder()
                .name("currentUserId")
                .client(true)
                .export_as(Some("userId".to_string()))
                .build()
                .into(),
            Field::builder()
                .name("user")
                .arguments(arguments)
                .selection_set(vec![scalar("id"), scalar("name")])
                .build()
                .into(),
        ],
    );

    let result = client
        .query(QueryOptions::builder().document(document).build())
        .await
        .unwrap();

    let request = link.last_request().unwrap();
    assert_eq!(request.variables.get("userId"), Some(&json!(7)));
    assert!(!request.document.has_client_fields());
    assert_eq!(
        result.data,
        Some(json!({"currentUserId": 7, "user": {"id": 7, "name": "Ada"}}))
    );
}

#[test(tokio::test)]
async fn fetch_more_merges_without_touching_the_first_page() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"items": [{"id": 1}]}))
            .build(),
    );
    let client = GraphClient::builder(cache.clone(), link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(items_document())
            .variables(variables(json!({"page": 1})))
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| observer.last_result().map_or(false, |r| r.data.is_some())).await;

    link.respond_with(
        Response::builder()
            .data(json!({"items": [{"id": 2}]}))
            .build(),
    );
    let merged = observable
        .fetch_more(
            FetchMoreOptions::builder()
                .variables(variables(json!({"page": 2})))
                .update_query(Arc::new(|previous: &Value, more: &Value| {
                    let mut items = previous
                        .as_object()
                        .and_then(|o| o.get("items"))
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default();
                    items.extend(
                        more.as_object()
                            .and_then(|o| o.get("items"))
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default(),
                    );
                    Some(json!({ "items": items }))
                }))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(merged.data, Some(json!({"items": [{"id": 2}]})));

    wait_for(|| {
        observer.last_result().map_or(false, |r| {
            r.data == Some(json!({"items": [{"id": 1}, {"id": 2}]}))
        })
    })
    .await;

    // the first page's cache entry still holds only the first page, and the
    // second page never got its own entry
    assert_eq!(
        cache
            .read(&items_document(), &variables(json!({"page": 1})), false)
            .unwrap(),
        json!({"items": [{"id": 1}]})
    );
    assert_eq!(cache.entry_count(), 1);
}

#[test(tokio::test)]
async fn set_variables_noops_without_changes_or_observers() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache, link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .variables(variables(json!({"id": 1})))
            .fetch_policy(FetchPolicy::NetworkOnly)
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| observer.last_result().map_or(false, |r| r.data.is_some())).await;
    assert_eq!(link.calls(), 1);

    // unchanged variables: stale result, no traffic
    let result = observable
        .set_variables(variables(json!({"id": 1})), false)
        .await
        .unwrap();
    assert_eq!(result.data, Some(json!({"item": {"id": 1, "name": "A"}})));
    assert_eq!(link.calls(), 1);

    // a view nobody observes defers its fetch until someone subscribes
    let unobserved = client.watch_query(
        WatchQueryOptions::builder()
            .document(items_document())
            .fetch_policy(FetchPolicy::NetworkOnly)
            .build(),
    );
    unobserved
        .set_variables(variables(json!({"page": 3})), false)
        .await
        .unwrap();
    assert_eq!(link.calls(), 1);

    link.respond_with(Response::builder().data(json!({"items": []})).build());
    let late = RecordingObserver::new();
    let _late_subscription = unobserved.subscribe(late.clone());
    wait_for(|| link.calls() == 2).await;
    let request = link.last_request().unwrap();
    assert_eq!(request.variables.get("page"), Some(&json!(3)));
}

#[test(tokio::test)]
async fn unsubscribe_twice_is_a_noop() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache.clone(), link).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .build(),
    );
    let observer = RecordingObserver::new();
    let mut subscription = observable.subscribe(observer.clone());
    wait_for(|| observer.last_result().map_or(false, |r| r.data.is_some())).await;
    assert_eq!(cache.watcher_count(), 1);

    subscription.cancel();
    assert_eq!(cache.watcher_count(), 0);
    subscription.cancel();
    assert_eq!(cache.watcher_count(), 0);

    // torn down: the last result is reframed under an error status
    let current = observable.get_current_result();
    assert_eq!(current.network_status, NetworkStatus::Error);
    assert_eq!(current.data, Some(json!({"item": {"id": 1, "name": "A"}})));
}

#[test(tokio::test)]
async fn clear_store_rejects_requests_in_flight() {
    let cache = MemoryCache::new();
    let link = ControlledLink::new();
    let client = GraphClient::builder(cache, link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::NetworkOnly)
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| link.calls() == 1).await;

    let refetching = observable.clone();
    let refetch = tokio::spawn(async move { refetching.refetch(None).await });
    wait_for(|| link.calls() == 2).await;

    client.clear_store();

    let error = refetch.await.unwrap().unwrap_err();
    assert!(error.is_store_reset());

    wait_for(|| !observer.errors().is_empty()).await;
    assert!(observer.errors().iter().any(|error| error.is_store_reset()));
    let current = observable.get_current_result();
    assert_eq!(current.network_status, NetworkStatus::Error);
}

#[test(tokio::test)]
async fn stop_rejects_pending_subscriptions_and_new_work() {
    use futures::StreamExt;

    let cache = MemoryCache::new();
    let link = ControlledLink::new();
    let client = GraphClient::builder(cache, link.clone()).build();

    let mut updates = client
        .subscribe(
            SubscriptionOptions::builder()
                .document(subscription_document("ItemAdded", "itemAdded"))
                .build(),
        )
        .await;
    wait_for(|| link.calls() == 1).await;

    link.resolve(
        0,
        Response::builder().data(json!({"itemAdded": {"id": 1}})).build(),
    );
    let first = updates.next().await.unwrap().unwrap();
    assert_eq!(first.data, Some(json!({"itemAdded": {"id": 1}})));

    client.stop();
    let next = updates.next().await.unwrap();
    assert!(next.unwrap_err().is_store_reset());
    assert!(updates.next().await.is_none());

    let error = client
        .query(QueryOptions::builder().document(item_document()).build())
        .await
        .unwrap_err();
    assert!(error.is_store_reset());
}

#[test(tokio::test)]
async fn subscribe_to_more_merges_and_tears_down() {
    let cache = MemoryCache::new();
    let link = ControlledLink::new();
    let client = GraphClient::builder(cache, link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(items_document())
            .build(),
    );
    let observer = RecordingObserver::new();
    let mut subscription = observable.subscribe(observer.clone());
    wait_for(|| link.calls() == 1).await;
    link.resolve(
        0,
        Response::builder().data(json!({"items": [{"id": 1}]})).build(),
    );
    link.complete(0);
    wait_for(|| observer.last_result().map_or(false, |r| r.data.is_some())).await;

    let _more = observable.subscribe_to_more(
        SubscribeToMoreOptions::builder()
            .document(subscription_document("ItemAdded", "itemAdded"))
            .update_query(Arc::new(|previous: &Value, payload: &Value| {
                let mut items = previous
                    .as_object()
                    .and_then(|o| o.get("items"))
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                if let Some(added) = payload.as_object().and_then(|o| o.get("itemAdded")) {
                    items.push(added.clone());
                }
                Some(json!({ "items": items }))
            }))
            .build(),
    );
    wait_for(|| link.calls() == 2).await;

    link.resolve(
        1,
        Response::builder().data(json!({"itemAdded": {"id": 2}})).build(),
    );
    wait_for(|| {
        observer.last_result().map_or(false, |r| {
            r.data == Some(json!({"items": [{"id": 1}, {"id": 2}]}))
        })
    })
    .await;

    // tearing down the last observer cancels the spawned subscription
    subscription.cancel();
    wait_for(|| link.is_closed(1)).await;
}

#[test(tokio::test)]
async fn mutations_update_and_refetch_named_queries() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder().data(json!({"items": [{"id": 1}]})).build(),
    );
    let client = GraphClient::builder(cache, link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(items_document())
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| observer.last_result().map_or(false, |r| r.data.is_some())).await;

    let mutation = Arc::new(
        Document::builder()
            .operation(
                Operation::builder()
                    .kind(OperationKind::Mutation)
                    .name("AddItem")
                    .selection_set(vec![Field::builder()
                        .name("addItem")
                        .selection_set(vec![scalar("id")])
                        .build()
                        .into()])
                    .build(),
            )
            .build(),
    );
    // the mutation response, then the refetch triggered by it
    link.respond_with(
        Response::builder().data(json!({"addItem": {"id": 2}})).build(),
    );
    link.respond_with(
        Response::builder()
            .data(json!({"items": [{"id": 1}, {"id": 2}]}))
            .build(),
    );

    let result = client
        .mutate(
            MutationOptions::builder()
                .document(mutation)
                .update_queries(vec![(
                    "Items".to_string(),
                    Arc::new(|previous: &Value, mutation_data: &Value| {
                        let mut items = previous
                            .as_object()
                            .and_then(|o| o.get("items"))
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        if let Some(added) =
                            mutation_data.as_object().and_then(|o| o.get("addItem"))
                        {
                            items.push(added.clone());
                        }
                        Some(json!({ "items": items }))
                    }) as Arc<UpdateQueryFn>,
                )])
                .refetch_queries(vec!["Items".to_string()])
                .await_refetch_queries(true)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(result.data, Some(json!({"addItem": {"id": 2}})));

    // initial fetch + mutation + awaited refetch
    assert_eq!(link.calls(), 3);
    wait_for(|| {
        observer.last_result().map_or(false, |r| {
            r.data == Some(json!({"items": [{"id": 1}, {"id": 2}]}))
        })
    })
    .await;
}

#[test(tokio::test)]
async fn leaving_standby_through_set_options_fetches() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.respond_with(
        Response::builder()
            .data(json!({"item": {"id": 1, "name": "A"}}))
            .build(),
    );
    let client = GraphClient::builder(cache, link.clone()).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::Standby)
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());
    wait_for(|| observer.result_count() >= 1).await;
    assert_eq!(link.calls(), 0);

    let result = observable
        .set_options(
            WatchQueryOptions::builder()
                .document(item_document())
                .fetch_policy(FetchPolicy::NetworkOnly)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(link.calls(), 1);
    assert_eq!(result.data, Some(json!({"item": {"id": 1, "name": "A"}})));
}

#[test(tokio::test)]
async fn error_policies_shape_the_delivered_result() {
    let failing_response = || {
        Response::builder()
            .errors(vec![Error {
                message: "field exploded".to_string(),
                ..Default::default()
            }])
            .build()
    };

    // none: the composite error carries the graphql errors
    let link = TestLink::new();
    link.respond_with(failing_response());
    let client = GraphClient::builder(MemoryCache::new(), link).build();
    let error = client
        .query(QueryOptions::builder().document(item_document()).build())
        .await
        .unwrap_err();
    assert_eq!(error.graphql_errors().len(), 1);
    assert!(error.network_error().is_none());

    // ignore: the errors vanish from the result
    let link = TestLink::new();
    link.respond_with(failing_response());
    let client = GraphClient::builder(MemoryCache::new(), link).build();
    let result = client
        .query(
            QueryOptions::builder()
                .document(item_document())
                .error_policy(ErrorPolicy::Ignore)
                .build(),
        )
        .await
        .unwrap();
    assert!(result.errors.is_empty());
    assert!(result.error.is_none());

    // all: errors ride alongside whatever data is available
    let link = TestLink::new();
    link.respond_with(failing_response());
    let client = GraphClient::builder(MemoryCache::new(), link).build();
    let result = client
        .query(
            QueryOptions::builder()
                .document(item_document())
                .error_policy(ErrorPolicy::All)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(result.errors.len(), 1);
}

#[test(tokio::test)]
async fn transport_failures_surface_as_network_errors() {
    let cache = MemoryCache::new();
    let link = TestLink::new();
    link.fail_with(FetchError::TransportError {
        reason: "connection refused".to_string(),
    });
    let client = GraphClient::builder(cache, link).build();

    let observable = client.watch_query(
        WatchQueryOptions::builder()
            .document(item_document())
            .fetch_policy(FetchPolicy::NetworkOnly)
            .build(),
    );
    let observer = RecordingObserver::new();
    let _subscription = observable.subscribe(observer.clone());

    wait_for(|| !observer.errors().is_empty()).await;
    let error = &observer.errors()[0];
    assert!(matches!(
        error.network_error(),
        Some(FetchError::TransportError { .. })
    ));
    let current = observable.get_current_result();
    assert_eq!(current.network_status, NetworkStatus::Error);
}

#[test(tokio::test)]
async fn mocked_links_can_stand_in_for_transports() {
    use mockall::predicate::always;

    let mut mock = MockLink::new();
    mock.expect_execute()
        .with(always())
        .times(1)
        .returning(|_| {
            Response::builder()
                .data(json!({"item": {"id": 1, "name": "A"}}))
                .build()
                .into()
        });
    let client = GraphClient::builder(MemoryCache::new(), Arc::new(mock)).build();

    let result = client
        .query(
            QueryOptions::builder()
                .document(item_document())
                .fetch_policy(FetchPolicy::NetworkOnly)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(result.data, Some(json!({"item": {"id": 1, "name": "A"}})));
}
