use crate::prelude::graphql::*;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use typed_builder::TypedBuilder;

/// Rule governing whether a query reads the cache, the network, or both, and
/// in what order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Answer from the cache when complete, otherwise fetch.
    CacheFirst,
    /// Answer from the cache immediately and always fetch as well.
    CacheAndNetwork,
    /// Always fetch; results are written to the cache.
    NetworkOnly,
    /// Never fetch; answer from the cache only.
    CacheOnly,
    /// Always fetch; results are never written to the shared cache.
    NoCache,
    /// Hold the query without fetching or answering.
    Standby,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy::CacheFirst
    }
}

impl FetchPolicy {
    /// Policies that must never initiate a network request.
    pub fn forbids_network(self) -> bool {
        matches!(self, FetchPolicy::CacheOnly | FetchPolicy::Standby)
    }

    /// Policies whose results must never be written to the shared cache.
    pub fn skips_cache(self) -> bool {
        matches!(self, FetchPolicy::NoCache)
    }
}

/// Governs how GraphQL-level errors reach the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Errors terminate the result; no partial data is surfaced.
    None,
    /// Errors are silently dropped from the delivered result.
    Ignore,
    /// Errors are delivered alongside whatever data is available.
    All,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::None
    }
}

/// Engine-wide fallbacks applied when an operation leaves a policy unset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultOptions {
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    pub notify_on_network_status_change: bool,
}

/// A merge function used by `fetch_more`, `update_queries` and
/// `subscribe_to_more`: combines a query's previous result with incoming
/// data, or returns `None` to bail out of the update.
pub type UpdateQueryFn = dyn Fn(&Value, &Value) -> Option<Value> + Send + Sync;

/// Options for `watch_query`.
#[derive(Clone, Derivative, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[derivative(Debug)]
pub struct WatchQueryOptions {
    pub document: Arc<Document>,

    #[serde(default)]
    #[builder(default)]
    pub variables: Object,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub fetch_policy: Option<FetchPolicy>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub error_policy: Option<ErrorPolicy>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub poll_interval: Option<Duration>,

    /// Deliver results for pure network-status transitions, not only for
    /// data changes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub notify_on_network_status_change: Option<bool>,

    /// Surface partial cache data instead of `None` while the full
    /// selection cannot be satisfied.
    #[serde(default)]
    #[builder(default)]
    pub return_partial_data: bool,

    #[serde(skip, default)]
    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub context: Context,
}

impl WatchQueryOptions {
    pub(crate) fn fetch_policy(&self, defaults: &DefaultOptions) -> FetchPolicy {
        self.fetch_policy.unwrap_or(defaults.fetch_policy)
    }

    pub(crate) fn error_policy(&self, defaults: &DefaultOptions) -> ErrorPolicy {
        self.error_policy.unwrap_or(defaults.error_policy)
    }

    pub(crate) fn notify_on_network_status_change(&self, defaults: &DefaultOptions) -> bool {
        self.notify_on_network_status_change
            .unwrap_or(defaults.notify_on_network_status_change)
    }
}

/// Options for a one-shot `query`.
#[derive(Clone, Derivative, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[derivative(Debug)]
pub struct QueryOptions {
    pub document: Arc<Document>,

    #[serde(default)]
    #[builder(default)]
    pub variables: Object,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub fetch_policy: Option<FetchPolicy>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    pub error_policy: Option<ErrorPolicy>,

    #[serde(skip, default)]
    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub context: Context,
}

impl From<QueryOptions> for WatchQueryOptions {
    fn from(options: QueryOptions) -> WatchQueryOptions {
        WatchQueryOptions {
            document: options.document,
            variables: options.variables,
            fetch_policy: options.fetch_policy,
            error_policy: options.error_policy,
            poll_interval: None,
            notify_on_network_status_change: None,
            return_partial_data: false,
            context: options.context,
        }
    }
}

/// Options for `mutate`.
#[derive(Clone, Derivative, TypedBuilder)]
#[derivative(Debug)]
pub struct MutationOptions {
    pub document: Arc<Document>,

    #[builder(default)]
    pub variables: Object,

    #[builder(default, setter(strip_option))]
    pub error_policy: Option<ErrorPolicy>,

    /// Do not write the mutation result to the shared cache.
    #[builder(default)]
    pub no_cache: bool,

    /// Operation names of active queries to refetch once the mutation
    /// completes.
    #[builder(default)]
    pub refetch_queries: Vec<String>,

    /// Wait for the triggered refetches before resolving the mutation.
    #[builder(default)]
    pub await_refetch_queries: bool,

    /// Per-query-name merge functions applied to active queries' results
    /// through the update-query path.
    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub update_queries: Vec<(String, Arc<UpdateQueryFn>)>,

    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub context: Context,
}

/// Options for `subscribe`.
#[derive(Clone, Derivative, TypedBuilder)]
#[derivative(Debug)]
pub struct SubscriptionOptions {
    pub document: Arc<Document>,

    #[builder(default)]
    pub variables: Object,

    #[builder(default, setter(strip_option))]
    pub error_policy: Option<ErrorPolicy>,

    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub context: Context,
}

/// Options for `ObservableQuery::fetch_more`.
#[derive(Clone, Derivative, TypedBuilder)]
#[derivative(Debug)]
pub struct FetchMoreOptions {
    /// Overriding document; defaults to the watched query's own document.
    #[builder(default)]
    pub document: Option<Arc<Document>>,

    /// Merged over the watched query's current variables.
    #[builder(default)]
    pub variables: Object,

    /// Combines the previous result with the newly fetched page.
    #[derivative(Debug = "ignore")]
    pub update_query: Arc<UpdateQueryFn>,
}

/// Options for `ObservableQuery::subscribe_to_more`.
#[derive(Clone, Derivative, TypedBuilder)]
#[derivative(Debug)]
pub struct SubscribeToMoreOptions {
    pub document: Arc<Document>,

    #[builder(default)]
    pub variables: Object,

    /// Combines the previous result with each subscription payload.
    #[derivative(Debug = "ignore")]
    pub update_query: Arc<UpdateQueryFn>,

    #[builder(default)]
    #[derivative(Debug = "ignore")]
    pub context: Context,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_helpers() {
        assert!(FetchPolicy::CacheOnly.forbids_network());
        assert!(FetchPolicy::Standby.forbids_network());
        assert!(!FetchPolicy::CacheAndNetwork.forbids_network());
        assert!(FetchPolicy::NoCache.skips_cache());
        assert!(!FetchPolicy::NetworkOnly.skips_cache());
    }

    #[test]
    fn test_serde_round_trip() {
        let policy: FetchPolicy = serde_json::from_str("\"cache-and-network\"").unwrap();
        assert_eq!(policy, FetchPolicy::CacheAndNetwork);
        assert_eq!(
            serde_json::to_string(&ErrorPolicy::All).unwrap(),
            "\"all\"".to_string()
        );
    }

    #[test]
    fn test_defaults_resolution() {
        let document = Arc::new(
            Document::builder()
                .operation(
                    Operation::builder()
                        .selection_set(vec![Field::builder().name("ping").build().into()])
                        .build(),
                )
                .build(),
        );
        let options = WatchQueryOptions::builder().document(document).build();
        let defaults = DefaultOptions {
            fetch_policy: FetchPolicy::CacheAndNetwork,
            ..Default::default()
        };
        assert_eq!(options.fetch_policy(&defaults), FetchPolicy::CacheAndNetwork);
        assert_eq!(options.error_policy(&defaults), ErrorPolicy::None);
    }
}
