use crate::prelude::graphql::*;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Result of a cache diff: a best-effort read plus a completeness flag.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheDiff {
    /// Whatever the cache could produce for the query, possibly partial.
    pub result: Value,

    /// True when the cache could satisfy the full selection.
    pub complete: bool,
}

/// Callback invoked by the cache whenever a watched query's data may have
/// changed.
pub type WatchCallback = Arc<dyn Fn(CacheDiff) + Send + Sync>;

/// The contract this engine requires from a cache.
///
/// The store layout, identity computation and merge strategy are entirely the
/// cache's business; the engine only ever goes through these entry points.
pub trait Cache: Send + Sync + Debug {
    /// Read as much of the query as possible, reporting completeness.
    fn diff(
        &self,
        document: &Document,
        variables: &Object,
        return_partial_data: bool,
        optimistic: bool,
    ) -> CacheDiff;

    /// Read the query or fail if the cache cannot fully satisfy it.
    fn read(
        &self,
        document: &Document,
        variables: &Object,
        optimistic: bool,
    ) -> Result<Value, FetchError>;

    /// Write a query result.
    fn write(&self, document: &Document, variables: &Object, data: &Value);

    /// Watch the region of the cache covered by the query. The returned
    /// token cancels the watch.
    #[must_use = "dropping the token without cancelling leaks the watch"]
    fn watch(
        &self,
        document: &Arc<Document>,
        variables: &Object,
        optimistic: bool,
        callback: WatchCallback,
    ) -> Cancellation;

    /// Give the cache a chance to rewrite the document, e.g. to inject
    /// metadata fields it needs for identity computation.
    fn transform_document(&self, document: Arc<Document>) -> Arc<Document> {
        document
    }
}

/// A link is responsible for turning a graphql request into a stream of
/// responses.
///
/// The goal of this trait is to hide the implementation details of the
/// transport chain (http, websockets, batching, retries). The stream may emit
/// zero or more responses before completing; transport failures surface as
/// `Err` items.
#[async_trait]
pub trait Link: Send + Sync + Debug {
    /// Constructs a stream of responses.
    #[must_use = "streams do nothing unless polled"]
    async fn execute(&self, request: Request) -> ResponseStream;
}

/// Decides whether a fragment's selection applies to a runtime value.
pub trait FragmentMatcher: Send + Sync + Debug {
    /// `type_condition` comes from the fragment; `typename` is the runtime
    /// `__typename` of the value under consideration, when present.
    fn matches(&self, type_condition: &str, typename: Option<&str>) -> bool;
}

/// Default matcher: exact `__typename` equality, permissive when the value
/// carries no `__typename`.
#[derive(Clone, Debug, Default)]
pub struct TypenameFragmentMatcher;

impl FragmentMatcher for TypenameFragmentMatcher {
    fn matches(&self, type_condition: &str, typename: Option<&str>) -> bool {
        match typename {
            Some(typename) => typename == type_condition,
            None => true,
        }
    }
}
