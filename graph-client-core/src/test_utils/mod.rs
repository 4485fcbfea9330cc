//! Test doubles for the engine's two external seams, plus small helpers for
//! building documents and observing results in tests.

use crate::prelude::graphql::*;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::prelude::*;
use mockall::mock;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A whole-result in-memory cache keyed by operation name and variables.
///
/// It does not normalize; it exists so tests can exercise diff completeness,
/// watches and cross-query invalidation. Every write notifies every watcher
/// with a diff recomputed for that watcher's own document and variables, the
/// way a normalized cache notifies queries whose regions overlap.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    watcher_seq: AtomicU64,
}

struct Watcher {
    id: u64,
    document: Arc<Document>,
    variables: Object,
    callback: WatchCallback,
}

fn cache_key(document: &Document, variables: &Object) -> String {
    format!(
        "{}|{}",
        document.operation_name().unwrap_or("anonymous"),
        serde_json::to_string(variables).unwrap_or_default()
    )
}

impl MemoryCache {
    pub fn new() -> Arc<MemoryCache> {
        Arc::new(Default::default())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.lock().len())
            .field("watchers", &self.watchers.lock().len())
            .finish()
    }
}

impl Cache for MemoryCache {
    fn diff(
        &self,
        document: &Document,
        variables: &Object,
        _return_partial_data: bool,
        _optimistic: bool,
    ) -> CacheDiff {
        match self.entries.lock().get(&cache_key(document, variables)) {
            Some(value) => CacheDiff {
                result: value.clone(),
                complete: true,
            },
            None => CacheDiff {
                result: Value::Null,
                complete: false,
            },
        }
    }

    fn read(
        &self,
        document: &Document,
        variables: &Object,
        optimistic: bool,
    ) -> Result<Value, FetchError> {
        let diff = self.diff(document, variables, false, optimistic);
        if diff.complete {
            Ok(diff.result)
        } else {
            Err(FetchError::CacheIncomplete {
                reason: format!(
                    "no entry for operation {}",
                    document.operation_name().unwrap_or("anonymous")
                ),
            })
        }
    }

    fn write(&self, document: &Document, variables: &Object, data: &Value) {
        self.entries
            .lock()
            .insert(cache_key(document, variables), data.clone());

        // fire every watcher with a diff for its own document, the way
        // overlapping regions of a normalized store would
        let snapshot: Vec<(Arc<Document>, Object, WatchCallback)> = self
            .watchers
            .lock()
            .iter()
            .map(|watcher| {
                (
                    Arc::clone(&watcher.document),
                    watcher.variables.clone(),
                    Arc::clone(&watcher.callback),
                )
            })
            .collect();
        for (document, variables, callback) in snapshot {
            let diff = self.diff(&document, &variables, true, false);
            callback(diff);
        }
    }

    fn watch(
        &self,
        document: &Arc<Document>,
        variables: &Object,
        _optimistic: bool,
        callback: WatchCallback,
    ) -> Cancellation {
        let id = self.watcher_seq.fetch_add(1, Ordering::SeqCst);
        self.watchers.lock().push(Watcher {
            id,
            document: Arc::clone(document),
            variables: variables.clone(),
            callback,
        });
        let watchers = Arc::clone(&self.watchers);
        Cancellation::new(move || {
            watchers.lock().retain(|watcher| watcher.id != id);
        })
    }
}

/// A link that replays scripted response streams and records every request.
#[derive(Default)]
pub struct TestLink {
    scripts: Mutex<VecDeque<Vec<Result<Response, FetchError>>>>,
    requests: Mutex<Vec<Request>>,
    calls: AtomicUsize,
}

impl TestLink {
    pub fn new() -> Arc<TestLink> {
        Arc::new(Default::default())
    }

    /// Queue the items of the next response stream. An empty script is a
    /// zero-value completion.
    pub fn enqueue(&self, items: Vec<Result<Response, FetchError>>) {
        self.scripts.lock().push_back(items);
    }

    /// Queue a single successful response.
    pub fn respond_with(&self, response: Response) {
        self.enqueue(vec![Ok(response)]);
    }

    /// Queue a transport failure.
    pub fn fail_with(&self, error: FetchError) {
        self.enqueue(vec![Err(error)]);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<Request> {
        self.requests.lock().last().cloned()
    }
}

impl fmt::Debug for TestLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestLink")
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl Link for TestLink {
    async fn execute(&self, request: Request) -> ResponseStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let items = self.scripts.lock().pop_front().unwrap_or_default();
        stream::iter(items).boxed()
    }
}

/// A link whose responses are resolved by hand, for interleaving tests. Each
/// `execute` call gets its own channel, indexed by call order.
#[derive(Default)]
pub struct ControlledLink {
    senders: Mutex<Vec<mpsc::UnboundedSender<Result<Response, FetchError>>>>,
    requests: Mutex<Vec<Request>>,
}

impl ControlledLink {
    pub fn new() -> Arc<ControlledLink> {
        Arc::new(Default::default())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Emit a response on the `index`-th request's stream.
    pub fn resolve(&self, index: usize, response: Response) {
        let sender = self.senders.lock()[index].clone();
        sender
            .unbounded_send(Ok(response))
            .expect("the request stream is still open; qed");
    }

    /// Fail the `index`-th request's stream.
    pub fn fail(&self, index: usize, error: FetchError) {
        let sender = self.senders.lock()[index].clone();
        sender
            .unbounded_send(Err(error))
            .expect("the request stream is still open; qed");
    }

    /// Complete the `index`-th request's stream.
    pub fn complete(&self, index: usize) {
        self.senders.lock()[index].close_channel();
    }

    /// True once the `index`-th request's stream has been dropped by its
    /// consumer.
    pub fn is_closed(&self, index: usize) -> bool {
        self.senders.lock()[index].is_closed()
    }
}

impl fmt::Debug for ControlledLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledLink")
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl Link for ControlledLink {
    async fn execute(&self, request: Request) -> ResponseStream {
        self.requests.lock().push(request);
        let (sender, receiver) = mpsc::unbounded();
        self.senders.lock().push(sender);
        receiver.boxed()
    }
}

mock! {
    pub Link {}

    #[async_trait]
    impl Link for Link {
        async fn execute(&self, request: Request) -> ResponseStream;
    }
}

impl fmt::Debug for MockLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockLink").finish()
    }
}

/// An observer that records everything it is handed.
#[derive(Default)]
pub struct RecordingObserver {
    results: Mutex<Vec<QueryResult>>,
    errors: Mutex<Vec<QueryError>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<RecordingObserver> {
        Arc::new(Default::default())
    }

    pub fn results(&self) -> Vec<QueryResult> {
        self.results.lock().clone()
    }

    pub fn last_result(&self) -> Option<QueryResult> {
        self.results.lock().last().cloned()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }

    pub fn errors(&self) -> Vec<QueryError> {
        self.errors.lock().clone()
    }
}

impl QueryObserver for RecordingObserver {
    fn next(&self, result: QueryResult) {
        self.results.lock().push(result);
    }

    fn error(&self, error: QueryError) {
        self.errors.lock().push(error);
    }
}

/// Build a named query document over the given selection set.
pub fn named_query(name: impl Into<String>, selection_set: Vec<Selection>) -> Arc<Document> {
    Arc::new(
        Document::builder()
            .operation(
                Operation::builder()
                    .name(name.into())
                    .selection_set(selection_set)
                    .build(),
            )
            .build(),
    )
}

/// A plain scalar field selection.
pub fn scalar(name: &str) -> Selection {
    Field::builder().name(name).build().into()
}

/// Poll `condition` until it holds, panicking after a couple of seconds.
/// Useful for assertions that depend on a spawned task having run.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
