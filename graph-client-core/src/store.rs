use crate::prelude::graphql::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What triggered a fetch cycle. Determines the in-flight network status
/// reported for the query while the request is outstanding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchKind {
    /// A first fetch for a freshly watched query.
    Normal,
    /// The query's variables changed.
    SetVariables,
    /// An explicit refetch.
    Refetch,
    /// A poll tick.
    Poll,
    /// A pagination fetch issued on behalf of another query.
    FetchMore,
}

/// Enumerated in-flight/terminal state of a single query's current request
/// cycle. Values below `Ready` mean a request is in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkStatus {
    Loading = 1,
    SetVariables = 2,
    FetchMore = 3,
    Refetch = 4,
    Poll = 6,
    Ready = 7,
    Error = 8,
}

impl NetworkStatus {
    pub fn is_in_flight(self) -> bool {
        (self as u8) < (NetworkStatus::Ready as u8)
    }
}

impl From<FetchKind> for NetworkStatus {
    fn from(kind: FetchKind) -> Self {
        match kind {
            FetchKind::Normal => NetworkStatus::Loading,
            FetchKind::SetVariables => NetworkStatus::SetVariables,
            FetchKind::Refetch => NetworkStatus::Refetch,
            FetchKind::Poll => NetworkStatus::Poll,
            FetchKind::FetchMore => NetworkStatus::FetchMore,
        }
    }
}

/// Per-query network-facing state. Mutated exclusively by the request
/// orchestrator; read by observable queries to compute user-visible loading
/// and error flags.
#[derive(Clone, Debug)]
pub struct QueryStoreEntry {
    pub network_status: NetworkStatus,
    pub variables: Object,
    /// Set while a fetch for new variables is outstanding, so observers can
    /// tell that the data they see still belongs to the old variables.
    pub previous_variables: Option<Object>,
    pub graphql_errors: Vec<Error>,
    pub network_error: Option<FetchError>,
    pub is_poll: bool,
    pub is_refetch: bool,
}

impl Default for QueryStoreEntry {
    fn default() -> Self {
        QueryStoreEntry {
            network_status: NetworkStatus::Loading,
            variables: Object::new(),
            previous_variables: None,
            graphql_errors: Vec::new(),
            network_error: None,
            is_poll: false,
            is_refetch: false,
        }
    }
}

/// Network-facing state for every query the engine currently knows about.
#[derive(Debug, Default)]
pub struct QueryStore {
    entries: HashMap<QueryId, QueryStoreEntry>,
}

impl QueryStore {
    /// Initialize the entry for a new request cycle. `will_fetch` is false
    /// when the cache alone will answer, in which case the cycle starts and
    /// ends at `Ready`.
    pub fn init_fetch(&mut self, id: QueryId, kind: FetchKind, variables: Object, will_fetch: bool) {
        let previous = self.entries.get(&id);
        let previous_variables = previous.and_then(|entry| {
            if entry.variables != variables {
                Some(entry.variables.clone())
            } else {
                None
            }
        });
        let network_status = if will_fetch {
            NetworkStatus::from(kind)
        } else {
            NetworkStatus::Ready
        };
        self.entries.insert(
            id,
            QueryStoreEntry {
                network_status,
                variables,
                previous_variables,
                graphql_errors: Vec::new(),
                network_error: None,
                is_poll: kind == FetchKind::Poll,
                is_refetch: kind == FetchKind::Refetch,
            },
        );
    }

    pub fn set_status(&mut self, id: QueryId, network_status: NetworkStatus) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.network_status = network_status;
        }
    }

    /// Record a network result. The entry becomes terminal unless more patch
    /// responses are expected.
    pub fn mark_result(&mut self, id: QueryId, graphql_errors: Vec<Error>, has_next: bool) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.network_error = None;
            entry.graphql_errors = graphql_errors;
            entry.previous_variables = None;
            if !has_next {
                entry.network_status = if entry.graphql_errors.is_empty() {
                    NetworkStatus::Ready
                } else {
                    NetworkStatus::Error
                };
            }
        }
    }

    pub fn mark_error(&mut self, id: QueryId, error: FetchError) {
        let entry = self.entries.entry(id).or_default();
        entry.network_status = NetworkStatus::Error;
        entry.network_error = Some(error);
    }

    pub fn mark_ready(&mut self, id: QueryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.network_status = NetworkStatus::Ready;
            entry.previous_variables = None;
        }
    }

    pub fn get(&self, id: QueryId) -> Option<&QueryStoreEntry> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: QueryId) {
        self.entries.remove(&id);
    }

    /// Transition every in-flight entry to an explicit error state. Used when
    /// the store is cleared or the engine stops so that no query is left in a
    /// silently hung loading state.
    pub fn reset_in_flight(&mut self) -> Vec<QueryId> {
        let mut affected = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if entry.network_status.is_in_flight() {
                entry.network_status = NetworkStatus::Error;
                entry.network_error = Some(FetchError::StoreReset);
                affected.push(*id);
            }
        }
        affected
    }
}
