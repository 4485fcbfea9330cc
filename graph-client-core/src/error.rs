use crate::prelude::graphql::*;
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for the fetch machinery.
///
/// Note that these are not surfaced to observers as-is, but are instead
/// converted to JSON for [`struct@Error`] or wrapped in a [`QueryError`].
#[derive(Error, Display, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[ignore_extra_doc_attributes]
pub enum FetchError {
    /// Query requires variable '{name}', but it was not provided.
    ValidationMissingVariable {
        /// Name of the variable.
        name: String,
    },

    /// Response was malformed: {reason}
    MalformedResponse {
        /// The reason the deserialization failed.
        reason: String,
    },

    /// Transport failed: {reason}
    ///
    /// Note that this relates to a transport error and not a GraphQL error.
    TransportError {
        /// The reason the fetch failed.
        reason: String,
    },

    /// Local resolver for field '{field}' failed: {reason}
    ResolverError {
        /// The field whose resolver failed.
        field: String,

        /// The failure reason.
        reason: String,
    },

    /// Cache could not fully satisfy the query: {reason}
    CacheIncomplete {
        /// What was missing.
        reason: String,
    },

    /// Operation is not supported for this query: {reason}
    UnsupportedOperation {
        /// Why the operation was refused.
        reason: String,
    },

    /// The client was stopped while the request was in flight.
    StoreReset,
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        Error {
            message: self.to_string(),
            locations: Default::default(),
            path,
            extensions: serde_json_bytes::to_value(self)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
        }
    }

    pub fn is_store_reset(&self) -> bool {
        matches!(self, FetchError::StoreReset)
    }
}

/// Any GraphQL error.
#[derive(Error, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct Error {
    /// The error message.
    pub message: String,

    /// The locations of the error from the originating request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    /// The path of the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,

    /// The optional graphql extensions.
    #[serde(default, skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

impl Error {
    pub(crate) fn from_value(value: Value) -> Result<Error, FetchError> {
        serde_json_bytes::from_value(value).map_err(|error| FetchError::MalformedResponse {
            reason: format!("invalid error entry: {}", error),
        })
    }
}

/// A location in the request that triggered a graphql error.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// The line number.
    pub line: i32,

    /// The column number.
    pub column: i32,
}

/// Aggregated failure surfaced to callers and observers.
///
/// Exactly one of the two sides is populated for a given failure: a request
/// either produced GraphQL errors or it never completed.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueryError {
    /// The response contained GraphQL errors.
    Graphql {
        /// The errors as reported by the server.
        errors: Vec<Error>,
    },

    /// The request failed before a usable response was received: {source}
    Network {
        /// The underlying failure.
        #[from]
        source: FetchError,
    },
}

impl QueryError {
    /// GraphQL errors carried by this failure, if any.
    pub fn graphql_errors(&self) -> &[Error] {
        match self {
            QueryError::Graphql { errors } => errors,
            QueryError::Network { .. } => &[],
        }
    }

    /// The network failure carried by this failure, if any.
    pub fn network_error(&self) -> Option<&FetchError> {
        match self {
            QueryError::Graphql { .. } => None,
            QueryError::Network { source } => Some(source),
        }
    }

    pub fn is_store_reset(&self) -> bool {
        matches!(
            self,
            QueryError::Network {
                source: FetchError::StoreReset
            }
        )
    }
}
