//! Client-side query orchestration and cache coherence for GraphQL.
//!
//! This crate tracks every active query and mutation, decides when to consult
//! the cache versus the link chain, reconciles asynchronous responses with
//! cache state, and keeps any number of observers of the same query
//! consistent. The cache and the transport are external collaborators,
//! consumed through the [`Cache`] and [`Link`] contracts.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

mod client;
mod context;
mod error;
mod fetch;
mod json_ext;
mod observable;
mod options;
mod polling;
mod registry;
mod request;
mod resolvers;
mod response;
mod spec;
mod store;
pub mod test_utils;
mod tower_compat;
mod traits;

pub use client::*;
pub use context::*;
pub use error::*;
pub use json_ext::*;
pub use observable::*;
pub use options::*;
pub use registry::*;
pub use request::*;
pub use resolvers::*;
pub use response::*;
pub use spec::*;
pub use store::*;
pub use tower_compat::*;
pub use traits::*;

pub mod prelude {
    // NOTE: only traits can be added here! Everything else should be scoped
    //       under the module graphql so a consumer can write, for example,
    //        -  graphql::Request for a request
    //        -  graphql::Response for a response
    //        -  ...
    //
    //       because consumers usually juggle transport-level requests next to
    //       GraphQL requests, and the namespace keeps them apart.
    pub use crate::traits::*;
    pub mod graphql {
        pub use crate::*;
    }
}

pub mod reexports {
    pub use serde_json_bytes;
}
