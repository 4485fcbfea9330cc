use crate::prelude::graphql::*;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use typed_builder::TypedBuilder;

/// A graphql request as handed to the link chain.
#[derive(Clone, Derivative, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
#[derivative(Debug, PartialEq)]
pub struct Request {
    /// The document describing the operation to execute. Local-only fields
    /// have already been stripped by the orchestrator.
    pub document: Arc<Document>,

    /// The optional graphql operation name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub operation_name: Option<String>,

    /// The variables in the form of a json object.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    #[builder(default)]
    pub variables: Arc<Object>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    #[builder(default)]
    pub extensions: Object,

    /// Request-scoped context, shared with local resolvers. Not serialized.
    #[serde(skip, default)]
    #[builder(default)]
    #[derivative(PartialEq = "ignore")]
    pub context: Context,
}
