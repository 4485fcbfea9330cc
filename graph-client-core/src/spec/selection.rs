use crate::prelude::graphql::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// A node in a selection set.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Selection {
    Field(Field),
    InlineFragment {
        /// The type the nested selection applies to, if constrained.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        type_condition: Option<String>,
        selection_set: Vec<Selection>,
    },
    FragmentSpread {
        name: String,
    },
}

impl Selection {
    pub fn field(field: Field) -> Selection {
        Selection::Field(field)
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Selection {
        Selection::Field(field)
    }
}

/// A field selection, including the client-side markers that drive local
/// resolution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Field {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub alias: Option<String>,

    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    #[builder(default)]
    pub arguments: IndexMap<String, ArgumentValue>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub selection_set: Vec<Selection>,

    /// The field is resolved locally and never sent over the wire.
    #[serde(default)]
    #[builder(default)]
    pub client: bool,

    /// Re-run the local resolver even when a value is already present on the
    /// merged result.
    #[serde(default)]
    #[builder(default)]
    pub always: bool,

    /// Export the resolved value into the named variable so later parts of
    /// the operation can consume it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub export_as: Option<String>,
}

impl Field {
    /// The key under which this field appears in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Evaluate this field's arguments against the operation variables.
    /// A reference to a missing variable resolves to `null`.
    pub fn argument_values(&self, variables: &Object) -> Object {
        let mut values = Object::new();
        for (name, argument) in &self.arguments {
            let value = match argument {
                ArgumentValue::Value(value) => value.clone(),
                ArgumentValue::Variable(variable) => variables
                    .get(variable.as_str())
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            values.insert(name.as_str(), value);
        }
        values
    }
}

/// The value of a field argument: either a literal or a variable reference.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum ArgumentValue {
    Value(Value),
    Variable(String),
}

impl From<Value> for ArgumentValue {
    fn from(value: Value) -> ArgumentValue {
        ArgumentValue::Value(value)
    }
}
