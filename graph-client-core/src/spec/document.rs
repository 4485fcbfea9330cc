use crate::prelude::graphql::*;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// The conventional root type name for this operation kind, used to look
    /// up local resolvers for root fields.
    pub(crate) fn root_type_name(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

impl Default for OperationKind {
    fn default() -> Self {
        OperationKind::Query
    }
}

/// A variable declared by an operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct VariableDefinition {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub default_value: Option<Value>,

    #[serde(default)]
    #[builder(default)]
    pub required: bool,
}

/// A single executable operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    #[builder(default)]
    pub kind: OperationKind,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(into, strip_option))]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub variable_definitions: Vec<VariableDefinition>,

    pub selection_set: Vec<Selection>,

    /// Live operations are refetched on every request cycle regardless of
    /// cache completeness.
    #[serde(default)]
    #[builder(default)]
    pub live: bool,
}

/// An already-structured query document: one operation plus its named
/// fragments. Parsing and printing happen outside this crate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub operation: Operation,

    #[serde(default)]
    #[builder(default)]
    pub fragments: Fragments,
}

impl Document {
    pub fn operation_name(&self) -> Option<&str> {
        self.operation.name.as_deref()
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }

    pub fn is_live(&self) -> bool {
        self.operation.live
    }

    /// The declared default values for this operation's variables.
    pub fn default_variables(&self) -> Object {
        let mut variables = Object::new();
        for definition in &self.operation.variable_definitions {
            if let Some(default) = &definition.default_value {
                variables.insert(definition.name.as_str(), default.clone());
            }
        }
        variables
    }

    /// Check that every required variable is present.
    pub fn validate_variables(&self, variables: &Object) -> Result<(), FetchError> {
        for definition in &self.operation.variable_definitions {
            if definition.required && variables.get(definition.name.as_str()).is_none() {
                return Err(FetchError::ValidationMissingVariable {
                    name: definition.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// True if any selected field, including fields reached through
    /// fragments, is resolved locally.
    pub fn has_client_fields(&self) -> bool {
        has_client_fields(&self.operation.selection_set)
            || self.fragments.iter().any(|(_, f)| has_client_fields(&f.selection_set))
    }

    /// True if any selected field exports its value into a variable.
    pub fn has_export_fields(&self) -> bool {
        has_export_fields(&self.operation.selection_set)
            || self.fragments.iter().any(|(_, f)| has_export_fields(&f.selection_set))
    }

    /// The document to send over the wire: local-only fields removed, along
    /// with any selection or fragment that becomes empty as a result.
    /// Returns `None` when nothing remains to ask the server for.
    pub fn strip_client_fields(&self) -> Option<Document> {
        let fragments: Fragments = self
            .fragments
            .iter()
            .filter_map(|(name, fragment)| {
                let selection_set = strip_client_fields(&fragment.selection_set);
                if selection_set.is_empty() {
                    None
                } else {
                    Some((
                        name.clone(),
                        Fragment {
                            type_condition: fragment.type_condition.clone(),
                            selection_set,
                        },
                    ))
                }
            })
            .collect();

        let selection_set = strip_client_fields(&self.operation.selection_set)
            .into_iter()
            // drop spreads whose fragment stripped down to nothing
            .filter(|selection| match selection {
                Selection::FragmentSpread { name } => fragments.get(name).is_some(),
                _ => true,
            })
            .collect::<Vec<_>>();

        if selection_set.is_empty() {
            return None;
        }

        Some(Document {
            operation: Operation {
                selection_set,
                ..self.operation.clone()
            },
            fragments,
        })
    }
}

fn has_client_fields(selection_set: &[Selection]) -> bool {
    selection_set.iter().any(|selection| match selection {
        Selection::Field(field) => field.client || has_client_fields(&field.selection_set),
        Selection::InlineFragment { selection_set, .. } => has_client_fields(selection_set),
        Selection::FragmentSpread { .. } => false,
    })
}

fn has_export_fields(selection_set: &[Selection]) -> bool {
    selection_set.iter().any(|selection| match selection {
        Selection::Field(field) => {
            field.export_as.is_some() || has_export_fields(&field.selection_set)
        }
        Selection::InlineFragment { selection_set, .. } => has_export_fields(selection_set),
        Selection::FragmentSpread { .. } => false,
    })
}

fn strip_client_fields(selection_set: &[Selection]) -> Vec<Selection> {
    selection_set
        .iter()
        .filter_map(|selection| match selection {
            Selection::Field(field) => {
                if field.client {
                    return None;
                }
                let stripped = strip_client_fields(&field.selection_set);
                // a composite field whose entire selection was local has
                // nothing left to fetch
                if stripped.is_empty() && !field.selection_set.is_empty() {
                    return None;
                }
                Some(Selection::Field(Field {
                    selection_set: stripped,
                    ..field.clone()
                }))
            }
            Selection::InlineFragment {
                type_condition,
                selection_set,
            } => {
                let stripped = strip_client_fields(selection_set);
                if stripped.is_empty() {
                    None
                } else {
                    Some(Selection::InlineFragment {
                        type_condition: type_condition.clone(),
                        selection_set: stripped,
                    })
                }
            }
            Selection::FragmentSpread { name } => Some(Selection::FragmentSpread {
                name: name.clone(),
            }),
        })
        .collect()
}
