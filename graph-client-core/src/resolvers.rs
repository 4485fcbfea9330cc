use crate::prelude::graphql::*;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A local field resolver: computes the value of one field without a network
/// round trip.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        parent: &Value,
        args: &Object,
        context: &Context,
        field: &Field,
    ) -> Result<Value, FetchError>;
}

/// Adapter so plain closures can be registered as resolvers.
pub struct FnResolver<F>(pub F);

#[async_trait]
impl<F> Resolver for FnResolver<F>
where
    F: Fn(&Value, &Object, &Context) -> Result<Value, FetchError> + Send + Sync,
{
    async fn resolve(
        &self,
        parent: &Value,
        args: &Object,
        context: &Context,
        _field: &Field,
    ) -> Result<Value, FetchError> {
        (self.0)(parent, args, context)
    }
}

/// Mapping from type name to field name to resolver.
#[derive(Clone, Default)]
pub struct ResolverMap {
    map: HashMap<String, HashMap<String, Arc<dyn Resolver>>>,
}

impl ResolverMap {
    pub fn new() -> ResolverMap {
        Default::default()
    }

    pub fn insert(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: Arc<dyn Resolver>,
    ) {
        self.map
            .entry(type_name.into())
            .or_default()
            .insert(field_name.into(), resolver);
    }

    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&Arc<dyn Resolver>> {
        self.map.get(type_name)?.get(field_name)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for ResolverMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries = self
            .map
            .iter()
            .flat_map(|(t, fields)| fields.keys().map(move |f| format!("{}.{}", t, f)))
            .collect::<Vec<_>>();
        entries.sort();
        f.debug_tuple("ResolverMap").field(&entries).finish()
    }
}

/// The outcome of one local resolution pass.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    /// The merged result, shaped by the selection set.
    pub data: Value,

    /// Values exported by `export_as` fields, ready to feed into the
    /// outgoing request's variables.
    pub exported_variables: Object,

    /// Resolver failures, converted to GraphQL errors. A failing field
    /// resolves to `null` without aborting its siblings.
    pub errors: Vec<Error>,
}

/// The local-state half of the engine: walks a query's selection structure
/// and computes values for fields the network does not provide.
#[derive(Clone, Debug)]
pub struct LocalState {
    resolvers: Arc<ResolverMap>,
    matcher: Arc<dyn FragmentMatcher>,
}

/// Execution context threaded through the recursive walk, instead of any
/// mutable interpreter state.
struct ExecContext<'a> {
    fragments: &'a Fragments,
    variables: &'a Object,
    context: &'a Context,
    exported: Mutex<Object>,
    errors: Mutex<Vec<Error>>,
}

impl LocalState {
    pub fn new(resolvers: ResolverMap, matcher: Arc<dyn FragmentMatcher>) -> LocalState {
        LocalState {
            resolvers: Arc::new(resolvers),
            matcher,
        }
    }

    pub fn has_resolvers(&self) -> bool {
        !self.resolvers.is_empty()
    }

    /// Run the resolvers over `document`, merging the remote (or
    /// cache-derived) root value with locally computed field values.
    #[tracing::instrument(skip_all, level = "trace")]
    pub async fn run_resolvers(
        &self,
        document: &Document,
        remote: Option<Value>,
        variables: &Object,
        context: &Context,
    ) -> Resolution {
        let ctx = ExecContext {
            fragments: &document.fragments,
            variables,
            context,
            exported: Mutex::new(Object::new()),
            errors: Mutex::new(Vec::new()),
        };
        let parent = remote.unwrap_or(Value::Null);
        let data = self
            .resolve_selection_set(
                &ctx,
                &document.operation.selection_set,
                parent,
                document.kind().root_type_name().to_string(),
                Path::empty(),
            )
            .await;
        Resolution {
            data,
            exported_variables: ctx.exported.into_inner(),
            errors: ctx.errors.into_inner(),
        }
    }

    /// The export-variable phase: resolve the document against the best
    /// available local data and collect the exported values, so they can be
    /// embedded in the outgoing request's variables.
    pub async fn resolve_exports(
        &self,
        document: &Document,
        seed: Option<Value>,
        variables: &Object,
        context: &Context,
    ) -> (Object, Vec<Error>) {
        let resolution = self.run_resolvers(document, seed, variables, context).await;
        (resolution.exported_variables, resolution.errors)
    }

    fn resolve_selection_set<'a>(
        &'a self,
        ctx: &'a ExecContext<'a>,
        selection_set: &'a [Selection],
        parent: Value,
        parent_type: String,
        path: Path,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            let mut output = Object::new();
            let parent_typename = parent
                .as_object()
                .and_then(|o| o.get("__typename"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            for selection in selection_set {
                match selection {
                    Selection::Field(field) => {
                        let key = field.response_key();
                        let mut field_path = path.clone();
                        field_path.push(PathElement::Key(key.to_string()));

                        let existing = parent
                            .as_object()
                            .and_then(|o| o.get(key))
                            .cloned();

                        let resolver = self.resolvers.get(&parent_type, &field.name);
                        let value = match resolver {
                            Some(resolver) if existing.is_none() || field.always => {
                                let args = field.argument_values(ctx.variables);
                                match resolver
                                    .resolve(&parent, &args, ctx.context, field)
                                    .await
                                {
                                    Ok(value) => value,
                                    Err(error) => {
                                        ctx.errors
                                            .lock()
                                            .push(error.to_graphql_error(Some(field_path.clone())));
                                        Value::Null
                                    }
                                }
                            }
                            _ => existing.unwrap_or(Value::Null),
                        };

                        if let Some(export) = &field.export_as {
                            ctx.exported.lock().insert(export.as_str(), value.clone());
                        }

                        let value = if field.selection_set.is_empty() {
                            value
                        } else {
                            self.complete_value(ctx, field, value, field_path).await
                        };
                        output.insert(key, value);
                    }
                    Selection::InlineFragment {
                        type_condition,
                        selection_set,
                    } => {
                        let applies = match type_condition {
                            Some(condition) => self
                                .matcher
                                .matches(condition, parent_typename.as_deref()),
                            None => true,
                        };
                        if applies {
                            let merged = self
                                .resolve_selection_set(
                                    ctx,
                                    selection_set,
                                    parent.clone(),
                                    parent_type.clone(),
                                    path.clone(),
                                )
                                .await;
                            if let Value::Object(merged) = merged {
                                for (key, value) in merged {
                                    output.insert(key, value);
                                }
                            }
                        }
                    }
                    Selection::FragmentSpread { name } => {
                        if let Some(fragment) = ctx.fragments.get(name) {
                            if self
                                .matcher
                                .matches(&fragment.type_condition, parent_typename.as_deref())
                            {
                                let merged = self
                                    .resolve_selection_set(
                                        ctx,
                                        &fragment.selection_set,
                                        parent.clone(),
                                        parent_type.clone(),
                                        path.clone(),
                                    )
                                    .await;
                                if let Value::Object(merged) = merged {
                                    for (key, value) in merged {
                                        output.insert(key, value);
                                    }
                                }
                            }
                        } else {
                            failfast_debug!("Missing fragment named: {}", name);
                        }
                    }
                }
            }

            Value::Object(output)
        })
    }

    /// Recurse into a composite field value, mapping element-wise over
    /// arrays and preserving null / array-of-null shapes.
    fn complete_value<'a>(
        &'a self,
        ctx: &'a ExecContext<'a>,
        field: &'a Field,
        value: Value,
        path: Path,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    let mut completed = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        let mut item_path = path.clone();
                        item_path.push(PathElement::Index(index));
                        completed.push(self.complete_value(ctx, field, item, item_path).await);
                    }
                    Value::Array(completed)
                }
                Value::Object(_) => {
                    let type_name = value
                        .as_object()
                        .and_then(|o| o.get("__typename"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.resolve_selection_set(ctx, &field.selection_set, value, type_name, path)
                        .await
                }
                // null stays null; a scalar under a composite selection is
                // passed through untouched
                other => other,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json_bytes::json;

    fn resolver(
        f: impl Fn(&Value, &Object, &Context) -> Result<Value, FetchError> + Send + Sync + 'static,
    ) -> Arc<dyn Resolver> {
        Arc::new(FnResolver(f))
    }

    fn local_state(resolvers: ResolverMap) -> LocalState {
        LocalState::new(resolvers, Arc::new(TypenameFragmentMatcher))
    }

    fn document(selection_set: Vec<Selection>) -> Document {
        Document::builder()
            .operation(Operation::builder().selection_set(selection_set).build())
            .build()
    }

    #[tokio::test]
    async fn test_merges_local_and_remote_fields() {
        let mut resolvers = ResolverMap::new();
        resolvers.insert("Query", "local", resolver(|_, _, _| Ok(json!(42))));
        let state = local_state(resolvers);

        let doc = document(vec![
            Field::builder().name("remote").build().into(),
            Field::builder().name("local").client(true).build().into(),
        ]);
        let resolution = state
            .run_resolvers(
                &doc,
                Some(json!({"remote": "from network"})),
                &Object::new(),
                &Context::new(),
            )
            .await;
        assert_eq!(
            resolution.data,
            json!({"remote": "from network", "local": 42})
        );
        assert!(resolution.errors.is_empty());
    }

    #[tokio::test]
    async fn test_throwing_resolver_nulls_field_and_keeps_siblings() {
        let mut resolvers = ResolverMap::new();
        resolvers.insert(
            "Query",
            "local",
            resolver(|_, _, _| {
                Err(FetchError::ResolverError {
                    field: "local".to_string(),
                    reason: "boom".to_string(),
                })
            }),
        );
        let state = local_state(resolvers);

        let doc = document(vec![
            Field::builder().name("local").client(true).build().into(),
            Field::builder().name("remote").build().into(),
        ]);
        let resolution = state
            .run_resolvers(
                &doc,
                Some(json!({"remote": "ok"})),
                &Object::new(),
                &Context::new(),
            )
            .await;
        assert_eq!(resolution.data, json!({"local": null, "remote": "ok"}));
        assert_eq!(resolution.errors.len(), 1);
        assert_eq!(
            resolution.errors[0].path,
            Some(Path::from("local"))
        );
    }

    #[tokio::test]
    async fn test_export_variables() {
        let mut resolvers = ResolverMap::new();
        resolvers.insert("Query", "currentUserId", resolver(|_, _, _| Ok(json!(7))));
        let state = local_state(resolvers);

        let doc = document(vec![Field::builder()
            .name("currentUserId")
            .client(true)
            .export_as(Some("userId".to_string()))
            .build()
            .into()]);
        let (exported, errors) = state
            .resolve_exports(&doc, None, &Object::new(), &Context::new())
            .await;
        assert_eq!(exported.get("userId"), Some(&json!(7)));
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_arrays_resolved_element_wise() {
        let mut resolvers = ResolverMap::new();
        resolvers.insert(
            "Item",
            "starred",
            resolver(|parent, _, _| {
                Ok(json!(parent
                    .as_object()
                    .and_then(|o| o.get("id"))
                    .and_then(|v| v.as_i64())
                    == Some(1)))
            }),
        );
        let state = local_state(resolvers);

        let doc = document(vec![Field::builder()
            .name("items")
            .selection_set(vec![
                Field::builder().name("id").build().into(),
                Field::builder().name("starred").client(true).build().into(),
            ])
            .build()
            .into()]);
        let remote = json!({"items": [
            {"__typename": "Item", "id": 1},
            {"__typename": "Item", "id": 2},
            null,
        ]});
        let resolution = state
            .run_resolvers(&doc, Some(remote), &Object::new(), &Context::new())
            .await;
        assert_eq!(
            resolution.data,
            json!({"items": [
                {"id": 1, "starred": true},
                {"id": 2, "starred": false},
                null,
            ]})
        );
    }

    #[tokio::test]
    async fn test_fragment_spread_respects_type_condition() {
        let mut resolvers = ResolverMap::new();
        resolvers.insert("Droid", "primaryFunction", resolver(|_, _, _| Ok(json!("protocol"))));
        let state = local_state(resolvers);

        let mut fragments = Fragments::new();
        fragments.insert(
            "droidFields",
            Fragment {
                type_condition: "Droid".to_string(),
                selection_set: vec![Field::builder()
                    .name("primaryFunction")
                    .client(true)
                    .build()
                    .into()],
            },
        );
        let doc = Document::builder()
            .operation(
                Operation::builder()
                    .selection_set(vec![Field::builder()
                        .name("hero")
                        .selection_set(vec![
                            Field::builder().name("__typename").build().into(),
                            Selection::FragmentSpread {
                                name: "droidFields".to_string(),
                            },
                        ])
                        .build()
                        .into()])
                    .build(),
            )
            .fragments(fragments)
            .build();

        let droid = json!({"hero": {"__typename": "Droid"}});
        let resolution = state
            .run_resolvers(&doc, Some(droid), &Object::new(), &Context::new())
            .await;
        assert_eq!(
            resolution.data,
            json!({"hero": {"__typename": "Droid", "primaryFunction": "protocol"}})
        );

        let human = json!({"hero": {"__typename": "Human"}});
        let resolution = state
            .run_resolvers(&doc, Some(human), &Object::new(), &Context::new())
            .await;
        assert_eq!(resolution.data, json!({"hero": {"__typename": "Human"}}));
    }

    #[tokio::test]
    async fn test_always_marker_forces_recompute() {
        let mut resolvers = ResolverMap::new();
        resolvers.insert("Query", "cachedValue", resolver(|_, _, _| Ok(json!("fresh"))));
        resolvers.insert("Query", "freshValue", resolver(|_, _, _| Ok(json!("fresh"))));
        let state = local_state(resolvers);

        let doc = document(vec![
            Field::builder().name("cachedValue").client(true).build().into(),
            Field::builder()
                .name("freshValue")
                .client(true)
                .always(true)
                .build()
                .into(),
        ]);
        let remote = json!({"cachedValue": "stale", "freshValue": "stale"});
        let resolution = state
            .run_resolvers(&doc, Some(remote), &Object::new(), &Context::new())
            .await;
        // without `always`, an existing value wins; with it, the resolver runs
        assert_eq!(
            resolution.data,
            json!({"cachedValue": "stale", "freshValue": "fresh"})
        );
    }
}
