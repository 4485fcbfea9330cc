use crate::prelude::graphql::*;
use bytes::Bytes;
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use typed_builder::TypedBuilder;

/// A stream of responses from the link chain: one primary response and any
/// number of patch responses, where an `Err` item is a transport failure.
/// An empty stream is a valid, empty success.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Response, FetchError>> + Send>>;

/// A graphql response as produced by the link chain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Response {
    /// The label that was passed to the defer or stream directive for this
    /// patch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub label: Option<String>,

    /// The response data.
    #[serde(skip_serializing_if = "skip_data_if", default)]
    #[builder(default = Value::Object(Default::default()))]
    pub data: Value,

    /// The path that the data should be merged at.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub path: Option<Path>,

    /// The optional indicator that there may be more data in the form of a
    /// patch response.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub has_next: Option<bool>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    pub errors: Vec<Error>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    #[builder(default)]
    pub extensions: Object,
}

fn skip_data_if(value: &Value) -> bool {
    match value {
        Value::Object(o) => o.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

impl Response {
    pub fn is_primary(&self) -> bool {
        self.path.is_none()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn from_bytes(b: Bytes) -> Result<Response, FetchError> {
        let value = Value::from_bytes(b).map_err(|error| FetchError::MalformedResponse {
            reason: error.to_string(),
        })?;

        let mut object = match value {
            Value::Object(o) => o,
            _ => {
                return Err(FetchError::MalformedResponse {
                    reason: "expected a JSON object".to_string(),
                })
            }
        };

        let label = object
            .get("label")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let data = object.remove("data").unwrap_or_default();

        let path = object
            .remove("path")
            .and_then(|v| serde_json_bytes::from_value(v).ok());
        let has_next = object.get("hasNext").and_then(|v| v.as_bool());

        let errors = match object.remove("errors") {
            Some(Value::Array(v)) => v
                .into_iter()
                .map(Error::from_value)
                .collect::<Result<Vec<Error>, FetchError>>()?,
            _ => Vec::new(),
        };

        let extensions = match object.remove("extensions") {
            Some(Value::Object(o)) => o,
            _ => Object::new(),
        };

        Ok(Response {
            label,
            data,
            path,
            has_next,
            errors,
            extensions,
        })
    }
}

impl From<Response> for ResponseStream {
    fn from(response: Response) -> Self {
        stream::once(future::ready(Ok(response))).boxed()
    }
}

impl From<FetchError> for ResponseStream {
    fn from(error: FetchError) -> Self {
        stream::once(future::ready(Err(error))).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serde_json_bytes::json as bjson;

    #[test]
    fn test_response() {
        let result = serde_json::from_str::<Response>(
            json!(
            {
              "errors": [
                {
                  "message": "Name for item 1002 could not be fetched.",
                  "locations": [{ "line": 6, "column": 7 }],
                  "path": ["item", "related", 1, "name"],
                  "extensions": {
                    "error-extension": 5,
                  }
                }
              ],
              "data": {
                "item": {
                  "name": "widget",
                  "related": [
                    { "id": "1000", "name": "gadget" },
                    { "id": "1002", "name": null }
                  ]
                }
              },
              "extensions": {
                "response-extension": 3,
              }
            })
            .to_string()
            .as_str(),
        );
        assert_eq!(
            result.unwrap(),
            Response::builder()
                .data(bjson!({
                  "item": {
                    "name": "widget",
                    "related": [
                      { "id": "1000", "name": "gadget" },
                      { "id": "1002", "name": null }
                    ]
                  }
                }))
                .errors(vec![Error {
                    message: "Name for item 1002 could not be fetched.".into(),
                    locations: vec![Location { line: 6, column: 7 }],
                    path: Some(Path::from("item/related/1/name")),
                    extensions: bjson!({
                        "error-extension": 5,
                    })
                    .as_object()
                    .cloned()
                    .unwrap()
                }])
                .extensions(
                    bjson!({
                        "response-extension": 3,
                    })
                    .as_object()
                    .cloned()
                    .unwrap()
                )
                .build()
        );
    }

    #[test]
    fn test_patch_response() {
        let result = serde_json::from_str::<Response>(
            json!(
            {
              "label": "part",
              "hasNext": true,
              "path": ["item", "related"],
              "data": { "name": "late arrival" }
            })
            .to_string()
            .as_str(),
        )
        .unwrap();
        assert!(!result.is_primary());
        assert_eq!(
            result,
            Response::builder()
                .label("part".to_string())
                .data(bjson!({ "name": "late arrival" }))
                .path(Path::from_slice(&["item", "related"]))
                .has_next(true)
                .build()
        );
    }

    #[test]
    fn test_from_bytes_malformed() {
        let result = Response::from_bytes(Bytes::from_static(b"[1, 2]"));
        assert!(matches!(
            result,
            Err(FetchError::MalformedResponse { reason }) if reason.contains("object")
        ));
    }
}
