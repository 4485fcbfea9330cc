use serde::{Deserialize, Serialize};
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;
use std::fmt;

/// A JSON object as returned by the cache or the transport.
pub type Object = Map<ByteString, Value>;

const FRAGMENT_PREFIX: &str = "...";

/// Extension trait for [`Value`].
pub trait ValueExt {
    /// Merge `other` into `self`, recursing into objects and arrays of the
    /// same length. An explicit `null` in `other` does not erase data that is
    /// already present.
    fn deep_merge(&mut self, other: Value);

    /// Get a mutable reference to the value at `path`, if the path exists.
    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value>;

    /// Insert `value` at `path`, merging with whatever is already there.
    /// Intermediate objects are created as needed; indexing into a missing
    /// array element is reported as a failure.
    fn insert_at_path(&mut self, path: &Path, value: Value) -> bool;
}

impl ValueExt for Value {
    fn deep_merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                for (key, value) in b {
                    match a.get_mut(key.as_str()) {
                        Some(slot) => slot.deep_merge(value),
                        None => {
                            a.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
                for (slot, value) in a.iter_mut().zip(b) {
                    slot.deep_merge(value);
                }
            }
            (_, Value::Null) => {}
            (slot, other) => {
                *slot = other;
            }
        }
    }

    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value> {
        let mut current = self;
        for element in &path.0 {
            current = match element {
                PathElement::Key(key) => current.as_object_mut()?.get_mut(key.as_str())?,
                PathElement::Index(index) => current.as_array_mut()?.get_mut(*index)?,
            };
        }
        Some(current)
    }

    fn insert_at_path(&mut self, path: &Path, value: Value) -> bool {
        let mut current = self;
        for element in &path.0 {
            match element {
                PathElement::Key(key) => {
                    if !current.is_object() {
                        if current.is_null() {
                            *current = Value::Object(Object::new());
                        } else {
                            return false;
                        }
                    }
                    let object = current
                        .as_object_mut()
                        .expect("the value was just checked or replaced; qed");
                    if object.get(key.as_str()).is_none() {
                        object.insert(key.as_str(), Value::Null);
                    }
                    current = object
                        .get_mut(key.as_str())
                        .expect("the entry was just inserted; qed");
                }
                PathElement::Index(index) => match current.as_array_mut() {
                    Some(array) if *index < array.len() => current = &mut array[*index],
                    _ => return false,
                },
            }
        }
        current.deep_merge(value);
        true
    }
}

/// One component of a [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index into an array.
    Index(usize),
    /// A key of an object.
    Key(String),
}

/// A path into the response data, as used by error locations and patch
/// responses. Serialized as the usual mixed array of keys and indices.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Vec::new())
    }

    pub fn from_slice<T: AsRef<str>>(s: &[T]) -> Path {
        Path(
            s.iter()
                .map(|x| x.as_ref())
                .map(|s| {
                    if let Ok(index) = s.parse::<usize>() {
                        PathElement::Index(index)
                    } else {
                        PathElement::Key(s.to_string())
                    }
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parent(&self) -> Option<Path> {
        if self.is_empty() {
            None
        } else {
            let mut elements = self.0.clone();
            elements.pop();
            Some(Path(elements))
        }
    }

    pub fn join(&self, other: impl AsRef<Path>) -> Path {
        let other = other.as_ref();
        let mut elements = self.0.clone();
        elements.extend(other.0.iter().cloned());
        Path(elements)
    }

    pub fn push(&mut self, element: PathElement) {
        self.0.push(element);
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path(
            s.split('/')
                .filter(|x| !x.is_empty())
                .map(|s| {
                    if let Ok(index) = s.parse::<usize>() {
                        PathElement::Index(index)
                    } else {
                        PathElement::Key(s.to_string())
                    }
                })
                .collect(),
        )
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path::from(s.as_str())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.0 {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{}", index)?,
                PathElement::Key(key) => {
                    // fragment keys are not valid response path elements but
                    // we want to round-trip whatever the transport sent
                    let key = key.strip_prefix(FRAGMENT_PREFIX).unwrap_or(key);
                    write!(f, "{}", key)?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json_bytes::json;

    #[test]
    fn test_deep_merge() {
        let mut value = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        value.deep_merge(json!({"a": {"b": 3}, "d": [4, 5], "e": "new"}));
        assert_eq!(value, json!({"a": {"b": 3, "c": 2}, "d": [4, 5], "e": "new"}));
    }

    #[test]
    fn test_deep_merge_ignores_null() {
        let mut value = json!({"a": 1, "b": {"c": 2}});
        value.deep_merge(json!({"a": null, "b": null}));
        assert_eq!(value, json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn test_path_round_trip() {
        let path = Path::from("hero/friends/1/name");
        assert_eq!(
            path.0,
            vec![
                PathElement::Key("hero".to_string()),
                PathElement::Key("friends".to_string()),
                PathElement::Index(1),
                PathElement::Key("name".to_string()),
            ]
        );
        assert_eq!(path.to_string(), "/hero/friends/1/name");
    }

    #[test]
    fn test_insert_at_path() {
        let mut value = json!({"items": {"page": 1}});
        assert!(value.insert_at_path(&Path::from("items/extra"), json!({"cursor": "x"})));
        assert_eq!(
            value,
            json!({"items": {"page": 1, "extra": {"cursor": "x"}}})
        );

        // indexing into a missing array element fails instead of creating one
        let mut value = json!({"items": []});
        assert!(!value.insert_at_path(&Path::from("items/3"), json!("nope")));
    }

    #[test]
    fn test_get_path_mut() {
        let mut value = json!({"a": [{"b": 1}]});
        *value.get_path_mut(&Path::from("a/0/b")).unwrap() = json!(2);
        assert_eq!(value, json!({"a": [{"b": 2}]}));
        assert!(value.get_path_mut(&Path::from("a/1")).is_none());
    }
}
