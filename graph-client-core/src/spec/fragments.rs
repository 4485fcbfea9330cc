use crate::prelude::graphql::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named fragment definition.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub type_condition: String,
    pub selection_set: Vec<Selection>,
}

/// The named fragments of a document.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fragments {
    map: HashMap<String, Fragment>,
}

impl Fragments {
    pub fn new() -> Fragments {
        Default::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, fragment: Fragment) {
        self.map.insert(name.into(), fragment);
    }

    pub fn get(&self, key: impl AsRef<str>) -> Option<&Fragment> {
        self.map.get(key.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Fragment)> {
        self.map.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl FromIterator<(String, Fragment)> for Fragments {
    fn from_iter<I: IntoIterator<Item = (String, Fragment)>>(iter: I) -> Self {
        Fragments {
            map: iter.into_iter().collect(),
        }
    }
}
