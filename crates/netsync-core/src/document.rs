//! Document: one keyed JSON document as held by a replica or a syncher.
//!
//! Serialized CouchDB-style: metadata lives in underscore-prefixed keys
//! (`_id`, `_rev`, `_revisions`, `_deleted`, `_conflicts`) and the payload
//! fields are flattened alongside them.

use crate::revision::{REVS_LIMIT, Revision};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arbitrary JSON payload keyed by field name.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    /// Ancestry, newest first, starting with `rev`.
    #[serde(rename = "_revisions", default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<Revision>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    /// Alternate leaf revisions observed when the document was read.
    #[serde(rename = "_conflicts", default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,

    #[serde(flatten)]
    pub fields: Fields,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Private keys belong to the store, not the payload.
pub fn is_private(key: &str) -> bool {
    key.starts_with('_')
}

impl Document {
    /// A document that has never been written.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        let mut doc = Self {
            id: id.into(),
            rev: None,
            revisions: Vec::new(),
            deleted: false,
            conflicts: Vec::new(),
            fields: Fields::new(),
        };
        doc.merge(fields);
        doc
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Shallow merge: top-level keys in `patch` replace ours.
    pub fn merge(&mut self, patch: Fields) {
        for (key, value) in patch {
            if !is_private(&key) {
                self.fields.insert(key, value);
            }
        }
    }

    /// Replace every payload field with those of `other`, keeping our identity.
    pub fn replace_fields(&mut self, other: &Fields) {
        self.fields = other
            .iter()
            .filter(|(key, _)| !is_private(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
    }

    /// Record a freshly assigned revision as the head of our ancestry.
    pub fn advance(&mut self, rev: Revision) {
        self.revisions.insert(0, rev.clone());
        self.revisions.truncate(REVS_LIMIT);
        self.rev = Some(rev);
    }

    /// The ancestry, guaranteed to start with `rev` when one is set.
    pub fn history(&self) -> Vec<Revision> {
        match &self.rev {
            Some(rev) if self.revisions.first() != Some(rev) => {
                let mut history = vec![rev.clone()];
                history.extend(self.revisions.iter().cloned());
                history
            }
            _ => self.revisions.clone(),
        }
    }

    /// Read `elements` as a list of ids, skipping anything that isn't a string.
    pub fn element_ids(&self) -> Vec<String> {
        self.fields
            .get("elements")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
