//! Query predicates and field updates.
//!
//! This is the small query language the synchronization engine needs from
//! its document stores: equality and membership on dotted field paths,
//! field existence, conjunction and disjunction, plus `$set`/`$unset`
//! style updates.

use crate::document::{Document, DocumentId, ID_FIELD};
use serde_json::Value;

/// A predicate over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// The value at the path equals the given value.
    Eq(String, Value),
    /// The path is present (`true`) or absent (`false`).
    Exists(String, bool),
    /// The value at the path is one of the given values.
    In(String, Vec<Value>),
    /// The path is absent or its value is none of the given values.
    NotIn(String, Vec<Value>),
    /// Every sub-filter matches.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Matches the document with the given id.
    pub fn by_id(id: &DocumentId) -> Self {
        Filter::Eq(ID_FIELD.to_string(), id.as_value().clone())
    }

    /// Matches any document whose id is in `ids`.
    pub fn ids_in<'a>(ids: impl IntoIterator<Item = &'a DocumentId>) -> Self {
        Filter::In(
            ID_FIELD.to_string(),
            ids.into_iter().map(|id| id.as_value().clone()).collect(),
        )
    }

    /// Matches any document whose id is not in `ids`.
    pub fn ids_not_in<'a>(ids: impl IntoIterator<Item = &'a DocumentId>) -> Self {
        Filter::NotIn(
            ID_FIELD.to_string(),
            ids.into_iter().map(|id| id.as_value().clone()).collect(),
        )
    }

    /// Equality on a field path.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    /// Conjunction of `self` and `other`.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Returns true if the document satisfies this filter.
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, value) => get_path(document, path) == Some(value),
            Filter::Exists(path, present) => get_path(document, path).is_some() == *present,
            Filter::In(path, values) => {
                get_path(document, path).is_some_and(|found| values.contains(found))
            }
            Filter::NotIn(path, values) => {
                get_path(document, path).is_none_or(|found| !values.contains(found))
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(document)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(document)),
        }
    }

    /// Returns the document an upsert should start from when nothing matches:
    /// every top-level equality constraint, including those nested in `And`.
    pub fn upsert_seed(&self) -> Document {
        let mut seed = Document::new();
        self.collect_equalities(&mut seed);
        seed
    }

    fn collect_equalities(&self, seed: &mut Document) {
        match self {
            Filter::Eq(path, value) => set_path(seed, path, value.clone()),
            Filter::And(filters) => filters.iter().for_each(|f| f.collect_equalities(seed)),
            _ => {}
        }
    }
}

/// A set of field assignments and removals applied to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    /// Dotted paths to assign.
    pub set: Document,
    /// Dotted paths to remove.
    pub unset: Vec<String>,
}

impl Update {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `$set` of `path` to `value`.
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(path.into(), value.into());
        self
    }

    /// Adds an `$unset` of `path`.
    #[must_use]
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    /// Returns true if the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Applies the update in place. Intermediate objects are created as needed.
    pub fn apply(&self, document: &mut Document) {
        for (path, value) in &self.set {
            set_path(document, path, value.clone());
        }
        for path in &self.unset {
            remove_path(document, path);
        }
    }
}

/// Looks up a dotted path.
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(document: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            document.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = document
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = document.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::doc;
    use serde_json::json;

    #[test]
    fn equality_on_nested_paths() {
        let document = doc(json!({"_id": 1, "a": {"b": 2}}));
        assert!(Filter::eq("a.b", 2).matches(&document));
        assert!(!Filter::eq("a.b", 3).matches(&document));
        assert!(!Filter::eq("a.c", 2).matches(&document));
    }

    #[test]
    fn existence_and_membership() {
        let document = doc(json!({"_id": "x", "v": 1}));
        assert!(Filter::Exists("v".into(), true).matches(&document));
        assert!(Filter::Exists("w".into(), false).matches(&document));

        let ids = [DocumentId::from("x"), DocumentId::from("y")];
        assert!(Filter::ids_in(&ids).matches(&document));
        assert!(!Filter::ids_not_in(&ids).matches(&document));
        assert!(Filter::NotIn("missing".into(), vec![json!(1)]).matches(&document));
    }

    #[test]
    fn and_flattens_and_skips_all() {
        let filter = Filter::All.and(Filter::eq("a", 1)).and(Filter::eq("b", 2));
        assert_eq!(
            filter,
            Filter::And(vec![Filter::eq("a", 1), Filter::eq("b", 2)])
        );
        assert!(filter.matches(&doc(json!({"a": 1, "b": 2}))));
        assert!(!Filter::Or(vec![]).matches(&doc(json!({}))));
    }

    #[test]
    fn upsert_seed_collects_equalities() {
        let filter = Filter::eq("_id", "k")
            .and(Filter::eq("meta.kind", "note"))
            .and(Filter::Exists("x".into(), false));
        assert_eq!(
            filter.upsert_seed(),
            doc(json!({"_id": "k", "meta": {"kind": "note"}}))
        );
    }

    #[test]
    fn update_sets_and_unsets_dotted_paths() {
        let mut document = doc(json!({"_id": 1, "a": 1, "n": {"x": 1, "y": 2}, "s": 5}));
        Update::new()
            .set("a", 2)
            .set("n.z", 3)
            .set("s.t", true)
            .unset("n.x")
            .unset("missing.path")
            .apply(&mut document);
        assert_eq!(
            document,
            doc(json!({"_id": 1, "a": 2, "n": {"y": 2, "z": 3}, "s": {"t": true}}))
        );
        assert!(Update::new().is_empty());
    }
}
