//! Documents and document identifiers.
//!
//! A document is a JSON object. Every synchronized document carries an
//! `_id` field, and remote copies may carry the reserved version field
//! [`VERSION_FIELD`], which is stripped before a document is handed to
//! application code.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A schemaless document.
pub type Document = serde_json::Map<String, Value>;

/// Name of the identifier field.
pub const ID_FIELD: &str = "_id";

/// Reserved field holding a document's version stamp on the remote store.
pub const VERSION_FIELD: &str = "__stitch_sync_version";

/// The `_id` value of a document.
///
/// Ids are arbitrary JSON values. Hashing goes through the canonical
/// serialized form, so two ids are interchangeable as map keys exactly
/// when they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Value);

impl DocumentId {
    /// Wraps a raw id value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// Generates a random string id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Value::String(uuid::Uuid::new_v4().to_string()))
    }

    /// Reads the id of a document.
    pub fn of(document: &Document) -> Option<Self> {
        document.get(ID_FIELD).cloned().map(Self)
    }

    /// Returns the raw id value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the id, returning the raw value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Returns a `{ "_id": <id> }` key document.
    #[must_use]
    pub fn key_document(&self) -> Document {
        let mut key = Document::new();
        key.insert(ID_FIELD.to_string(), self.0.clone());
        key
    }
}

impl Hash for DocumentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<i64> for DocumentId {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

/// Removes the reserved version field from a document.
#[must_use]
pub fn sanitize(mut document: Document) -> Document {
    document.remove(VERSION_FIELD);
    document
}

/// Returns the document's id, failing when it has none.
pub fn require_id(document: &Document) -> ProtocolResult<DocumentId> {
    DocumentId::of(document).ok_or(ProtocolError::MissingId)
}

/// Serializes a value into a document.
pub fn to_document<T: Serialize>(value: &T) -> ProtocolResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::NotADocument(other.to_string())),
    }
}

/// Deserializes a document into a value.
pub fn from_document<T: DeserializeOwned>(document: Document) -> ProtocolResult<T> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// Builds a document from a `serde_json::json!` object literal.
///
/// Non-object values yield an empty document.
#[must_use]
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn ids_hash_by_value() {
        let mut ids = HashSet::new();
        ids.insert(DocumentId::from("a"));
        ids.insert(DocumentId::new(json!("a")));
        ids.insert(DocumentId::from(1));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn sanitize_strips_version_field() {
        let document = doc(json!({"_id": 1, "a": 2, VERSION_FIELD: {"v": 0}}));
        let clean = sanitize(document);
        assert_eq!(clean, doc(json!({"_id": 1, "a": 2})));
    }

    #[test]
    fn require_id_reports_missing_id() {
        let result = require_id(&doc(json!({"a": 1})));
        assert!(matches!(result, Err(ProtocolError::MissingId)));
        assert_eq!(
            require_id(&doc(json!({"_id": "x"}))).unwrap(),
            DocumentId::from("x")
        );
    }

    #[test]
    fn typed_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Todo {
            _id: String,
            done: bool,
        }

        let todo = Todo {
            _id: "t1".into(),
            done: true,
        };
        let document = to_document(&todo).unwrap();
        assert_eq!(document.get("done"), Some(&json!(true)));
        assert_eq!(from_document::<Todo>(document).unwrap(), todo);
        assert!(matches!(
            to_document(&5),
            Err(ProtocolError::NotADocument(_))
        ));
    }

    #[test]
    fn display_prefers_bare_strings() {
        assert_eq!(DocumentId::from("abc").to_string(), "abc");
        assert_eq!(DocumentId::from(7).to_string(), "7");
    }
}
