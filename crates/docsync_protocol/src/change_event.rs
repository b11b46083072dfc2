//! Change events and update descriptions.
//!
//! A [`ChangeEvent`] describes one write to one document. Events arrive
//! from the remote change stream, and the engine synthesizes them for
//! local writes and for authoritative remote lookups. Local events are
//! kept as the "uncommitted change event" of a document until the remote
//! store acknowledges them.

use crate::document::{
    from_document, sanitize, to_document, Document, DocumentId, ID_FIELD, VERSION_FIELD,
};
use crate::error::ProtocolResult;
use crate::filter::Update;
use crate::namespace::Namespace;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of write a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A new document.
    Insert,
    /// A removed document.
    Delete,
    /// A whole-document replacement.
    Replace,
    /// A partial update.
    Update,
    /// Anything the engine does not understand.
    #[serde(other)]
    Unknown,
}

impl OperationType {
    /// Short lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Update => "update",
            OperationType::Unknown => "unknown",
        }
    }
}

/// The fields changed by an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    /// Dotted paths that were assigned, with their new values.
    #[serde(default)]
    pub updated_fields: Document,
    /// Dotted paths that were removed.
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// Computes the update that turns `before` into `after`.
    ///
    /// Nested objects present on both sides are compared field by field and
    /// reported with dotted paths. Arrays and other values are compared as a
    /// whole. `_id` and the version field are never reported.
    pub fn diff(before: &Document, after: &Document) -> Self {
        let mut description = Self::default();
        diff_into(before, after, None, &mut description);
        description
    }

    /// Returns true if the description changes nothing.
    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }

    /// Converts to a `$set`/`$unset` update.
    pub fn to_update(&self) -> Update {
        Update {
            set: self.updated_fields.clone(),
            unset: self.removed_fields.clone(),
        }
    }
}

fn diff_into(
    ours: &Document,
    theirs: &Document,
    prefix: Option<&str>,
    out: &mut UpdateDescription,
) {
    let path = |key: &str| match prefix {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    };

    for (key, our_value) in ours {
        if key == ID_FIELD || key == VERSION_FIELD {
            continue;
        }
        match theirs.get(key) {
            Some(their_value) => match (our_value, their_value) {
                (Value::Object(our_child), Value::Object(their_child)) => {
                    diff_into(our_child, their_child, Some(&path(key)), out);
                }
                _ if our_value != their_value => {
                    out.updated_fields.insert(path(key), their_value.clone());
                }
                _ => {}
            },
            None => out.removed_fields.push(path(key)),
        }
    }

    for (key, their_value) in theirs {
        if key == ID_FIELD || key == VERSION_FIELD || ours.contains_key(key) {
            continue;
        }
        out.updated_fields.insert(path(key), their_value.clone());
    }
}

/// One write to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent<T = Document> {
    /// Opaque resume metadata from the change stream; empty for synthesized events.
    #[serde(rename = "_id", default)]
    pub resume_token: Document,
    /// The kind of write.
    pub operation_type: OperationType,
    /// The document after the write, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<T>,
    /// The namespace written to.
    #[serde(rename = "ns")]
    pub namespace: Namespace,
    /// `{ "_id": <id> }` of the written document.
    pub document_key: Document,
    /// Changed fields, for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
    /// True while the write has not been acknowledged by the remote store.
    #[serde(default)]
    pub has_uncommitted_writes: bool,
}

impl<T> ChangeEvent<T> {
    /// Returns the id from the document key.
    pub fn document_id(&self) -> Option<DocumentId> {
        DocumentId::of(&self.document_key)
    }
}

impl ChangeEvent<Document> {
    fn synthesized(
        operation_type: OperationType,
        namespace: &Namespace,
        id: &DocumentId,
        full_document: Option<Document>,
        update_description: Option<UpdateDescription>,
        write_pending: bool,
    ) -> Self {
        Self {
            resume_token: Document::new(),
            operation_type,
            full_document,
            namespace: namespace.clone(),
            document_key: id.key_document(),
            update_description,
            has_uncommitted_writes: write_pending,
        }
    }

    /// An insert of `document`, keyed by `id`.
    pub fn insert(
        namespace: &Namespace,
        id: &DocumentId,
        document: Document,
        write_pending: bool,
    ) -> Self {
        Self::synthesized(OperationType::Insert, namespace, id, Some(document), None, write_pending)
    }

    /// An update described by `description`, with the resulting document.
    pub fn update(
        namespace: &Namespace,
        id: &DocumentId,
        description: UpdateDescription,
        document_after: Document,
        write_pending: bool,
    ) -> Self {
        Self::synthesized(
            OperationType::Update,
            namespace,
            id,
            Some(document_after),
            Some(description),
            write_pending,
        )
    }

    /// A replacement of the whole document.
    pub fn replace(
        namespace: &Namespace,
        id: &DocumentId,
        document: Document,
        write_pending: bool,
    ) -> Self {
        Self::synthesized(
            OperationType::Replace,
            namespace,
            id,
            Some(document),
            None,
            write_pending,
        )
    }

    /// A deletion.
    pub fn delete(namespace: &Namespace, id: &DocumentId, write_pending: bool) -> Self {
        Self::synthesized(OperationType::Delete, namespace, id, None, None, write_pending)
    }

    /// Returns a copy with the uncommitted-writes flag set to `pending`.
    #[must_use]
    pub fn with_uncommitted_writes(mut self, pending: bool) -> Self {
        self.has_uncommitted_writes = pending;
        self
    }

    /// Returns a copy whose full document has the version field stripped.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.full_document = self.full_document.map(sanitize);
        self
    }

    /// Merges a new local write into the write still waiting to be pushed.
    ///
    /// - an update or replace after a pending insert stays an insert, since
    ///   the document has never reached the remote store;
    /// - an insert after a pending delete becomes a replace, since the
    ///   remote copy still exists;
    /// - an update after a pending update or replace becomes a replace of
    ///   the latest full document, since the newer description alone would
    ///   lose the earlier fields;
    /// - anything else is superseded by the newest event.
    pub fn coalesce(last: Option<&ChangeEvent>, newest: ChangeEvent) -> ChangeEvent {
        let Some(last) = last else {
            return newest;
        };
        let becomes = match (last.operation_type, newest.operation_type) {
            (OperationType::Insert, OperationType::Update | OperationType::Replace) => {
                OperationType::Insert
            }
            (OperationType::Delete, OperationType::Insert) => OperationType::Replace,
            (OperationType::Update | OperationType::Replace, OperationType::Update)
                if newest.full_document.is_some() =>
            {
                OperationType::Replace
            }
            _ => return newest,
        };
        ChangeEvent {
            operation_type: becomes,
            update_description: None,
            ..newest
        }
    }

    /// Converts the payload to a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> ProtocolResult<ChangeEvent<T>> {
        let full_document = match &self.full_document {
            Some(document) => Some(from_document(sanitize(document.clone()))?),
            None => None,
        };
        Ok(ChangeEvent {
            resume_token: self.resume_token.clone(),
            operation_type: self.operation_type,
            full_document,
            namespace: self.namespace.clone(),
            document_key: self.document_key.clone(),
            update_description: self.update_description.clone(),
            has_uncommitted_writes: self.has_uncommitted_writes,
        })
    }
}

impl<T: Serialize> ChangeEvent<T> {
    /// Converts a typed event back to a document event.
    pub fn encode(&self) -> ProtocolResult<ChangeEvent<Document>> {
        let full_document = match &self.full_document {
            Some(value) => Some(to_document(value)?),
            None => None,
        };
        Ok(ChangeEvent {
            resume_token: self.resume_token.clone(),
            operation_type: self.operation_type,
            full_document,
            namespace: self.namespace.clone(),
            document_key: self.document_key.clone(),
            update_description: self.update_description.clone(),
            has_uncommitted_writes: self.has_uncommitted_writes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::doc;
    use proptest::prelude::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    #[test]
    fn diff_reports_nested_changes_with_dotted_paths() {
        let before = doc(json!({"_id": 1, "a": 1, "n": {"x": 1, "y": 2}, "gone": true}));
        let after = doc(json!({"_id": 2, "a": 2, "n": {"x": 1, "z": 3}, "new": [1]}));
        let description = UpdateDescription::diff(&before, &after);
        assert_eq!(
            description.updated_fields,
            doc(json!({"a": 2, "n.z": 3, "new": [1]}))
        );
        let mut removed = description.removed_fields.clone();
        removed.sort();
        assert_eq!(removed, vec!["gone".to_string(), "n.y".to_string()]);
    }

    #[test]
    fn diff_ignores_version_field() {
        let before = doc(json!({"a": 1, VERSION_FIELD: {"v": 1}}));
        let after = doc(json!({"a": 1, VERSION_FIELD: {"v": 2}}));
        assert!(UpdateDescription::diff(&before, &after).is_empty());
    }

    #[test]
    fn coalesce_update_after_insert_stays_insert() {
        let id = DocumentId::from("x");
        let insert = ChangeEvent::insert(&ns(), &id, doc(json!({"_id": "x", "a": 1})), true);
        let update = ChangeEvent::update(
            &ns(),
            &id,
            UpdateDescription::diff(&doc(json!({"a": 1})), &doc(json!({"a": 2}))),
            doc(json!({"_id": "x", "a": 2})),
            true,
        );
        let merged = ChangeEvent::coalesce(Some(&insert), update);
        assert_eq!(merged.operation_type, OperationType::Insert);
        assert_eq!(merged.full_document, Some(doc(json!({"_id": "x", "a": 2}))));
        assert!(merged.update_description.is_none());
    }

    #[test]
    fn coalesce_insert_after_delete_becomes_replace() {
        let id = DocumentId::from("x");
        let delete = ChangeEvent::delete(&ns(), &id, true);
        let insert = ChangeEvent::insert(&ns(), &id, doc(json!({"_id": "x"})), true);
        let merged = ChangeEvent::coalesce(Some(&delete), insert);
        assert_eq!(merged.operation_type, OperationType::Replace);
    }

    #[test]
    fn coalesce_keeps_full_document_across_repeated_updates() {
        let id = DocumentId::from("x");
        let update = |before: serde_json::Value, after: serde_json::Value| {
            ChangeEvent::update(
                &ns(),
                &id,
                UpdateDescription::diff(&doc(before), &doc(after.clone())),
                doc(after),
                true,
            )
        };
        let first = update(json!({"_id": "x"}), json!({"_id": "x", "a": 1}));
        let second = ChangeEvent::coalesce(
            Some(&first),
            update(json!({"_id": "x", "a": 1}), json!({"_id": "x", "a": 1, "b": 2})),
        );
        assert_eq!(second.operation_type, OperationType::Replace);

        let third = ChangeEvent::coalesce(
            Some(&second),
            update(
                json!({"_id": "x", "a": 1, "b": 2}),
                json!({"_id": "x", "a": 1, "b": 2, "c": 3}),
            ),
        );
        assert_eq!(third.operation_type, OperationType::Replace);
        assert!(third.update_description.is_none());
        assert_eq!(
            third.full_document,
            Some(doc(json!({"_id": "x", "a": 1, "b": 2, "c": 3})))
        );
    }

    #[test]
    fn coalesce_delete_supersedes_everything() {
        let id = DocumentId::from("x");
        let insert = ChangeEvent::insert(&ns(), &id, doc(json!({"_id": "x"})), true);
        let delete = ChangeEvent::delete(&ns(), &id, true);
        let merged = ChangeEvent::coalesce(Some(&insert), delete.clone());
        assert_eq!(merged, delete);
        assert_eq!(ChangeEvent::coalesce(None, delete.clone()), delete);
    }

    #[test]
    fn unknown_operation_types_deserialize() {
        let op: OperationType = serde_json::from_value(json!("invalidate")).unwrap();
        assert_eq!(op, OperationType::Unknown);
        let op: OperationType = serde_json::from_value(json!("replace")).unwrap();
        assert_eq!(op, OperationType::Replace);
    }

    #[test]
    fn typed_decode_strips_version_field() {
        #[derive(Deserialize, Serialize, Debug, PartialEq)]
        struct Item {
            _id: String,
            qty: i64,
        }

        let id = DocumentId::from("i");
        let event = ChangeEvent::replace(
            &ns(),
            &id,
            doc(json!({"_id": "i", "qty": 3, VERSION_FIELD: {"spv": 1, "id": "a", "v": 0}})),
            false,
        );
        let typed: ChangeEvent<Item> = event.decode().unwrap();
        assert_eq!(typed.full_document.as_ref().unwrap().qty, 3);
        assert_eq!(typed.document_id(), Some(id));
        let back = typed.encode().unwrap();
        assert_eq!(back.full_document, Some(doc(json!({"_id": "i", "qty": 3}))));
    }

    fn flat_document() -> impl Strategy<Value = Document> {
        prop::collection::btree_map("[a-e]", 0i64..4, 0..5).prop_map(|fields| {
            fields
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn applying_a_diff_reproduces_the_target(
            before in flat_document(),
            after in flat_document(),
        ) {
            let mut patched = before.clone();
            UpdateDescription::diff(&before, &after).to_update().apply(&mut patched);
            prop_assert_eq!(patched, after);
        }
    }
}
