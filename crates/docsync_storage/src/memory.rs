//! In-memory document store.

use crate::collection::{DocumentCollection, DocumentSet, LocalStore, WriteResult};
use crate::error::StorageResult;
use docsync_protocol::{Document, DocumentId, Filter, Update};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// An in-memory collection.
///
/// Suitable for:
/// - Unit and integration tests
/// - Stores that don't need persistence
/// - The backing state of test doubles for remote stores
///
/// # Example
///
/// ```rust
/// use docsync_protocol::{doc, Filter};
/// use docsync_storage::{DocumentCollection, InMemoryCollection};
/// use serde_json::json;
///
/// let todos = InMemoryCollection::new("todos");
/// todos.insert_one(doc(json!({"_id": 1, "done": false}))).unwrap();
/// assert_eq!(todos.count(&Filter::eq("done", false)).unwrap(), 1);
/// ```
#[derive(Debug)]
pub struct InMemoryCollection {
    name: String,
    data: RwLock<DocumentSet>,
}

impl InMemoryCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_documents(name, Vec::new())
    }

    /// Creates a collection holding `documents`.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_documents(name: &str, documents: Vec<Document>) -> Self {
        Self {
            name: name.to_string(),
            data: RwLock::new(DocumentSet::new(name, documents)),
        }
    }

    /// Returns a copy of every document, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Document> {
        self.data.read().documents().to_vec()
    }

    /// Runs `f` against the documents under the write lock, then hands the
    /// resulting documents to `after` while the lock is still held.
    pub(crate) fn mutate<R>(
        &self,
        f: impl FnOnce(&mut DocumentSet) -> StorageResult<R>,
        after: impl FnOnce(&[Document]) -> StorageResult<()>,
    ) -> StorageResult<R> {
        let mut data = self.data.write();
        let result = f(&mut data)?;
        after(data.documents())?;
        Ok(result)
    }

    fn write<R>(&self, f: impl FnOnce(&mut DocumentSet) -> StorageResult<R>) -> StorageResult<R> {
        self.mutate(f, |_| Ok(()))
    }
}

/// Write operations shared with persistent collections, expressed against a
/// `mutate` hook so each implementation decides what happens after a write.
macro_rules! delegate_writes {
    ($ty:ty, $write:ident) => {
        impl crate::collection::DocumentCollection for $ty {
            fn name(&self) -> &str {
                self.collection_name()
            }

            fn find(&self, filter: &Filter) -> StorageResult<Vec<Document>> {
                Ok(self.read_documents(filter))
            }

            fn insert_one(&self, document: Document) -> StorageResult<DocumentId> {
                self.$write(|data| data.insert(document))
            }

            fn replace_one(
                &self,
                filter: &Filter,
                replacement: Document,
                upsert: bool,
            ) -> StorageResult<WriteResult> {
                self.$write(|data| Ok(data.replace_one(filter, replacement, upsert)?.0))
            }

            fn update_one(
                &self,
                filter: &Filter,
                update: &Update,
                upsert: bool,
            ) -> StorageResult<WriteResult> {
                self.$write(|data| Ok(data.update_one(filter, update, upsert)?.0))
            }

            fn update_many(&self, filter: &Filter, update: &Update) -> StorageResult<WriteResult> {
                self.$write(|data| Ok(data.update_many(filter, update)))
            }

            fn find_one_and_update(
                &self,
                filter: &Filter,
                update: &Update,
                upsert: bool,
            ) -> StorageResult<Option<Document>> {
                self.$write(|data| Ok(data.update_one(filter, update, upsert)?.1))
            }

            fn find_one_and_replace(
                &self,
                filter: &Filter,
                replacement: Document,
                upsert: bool,
            ) -> StorageResult<Option<Document>> {
                self.$write(|data| Ok(data.replace_one(filter, replacement, upsert)?.1))
            }

            fn delete_one(&self, filter: &Filter) -> StorageResult<u64> {
                self.$write(|data| Ok(data.delete_one(filter)))
            }

            fn delete_many(&self, filter: &Filter) -> StorageResult<u64> {
                self.$write(|data| Ok(data.delete_many(filter)))
            }
        }
    };
}

pub(crate) use delegate_writes;

impl InMemoryCollection {
    pub(crate) fn collection_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn read_documents(&self, filter: &Filter) -> Vec<Document> {
        self.data.read().find(filter)
    }
}

delegate_writes!(InMemoryCollection, write);

/// An in-memory store of named collections.
///
/// Clones of the `Arc` share state, so a store can outlive one engine and be
/// handed to the next, which is how crash-recovery tests simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<InMemoryCollection>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the concrete collection, creating it if needed.
    pub fn memory_collection(&self, name: &str) -> Arc<InMemoryCollection> {
        if let Some(existing) = self.collections.read().get(name) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.collections
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(InMemoryCollection::new(name))),
        )
    }
}

impl LocalStore for MemoryStore {
    fn collection(&self, name: &str) -> StorageResult<Arc<dyn DocumentCollection>> {
        Ok(self.memory_collection(name))
    }

    fn collection_names(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use docsync_protocol::{doc, VersionStamp, ID_FIELD};
    use serde_json::json;

    fn seeded() -> InMemoryCollection {
        InMemoryCollection::with_documents(
            "c",
            vec![
                doc(json!({"_id": 1, "a": 1})),
                doc(json!({"_id": 2, "a": 2})),
                doc(json!({"_id": 3, "a": 2})),
            ],
        )
    }

    #[test]
    fn memory_find_preserves_insertion_order() {
        let coll = seeded();
        let found = coll.find(&Filter::eq("a", 2)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].get(ID_FIELD), Some(&json!(2)));
        assert_eq!(coll.count(&Filter::All).unwrap(), 3);
        assert_eq!(
            coll.find_one(&Filter::eq("a", 2)).unwrap().unwrap().get(ID_FIELD),
            Some(&json!(2))
        );
    }

    #[test]
    fn memory_insert_rejects_duplicates_and_missing_ids() {
        let coll = seeded();
        let err = coll.insert_one(doc(json!({"_id": 1}))).unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(matches!(
            coll.insert_one(doc(json!({"a": 1}))),
            Err(StorageError::InvalidDocument(_))
        ));
    }

    #[test]
    fn memory_guarded_replace_matches_only_expected_version() {
        let coll = InMemoryCollection::new("c");
        let id = DocumentId::from("d");
        let v0 = VersionStamp::fresh();
        let mut stored = doc(json!({"_id": "d", "a": 1}));
        v0.stamp(&mut stored);
        coll.insert_one(stored).unwrap();

        let mut replacement = doc(json!({"_id": "d", "a": 2}));
        let v1 = v0.next();
        v1.stamp(&mut replacement);

        let stale = coll
            .replace_one(&VersionStamp::filter_for(&id, Some(&v1)), replacement.clone(), false)
            .unwrap();
        assert_eq!(stale.matched_count, 0);

        let ok = coll
            .replace_one(&VersionStamp::filter_for(&id, Some(&v0)), replacement, false)
            .unwrap();
        assert_eq!(ok.matched_count, 1);
        assert_eq!(ok.modified_count, 1);
        let current = coll.find_one(&Filter::by_id(&id)).unwrap().unwrap();
        assert_eq!(VersionStamp::extract(&current).unwrap(), Some(v1));
    }

    #[test]
    fn memory_replace_cannot_change_id() {
        let coll = seeded();
        let result = coll.replace_one(&Filter::eq("_id", 1), doc(json!({"_id": 9})), false);
        assert!(matches!(result, Err(StorageError::InvalidDocument(_))));
    }

    #[test]
    fn memory_upserts_seed_from_filter() {
        let coll = InMemoryCollection::new("c");
        let result = coll
            .update_one(
                &Filter::eq("_id", "u").and(Filter::eq("kind", "x")),
                &Update::new().set("n", 1),
                true,
            )
            .unwrap();
        assert_eq!(result.upserted_id, Some(DocumentId::from("u")));
        assert_eq!(
            coll.find_one(&Filter::All).unwrap(),
            Some(doc(json!({"_id": "u", "kind": "x", "n": 1})))
        );

        let replaced = coll
            .find_one_and_replace(&Filter::eq("_id", "r"), doc(json!({"b": true})), true)
            .unwrap();
        assert_eq!(replaced, Some(doc(json!({"_id": "r", "b": true}))));

        let generated = coll
            .update_one(&Filter::eq("kind", "y"), &Update::new().set("m", 2), true)
            .unwrap();
        assert!(generated.upserted_id.is_some());
    }

    #[test]
    fn memory_find_one_and_update_returns_after_image() {
        let coll = seeded();
        let after = coll
            .find_one_and_update(
                &Filter::eq("_id", 1),
                &Update::new().set("a", 5).set("_id", 99),
                false,
            )
            .unwrap();
        assert_eq!(after, Some(doc(json!({"_id": 1, "a": 5}))));
        assert_eq!(
            coll.find_one_and_update(&Filter::eq("_id", 42), &Update::new().set("a", 1), false)
                .unwrap(),
            None
        );
    }

    #[test]
    fn memory_update_many_counts_modifications() {
        let coll = seeded();
        let result = coll.update_many(&Filter::All, &Update::new().set("a", 2)).unwrap();
        assert_eq!(result.matched_count, 3);
        assert_eq!(result.modified_count, 1);
    }

    #[test]
    fn memory_deletes() {
        let coll = seeded();
        assert_eq!(coll.delete_one(&Filter::eq("a", 2)).unwrap(), 1);
        assert_eq!(coll.delete_many(&Filter::All).unwrap(), 2);
        assert_eq!(coll.delete_one(&Filter::All).unwrap(), 0);
        assert!(coll.snapshot().is_empty());
    }

    #[test]
    fn memory_store_shares_collections() {
        let store = MemoryStore::new();
        store
            .collection("a")
            .unwrap()
            .insert_one(doc(json!({"_id": 1})))
            .unwrap();
        assert_eq!(store.memory_collection("a").snapshot().len(), 1);
        store.collection("b").unwrap();
        assert_eq!(store.collection_names().unwrap(), vec!["a", "b"]);
    }
}
