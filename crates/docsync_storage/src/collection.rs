//! Document collection and store traits.

use crate::error::{StorageError, StorageResult};
use docsync_protocol::{Document, DocumentId, Filter, Update, ID_FIELD};
use std::sync::Arc;

/// Outcome of an update or replace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Number of documents matched by the filter.
    pub matched_count: u64,
    /// Number of matched documents that actually changed.
    pub modified_count: u64,
    /// Id of the document created by an upsert, if any.
    pub upserted_id: Option<DocumentId>,
}

/// An ordered collection of documents keyed by `_id`.
///
/// This is the store contract the synchronization engine relies on for both
/// its local data and its own bookkeeping: filter-guarded writes, batch
/// finds and atomic find-and-modify with upsert.
///
/// # Invariants
///
/// - Every stored document has an `_id`, unique within the collection
/// - Documents are returned in insertion order
/// - A write that returns `Ok` is visible to every later read
/// - Implementations must be `Send + Sync` for concurrent access
pub trait DocumentCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Returns every document matching `filter`.
    fn find(&self, filter: &Filter) -> StorageResult<Vec<Document>>;

    /// Returns the first document matching `filter`.
    fn find_one(&self, filter: &Filter) -> StorageResult<Option<Document>> {
        Ok(self.find(filter)?.into_iter().next())
    }

    /// Counts documents matching `filter`.
    fn count(&self, filter: &Filter) -> StorageResult<u64> {
        Ok(self.find(filter)?.len() as u64)
    }

    /// Inserts a document, which must carry an `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateKey`] if the id is taken.
    fn insert_one(&self, document: Document) -> StorageResult<DocumentId>;

    /// Replaces the first match. With `upsert`, inserts when nothing matches.
    fn replace_one(
        &self,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StorageResult<WriteResult>;

    /// Updates the first match. With `upsert`, inserts when nothing matches.
    fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> StorageResult<WriteResult>;

    /// Updates every match.
    fn update_many(&self, filter: &Filter, update: &Update) -> StorageResult<WriteResult>;

    /// Updates the first match and returns it as it is after the update.
    fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> StorageResult<Option<Document>>;

    /// Replaces the first match and returns the replacement as stored.
    fn find_one_and_replace(
        &self,
        filter: &Filter,
        replacement: Document,
        upsert: bool,
    ) -> StorageResult<Option<Document>>;

    /// Deletes the first match. Returns the number deleted.
    fn delete_one(&self, filter: &Filter) -> StorageResult<u64>;

    /// Deletes every match. Returns the number deleted.
    fn delete_many(&self, filter: &Filter) -> StorageResult<u64>;
}

/// A named set of collections.
pub trait LocalStore: Send + Sync {
    /// Opens a collection, creating it if needed.
    fn collection(&self, name: &str) -> StorageResult<Arc<dyn DocumentCollection>>;

    /// Names of every collection that holds or has held documents.
    fn collection_names(&self) -> StorageResult<Vec<String>>;
}

/// The documents of one collection, in insertion order.
///
/// Shared by every collection implementation; callers provide locking.
#[derive(Debug, Clone, Default)]
pub(crate) struct DocumentSet {
    name: String,
    documents: Vec<Document>,
}

impl DocumentSet {
    pub(crate) fn new(name: &str, documents: Vec<Document>) -> Self {
        Self {
            name: name.to_string(),
            documents,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn documents(&self) -> &[Document] {
        &self.documents
    }

    fn position_of(&self, id: &DocumentId) -> Option<usize> {
        self.documents
            .iter()
            .position(|d| d.get(ID_FIELD) == Some(id.as_value()))
    }

    fn first_match(&self, filter: &Filter) -> Option<usize> {
        self.documents.iter().position(|d| filter.matches(d))
    }

    pub(crate) fn find(&self, filter: &Filter) -> Vec<Document> {
        self.documents
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    pub(crate) fn insert(&mut self, document: Document) -> StorageResult<DocumentId> {
        let id = DocumentId::of(&document)
            .ok_or_else(|| StorageError::InvalidDocument("document has no _id".into()))?;
        if self.position_of(&id).is_some() {
            return Err(StorageError::DuplicateKey {
                collection: self.name.clone(),
                id: id.to_string(),
            });
        }
        self.documents.push(document);
        Ok(id)
    }

    /// Builds the document an upsert inserts: the filter's equality fields,
    /// then `fill`, then an `_id` if still missing.
    fn upsert_document(filter: &Filter, fill: impl FnOnce(&mut Document)) -> Document {
        let mut document = filter.upsert_seed();
        fill(&mut document);
        if !document.contains_key(ID_FIELD) {
            document.insert(ID_FIELD.to_string(), DocumentId::generate().into_value());
        }
        document
    }

    pub(crate) fn replace_one(
        &mut self,
        filter: &Filter,
        mut replacement: Document,
        upsert: bool,
    ) -> StorageResult<(WriteResult, Option<Document>)> {
        match self.first_match(filter) {
            Some(index) => {
                let current = &self.documents[index];
                let id = current.get(ID_FIELD).cloned().unwrap_or_default();
                match replacement.get(ID_FIELD) {
                    Some(new_id) if *new_id != id => {
                        return Err(StorageError::InvalidDocument(format!(
                            "replacement changes _id from {id} to {new_id}"
                        )));
                    }
                    _ => {}
                }
                replacement.insert(ID_FIELD.to_string(), id);
                let modified = u64::from(*current != replacement);
                self.documents[index] = replacement.clone();
                Ok((
                    WriteResult {
                        matched_count: 1,
                        modified_count: modified,
                        upserted_id: None,
                    },
                    Some(replacement),
                ))
            }
            None if upsert => {
                if !replacement.contains_key(ID_FIELD) {
                    let id = filter
                        .upsert_seed()
                        .remove(ID_FIELD)
                        .unwrap_or_else(|| DocumentId::generate().into_value());
                    replacement.insert(ID_FIELD.to_string(), id);
                }
                let id = self.insert(replacement.clone())?;
                Ok((
                    WriteResult {
                        upserted_id: Some(id),
                        ..WriteResult::default()
                    },
                    Some(replacement),
                ))
            }
            None => Ok((WriteResult::default(), None)),
        }
    }

    fn apply_at(&mut self, index: usize, update: &Update) -> bool {
        let current = &mut self.documents[index];
        let id = current.get(ID_FIELD).cloned();
        let before = current.clone();
        update.apply(current);
        if let Some(id) = id {
            current.insert(ID_FIELD.to_string(), id);
        }
        *current != before
    }

    pub(crate) fn update_one(
        &mut self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> StorageResult<(WriteResult, Option<Document>)> {
        match self.first_match(filter) {
            Some(index) => {
                let modified = self.apply_at(index, update);
                Ok((
                    WriteResult {
                        matched_count: 1,
                        modified_count: u64::from(modified),
                        upserted_id: None,
                    },
                    Some(self.documents[index].clone()),
                ))
            }
            None if upsert => {
                let document = Self::upsert_document(filter, |seed| update.apply(seed));
                let id = self.insert(document.clone())?;
                Ok((
                    WriteResult {
                        upserted_id: Some(id),
                        ..WriteResult::default()
                    },
                    Some(document),
                ))
            }
            None => Ok((WriteResult::default(), None)),
        }
    }

    pub(crate) fn update_many(&mut self, filter: &Filter, update: &Update) -> WriteResult {
        let matching: Vec<usize> = (0..self.documents.len())
            .filter(|&i| filter.matches(&self.documents[i]))
            .collect();
        let mut result = WriteResult {
            matched_count: matching.len() as u64,
            ..WriteResult::default()
        };
        for index in matching {
            if self.apply_at(index, update) {
                result.modified_count += 1;
            }
        }
        result
    }

    pub(crate) fn delete_one(&mut self, filter: &Filter) -> u64 {
        match self.first_match(filter) {
            Some(index) => {
                self.documents.remove(index);
                1
            }
            None => 0,
        }
    }

    pub(crate) fn delete_many(&mut self, filter: &Filter) -> u64 {
        let before = self.documents.len();
        self.documents.retain(|d| !filter.matches(d));
        (before - self.documents.len()) as u64
    }
}
