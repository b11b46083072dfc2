//! Per-namespace synchronization state.

use crate::doc_state::DocumentSyncState;
use crate::error::SyncResult;
use crate::listener::{ChangeEventListener, ConflictHandler};
use docsync_protocol::{ChangeEvent, DocumentId, Filter, Namespace, VersionStamp, ID_FIELD};
use docsync_storage::DocumentCollection;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// The synchronized documents of one namespace, written through to the
/// document records collection on every mutation.
///
/// A namespace becomes configured once a conflict handler is attached; the
/// engine does not reconcile unconfigured namespaces.
///
/// Every mutation goes through `&mut self`, so callers hold the
/// namespace's write lock for its duration.
pub struct NamespaceSyncState {
    namespace: Namespace,
    documents: HashMap<DocumentId, DocumentSyncState>,
    records: Arc<dyn DocumentCollection>,
    conflict_handler: Option<Arc<dyn ConflictHandler>>,
    change_listener: Option<Arc<dyn ChangeEventListener>>,
}

impl fmt::Debug for NamespaceSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceSyncState")
            .field("namespace", &self.namespace)
            .field("documents", &self.documents.len())
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl NamespaceSyncState {
    /// Loads every document record of `namespace`.
    pub(crate) fn load(
        namespace: Namespace,
        records: Arc<dyn DocumentCollection>,
    ) -> SyncResult<Self> {
        let mut documents = HashMap::new();
        for record in records.find(&Filter::eq(format!("{ID_FIELD}.ns"), namespace.to_string()))? {
            let state = DocumentSyncState::from_record(record)?;
            documents.insert(state.document_id().clone(), state);
        }
        Ok(Self {
            namespace,
            documents,
            records,
            conflict_handler: None,
            change_listener: None,
        })
    }

    /// The namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Attaches the handlers that make this namespace configured.
    pub(crate) fn configure(
        &mut self,
        conflict_handler: Arc<dyn ConflictHandler>,
        change_listener: Option<Arc<dyn ChangeEventListener>>,
    ) {
        self.conflict_handler = Some(conflict_handler);
        self.change_listener = change_listener;
    }

    /// Returns true once a conflict handler is attached.
    pub fn is_configured(&self) -> bool {
        self.conflict_handler.is_some()
    }

    pub(crate) fn conflict_handler(&self) -> Option<Arc<dyn ConflictHandler>> {
        self.conflict_handler.clone()
    }

    pub(crate) fn change_listener(&self) -> Option<Arc<dyn ChangeEventListener>> {
        self.change_listener.clone()
    }

    /// The state of one document.
    pub fn get(&self, document_id: &DocumentId) -> Option<&DocumentSyncState> {
        self.documents.get(document_id)
    }

    /// Returns true if the document is synchronized.
    pub fn contains(&self, document_id: &DocumentId) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Iterates over every synchronized document.
    pub fn documents(&self) -> impl Iterator<Item = &DocumentSyncState> {
        self.documents.values()
    }

    /// Number of synchronized documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if no document is synchronized.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Ids of every synchronized document.
    pub fn synced_ids(&self) -> HashSet<DocumentId> {
        self.documents.keys().cloned().collect()
    }

    /// Ids of every paused document.
    pub fn paused_ids(&self) -> HashSet<DocumentId> {
        self.ids_where(DocumentSyncState::is_paused)
    }

    /// Ids of every stale document.
    pub fn stale_ids(&self) -> HashSet<DocumentId> {
        self.ids_where(DocumentSyncState::is_stale)
    }

    /// Ids of every document with a pending local write.
    pub fn pending_ids(&self) -> HashSet<DocumentId> {
        self.ids_where(DocumentSyncState::has_uncommitted_writes)
    }

    fn ids_where(&self, predicate: impl Fn(&DocumentSyncState) -> bool) -> HashSet<DocumentId> {
        self.documents
            .values()
            .filter(|d| predicate(d))
            .map(|d| d.document_id().clone())
            .collect()
    }

    /// Starts synchronizing a document. Returns false if it already was.
    pub(crate) fn sync(&mut self, document_id: &DocumentId) -> SyncResult<bool> {
        if self.documents.contains_key(document_id) {
            return Ok(false);
        }
        let state = DocumentSyncState::new(self.namespace.clone(), document_id.clone());
        self.persist(&state)?;
        self.documents.insert(document_id.clone(), state);
        Ok(true)
    }

    /// Stops synchronizing a document, dropping its record.
    pub(crate) fn desync(&mut self, document_id: &DocumentId) -> SyncResult<()> {
        self.records.delete_one(&Self::record_filter(&self.namespace, document_id))?;
        self.documents.remove(document_id);
        Ok(())
    }

    pub(crate) fn set_pending_write(
        &mut self,
        document_id: &DocumentId,
        logical_t: i64,
        event: ChangeEvent,
    ) -> SyncResult<()> {
        self.mutate(document_id, |d| d.set_pending_write(logical_t, event))
    }

    pub(crate) fn set_pending_write_at_version(
        &mut self,
        document_id: &DocumentId,
        logical_t: i64,
        version: Option<VersionStamp>,
        event: ChangeEvent,
    ) -> SyncResult<()> {
        self.mutate(document_id, |d| d.set_pending_write_at_version(logical_t, version, event))
    }

    pub(crate) fn commit_pending_write(
        &mut self,
        document_id: &DocumentId,
        version: Option<VersionStamp>,
    ) -> SyncResult<()> {
        self.mutate(document_id, |d| d.commit_pending_write(version))
    }

    pub(crate) fn set_stale(&mut self, document_id: &DocumentId, stale: bool) -> SyncResult<()> {
        self.mutate(document_id, |d| d.set_stale(stale))
    }

    /// Marks every document stale, forcing a remote lookup on the next pass.
    pub(crate) fn set_all_stale(&mut self, stale: bool) -> SyncResult<()> {
        let ids: Vec<DocumentId> = self.documents.keys().cloned().collect();
        for id in ids {
            self.set_stale(&id, stale)?;
        }
        Ok(())
    }

    pub(crate) fn pause(&mut self, document_id: &DocumentId) -> SyncResult<()> {
        self.mutate(document_id, |d| d.set_paused(true))
    }

    /// Resumes a paused document. Returns false if it is not synchronized.
    pub(crate) fn resume(&mut self, document_id: &DocumentId) -> SyncResult<bool> {
        if !self.contains(document_id) {
            return Ok(false);
        }
        self.mutate(document_id, |d| d.set_paused(false))?;
        Ok(true)
    }

    /// Applies `f` to a synchronized document and persists the result.
    /// Unknown ids are ignored.
    fn mutate(
        &mut self,
        document_id: &DocumentId,
        f: impl FnOnce(&mut DocumentSyncState),
    ) -> SyncResult<()> {
        let Some(current) = self.documents.get(document_id) else {
            return Ok(());
        };
        let mut next = current.clone();
        f(&mut next);
        self.persist(&next)?;
        self.documents.insert(document_id.clone(), next);
        Ok(())
    }

    fn persist(&self, state: &DocumentSyncState) -> SyncResult<()> {
        self.records.replace_one(
            &Self::record_filter(&self.namespace, state.document_id()),
            state.to_record()?,
            true,
        )?;
        Ok(())
    }

    fn record_filter(namespace: &Namespace, document_id: &DocumentId) -> Filter {
        Filter::Eq(
            ID_FIELD.to_string(),
            DocumentSyncState::record_key(namespace, document_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ConflictPolicy;
    use docsync_protocol::doc;
    use docsync_storage::InMemoryCollection;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    fn records() -> Arc<InMemoryCollection> {
        Arc::new(InMemoryCollection::new("sync_config_default.documents"))
    }

    #[test]
    fn mutations_write_through() {
        let records = records();
        let id = DocumentId::from("a");
        {
            let mut state = NamespaceSyncState::load(ns(), records.clone()).unwrap();
            assert!(state.sync(&id).unwrap());
            assert!(!state.sync(&id).unwrap());
            let insert = ChangeEvent::insert(&ns(), &id, doc(json!({"_id": "a"})), true);
            state.set_pending_write(&id, 3, insert).unwrap();
            state.pause(&id).unwrap();
        }

        let reloaded = NamespaceSyncState::load(ns(), records.clone()).unwrap();
        let doc_state = reloaded.get(&id).unwrap();
        assert!(doc_state.has_uncommitted_writes());
        assert!(doc_state.is_paused());
        assert_eq!(doc_state.last_resolution(), 3);
        assert_eq!(reloaded.paused_ids(), HashSet::from([id.clone()]));
        assert_eq!(reloaded.pending_ids(), HashSet::from([id]));
        assert_eq!(records.snapshot().len(), 1);
    }

    #[test]
    fn load_only_sees_its_namespace() {
        let records = records();
        let mut first = NamespaceSyncState::load(ns(), records.clone()).unwrap();
        first.sync(&DocumentId::from(1)).unwrap();
        let mut other =
            NamespaceSyncState::load(Namespace::new("db", "other"), records.clone()).unwrap();
        other.sync(&DocumentId::from(1)).unwrap();

        assert_eq!(NamespaceSyncState::load(ns(), records.clone()).unwrap().len(), 1);
        assert_eq!(records.snapshot().len(), 2);
    }

    #[test]
    fn desync_drops_record() {
        let records = records();
        let id = DocumentId::from("a");
        let mut state = NamespaceSyncState::load(ns(), records.clone()).unwrap();
        state.sync(&id).unwrap();
        state.desync(&id).unwrap();
        assert!(state.is_empty());
        assert!(records.snapshot().is_empty());
        assert!(!state.resume(&id).unwrap());
    }

    #[test]
    fn set_all_stale_marks_every_document() {
        let mut state = NamespaceSyncState::load(ns(), records()).unwrap();
        for i in 0..3 {
            state.sync(&DocumentId::from(i)).unwrap();
        }
        state.set_all_stale(true).unwrap();
        assert_eq!(state.stale_ids().len(), 3);
        state.set_stale(&DocumentId::from(1), false).unwrap();
        assert_eq!(state.stale_ids().len(), 2);
    }

    #[test]
    fn configured_once_handler_attached() {
        let mut state = NamespaceSyncState::load(ns(), records()).unwrap();
        assert!(!state.is_configured());
        state.configure(Arc::new(ConflictPolicy::RemoteWins), None);
        assert!(state.is_configured());
        assert!(state.conflict_handler().is_some());
        assert!(state.change_listener().is_none());
    }
}
