//! Local reads and writes on synchronized namespaces.
//!
//! Every write runs under the namespace lock, records the document's
//! pending change for the next local-to-remote phase, and brackets any
//! mutation of an existing document with an undo record so recovery can
//! finish or roll back a write interrupted by a crash.

use crate::dispatch::Outbox;
use crate::error::{SyncError, SyncResult};
use crate::namespace_state::NamespaceSyncState;
use crate::synchronizer::{SyncInner, Synchronizer};
use docsync_protocol::{
    sanitize, ChangeEvent, Document, DocumentId, Filter, Namespace, OperationType, Update,
    UpdateDescription,
    ID_FIELD, VERSION_FIELD,
};
use docsync_storage::DocumentCollection;
use std::collections::HashMap;

/// Result of [`Synchronizer::insert_one`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOneResult {
    /// Id of the inserted document.
    pub inserted_id: DocumentId,
}

/// Result of [`Synchronizer::insert_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertManyResult {
    /// Ids of the inserted documents, in input order.
    pub inserted_ids: Vec<DocumentId>,
}

/// Result of [`Synchronizer::update_one`] and [`Synchronizer::update_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Documents matched by the filter.
    pub matched_count: u64,
    /// Matched documents that changed.
    pub modified_count: u64,
    /// Id of the document created by an upsert.
    pub upserted_id: Option<DocumentId>,
}

/// Result of [`Synchronizer::delete_one`] and [`Synchronizer::delete_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Documents deleted.
    pub deleted_count: u64,
}

impl Synchronizer {
    /// Inserts a document and starts synchronizing it. A document without
    /// `_id` is given a generated one.
    pub fn insert_one(
        &self,
        namespace: &Namespace,
        document: Document,
    ) -> SyncResult<InsertOneResult> {
        let inserted_id = self
            .insert_documents(namespace, vec![document])?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Fatal("insert returned no id".into()))?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Inserts documents and starts synchronizing them.
    ///
    /// Stops at the first failing insert; earlier documents stay inserted.
    pub fn insert_many(
        &self,
        namespace: &Namespace,
        documents: Vec<Document>,
    ) -> SyncResult<InsertManyResult> {
        let inserted_ids = self.insert_documents(namespace, documents)?;
        Ok(InsertManyResult { inserted_ids })
    }

    fn insert_documents(
        &self,
        namespace: &Namespace,
        documents: Vec<Document>,
    ) -> SyncResult<Vec<DocumentId>> {
        let inner = &self.inner;
        let entry = inner.instance.get_or_create(namespace)?;
        let mut outbox = Outbox::default();
        let result = {
            let mut state = entry.state.write();
            let local = inner.local_collection(namespace)?;
            let logical_t = inner.current_logical_t();
            let mut ids = Vec::with_capacity(documents.len());
            let mut failed = None;
            for document in documents {
                match insert_locked(&mut state, local.as_ref(), logical_t, document, &mut outbox) {
                    Ok(id) => ids.push(id),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            match failed {
                Some(e) => Err(e),
                None => Ok(ids),
            }
        };
        outbox.relisten();
        inner.flush(&entry, outbox);
        result
    }

    /// Applies `update` to the first document matching `filter`.
    ///
    /// With `upsert`, a document built from the filter's equalities is
    /// inserted and synchronized when nothing matches.
    pub fn update_one(
        &self,
        namespace: &Namespace,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> SyncResult<UpdateResult> {
        self.with_namespace(namespace, |inner, state, outbox| {
            inner.update_one_locked(state, filter, update, upsert, outbox)
        })
    }

    /// Applies `update` to every document matching `filter`.
    pub fn update_many(
        &self,
        namespace: &Namespace,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> SyncResult<UpdateResult> {
        self.with_namespace(namespace, |inner, state, outbox| {
            inner.update_many_locked(state, filter, update, upsert, outbox)
        })
    }

    /// Deletes the first synchronized document matching `filter`.
    pub fn delete_one(&self, namespace: &Namespace, filter: &Filter) -> SyncResult<DeleteResult> {
        self.with_namespace(namespace, |inner, state, outbox| {
            let local = inner.local_collection(namespace)?;
            let Some(document) = local.find_one(filter)? else {
                return Ok(DeleteResult::default());
            };
            let Some(id) = DocumentId::of(&document).filter(|id| state.contains(id)) else {
                return Ok(DeleteResult::default());
            };
            inner.delete_locked(state, vec![(id, document)], outbox)
        })
    }

    /// Deletes every synchronized document matching `filter`.
    pub fn delete_many(&self, namespace: &Namespace, filter: &Filter) -> SyncResult<DeleteResult> {
        self.with_namespace(namespace, |inner, state, outbox| {
            let local = inner.local_collection(namespace)?;
            let targets: Vec<(DocumentId, Document)> = local
                .find(filter)?
                .into_iter()
                .filter_map(|d| {
                    DocumentId::of(&d)
                        .filter(|id| state.contains(id))
                        .map(|id| (id, d))
                })
                .collect();
            if targets.is_empty() {
                return Ok(DeleteResult::default());
            }
            inner.delete_locked(state, targets, outbox)
        })
    }

    /// Returns every local document matching `filter`.
    pub fn find(&self, namespace: &Namespace, filter: &Filter) -> SyncResult<Vec<Document>> {
        let local = self.inner.local_collection(namespace)?;
        let found = match self.inner.instance.get(namespace) {
            Some(entry) => {
                let _state = entry.state.read();
                local.find(filter)?
            }
            None => local.find(filter)?,
        };
        Ok(found.into_iter().map(sanitize).collect())
    }

    /// Returns the first local document matching `filter`.
    pub fn find_one(&self, namespace: &Namespace, filter: &Filter) -> SyncResult<Option<Document>> {
        Ok(self.find(namespace, filter)?.into_iter().next())
    }

    /// Counts local documents matching `filter`.
    pub fn count(&self, namespace: &Namespace, filter: &Filter) -> SyncResult<u64> {
        Ok(self.find(namespace, filter)?.len() as u64)
    }

    /// Starts synchronizing documents that exist on the remote store.
    ///
    /// The documents are fetched on the next pass.
    pub fn sync(&self, namespace: &Namespace, ids: &[DocumentId]) -> SyncResult<()> {
        self.with_namespace(namespace, |_, state, outbox| {
            for id in ids {
                if state.sync(id)? {
                    state.set_stale(id, true)?;
                    tracing::debug!(ns = %namespace, document_id = %id, "document synchronized");
                }
            }
            outbox.relisten();
            Ok(())
        })
    }

    /// Stops synchronizing documents and removes their local copies.
    /// Pending writes are lost.
    pub fn desync(&self, namespace: &Namespace, ids: &[DocumentId]) -> SyncResult<()> {
        self.with_namespace(namespace, |inner, state, outbox| {
            for id in ids {
                if state.contains(id) {
                    inner.desync_document(state, id)?;
                    tracing::debug!(ns = %namespace, document_id = %id, "document desynchronized");
                }
            }
            outbox.relisten();
            Ok(())
        })
    }

    /// Runs `f` under the namespace write lock, then delivers its outbox.
    fn with_namespace<R>(
        &self,
        namespace: &Namespace,
        f: impl FnOnce(&SyncInner, &mut NamespaceSyncState, &mut Outbox) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let entry = self.inner.instance.get_or_create(namespace)?;
        let mut outbox = Outbox::default();
        let result = {
            let mut state = entry.state.write();
            f(&self.inner, &mut state, &mut outbox)
        };
        self.inner.flush(&entry, outbox);
        result
    }
}

/// Inserts one document and records the pending insert.
fn insert_locked(
    state: &mut NamespaceSyncState,
    local: &dyn DocumentCollection,
    logical_t: i64,
    document: Document,
    outbox: &mut Outbox,
) -> SyncResult<DocumentId> {
    let namespace = state.namespace().clone();
    let mut document = sanitize(document);
    if !document.contains_key(ID_FIELD) {
        document.insert(ID_FIELD.to_string(), DocumentId::generate().into_value());
    }
    let id = local.insert_one(document.clone())?;
    state.sync(&id)?;
    let event = ChangeEvent::insert(&namespace, &id, document, true);
    state.set_pending_write(&id, logical_t, event.clone())?;
    outbox.event(state.change_listener().as_ref(), &id, event);
    Ok(id)
}

/// Removes the version field if an update wrote one.
fn strip_version(
    local: &dyn DocumentCollection,
    id: &DocumentId,
    document: Document,
) -> SyncResult<Document> {
    if !document.contains_key(VERSION_FIELD) {
        return Ok(document);
    }
    let document = sanitize(document);
    local.replace_one(&Filter::by_id(id), document.clone(), false)?;
    Ok(document)
}

impl SyncInner {
    fn update_one_locked(
        &self,
        state: &mut NamespaceSyncState,
        filter: &Filter,
        update: &Update,
        upsert: bool,
        outbox: &mut Outbox,
    ) -> SyncResult<UpdateResult> {
        let namespace = state.namespace().clone();
        let local = self.local_collection(&namespace)?;
        let undo = self.undo_collection(&namespace)?;

        let before = local.find_one(filter)?;
        let before_id = before.as_ref().and_then(DocumentId::of);
        let target = match &before_id {
            Some(id) => Filter::by_id(id),
            None if upsert => filter.clone(),
            None => return Ok(UpdateResult::default()),
        };
        if let (Some(id), Some(before)) = (&before_id, &before) {
            undo.replace_one(&Filter::by_id(id), before.clone(), true)?;
        }
        let clear_undo = |id: &DocumentId| undo.delete_one(&Filter::by_id(id));

        let after = local.find_one_and_update(&target, update, upsert)?;
        let Some((id, after)) = after.and_then(|a| DocumentId::of(&a).map(|id| (id, a))) else {
            if let Some(id) = &before_id {
                clear_undo(id)?;
            }
            return Ok(UpdateResult::default());
        };
        let after = strip_version(local.as_ref(), &id, after)?;
        let logical_t = self.current_logical_t();
        let listener = state.change_listener();

        let Some(before) = before else {
            state.sync(&id)?;
            let event = ChangeEvent::insert(&namespace, &id, after, true);
            state.set_pending_write(&id, logical_t, event.clone())?;
            outbox.event(listener.as_ref(), &id, event);
            outbox.relisten();
            return Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(id),
            });
        };

        if !state.contains(&id) {
            clear_undo(&id)?;
            return Ok(UpdateResult::default());
        }
        let description = UpdateDescription::diff(&before, &after);
        let modified = !description.is_empty();
        if modified {
            let event = ChangeEvent::update(&namespace, &id, description, after, true);
            state.set_pending_write(&id, logical_t, event.clone())?;
            outbox.event(listener.as_ref(), &id, event);
        }
        clear_undo(&id)?;
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: u64::from(modified),
            upserted_id: None,
        })
    }

    fn update_many_locked(
        &self,
        state: &mut NamespaceSyncState,
        filter: &Filter,
        update: &Update,
        upsert: bool,
        outbox: &mut Outbox,
    ) -> SyncResult<UpdateResult> {
        let namespace = state.namespace().clone();
        let local = self.local_collection(&namespace)?;
        let undo = self.undo_collection(&namespace)?;

        let mut before: HashMap<DocumentId, Document> = HashMap::new();
        for document in local.find(filter)? {
            if let Some(id) = DocumentId::of(&document).filter(|id| state.contains(id)) {
                before.insert(id, document);
            }
        }
        if before.is_empty() {
            return if upsert {
                self.update_one_locked(state, filter, update, true, outbox)
            } else {
                Ok(UpdateResult::default())
            };
        }

        for (id, document) in &before {
            undo.replace_one(&Filter::by_id(id), document.clone(), true)?;
        }
        let matched = Filter::ids_in(before.keys());
        local.update_many(&matched, update)?;

        let logical_t = self.current_logical_t();
        let listener = state.change_listener();
        let mut modified_count = 0;
        for after in local.find(&matched)? {
            let Some(id) = DocumentId::of(&after) else {
                continue;
            };
            let Some(previous) = before.get(&id) else {
                continue;
            };
            let after = strip_version(local.as_ref(), &id, after)?;
            let description = UpdateDescription::diff(previous, &after);
            if !description.is_empty() {
                let event = ChangeEvent::update(&namespace, &id, description, after, true);
                state.set_pending_write(&id, logical_t, event.clone())?;
                outbox.event(listener.as_ref(), &id, event);
                modified_count += 1;
            }
            undo.delete_one(&Filter::by_id(&id))?;
        }
        Ok(UpdateResult {
            matched_count: before.len() as u64,
            modified_count,
            upserted_id: None,
        })
    }

    /// Deletes synchronized documents locally and records the deletes.
    fn delete_locked(
        &self,
        state: &mut NamespaceSyncState,
        targets: Vec<(DocumentId, Document)>,
        outbox: &mut Outbox,
    ) -> SyncResult<DeleteResult> {
        let namespace = state.namespace().clone();
        let local = self.local_collection(&namespace)?;
        let undo = self.undo_collection(&namespace)?;

        for (id, document) in &targets {
            undo.replace_one(&Filter::by_id(id), document.clone(), true)?;
        }
        let deleted_count = local.delete_many(&Filter::ids_in(targets.iter().map(|(id, _)| id)))?;

        let logical_t = self.current_logical_t();
        let listener = state.change_listener();
        for (id, _) in &targets {
            let pending_insert = state
                .get(id)
                .and_then(|d| d.uncommitted_change_event())
                .is_some_and(|e| e.operation_type == OperationType::Insert);
            if pending_insert {
                // never reached the remote store; nothing to push
                state.desync(id)?;
                outbox.event(listener.as_ref(), id, ChangeEvent::delete(&namespace, id, false));
                outbox.relisten();
            } else {
                let event = ChangeEvent::delete(&namespace, id, true);
                state.set_pending_write(id, logical_t, event.clone())?;
                outbox.event(listener.as_ref(), id, event);
            }
            undo.delete_one(&Filter::by_id(id))?;
        }
        Ok(DeleteResult { deleted_count })
    }
}

#[cfg(test)]
mod tests {
    use crate::{MemoryRemote, SyncConfig, Synchronizer};
    use docsync_protocol::{doc, ChangeEvent, DocumentId, Filter, Namespace, OperationType, Update};
    use docsync_storage::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn engine() -> (Synchronizer, Arc<MemoryStore>, Namespace) {
        let store = Arc::new(MemoryStore::new());
        let engine = Synchronizer::new(
            SyncConfig::new("crud").with_background_loop(false),
            store.clone(),
            Arc::new(MemoryRemote::new()),
        )
        .unwrap();
        (engine, store, Namespace::new("db", "coll"))
    }

    fn pending_op(engine: &Synchronizer, ns: &Namespace, id: &DocumentId) -> Option<OperationType> {
        engine
            .document_state(ns, id)
            .and_then(|s| s.uncommitted_change_event().map(|e| e.operation_type))
    }

    #[test]
    fn insert_assigns_ids_and_records_pending_inserts() {
        let (engine, _, ns) = engine();
        let given = engine.insert_one(&ns, doc(json!({"_id": "a", "n": 1}))).unwrap();
        assert_eq!(given.inserted_id, DocumentId::from("a"));

        let generated = engine.insert_one(&ns, doc(json!({"n": 2}))).unwrap();
        assert!(generated.inserted_id.as_value().is_string());

        assert_eq!(engine.synced_ids(&ns).len(), 2);
        assert_eq!(pending_op(&engine, &ns, &given.inserted_id), Some(OperationType::Insert));
        assert_eq!(engine.count(&ns, &Filter::All).unwrap(), 2);
    }

    #[test]
    fn insert_strips_the_version_field() {
        let (engine, _, ns) = engine();
        engine
            .insert_one(&ns, doc(json!({"_id": "a", "__stitch_sync_version": {"v": 1}})))
            .unwrap();
        let found = engine.find_one(&ns, &Filter::All).unwrap().unwrap();
        assert!(!found.contains_key(docsync_protocol::VERSION_FIELD));
    }

    #[test]
    fn update_after_insert_stays_an_insert() {
        let (engine, _, ns) = engine();
        let id = engine.insert_one(&ns, doc(json!({"_id": "a", "n": 1}))).unwrap().inserted_id;
        let result = engine
            .update_one(&ns, &Filter::by_id(&id), &Update::new().set("n", 2), false)
            .unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.modified_count, 1);

        let state = engine.document_state(&ns, &id).unwrap();
        let pending = state.uncommitted_change_event().unwrap();
        assert_eq!(pending.operation_type, OperationType::Insert);
        assert_eq!(pending.full_document.as_ref().unwrap().get("n"), Some(&json!(2)));
    }

    #[test]
    fn update_without_match_or_change() {
        let (engine, _, ns) = engine();
        let missing = engine
            .update_one(&ns, &Filter::eq("n", 9), &Update::new().set("n", 1), false)
            .unwrap();
        assert_eq!(missing, crate::UpdateResult::default());

        engine.insert_one(&ns, doc(json!({"_id": "a", "n": 1}))).unwrap();
        let unchanged = engine
            .update_one(&ns, &Filter::eq("n", 1), &Update::new().set("n", 1), false)
            .unwrap();
        assert_eq!(unchanged.matched_count, 1);
        assert_eq!(unchanged.modified_count, 0);
    }

    #[test]
    fn upsert_inserts_and_synchronizes() {
        let (engine, _, ns) = engine();
        let result = engine
            .update_one(&ns, &Filter::eq("_id", "u"), &Update::new().set("n", 1), true)
            .unwrap();
        let id = result.upserted_id.unwrap();
        assert_eq!(id, DocumentId::from("u"));
        assert_eq!(pending_op(&engine, &ns, &id), Some(OperationType::Insert));
        assert_eq!(
            engine.find_one(&ns, &Filter::by_id(&id)).unwrap().unwrap().get("n"),
            Some(&json!(1))
        );
    }

    #[test]
    fn update_many_counts_matches_and_modifications() {
        let (engine, _, ns) = engine();
        engine
            .insert_many(
                &ns,
                vec![
                    doc(json!({"_id": 1, "kind": "a", "n": 0})),
                    doc(json!({"_id": 2, "kind": "a", "n": 5})),
                    doc(json!({"_id": 3, "kind": "b", "n": 0})),
                ],
            )
            .unwrap();
        let result = engine
            .update_many(&ns, &Filter::eq("kind", "a"), &Update::new().set("n", 5), false)
            .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 1);
        assert_eq!(engine.count(&ns, &Filter::eq("n", 5)).unwrap(), 2);
    }

    #[test]
    fn deleting_a_pending_insert_desyncs_it() {
        let (engine, _, ns) = engine();
        let id = engine.insert_one(&ns, doc(json!({"_id": "a"}))).unwrap().inserted_id;
        let result = engine.delete_one(&ns, &Filter::by_id(&id)).unwrap();
        assert_eq!(result.deleted_count, 1);
        assert!(engine.synced_ids(&ns).is_empty());
        assert_eq!(engine.count(&ns, &Filter::All).unwrap(), 0);
    }

    #[test]
    fn writes_leave_no_undo_records() {
        let (engine, store, ns) = engine();
        engine.insert_many(&ns, vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))]).unwrap();
        engine
            .update_many(&ns, &Filter::All, &Update::new().set("x", true), false)
            .unwrap();
        engine.delete_many(&ns, &Filter::All).unwrap();

        let undo = store.memory_collection(&SyncConfig::undo_collection(&ns));
        assert!(undo.snapshot().is_empty());
    }

    #[test]
    fn listener_sees_local_writes_in_order() {
        let (engine, _, ns) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .configure(
                &ns,
                crate::ConflictPolicy::RemoteWins,
                Some(Arc::new(move |_: &DocumentId, e: &ChangeEvent| {
                    sink.lock().push((e.operation_type, e.has_uncommitted_writes));
                })),
                None,
            )
            .unwrap();
        let id = engine.insert_one(&ns, doc(json!({"_id": "a", "n": 1}))).unwrap().inserted_id;
        engine
            .update_one(&ns, &Filter::by_id(&id), &Update::new().set("n", 2), false)
            .unwrap();
        engine.wait_for_listeners();

        assert_eq!(
            *seen.lock(),
            vec![(OperationType::Insert, true), (OperationType::Update, true)]
        );
    }

    #[test]
    fn sync_and_desync_manage_ids() {
        let (engine, _, ns) = engine();
        let id = DocumentId::from("remote-only");
        engine.sync(&ns, std::slice::from_ref(&id)).unwrap();
        let state = engine.document_state(&ns, &id).unwrap();
        assert!(state.is_stale());

        engine.desync(&ns, std::slice::from_ref(&id)).unwrap();
        assert!(engine.document_state(&ns, &id).is_none());
    }
}
