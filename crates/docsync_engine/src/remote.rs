//! Remote store abstraction.
//!
//! The engine talks to the remote store through [`RemoteClient`]: guarded
//! CRUD on per-namespace [`RemoteCollection`]s and a change stream per
//! namespace delivered to a [`ChangeStreamSink`]. Reconnects and backoff are
//! the client's business; the engine only needs to be told when a stream
//! opens.

use crate::error::{SyncError, SyncResult};
use docsync_protocol::{
    ChangeEvent, Document, DocumentId, Filter, Namespace, Update, UpdateDescription, VersionStamp,
};
use docsync_storage::{DocumentCollection, InMemoryCollection};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// One collection of the remote store.
pub trait RemoteCollection: Send + Sync {
    /// The namespace this handle writes to.
    fn namespace(&self) -> &Namespace;

    /// Returns every document matching `filter`.
    fn find(&self, filter: &Filter) -> SyncResult<Vec<Document>>;

    /// Returns the first document matching `filter`.
    fn find_one(&self, filter: &Filter) -> SyncResult<Option<Document>> {
        Ok(self.find(filter)?.into_iter().next())
    }

    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateKey`] if the id is taken.
    fn insert_one(&self, document: Document) -> SyncResult<()>;

    /// Replaces the first match. Returns the number matched.
    fn replace_one(&self, filter: &Filter, replacement: Document) -> SyncResult<u64>;

    /// Updates the first match. Returns the number matched.
    fn update_one(&self, filter: &Filter, update: &Update) -> SyncResult<u64>;

    /// Deletes the first match. Returns the number deleted.
    fn delete_one(&self, filter: &Filter) -> SyncResult<u64>;
}

/// Receives the events of one change stream.
pub trait ChangeStreamSink: Send + Sync {
    /// The stream is open; events may have been missed before this point.
    fn on_open(&self);

    /// A change to a watched document.
    fn on_event(&self, event: ChangeEvent);

    /// The stream closed.
    fn on_close(&self);
}

/// An open change stream.
pub trait StreamHandle: Send + Sync {
    /// Closes the stream.
    fn close(&self);

    /// Returns true until the stream closes.
    fn is_open(&self) -> bool;
}

/// A connection to the remote store.
pub trait RemoteClient: Send + Sync {
    /// Returns the collection for `namespace`.
    fn collection(&self, namespace: &Namespace) -> Arc<dyn RemoteCollection>;

    /// Opens a change stream over `ids` in `namespace`.
    fn watch(
        &self,
        namespace: &Namespace,
        ids: &[DocumentId],
        sink: Arc<dyn ChangeStreamSink>,
    ) -> SyncResult<Box<dyn StreamHandle>>;
}

/// An in-memory remote store for tests and local development.
///
/// Every successful write is delivered to the watchers of its document,
/// including writes made by the engine itself. Sinks are called on the
/// writing thread after the store's own locks are released.
///
/// # Example
///
/// ```rust
/// use docsync_engine::{MemoryRemote, RemoteClient};
/// use docsync_protocol::{doc, Filter, Namespace};
/// use serde_json::json;
///
/// let remote = MemoryRemote::new();
/// let ns = Namespace::new("app", "todos");
/// remote.collection(&ns).insert_one(doc(json!({"_id": 1}))).unwrap();
/// assert_eq!(remote.documents(&ns).len(), 1);
///
/// remote.set_online(false);
/// assert!(remote.collection(&ns).find(&Filter::All).is_err());
/// ```
#[derive(Clone, Default)]
pub struct MemoryRemote {
    shared: Arc<RemoteShared>,
}

#[derive(Default)]
struct RemoteShared {
    collections: Mutex<HashMap<Namespace, Arc<InMemoryCollection>>>,
    watchers: Mutex<Vec<Watcher>>,
    write_lock: Mutex<()>,
    offline: AtomicBool,
    next_watch_id: AtomicU64,
    writes: AtomicU64,
}

struct Watcher {
    id: u64,
    namespace: Namespace,
    ids: HashSet<DocumentId>,
    sink: Weak<dyn ChangeStreamSink>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("online", &self.is_online())
            .field("writes", &self.write_count())
            .finish()
    }
}

impl MemoryRemote {
    /// Creates an empty, online remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the remote on or off. Going offline closes every stream.
    pub fn set_online(&self, online: bool) {
        self.shared.offline.store(!online, Ordering::SeqCst);
        if !online {
            let closed: Vec<Watcher> = self.shared.watchers.lock().drain(..).collect();
            for watcher in closed {
                watcher.open.store(false, Ordering::SeqCst);
                if let Some(sink) = watcher.sink.upgrade() {
                    sink.on_close();
                }
            }
        }
    }

    /// Returns true unless switched offline.
    pub fn is_online(&self) -> bool {
        !self.shared.offline.load(Ordering::SeqCst)
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Number of open change streams.
    pub fn open_streams(&self) -> usize {
        self.shared.watchers.lock().len()
    }

    /// Every document in `namespace`, stamps included.
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.shared.collection(namespace).snapshot()
    }

    /// One document, stamp included.
    pub fn document(&self, namespace: &Namespace, id: &DocumentId) -> Option<Document> {
        self.shared
            .collection(namespace)
            .find_one(&Filter::by_id(id))
            .ok()
            .flatten()
    }

    /// Writes `document` as another client of the same lineage would: the
    /// stamp advances from whatever the remote copy holds, and a missing
    /// document is created with a fresh stamp.
    pub fn write_as_other_client(
        &self,
        namespace: &Namespace,
        mut document: Document,
    ) -> SyncResult<()> {
        let id = docsync_protocol::require_id(&document)?;
        let collection = self.collection(namespace);
        match collection.find_one(&Filter::by_id(&id))? {
            Some(current) => {
                let stamp = VersionStamp::extract(&current)?;
                VersionStamp::next_after(stamp.as_ref()).stamp(&mut document);
                collection.replace_one(&Filter::by_id(&id), document)?;
            }
            None => {
                VersionStamp::fresh().stamp(&mut document);
                collection.insert_one(document)?;
            }
        }
        Ok(())
    }

    /// Writes `document` as a client of another lineage would, for example
    /// after the remote copy was dropped and recreated: the stamp is always
    /// fresh, so it cannot be ordered against earlier ones.
    pub fn write_as_new_lineage(
        &self,
        namespace: &Namespace,
        mut document: Document,
    ) -> SyncResult<()> {
        let id = docsync_protocol::require_id(&document)?;
        VersionStamp::fresh().stamp(&mut document);
        let collection = self.collection(namespace);
        if collection.replace_one(&Filter::by_id(&id), document.clone())? == 0 {
            collection.insert_one(document)?;
        }
        Ok(())
    }

    /// Deletes a document as another client would.
    pub fn delete_as_other_client(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> SyncResult<u64> {
        self.collection(namespace).delete_one(&Filter::by_id(id))
    }
}

impl RemoteShared {
    fn collection(&self, namespace: &Namespace) -> Arc<InMemoryCollection> {
        Arc::clone(
            self.collections
                .lock()
                .entry(namespace.clone())
                .or_insert_with(|| Arc::new(InMemoryCollection::new(&namespace.to_string()))),
        )
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::remote_retryable("remote is offline"));
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let Some(id) = event.document_id() else {
            return;
        };
        let sinks: Vec<Arc<dyn ChangeStreamSink>> = self
            .watchers
            .lock()
            .iter()
            .filter(|w| w.namespace == event.namespace && w.ids.contains(&id))
            .filter_map(|w| w.sink.upgrade())
            .collect();
        for sink in sinks {
            sink.on_event(event.clone());
        }
    }
}

impl RemoteClient for MemoryRemote {
    fn collection(&self, namespace: &Namespace) -> Arc<dyn RemoteCollection> {
        Arc::new(MemoryRemoteCollection {
            namespace: namespace.clone(),
            data: self.shared.collection(namespace),
            shared: Arc::clone(&self.shared),
        })
    }

    fn watch(
        &self,
        namespace: &Namespace,
        ids: &[DocumentId],
        sink: Arc<dyn ChangeStreamSink>,
    ) -> SyncResult<Box<dyn StreamHandle>> {
        self.shared.check_online()?;
        let id = self.shared.next_watch_id.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        self.shared.watchers.lock().push(Watcher {
            id,
            namespace: namespace.clone(),
            ids: ids.iter().cloned().collect(),
            sink: Arc::downgrade(&sink),
            open: Arc::clone(&open),
        });
        sink.on_open();
        Ok(Box::new(MemoryStream {
            id,
            open,
            sink: Arc::downgrade(&sink),
            shared: Arc::downgrade(&self.shared),
        }))
    }
}

struct MemoryRemoteCollection {
    namespace: Namespace,
    data: Arc<InMemoryCollection>,
    shared: Arc<RemoteShared>,
}

impl RemoteCollection for MemoryRemoteCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn find(&self, filter: &Filter) -> SyncResult<Vec<Document>> {
        self.shared.check_online()?;
        Ok(self.data.find(filter)?)
    }

    fn insert_one(&self, document: Document) -> SyncResult<()> {
        self.shared.check_online()?;
        let id = match self.data.insert_one(document.clone()) {
            Ok(id) => id,
            Err(e) if e.is_duplicate_key() => return Err(SyncError::DuplicateKey(e.to_string())),
            Err(e) => return Err(e.into()),
        };
        self.shared
            .publish(ChangeEvent::insert(&self.namespace, &id, document, false));
        Ok(())
    }

    fn replace_one(&self, filter: &Filter, replacement: Document) -> SyncResult<u64> {
        self.shared.check_online()?;
        let Some(after) = self.data.find_one_and_replace(filter, replacement, false)? else {
            return Ok(0);
        };
        if let Some(id) = DocumentId::of(&after) {
            self.shared
                .publish(ChangeEvent::replace(&self.namespace, &id, after, false));
        }
        Ok(1)
    }

    fn update_one(&self, filter: &Filter, update: &Update) -> SyncResult<u64> {
        self.shared.check_online()?;
        let guard = self.shared.write_lock.lock();
        let Some(before) = self.data.find_one(filter)? else {
            return Ok(0);
        };
        let Some(id) = DocumentId::of(&before) else {
            return Ok(0);
        };
        let Some(after) = self
            .data
            .find_one_and_update(&Filter::by_id(&id).and(filter.clone()), update, false)?
        else {
            return Ok(0);
        };
        drop(guard);
        let mut description = UpdateDescription::diff(&before, &after);
        if let Some(stamp) = after.get(docsync_protocol::VERSION_FIELD) {
            description
                .updated_fields
                .insert(docsync_protocol::VERSION_FIELD.to_string(), stamp.clone());
        }
        self.shared
            .publish(ChangeEvent::update(&self.namespace, &id, description, after, false));
        Ok(1)
    }

    fn delete_one(&self, filter: &Filter) -> SyncResult<u64> {
        self.shared.check_online()?;
        let guard = self.shared.write_lock.lock();
        let Some(doomed) = self.data.find_one(filter)? else {
            return Ok(0);
        };
        let Some(id) = DocumentId::of(&doomed) else {
            return Ok(0);
        };
        let deleted = self.data.delete_one(&Filter::by_id(&id).and(filter.clone()))?;
        drop(guard);
        if deleted > 0 {
            self.shared
                .publish(ChangeEvent::delete(&self.namespace, &id, false));
        }
        Ok(deleted)
    }
}

struct MemoryStream {
    id: u64,
    open: Arc<AtomicBool>,
    sink: Weak<dyn ChangeStreamSink>,
    shared: Weak<RemoteShared>,
}

impl StreamHandle for MemoryStream {
    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.watchers.lock().retain(|w| w.id != self.id);
        }
        if let Some(sink) = self.sink.upgrade() {
            sink.on_close();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{doc, OperationType, VersionOrdering};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        opened: AtomicUsize,
        closed: AtomicUsize,
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeStreamSink for RecordingSink {
        fn on_open(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn on_event(&self, event: ChangeEvent) {
            self.events.lock().push(event);
        }

        fn on_close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    #[test]
    fn watchers_see_writes_to_watched_ids_only() {
        let remote = MemoryRemote::new();
        let sink = Arc::new(RecordingSink::default());
        let handle = remote
            .watch(&ns(), &[DocumentId::from("a")], sink.clone())
            .unwrap();
        assert_eq!(sink.opened.load(Ordering::SeqCst), 1);

        let coll = remote.collection(&ns());
        coll.insert_one(doc(json!({"_id": "a", "n": 1}))).unwrap();
        coll.insert_one(doc(json!({"_id": "b", "n": 1}))).unwrap();
        coll.update_one(&Filter::eq("_id", "a"), &Update::new().set("n", 2))
            .unwrap();
        coll.delete_one(&Filter::eq("_id", "a")).unwrap();

        let ops: Vec<OperationType> = sink.events.lock().iter().map(|e| e.operation_type).collect();
        assert_eq!(
            ops,
            vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
        );
        let update = &sink.events.lock()[1];
        assert_eq!(
            update.update_description.as_ref().unwrap().updated_fields,
            doc(json!({"n": 2}))
        );
        assert_eq!(update.full_document, Some(doc(json!({"_id": "a", "n": 2}))));

        handle.close();
        assert!(!handle.is_open());
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
        assert_eq!(remote.open_streams(), 0);
        assert_eq!(remote.write_count(), 4);
    }

    #[test]
    fn guarded_writes_report_matches() {
        let remote = MemoryRemote::new();
        let coll = remote.collection(&ns());
        let id = DocumentId::from("a");
        let stamp = VersionStamp::fresh();
        let mut document = doc(json!({"_id": "a"}));
        stamp.stamp(&mut document);
        coll.insert_one(document.clone()).unwrap();

        assert!(matches!(
            coll.insert_one(document.clone()),
            Err(SyncError::DuplicateKey(_))
        ));
        assert_eq!(
            coll.replace_one(&VersionStamp::filter_for(&id, Some(&stamp.next())), document.clone())
                .unwrap(),
            0
        );
        assert_eq!(
            coll.update_one(&VersionStamp::filter_for(&id, None), &Update::new().set("x", 1))
                .unwrap(),
            0
        );
        assert_eq!(
            coll.delete_one(&VersionStamp::filter_for(&id, Some(&stamp))).unwrap(),
            1
        );
    }

    #[test]
    fn offline_rejects_everything_and_closes_streams() {
        let remote = MemoryRemote::new();
        let sink = Arc::new(RecordingSink::default());
        let handle = remote.watch(&ns(), &[DocumentId::from(1)], sink.clone()).unwrap();

        remote.set_online(false);
        assert!(!handle.is_open());
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
        assert!(remote.collection(&ns()).find(&Filter::All).unwrap_err().is_retryable());
        assert!(remote.watch(&ns(), &[], sink).is_err());

        remote.set_online(true);
        assert!(remote.collection(&ns()).find(&Filter::All).unwrap().is_empty());
    }

    #[test]
    fn other_client_writes_advance_the_lineage() {
        let remote = MemoryRemote::new();
        let id = DocumentId::from("x");
        remote
            .write_as_other_client(&ns(), doc(json!({"_id": "x", "a": 1})))
            .unwrap();
        let first = VersionStamp::extract(&remote.document(&ns(), &id).unwrap())
            .unwrap()
            .unwrap();
        remote
            .write_as_other_client(&ns(), doc(json!({"_id": "x", "a": 2})))
            .unwrap();
        let second = VersionStamp::extract(&remote.document(&ns(), &id).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(second, first.next());
        assert_eq!(remote.delete_as_other_client(&ns(), &id).unwrap(), 1);
        assert!(remote.document(&ns(), &id).is_none());
    }

    #[test]
    fn new_lineage_writes_cannot_be_ordered() {
        let remote = MemoryRemote::new();
        let id = DocumentId::from("x");
        remote
            .write_as_other_client(&ns(), doc(json!({"_id": "x", "a": 1})))
            .unwrap();
        let before = VersionStamp::extract(&remote.document(&ns(), &id).unwrap())
            .unwrap()
            .unwrap();
        remote
            .write_as_new_lineage(&ns(), doc(json!({"_id": "x", "a": 2})))
            .unwrap();
        let after = remote.document(&ns(), &id).unwrap();
        assert_eq!(after.get("a"), Some(&json!(2)));
        let after = VersionStamp::extract(&after).unwrap().unwrap();
        assert_eq!(after.compare(&before), VersionOrdering::Unorderable);

        remote
            .write_as_new_lineage(&ns(), doc(json!({"_id": "y"})))
            .unwrap();
        assert_eq!(remote.documents(&ns()).len(), 2);
    }
}
