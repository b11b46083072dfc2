//! Typed access to one synchronized namespace.
//!
//! The engine works on [`Document`]s. [`SyncCollection`] converts payloads
//! with a `serde_json` round trip at its boundary, so hosts can use their own
//! types for documents, conflict handlers and listeners.

use crate::crud::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
use crate::error::{SyncError, SyncResult};
use crate::listener::{BoxError, ChangeEventListener, ErrorListener};
use crate::synchronizer::Synchronizer;
use docsync_protocol::{
    from_document, to_document, ChangeEvent, Document, DocumentId, Filter, Namespace, Update,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// A namespace viewed through the payload type `T`.
pub struct SyncCollection<T> {
    engine: Synchronizer,
    namespace: Namespace,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for SyncCollection<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            namespace: self.namespace.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SyncCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCollection")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<T> SyncCollection<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Wraps `namespace` of `engine`.
    pub fn new(engine: Synchronizer, namespace: Namespace) -> Self {
        Self {
            engine,
            namespace,
            _payload: PhantomData,
        }
    }

    /// The wrapped namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Synchronizer {
        &self.engine
    }

    /// Configures the namespace with a typed conflict handler and listener.
    ///
    /// A payload that fails to decode is reported to the handler's caller as
    /// a conflict-handler failure, which pauses the document. Listener
    /// events that fail to decode are logged and skipped.
    pub fn configure<H, L>(
        &self,
        conflict_handler: H,
        change_listener: Option<L>,
        error_listener: Option<Arc<dyn ErrorListener>>,
    ) -> SyncResult<()>
    where
        H: Fn(&DocumentId, &ChangeEvent<T>, &ChangeEvent<T>) -> Result<Option<T>, BoxError>
            + Send
            + Sync
            + 'static,
        L: Fn(&DocumentId, &ChangeEvent<T>) + Send + Sync + 'static,
    {
        let handler = move |id: &DocumentId,
                            local: &ChangeEvent,
                            remote: &ChangeEvent|
              -> Result<Option<Document>, BoxError> {
            let local = local.decode::<T>()?;
            let remote = remote.decode::<T>()?;
            match conflict_handler(id, &local, &remote)? {
                Some(resolved) => Ok(Some(to_document(&resolved)?)),
                None => Ok(None),
            }
        };
        let listener = change_listener.map(|listener| {
            let erased: Arc<dyn ChangeEventListener> =
                Arc::new(move |id: &DocumentId, event: &ChangeEvent| match event.decode::<T>() {
                    Ok(typed) => listener(id, &typed),
                    Err(e) => {
                        tracing::warn!(
                            document_id = %id,
                            error = %e,
                            "dropping undecodable change event"
                        )
                    }
                });
            erased
        });
        self.engine.configure(&self.namespace, handler, listener, error_listener)
    }

    /// Inserts a value.
    pub fn insert_one(&self, value: &T) -> SyncResult<InsertOneResult> {
        self.engine.insert_one(&self.namespace, encode(value)?)
    }

    /// Inserts values.
    pub fn insert_many(&self, values: &[T]) -> SyncResult<InsertManyResult> {
        let documents = values.iter().map(encode).collect::<SyncResult<Vec<_>>>()?;
        self.engine.insert_many(&self.namespace, documents)
    }

    /// Returns every value matching `filter`.
    pub fn find(&self, filter: &Filter) -> SyncResult<Vec<T>> {
        self.engine
            .find(&self.namespace, filter)?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Returns the first value matching `filter`.
    pub fn find_one(&self, filter: &Filter) -> SyncResult<Option<T>> {
        self.engine.find_one(&self.namespace, filter)?.map(decode).transpose()
    }

    /// Counts values matching `filter`.
    pub fn count(&self, filter: &Filter) -> SyncResult<u64> {
        self.engine.count(&self.namespace, filter)
    }

    /// See [`Synchronizer::update_one`].
    pub fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> SyncResult<UpdateResult> {
        self.engine.update_one(&self.namespace, filter, update, upsert)
    }

    /// See [`Synchronizer::update_many`].
    pub fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> SyncResult<UpdateResult> {
        self.engine.update_many(&self.namespace, filter, update, upsert)
    }

    /// See [`Synchronizer::delete_one`].
    pub fn delete_one(&self, filter: &Filter) -> SyncResult<DeleteResult> {
        self.engine.delete_one(&self.namespace, filter)
    }

    /// See [`Synchronizer::delete_many`].
    pub fn delete_many(&self, filter: &Filter) -> SyncResult<DeleteResult> {
        self.engine.delete_many(&self.namespace, filter)
    }

    /// See [`Synchronizer::sync`].
    pub fn sync(&self, ids: &[DocumentId]) -> SyncResult<()> {
        self.engine.sync(&self.namespace, ids)
    }

    /// See [`Synchronizer::desync`].
    pub fn desync(&self, ids: &[DocumentId]) -> SyncResult<()> {
        self.engine.desync(&self.namespace, ids)
    }

    /// Ids of every synchronized document.
    pub fn synced_ids(&self) -> HashSet<DocumentId> {
        self.engine.synced_ids(&self.namespace)
    }

    /// Ids of every paused document.
    pub fn paused_ids(&self) -> HashSet<DocumentId> {
        self.engine.paused_ids(&self.namespace)
    }

    /// See [`Synchronizer::resume_sync`].
    pub fn resume_sync(&self, document_id: &DocumentId) -> SyncResult<bool> {
        self.engine.resume_sync(&self.namespace, document_id)
    }
}

fn encode<T: Serialize>(value: &T) -> SyncResult<Document> {
    to_document(value).map_err(SyncError::from)
}

fn decode<T: DeserializeOwned>(document: Document) -> SyncResult<T> {
    from_document(document).map_err(SyncError::from)
}
