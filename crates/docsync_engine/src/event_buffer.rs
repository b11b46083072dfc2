//! Buffered remote change events.

use crate::error::SyncResult;
use crate::remote::{ChangeStreamSink, RemoteClient, StreamHandle};
use docsync_protocol::{ChangeEvent, DocumentId, Namespace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Holds the latest undelivered remote event per document of one namespace.
///
/// The change stream writes into the buffer; the sync pass drains it. A
/// newer event for a document replaces the older one, since only the latest
/// remote state matters.
///
/// Opening a stream sets a stale marker: events may have been missed while
/// it was closed, so the next pass re-reads every synchronized document.
/// Stream delivery never touches the namespace lock.
pub struct RemoteEventBuffer {
    namespace: Namespace,
    events: Mutex<HashMap<DocumentId, ChangeEvent>>,
    stale_marker: AtomicBool,
    stream: Mutex<Option<Box<dyn StreamHandle>>>,
}

impl std::fmt::Debug for RemoteEventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEventBuffer")
            .field("namespace", &self.namespace)
            .field("buffered", &self.len())
            .field("open", &self.is_open())
            .finish()
    }
}

impl RemoteEventBuffer {
    /// Creates an empty buffer with no open stream.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            events: Mutex::new(HashMap::new()),
            stale_marker: AtomicBool::new(false),
            stream: Mutex::new(None),
        }
    }

    /// The buffered namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Buffers an event, replacing any older event for the same document.
    /// Events without a document key are dropped.
    pub fn enqueue(&self, event: ChangeEvent) {
        let Some(id) = event.document_id() else {
            tracing::warn!(ns = %self.namespace, "dropping remote event without a document key");
            return;
        };
        self.events.lock().insert(id, event);
    }

    /// Takes every buffered event.
    pub fn dequeue_all(&self) -> HashMap<DocumentId, ChangeEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Takes the buffered event for one document.
    pub fn take_unprocessed(&self, document_id: &DocumentId) -> Option<ChangeEvent> {
        self.events.lock().remove(document_id)
    }

    /// Returns a copy of the buffered event for one document.
    pub fn peek(&self, document_id: &DocumentId) -> Option<ChangeEvent> {
        self.events.lock().get(document_id).cloned()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears and returns the stale marker.
    pub fn take_stale_marker(&self) -> bool {
        self.stale_marker.swap(false, Ordering::SeqCst)
    }

    /// Opens a stream over `ids`, replacing any stream already open.
    pub fn start(
        self: &Arc<Self>,
        remote: &dyn RemoteClient,
        ids: &[DocumentId],
    ) -> SyncResult<()> {
        self.stop();
        let sink: Arc<dyn ChangeStreamSink> = Arc::clone(self) as Arc<dyn ChangeStreamSink>;
        let handle = remote.watch(&self.namespace, ids, sink)?;
        tracing::debug!(ns = %self.namespace, documents = ids.len(), "change stream opened");
        *self.stream.lock() = Some(handle);
        Ok(())
    }

    /// Closes the stream if one is open.
    pub fn stop(&self) {
        let handle = self.stream.lock().take();
        if let Some(handle) = handle {
            handle.close();
            tracing::debug!(ns = %self.namespace, "change stream closed");
        }
    }

    /// Returns true while a stream is open.
    pub fn is_open(&self) -> bool {
        self.stream.lock().as_ref().is_some_and(|h| h.is_open())
    }
}

impl ChangeStreamSink for RemoteEventBuffer {
    fn on_open(&self) {
        self.stale_marker.store(true, Ordering::SeqCst);
    }

    fn on_event(&self, event: ChangeEvent) {
        self.enqueue(event);
    }

    fn on_close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use docsync_protocol::{doc, Document};
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    #[test]
    fn newer_events_replace_older() {
        let buffer = RemoteEventBuffer::new(ns());
        let id = DocumentId::from("a");
        buffer.enqueue(ChangeEvent::insert(&ns(), &id, doc(json!({"_id": "a"})), false));
        buffer.enqueue(ChangeEvent::delete(&ns(), &id, false));
        buffer.enqueue(ChangeEvent::delete(&ns(), &DocumentId::from("b"), false));
        assert_eq!(buffer.len(), 2);
        assert!(buffer.peek(&id).unwrap().full_document.is_none());

        assert!(buffer.take_unprocessed(&id).is_some());
        assert!(buffer.take_unprocessed(&id).is_none());
        assert_eq!(buffer.dequeue_all().len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn keyless_events_are_dropped() {
        let buffer = RemoteEventBuffer::new(ns());
        let mut event = ChangeEvent::delete(&ns(), &DocumentId::from("a"), false);
        event.document_key = Document::new();
        buffer.enqueue(event);
        assert!(buffer.is_empty());
    }

    #[test]
    fn opening_marks_stale_and_streams_fill_buffer() {
        let remote = MemoryRemote::new();
        let buffer = Arc::new(RemoteEventBuffer::new(ns()));
        let id = DocumentId::from("a");
        buffer.start(&remote, &[id.clone()]).unwrap();
        assert!(buffer.is_open());
        assert!(buffer.take_stale_marker());
        assert!(!buffer.take_stale_marker());

        remote
            .write_as_other_client(&ns(), doc(json!({"_id": "a", "n": 1})))
            .unwrap();
        assert_eq!(buffer.len(), 1);

        buffer.stop();
        assert!(!buffer.is_open());
        remote
            .write_as_other_client(&ns(), doc(json!({"_id": "a", "n": 2})))
            .unwrap();
        assert_eq!(buffer.peek(&id).unwrap().full_document.unwrap()["n"], json!(1));
    }

    #[test]
    fn start_fails_while_offline() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let buffer = Arc::new(RemoteEventBuffer::new(ns()));
        assert!(buffer.start(&remote, &[]).is_err());
        assert!(!buffer.is_open());
    }
}
