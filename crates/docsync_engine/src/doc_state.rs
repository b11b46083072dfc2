//! Per-document synchronization state.

use crate::error::{SyncError, SyncResult};
use docsync_protocol::{to_document, ChangeEvent, Document, DocumentId, Namespace, VersionStamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Layout version of persisted configuration records.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// The state machine of one synchronized document.
///
/// # Invariants
///
/// - `uncommitted_change_event` is set exactly while a local write has not
///   been acknowledged by the remote store
/// - a paused document receives no remote updates until it is resumed,
///   either explicitly or by a new local write
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSyncState {
    namespace: Namespace,
    document_id: DocumentId,
    last_known_remote_version: Option<VersionStamp>,
    uncommitted_change_event: Option<ChangeEvent>,
    last_resolution: i64,
    is_stale: bool,
    is_paused: bool,
}

impl DocumentSyncState {
    /// Creates the state of a newly synchronized document.
    pub fn new(namespace: Namespace, document_id: DocumentId) -> Self {
        Self {
            namespace,
            document_id,
            last_known_remote_version: None,
            uncommitted_change_event: None,
            last_resolution: 0,
            is_stale: false,
            is_paused: false,
        }
    }

    /// The document's namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The document's id.
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// The stamp of the last remote state this engine acknowledged.
    pub fn last_known_remote_version(&self) -> Option<&VersionStamp> {
        self.last_known_remote_version.as_ref()
    }

    /// The local write waiting to be pushed, if any.
    pub fn uncommitted_change_event(&self) -> Option<&ChangeEvent> {
        self.uncommitted_change_event.as_ref()
    }

    /// Returns true while a local write is waiting to be pushed.
    pub fn has_uncommitted_writes(&self) -> bool {
        self.uncommitted_change_event.is_some()
    }

    /// Logical time of the last local write or resolution.
    pub fn last_resolution(&self) -> i64 {
        self.last_resolution
    }

    /// Returns true if the local copy may be behind the remote store.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Returns true if remote updates are suppressed.
    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    /// Records a local write, merging it into the write still pending.
    ///
    /// A local write resumes a paused document, which is then stale since
    /// remote updates were ignored while it was paused.
    pub(crate) fn set_pending_write(&mut self, logical_t: i64, event: ChangeEvent) {
        if self.is_paused {
            self.is_paused = false;
            self.is_stale = true;
        }
        self.uncommitted_change_event =
            Some(ChangeEvent::coalesce(self.uncommitted_change_event.as_ref(), event));
        self.last_resolution = logical_t;
    }

    /// Records the outcome of a conflict resolution as the pending write,
    /// with `version` as the new remote baseline.
    pub(crate) fn set_pending_write_at_version(
        &mut self,
        logical_t: i64,
        version: Option<VersionStamp>,
        event: ChangeEvent,
    ) {
        self.uncommitted_change_event = Some(event);
        self.last_resolution = logical_t;
        self.last_known_remote_version = version;
        self.is_paused = false;
    }

    /// Clears the pending write; `version` is what the remote store now holds.
    pub(crate) fn commit_pending_write(&mut self, version: Option<VersionStamp>) {
        self.uncommitted_change_event = None;
        self.last_known_remote_version = version;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.is_stale = stale;
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.is_paused = paused;
    }

    /// The key of this document's configuration record.
    pub(crate) fn record_key(namespace: &Namespace, document_id: &DocumentId) -> Value {
        json!({ "ns": namespace.to_string(), "id": document_id.as_value() })
    }

    /// Encodes the persisted record.
    pub(crate) fn to_record(&self) -> SyncResult<Document> {
        let record = DocumentRecord {
            key: Self::record_key(&self.namespace, &self.document_id),
            schema_version: SCHEMA_VERSION,
            namespace: self.namespace.clone(),
            document_id: self.document_id.clone(),
            last_known_remote_version: self.last_known_remote_version.clone(),
            last_uncommitted_change_event: self.uncommitted_change_event.clone(),
            last_resolution: self.last_resolution,
            is_stale: self.is_stale,
            is_paused: self.is_paused,
        };
        Ok(to_document(&record)?)
    }

    /// Decodes a record from the documents collection.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decoding`] if the record is malformed or was
    /// written by an incompatible schema version.
    pub fn from_record(record: Document) -> SyncResult<Self> {
        let record: DocumentRecord = serde_json::from_value(Value::Object(record))
            .map_err(|e| SyncError::Decoding(format!("document record: {e}")))?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(SyncError::Decoding(format!(
                "unsupported document record schema version {}",
                record.schema_version
            )));
        }
        Ok(Self {
            namespace: record.namespace,
            document_id: record.document_id,
            last_known_remote_version: record.last_known_remote_version,
            uncommitted_change_event: record.last_uncommitted_change_event,
            last_resolution: record.last_resolution,
            is_stale: record.is_stale,
            is_paused: record.is_paused,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    #[serde(rename = "_id")]
    key: Value,
    schema_version: u32,
    namespace: Namespace,
    document_id: DocumentId,
    #[serde(default)]
    last_known_remote_version: Option<VersionStamp>,
    #[serde(default)]
    last_uncommitted_change_event: Option<ChangeEvent>,
    last_resolution: i64,
    is_stale: bool,
    is_paused: bool,
}
