//! The set of synchronized namespaces.

use crate::config::SyncConfig;
use crate::doc_state::SCHEMA_VERSION;
use crate::error::{SyncError, SyncResult};
use crate::event_buffer::RemoteEventBuffer;
use crate::namespace_state::NamespaceSyncState;
use docsync_protocol::{to_document, Filter, Namespace, ID_FIELD};
use docsync_storage::{DocumentCollection, LocalStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One synchronized namespace: its state behind the namespace lock and its
/// buffer of remote events.
#[derive(Debug)]
pub(crate) struct NamespaceEntry {
    pub(crate) namespace: Namespace,
    pub(crate) state: RwLock<NamespaceSyncState>,
    pub(crate) buffer: Arc<RemoteEventBuffer>,
}

/// Every namespace this engine instance has seen, loaded from and written
/// through to the namespace records collection.
pub(crate) struct InstanceSyncState {
    namespaces: Mutex<BTreeMap<Namespace, Arc<NamespaceEntry>>>,
    namespace_records: Arc<dyn DocumentCollection>,
    document_records: Arc<dyn DocumentCollection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamespaceRecord {
    #[serde(rename = "_id")]
    key: String,
    schema_version: u32,
    namespace: Namespace,
}

impl InstanceSyncState {
    /// Loads every persisted namespace together with its documents.
    pub(crate) fn load(store: &dyn LocalStore, config: &SyncConfig) -> SyncResult<Self> {
        let namespace_records = store.collection(&config.namespaces_collection())?;
        let document_records = store.collection(&config.documents_collection())?;

        let mut namespaces = BTreeMap::new();
        for record in namespace_records.find(&Filter::All)? {
            let record: NamespaceRecord = serde_json::from_value(Value::Object(record))
                .map_err(|e| SyncError::Decoding(format!("namespace record: {e}")))?;
            if record.schema_version != SCHEMA_VERSION {
                return Err(SyncError::Decoding(format!(
                    "unsupported namespace record schema version {}",
                    record.schema_version
                )));
            }
            let state =
                NamespaceSyncState::load(record.namespace.clone(), Arc::clone(&document_records))?;
            let entry = Arc::new(Self::entry(record.namespace.clone(), state));
            namespaces.insert(record.namespace, entry);
        }
        tracing::debug!(
            instance = %config.instance_key,
            namespaces = namespaces.len(),
            "loaded sync configuration"
        );

        Ok(Self {
            namespaces: Mutex::new(namespaces),
            namespace_records,
            document_records,
        })
    }

    fn entry(namespace: Namespace, state: NamespaceSyncState) -> NamespaceEntry {
        NamespaceEntry {
            buffer: Arc::new(RemoteEventBuffer::new(namespace.clone())),
            namespace,
            state: RwLock::new(state),
        }
    }

    /// Returns the entry for `namespace` if it exists.
    pub(crate) fn get(&self, namespace: &Namespace) -> Option<Arc<NamespaceEntry>> {
        self.namespaces.lock().get(namespace).cloned()
    }

    /// Returns the entry for `namespace`, persisting a new one if needed.
    pub(crate) fn get_or_create(&self, namespace: &Namespace) -> SyncResult<Arc<NamespaceEntry>> {
        let mut namespaces = self.namespaces.lock();
        if let Some(entry) = namespaces.get(namespace) {
            return Ok(Arc::clone(entry));
        }
        let record = NamespaceRecord {
            key: namespace.to_string(),
            schema_version: SCHEMA_VERSION,
            namespace: namespace.clone(),
        };
        self.namespace_records.replace_one(
            &Filter::eq(ID_FIELD, namespace.to_string()),
            to_document(&record)?,
            true,
        )?;
        let state =
            NamespaceSyncState::load(namespace.clone(), Arc::clone(&self.document_records))?;
        let entry = Arc::new(Self::entry(namespace.clone(), state));
        namespaces.insert(namespace.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Every namespace, in name order.
    pub(crate) fn entries(&self) -> Vec<Arc<NamespaceEntry>> {
        self.namespaces.lock().values().cloned().collect()
    }
}
