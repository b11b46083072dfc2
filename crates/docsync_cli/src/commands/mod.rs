//! CLI command implementations.

pub mod documents;
pub mod namespaces;
pub mod show;
pub mod undo;

use docsync_engine::{DocumentSyncState, SyncConfig};
use docsync_protocol::{DocumentId, Filter, Namespace};
use docsync_storage::{DocumentCollection, FileStore, LocalStore};
use std::path::Path;

pub(crate) type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens an existing store. Fails with a lock error while an engine has it open.
pub(crate) fn open_store(path: &Path) -> CliResult<FileStore> {
    Ok(FileStore::open(path, false)?)
}

pub(crate) fn parse_namespace(raw: &str) -> CliResult<Namespace> {
    Namespace::parse(raw).ok_or_else(|| format!("expected database.collection, got {raw:?}").into())
}

/// Reads an id as JSON, falling back to a plain string.
pub(crate) fn parse_id(raw: &str) -> DocumentId {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => DocumentId::new(value),
        Err(_) => DocumentId::from(raw),
    }
}

/// Loads every document sync state recorded for `instance`, optionally
/// restricted to one namespace.
pub(crate) fn load_states(
    store: &FileStore,
    instance: &str,
    namespace: Option<&Namespace>,
) -> CliResult<Vec<DocumentSyncState>> {
    let records = store.collection(&SyncConfig::new(instance).documents_collection())?;
    let mut states = Vec::new();
    for record in records.find(&Filter::All)? {
        let state = DocumentSyncState::from_record(record)?;
        if namespace.map_or(true, |ns| state.namespace() == ns) {
            states.push(state);
        }
    }
    states.sort_by_key(|s| s.document_id().to_string());
    Ok(states)
}

/// Short flag column for a state: `P` pending, `Z` paused, `S` stale.
pub(crate) fn flags(state: &DocumentSyncState) -> String {
    let mut out = String::with_capacity(3);
    out.push(if state.has_uncommitted_writes() { 'P' } else { '-' });
    out.push(if state.is_paused() { 'Z' } else { '-' });
    out.push(if state.is_stale() { 'S' } else { '-' });
    out
}
