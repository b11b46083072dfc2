//! Show command implementation.

use super::{flags, load_states, open_store, CliResult};
use crate::commands::documents::DocumentRow;
use docsync_engine::SyncConfig;
use docsync_protocol::{ChangeEvent, Document, DocumentId, Filter, Namespace};
use docsync_storage::{DocumentCollection, FileStore, LocalStore};
use serde::Serialize;
use std::path::Path;

/// A document as stored locally, with its sync state.
#[derive(Debug, Serialize)]
pub struct ShowResult {
    /// The local copy, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    /// Sync state, absent when the document is not synchronized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DocumentRow>,
    /// The pending local write in full.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_event: Option<ChangeEvent>,
}

/// Runs the show command.
pub fn run(
    path: &Path,
    instance: &str,
    namespace: &Namespace,
    id: &DocumentId,
    format: &str,
) -> CliResult<()> {
    let store = open_store(path)?;
    let result = lookup(&store, instance, namespace, id)?;
    if result.document.is_none() && result.state.is_none() {
        return Err(format!("document {id} not found in {namespace}").into());
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("{namespace} / {id}");
            match &result.state {
                Some(row) => println!(
                    "  sync:     pending={} paused={} stale={} version={}",
                    row.pending.as_deref().unwrap_or("-"),
                    row.paused,
                    row.stale,
                    row.version.as_deref().unwrap_or("-"),
                ),
                None => println!("  sync:     not synchronized"),
            }
            match &result.document {
                Some(document) => println!("  document: {}", serde_json::to_string(document)?),
                None => println!("  document: <deleted locally>"),
            }
        }
    }
    Ok(())
}

fn lookup(
    store: &FileStore,
    instance: &str,
    namespace: &Namespace,
    id: &DocumentId,
) -> CliResult<ShowResult> {
    let document = store
        .collection(&SyncConfig::user_collection(namespace))?
        .find_one(&Filter::by_id(id))?;
    let state = load_states(store, instance, Some(namespace))?
        .into_iter()
        .find(|s| s.document_id() == id);
    if let Some(state) = &state {
        tracing::debug!(%id, flags = %flags(state), "found sync record");
    }
    Ok(ShowResult {
        document,
        pending_event: state.as_ref().and_then(|s| s.uncommitted_change_event().cloned()),
        state: state.as_ref().map(DocumentRow::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;
    use docsync_protocol::{doc, OperationType};
    use serde_json::json;

    #[test]
    fn shows_local_copy_and_pending_write() {
        let dir = tempfile::tempdir().unwrap();
        testing::seed(dir.path());
        let store = open_store(dir.path()).unwrap();

        let result = lookup(&store, "default", &testing::todos(), &DocumentId::from("b")).unwrap();
        assert_eq!(result.document, Some(doc(json!({"_id": "b", "n": 2}))));
        assert_eq!(
            result.pending_event.map(|e| e.operation_type),
            Some(OperationType::Insert)
        );
    }

    #[test]
    fn unknown_documents_have_neither_copy_nor_state() {
        let dir = tempfile::tempdir().unwrap();
        testing::seed(dir.path());
        let store = open_store(dir.path()).unwrap();

        let result = lookup(&store, "default", &testing::todos(), &DocumentId::from("zz")).unwrap();
        assert!(result.document.is_none());
        assert!(result.state.is_none());
    }
}
