//! Documents command implementation.

use super::{flags, load_states, open_store, CliResult};
use docsync_engine::DocumentSyncState;
use docsync_protocol::Namespace;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Row filters. Both set means either.
#[derive(Debug, Clone, Copy, Default)]
pub struct Only {
    /// Keep documents with a pending local write.
    pub pending: bool,
    /// Keep paused documents.
    pub paused: bool,
}

impl Only {
    fn keeps(self, state: &DocumentSyncState) -> bool {
        if !self.pending && !self.paused {
            return true;
        }
        (self.pending && state.has_uncommitted_writes()) || (self.paused && state.is_paused())
    }
}

/// One synchronized document.
#[derive(Debug, Serialize)]
pub struct DocumentRow {
    /// Document id.
    pub id: Value,
    /// Pending local operation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<String>,
    /// Whether the document is paused.
    pub paused: bool,
    /// Whether the document is stale.
    pub stale: bool,
    /// Last acknowledged remote version as `instance:counter`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl From<&DocumentSyncState> for DocumentRow {
    fn from(state: &DocumentSyncState) -> Self {
        Self {
            id: state.document_id().as_value().clone(),
            pending: state
                .uncommitted_change_event()
                .map(|e| e.operation_type.as_str().to_string()),
            paused: state.is_paused(),
            stale: state.is_stale(),
            version: state
                .last_known_remote_version()
                .map(|v| format!("{}:{}", v.instance_id, v.counter)),
        }
    }
}

/// Runs the documents command.
pub fn run(
    path: &Path,
    instance: &str,
    namespace: &Namespace,
    only: Only,
    format: &str,
) -> CliResult<()> {
    let store = open_store(path)?;
    let states: Vec<_> = load_states(&store, instance, Some(namespace))?
        .into_iter()
        .filter(|s| only.keeps(s))
        .collect();

    match format {
        "json" => {
            let rows: Vec<DocumentRow> = states.iter().map(DocumentRow::from).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            println!("{} ({} documents)", namespace, states.len());
            for state in &states {
                let row = DocumentRow::from(state);
                println!(
                    "  {} {:<36} {:<8} {}",
                    flags(state),
                    state.document_id(),
                    row.pending.as_deref().unwrap_or("-"),
                    row.version.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    #[test]
    fn pending_filter_keeps_unpushed_documents() {
        let dir = tempfile::tempdir().unwrap();
        testing::seed(dir.path());
        let store = open_store(dir.path()).unwrap();
        let states = load_states(&store, "default", Some(&testing::todos())).unwrap();

        let only = Only {
            pending: true,
            paused: false,
        };
        let kept: Vec<_> = states.iter().filter(|s| only.keeps(s)).collect();
        assert_eq!(kept.len(), 1);

        let row = DocumentRow::from(kept[0]);
        assert_eq!(row.id, serde_json::json!("b"));
        assert_eq!(row.pending.as_deref(), Some("insert"));
        assert!(row.version.is_none());
    }

    #[test]
    fn committed_documents_show_their_version() {
        let dir = tempfile::tempdir().unwrap();
        testing::seed(dir.path());
        let store = open_store(dir.path()).unwrap();
        let states = load_states(&store, "default", Some(&testing::todos())).unwrap();

        let row = DocumentRow::from(&states[0]);
        assert!(row.pending.is_none());
        assert!(row.version.unwrap().ends_with(":0"));
    }
}
