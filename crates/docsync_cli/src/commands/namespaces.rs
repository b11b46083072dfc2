//! Namespaces command implementation.

use super::{load_states, open_store, CliResult};
use docsync_engine::SyncConfig;
use docsync_protocol::{Filter, Namespace};
use docsync_storage::{DocumentCollection, FileStore, LocalStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Summary of one synchronized namespace.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct NamespaceSummary {
    /// `database.collection`.
    pub namespace: String,
    /// Synchronized documents.
    pub documents: usize,
    /// Documents with a pending local write.
    pub pending: usize,
    /// Paused documents.
    pub paused: usize,
    /// Undo records left by interrupted writes.
    pub undo_records: usize,
}

/// Runs the namespaces command.
pub fn run(path: &Path, instance: &str, format: &str) -> CliResult<()> {
    let store = open_store(path)?;
    let summaries = summarize(&store, instance)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summaries)?),
        _ => {
            if summaries.is_empty() {
                println!("No synchronized namespaces for instance {instance:?}");
            }
            for s in &summaries {
                println!(
                    "{:<40} docs={:<6} pending={:<6} paused={:<6} undo={}",
                    s.namespace, s.documents, s.pending, s.paused, s.undo_records
                );
            }
        }
    }
    Ok(())
}

fn summarize(store: &FileStore, instance: &str) -> CliResult<Vec<NamespaceSummary>> {
    let mut summaries: BTreeMap<Namespace, NamespaceSummary> = BTreeMap::new();

    let records = store.collection(&SyncConfig::new(instance).namespaces_collection())?;
    for record in records.find(&Filter::All)? {
        let Some(raw) = record.get("namespace") else {
            tracing::warn!(?record, "namespace record without a namespace");
            continue;
        };
        let namespace: Namespace = serde_json::from_value(raw.clone())?;
        summaries.entry(namespace).or_default();
    }

    for state in load_states(store, instance, None)? {
        let summary = summaries.entry(state.namespace().clone()).or_default();
        summary.documents += 1;
        summary.pending += usize::from(state.has_uncommitted_writes());
        summary.paused += usize::from(state.is_paused());
    }

    for (namespace, summary) in summaries.iter_mut() {
        summary.namespace = namespace.to_string();
        summary.undo_records = store
            .collection(&SyncConfig::undo_collection(namespace))?
            .count(&Filter::All)? as usize;
    }
    Ok(summaries.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    #[test]
    fn summarizes_seeded_store() {
        let dir = tempfile::tempdir().unwrap();
        testing::seed(dir.path());
        let store = open_store(dir.path()).unwrap();

        let summaries = summarize(&store, "default").unwrap();
        assert_eq!(
            summaries,
            vec![NamespaceSummary {
                namespace: "app.todos".into(),
                documents: 2,
                pending: 1,
                paused: 0,
                undo_records: 0,
            }]
        );
    }

    #[test]
    fn other_instances_see_nothing() {
        let dir = tempfile::tempdir().unwrap();
        testing::seed(dir.path());
        let store = open_store(dir.path()).unwrap();
        assert!(summarize(&store, "someone-else").unwrap().is_empty());
    }
}
