//! Undo command implementation.

use super::{open_store, CliResult};
use docsync_engine::SyncConfig;
use docsync_protocol::{Document, Filter, Namespace};
use docsync_storage::{DocumentCollection, FileStore, LocalStore};
use std::path::Path;

/// Runs the undo command.
///
/// Undo records outlive a write only when the process died mid-write; the
/// next engine start rolls them back or forward.
pub fn run(path: &Path, namespace: &Namespace) -> CliResult<()> {
    let store = open_store(path)?;
    let records = undo_records(&store, namespace)?;
    if records.is_empty() {
        println!("No undo records in {namespace}");
        return Ok(());
    }
    println!("{} undo record(s) in {namespace}", records.len());
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

fn undo_records(store: &FileStore, namespace: &Namespace) -> CliResult<Vec<Document>> {
    Ok(store
        .collection(&SyncConfig::undo_collection(namespace))?
        .find(&Filter::All)?)
}
