//! Crash recovery.
//!
//! Every local write first saves the document's pre-image to the undo
//! collection of its namespace and removes it once the write and its
//! bookkeeping are done. An undo record found at startup therefore marks a
//! write that was interrupted. Recovery rolls such documents back to the
//! pre-image, then forward to the pending write recorded for them, and
//! finally drops local documents that no synchronization record covers.
//!
//! Every step is idempotent, so a crash during recovery is repaired by the
//! next one.

use crate::error::{SyncError, SyncResult};
use crate::namespace_state::NamespaceSyncState;
use crate::synchronizer::SyncInner;
use docsync_protocol::{DocumentId, Filter, Namespace, OperationType};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

impl SyncInner {
    /// Starts recovery on its own thread and returns once that thread holds
    /// every namespace lock.
    pub(crate) fn spawn_recovery(self: &Arc<Self>) -> SyncResult<JoinHandle<()>> {
        let (locked, wait_locked) = mpsc::channel::<()>();
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("docsync-recovery-{}", self.config.instance_key))
            .spawn(move || {
                let entries = inner.instance.entries();
                let guards: Vec<_> = entries.iter().map(|e| (e, e.state.write())).collect();
                let _ = locked.send(());
                for (entry, state) in &guards {
                    if let Err(e) = inner.recover_namespace(&entry.namespace, state) {
                        tracing::error!(ns = %entry.namespace, error = %e, "recovery failed");
                        inner.report_unattributed(e);
                    }
                }
            })
            .map_err(|e| SyncError::Fatal(format!("failed to spawn recovery: {e}")))?;
        // A closed channel means the thread died before locking; nothing to wait for.
        let _ = wait_locked.recv();
        Ok(handle)
    }

    /// Runs `write` bracketed by an undo record for one document.
    ///
    /// The local copy, if any, is saved before `write` runs and dropped only
    /// once it returns `Ok`, so `write` must finish with the bookkeeping that
    /// makes the new local copy recoverable. A failed `write` leaves the
    /// record for the next recovery.
    pub(crate) fn with_undo<R>(
        &self,
        namespace: &Namespace,
        document_id: &DocumentId,
        write: impl FnOnce() -> SyncResult<R>,
    ) -> SyncResult<R> {
        let undo = self.undo_collection(namespace)?;
        let by_id = Filter::by_id(document_id);
        // a record left by an earlier failed write holds the older pre-image
        if undo.find_one(&by_id)?.is_none() {
            if let Some(pre_image) = self.local_collection(namespace)?.find_one(&by_id)? {
                undo.insert_one(pre_image)?;
            }
        }
        let written = write()?;
        undo.delete_one(&by_id)?;
        Ok(written)
    }

    pub(crate) fn recover_namespace(
        &self,
        namespace: &Namespace,
        state: &NamespaceSyncState,
    ) -> SyncResult<()> {
        let undo = self.undo_collection(namespace)?;
        let local = self.local_collection(namespace)?;

        let mut recovered: HashSet<DocumentId> = HashSet::new();
        for pre_image in undo.find(&Filter::All)? {
            let Some(id) = DocumentId::of(&pre_image) else {
                continue;
            };
            local.find_one_and_replace(&Filter::by_id(&id), pre_image, true)?;
            recovered.insert(id);
        }

        for id in &recovered {
            let Some(pending) = state.get(id).and_then(|d| d.uncommitted_change_event()) else {
                continue;
            };
            match pending.operation_type {
                OperationType::Insert | OperationType::Replace | OperationType::Update => {
                    if let Some(document) = &pending.full_document {
                        local.find_one_and_replace(&Filter::by_id(id), document.clone(), true)?;
                    }
                }
                OperationType::Delete => {
                    local.delete_one(&Filter::by_id(id))?;
                }
                OperationType::Unknown => {
                    return Err(SyncError::Decoding(format!(
                        "pending write for {id} has an unknown operation type"
                    )));
                }
            }
        }

        if !recovered.is_empty() {
            undo.delete_many(&Filter::ids_in(&recovered))?;
        }

        let synced = state.synced_ids();
        let orphans = local.delete_many(&Filter::ids_not_in(&synced))?;
        if !recovered.is_empty() || orphans > 0 {
            tracing::info!(
                ns = %namespace,
                recovered = recovered.len(),
                orphans,
                "recovered namespace"
            );
        }
        Ok(())
    }
}
