//! Remote-to-local reconciliation.

use crate::action::{log_decision, SyncAction, SyncMessage, R2L_METHOD};
use crate::dispatch::Outbox;
use crate::doc_state::DocumentSyncState;
use crate::error::{SyncError, SyncResult};
use crate::instance_state::NamespaceEntry;
use crate::namespace_state::NamespaceSyncState;
use crate::synchronizer::SyncInner;
use docsync_protocol::{
    sanitize, ChangeEvent, Document, DocumentId, Filter, OperationType, Update, VersionOrdering,
    VersionStamp,
    VERSION_FIELD,
};
use std::collections::{HashMap, HashSet};

/// Reads the stamp of an event's full document. Events without a document
/// carry no stamp.
pub(crate) fn event_version(
    event: &ChangeEvent,
) -> docsync_protocol::ProtocolResult<Option<VersionStamp>> {
    Ok(event
        .full_document
        .as_ref()
        .map(VersionStamp::extract)
        .transpose()?
        .flatten())
}

/// The error reported for an irrecoverable decision.
pub(crate) fn irrecoverable(message: &SyncMessage) -> SyncError {
    match message {
        SyncMessage::UnknownRemoteProtocolVersion(version)
        | SyncMessage::StaleProtocolVersion(version) => {
            SyncError::UnsupportedProtocolVersion(*version)
        }
        _ => SyncError::Decoding(message.to_string()),
    }
}

/// Chooses what to do with a remote event for a synchronized document.
fn decide(
    logical_t: i64,
    doc: &DocumentSyncState,
    event: &ChangeEvent,
) -> (SyncAction, SyncMessage) {
    let pending = doc.has_uncommitted_writes();
    if pending && doc.last_resolution() == logical_t {
        return (SyncAction::Wait, SyncMessage::SimultaneousWrites);
    }
    if event.operation_type == OperationType::Unknown {
        return (SyncAction::DropEventAndPause, SyncMessage::UnknownOptype(event.operation_type));
    }
    let Ok(remote) = event_version(event) else {
        return (SyncAction::DropEventAndDesync, SyncMessage::CannotParseRemoteVersion);
    };
    if let Some(remote) = &remote {
        if !remote.is_supported() {
            return (
                SyncAction::DropEventAndDesync,
                SyncMessage::UnknownRemoteProtocolVersion(remote.protocol_version),
            );
        }
    }
    let local = doc.last_known_remote_version();
    if let (Some(remote), Some(local)) = (&remote, local) {
        if remote.is_same_write(local) {
            return (SyncAction::DropEvent, SyncMessage::ProbablyGeneratedByUs);
        }
    }

    if !pending {
        if event.operation_type == OperationType::Delete {
            return (SyncAction::DeleteLocal, SyncMessage::DeleteFromRemote);
        }
        if let Some(local) = local.filter(|l| !l.is_supported()) {
            return (
                SyncAction::DeleteLocalAndDesync,
                SyncMessage::StaleProtocolVersion(local.protocol_version),
            );
        }
        return match (&remote, local) {
            (Some(remote), Some(local)) => match remote.compare(local) {
                VersionOrdering::Unorderable => {
                    (SyncAction::RemoteFind, SyncMessage::InstanceIdMismatch)
                }
                VersionOrdering::Newer => {
                    (SyncAction::ApplyFromRemote, SyncMessage::ApplyFromRemote)
                }
                _ => (SyncAction::DropEvent, SyncMessage::ProbablyGeneratedByUs),
            },
            (None, None) => (SyncAction::ApplyAndVersionFromRemote, SyncMessage::EmptyVersion),
            _ => (SyncAction::ApplyFromRemote, SyncMessage::ApplyFromRemote),
        };
    }

    if event.operation_type == OperationType::Delete {
        return (SyncAction::Conflict, SyncMessage::PendingWriteDelete);
    }
    match (&remote, local) {
        (Some(remote), Some(local)) => match remote.compare(local) {
            VersionOrdering::Unorderable => {
                (SyncAction::RemoteFind, SyncMessage::InstanceIdMismatch)
            }
            VersionOrdering::Newer => (SyncAction::Conflict, SyncMessage::StaleLocalWrite),
            _ => (SyncAction::DropEvent, SyncMessage::StaleEvent),
        },
        _ => (SyncAction::Conflict, SyncMessage::PendingWriteEmptyVersion),
    }
}

impl SyncInner {
    pub(crate) fn sync_remote_to_local(&self, logical_t: i64) -> SyncResult<()> {
        self.for_each_namespace(|entry, state, outbox| {
            self.remote_to_local_namespace(logical_t, entry, state, outbox)
        })
    }

    fn remote_to_local_namespace(
        &self,
        logical_t: i64,
        entry: &NamespaceEntry,
        state: &mut NamespaceSyncState,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = entry.namespace.clone();
        if entry.buffer.take_stale_marker() {
            tracing::debug!(
                ns = %namespace,
                "t='{logical_t}': change stream reopened; marking documents stale"
            );
            state.set_all_stale(true)?;
        }
        let events = entry.buffer.dequeue_all();

        let mut unseen: HashSet<DocumentId> = state.stale_ids();
        let mut latest: HashMap<DocumentId, Document> = HashMap::new();
        if !unseen.is_empty() {
            let remote = self.remote.collection(&namespace);
            for document in remote.find(&Filter::ids_in(&unseen))? {
                if let Some(id) = DocumentId::of(&document) {
                    latest.insert(id, document);
                }
            }
        }

        for (id, event) in events {
            match state.get(&id) {
                Some(doc) if !doc.is_paused() => {}
                _ => continue,
            }
            unseen.remove(&id);
            latest.remove(&id);
            self.sync_remote_change_event_to_local(logical_t, state, &id, event, outbox)?;
        }

        for id in unseen {
            let Some(doc) = state.get(&id) else {
                continue;
            };
            if doc.is_paused() {
                continue;
            }
            let pending = doc.has_uncommitted_writes();
            let known = doc.last_known_remote_version().is_some();
            if let Some(document) = latest.remove(&id) {
                let event = ChangeEvent::replace(&namespace, &id, document, pending);
                self.sync_remote_change_event_to_local(logical_t, state, &id, event, outbox)?;
            } else if known {
                let event = ChangeEvent::delete(&namespace, &id, pending);
                self.sync_remote_change_event_to_local(logical_t, state, &id, event, outbox)?;
            }
            if state.contains(&id) {
                state.set_stale(&id, false)?;
            }
        }
        Ok(())
    }

    /// Reconciles one remote event against the local state of its document.
    pub(crate) fn sync_remote_change_event_to_local(
        &self,
        logical_t: i64,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
        event: ChangeEvent,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let Some(doc) = state.get(document_id) else {
            return Ok(());
        };
        let (action, message) = decide(logical_t, doc, &event);
        log_decision(logical_t, R2L_METHOD, state.namespace(), document_id, &message, action);
        self.enqueue_action(logical_t, state, document_id, action, message, event, outbox)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_action(
        &self,
        logical_t: i64,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
        action: SyncAction,
        message: SyncMessage,
        event: ChangeEvent,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        match action {
            SyncAction::DropEvent | SyncAction::Wait => Ok(()),
            SyncAction::ApplyFromRemote => {
                self.apply_from_remote(state, document_id, event, outbox)
            }
            SyncAction::ApplyAndVersionFromRemote => {
                self.apply_and_version_from_remote(logical_t, state, document_id, event, outbox)
            }
            SyncAction::Conflict => {
                self.resolve_conflict(logical_t, state, document_id, event, outbox)
            }
            SyncAction::RemoteFind => self.remote_find(logical_t, state, document_id, outbox),
            SyncAction::DeleteLocal => {
                self.desync_document(state, document_id)?;
                outbox.event(
                    state.change_listener().as_ref(),
                    document_id,
                    ChangeEvent::delete(&namespace, document_id, false),
                );
                outbox.relisten();
                Ok(())
            }
            SyncAction::DeleteLocalAndDesync => {
                self.desync_document(state, document_id)?;
                outbox.relisten();
                Ok(())
            }
            SyncAction::DropEventAndDesync => {
                outbox.error(irrecoverable(&message), Some(document_id));
                self.desync_document(state, document_id)?;
                outbox.relisten();
                Ok(())
            }
            SyncAction::DropEventAndPause => {
                outbox.error(irrecoverable(&message), Some(document_id));
                state.pause(document_id)
            }
        }
    }

    /// Writes a remote document locally and adopts its version.
    pub(crate) fn apply_from_remote(
        &self,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
        event: ChangeEvent,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        let Some(document) = event.full_document else {
            return Err(SyncError::DocumentDoesNotExist(document_id.to_string()));
        };
        let version = VersionStamp::extract(&document)?;
        let document = sanitize(document);
        let local = self.local_collection(&namespace)?;
        self.with_undo(&namespace, document_id, || {
            local.replace_one(&Filter::by_id(document_id), document.clone(), true)?;
            state.commit_pending_write(document_id, version)
        })?;
        outbox.event(
            state.change_listener().as_ref(),
            document_id,
            ChangeEvent::replace(&namespace, document_id, document, false),
        );
        Ok(())
    }

    /// Stamps an unversioned remote document, then applies it.
    fn apply_and_version_from_remote(
        &self,
        logical_t: i64,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
        event: ChangeEvent,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        let Some(mut document) = event.full_document else {
            return Err(SyncError::DocumentDoesNotExist(document_id.to_string()));
        };
        let stamp = VersionStamp::fresh();
        let matched = self.remote.collection(&namespace).update_one(
            &VersionStamp::filter_for(document_id, None),
            &Update::new().set(VERSION_FIELD, stamp.to_value()),
        )?;
        if matched == 0 {
            log_decision(
                logical_t,
                R2L_METHOD,
                &namespace,
                document_id,
                &SyncMessage::VersionDifferent(OperationType::Update),
                SyncAction::DropEvent,
            );
            return state.set_stale(document_id, true);
        }
        self.stats.write().remote_writes += 1;
        stamp.stamp(&mut document);
        self.apply_from_remote(
            state,
            document_id,
            ChangeEvent::replace(&namespace, document_id, document, false),
            outbox,
        )
    }

    /// Settles an event from another lineage against the document the
    /// remote store holds now.
    fn remote_find(
        &self,
        logical_t: i64,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        let Some(doc) = state.get(document_id) else {
            return Ok(());
        };
        let pending = doc.has_uncommitted_writes();
        let local = doc.last_known_remote_version().cloned();
        let decision = |message: SyncMessage, action: SyncAction| {
            log_decision(logical_t, R2L_METHOD, &namespace, document_id, &message, action);
            (action, message)
        };

        let lookup = self.remote.collection(&namespace).find_one(&Filter::by_id(document_id));
        let fetched = match lookup {
            Ok(fetched) => fetched,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    ns = %namespace,
                    document_id = %document_id,
                    error = %e,
                    "remote lookup failed"
                );
                decision(SyncMessage::RemoteFindFailed, SyncAction::DropEvent);
                return state.set_stale(document_id, true);
            }
        };

        match fetched {
            Some(document) => {
                let remote = match VersionStamp::extract(&document) {
                    Ok(remote) => remote,
                    Err(_) => {
                        let (action, message) = decision(
                            SyncMessage::CannotParseRemoteVersion,
                            SyncAction::DropEventAndDesync,
                        );
                        let event =
                            ChangeEvent::replace(&namespace, document_id, document, pending);
                        return self.enqueue_action(
                            logical_t,
                            state,
                            document_id,
                            action,
                            message,
                            event,
                            outbox,
                        );
                    }
                };
                let same_lineage = matches!(
                    (&remote, &local),
                    (Some(remote), Some(local)) if remote.instance_id == local.instance_id
                );
                if same_lineage {
                    decision(SyncMessage::StaleEvent, SyncAction::DropEvent);
                    return Ok(());
                }
                let event = ChangeEvent::replace(&namespace, document_id, document, pending);
                if pending {
                    decision(SyncMessage::RemoteFindReplacedDoc, SyncAction::Conflict);
                    self.resolve_conflict(logical_t, state, document_id, event, outbox)
                } else {
                    decision(SyncMessage::RemoteFindReplacedDoc, SyncAction::ApplyFromRemote);
                    self.apply_from_remote(state, document_id, event, outbox)
                }
            }
            None if pending => {
                decision(SyncMessage::RemoteFindDeletedDoc, SyncAction::Conflict);
                let event = ChangeEvent::delete(&namespace, document_id, true);
                self.resolve_conflict(logical_t, state, document_id, event, outbox)
            }
            None => {
                decision(SyncMessage::RemoteFindDeletedDoc, SyncAction::DeleteLocalAndDesync);
                self.desync_document(state, document_id)?;
                outbox.relisten();
                Ok(())
            }
        }
    }

    /// Stops synchronizing a document: drops its record, then its local copy.
    pub(crate) fn desync_document(
        &self,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        let local = self.local_collection(&namespace)?;
        self.with_undo(&namespace, document_id, || {
            state.desync(document_id)?;
            local.delete_one(&Filter::by_id(document_id))?;
            Ok(())
        })
    }
}
