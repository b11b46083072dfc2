//! Local-to-remote reconciliation.

use crate::action::{log_decision, SyncAction, SyncMessage, L2R_METHOD};
use crate::dispatch::Outbox;
use crate::error::{SyncError, SyncResult};
use crate::event_buffer::RemoteEventBuffer;
use crate::namespace_state::NamespaceSyncState;
use crate::r2l::{event_version, irrecoverable};
use crate::remote::RemoteCollection;
use crate::synchronizer::SyncInner;
use docsync_protocol::{
    ChangeEvent, Document, DocumentId, Filter, OperationType, VersionOrdering, VersionStamp,
    VERSION_FIELD,
};

/// How pushing one pending write ended.
enum Push {
    /// The remote store accepted the write at this version.
    Committed(VersionStamp),
    /// The remote state diverged; resolve against this event, or against a
    /// fresh lookup when `None`.
    Conflict(SyncMessage, Option<ChangeEvent>),
    /// The pending delete is gone on both sides.
    Deleted { acknowledged: bool },
    /// Nothing was pushed and nothing more needs doing.
    Dropped,
    /// The document cannot be pushed until it is resumed.
    Paused(SyncMessage, SyncError),
}

impl SyncInner {
    pub(crate) fn sync_local_to_remote(&self, logical_t: i64) -> SyncResult<()> {
        self.for_each_namespace(|entry, state, outbox| {
            let remote = self.remote.collection(&entry.namespace);
            let mut pending: Vec<DocumentId> = state.pending_ids().into_iter().collect();
            pending.sort_by_key(|id| id.to_string());
            for document_id in pending {
                self.sync_document_to_remote(
                    logical_t,
                    state,
                    &entry.buffer,
                    remote.as_ref(),
                    &document_id,
                    outbox,
                )?;
            }
            Ok(())
        })
    }

    fn sync_document_to_remote(
        &self,
        logical_t: i64,
        state: &mut NamespaceSyncState,
        buffer: &RemoteEventBuffer,
        remote: &dyn RemoteCollection,
        document_id: &DocumentId,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        let Some(doc) = state.get(document_id) else {
            return Ok(());
        };
        if doc.is_paused() {
            return Ok(());
        }
        let Some(local_event) = doc.uncommitted_change_event().cloned() else {
            return Ok(());
        };
        let baseline = doc.last_known_remote_version().cloned();
        let decision = |message: &SyncMessage, action: SyncAction| {
            log_decision(logical_t, L2R_METHOD, &namespace, document_id, message, action);
        };

        if doc.last_resolution() == logical_t {
            decision(&SyncMessage::SimultaneousWrites, SyncAction::Wait);
            return Ok(());
        }

        if let Some(unprocessed) = buffer.take_unprocessed(document_id) {
            let remote_version = match event_version(&unprocessed) {
                Ok(version) => version,
                Err(_) => {
                    let message = SyncMessage::CannotParseRemoteVersion;
                    decision(&message, SyncAction::DropEventAndDesync);
                    outbox.error(irrecoverable(&message), Some(document_id));
                    self.desync_document(state, document_id)?;
                    outbox.relisten();
                    return Ok(());
                }
            };
            let conflicted = match (&remote_version, &baseline) {
                (Some(remote), Some(local)) => matches!(
                    remote.compare(local),
                    VersionOrdering::Unorderable | VersionOrdering::Newer
                ),
                (None, None) => false,
                _ => true,
            };
            if conflicted {
                decision(&SyncMessage::VersionDifferentUnprocessedEvent, SyncAction::Conflict);
                return self.resolve_conflict(logical_t, state, document_id, unprocessed, outbox);
            }
        }

        let push = self.push(remote, &local_event, document_id, baseline.as_ref())?;
        let listener = state.change_listener();
        match push {
            Push::Committed(version) => {
                state.commit_pending_write(document_id, Some(version))?;
                self.stats.write().remote_writes += 1;
                let committed = local_event.with_uncommitted_writes(false);
                outbox.event(listener.as_ref(), document_id, committed);
                Ok(())
            }
            Push::Deleted { acknowledged } => {
                decision(&SyncMessage::DocumentDeleted, SyncAction::DeleteLocalAndDesync);
                self.desync_document(state, document_id)?;
                if acknowledged {
                    self.stats.write().remote_writes += 1;
                    outbox.event(
                        listener.as_ref(),
                        document_id,
                        ChangeEvent::delete(&namespace, document_id, false),
                    );
                }
                outbox.relisten();
                Ok(())
            }
            Push::Dropped => {
                decision(&SyncMessage::EmptyUpdateDescription, SyncAction::DropEvent);
                state.commit_pending_write(document_id, baseline)
            }
            Push::Paused(message, error) => {
                decision(&message, SyncAction::DropEventAndPause);
                outbox.error(error, Some(document_id));
                state.pause(document_id)
            }
            Push::Conflict(message, remote_event) => {
                decision(&message, SyncAction::Conflict);
                let remote_event = match remote_event {
                    Some(event) => event,
                    None => match remote.find_one(&Filter::by_id(document_id)) {
                        Ok(Some(document)) => {
                            ChangeEvent::replace(&namespace, document_id, document, false)
                        }
                        Ok(None) => ChangeEvent::delete(&namespace, document_id, false),
                        Err(e) if e.is_retryable() => return Err(e),
                        Err(e) => {
                            decision(&SyncMessage::RemoteFindFailed, SyncAction::DropEventAndPause);
                            outbox.error(e, Some(document_id));
                            return state.pause(document_id);
                        }
                    },
                };
                self.resolve_conflict(logical_t, state, document_id, remote_event, outbox)
            }
        }
    }

    /// Attempts the guarded remote write for one pending local event.
    fn push(
        &self,
        remote: &dyn RemoteCollection,
        local_event: &ChangeEvent,
        document_id: &DocumentId,
        baseline: Option<&VersionStamp>,
    ) -> SyncResult<Push> {
        let operation = local_event.operation_type;
        let guard = VersionStamp::filter_for(document_id, baseline);
        let stamped = |next: &VersionStamp| -> Option<Document> {
            let mut document = local_event.full_document.clone()?;
            next.stamp(&mut document);
            Some(document)
        };
        let missing_document = || {
            Push::Paused(
                SyncMessage::ExpectedLocalDocumentToExist,
                SyncError::DocumentDoesNotExist(document_id.to_string()),
            )
        };
        let failed = |e: SyncError| -> SyncResult<Push> {
            if e.is_retryable() {
                return Err(e);
            }
            Ok(Push::Paused(
                SyncMessage::ExceptionOnWrite {
                    operation,
                    error: e.to_string(),
                },
                e,
            ))
        };

        match operation {
            OperationType::Insert => {
                let next = VersionStamp::fresh();
                let Some(document) = stamped(&next) else {
                    return Ok(missing_document());
                };
                match remote.insert_one(document) {
                    Ok(()) => Ok(Push::Committed(next)),
                    Err(SyncError::DuplicateKey(_)) => {
                        Ok(Push::Conflict(SyncMessage::DuplicateKeyException, None))
                    }
                    Err(e) => failed(e),
                }
            }
            OperationType::Replace => {
                let next = VersionStamp::next_after(baseline);
                let Some(document) = stamped(&next) else {
                    return Ok(missing_document());
                };
                match remote.replace_one(&guard, document) {
                    Ok(0) => Ok(Push::Conflict(SyncMessage::VersionDifferent(operation), None)),
                    Ok(_) => Ok(Push::Committed(next)),
                    Err(e) => failed(e),
                }
            }
            OperationType::Update => {
                let description = local_event.update_description.clone().unwrap_or_default();
                if description.is_empty() {
                    return Ok(Push::Dropped);
                }
                let next = VersionStamp::next_after(baseline);
                let update = description.to_update().set(VERSION_FIELD, next.to_value());
                match remote.update_one(&guard, &update) {
                    Ok(0) => Ok(Push::Conflict(SyncMessage::VersionDifferent(operation), None)),
                    Ok(_) => Ok(Push::Committed(next)),
                    Err(e) => failed(e),
                }
            }
            OperationType::Delete => match remote.delete_one(&guard) {
                Ok(0) => match remote.find_one(&Filter::by_id(document_id)) {
                    Ok(Some(document)) => Ok(Push::Conflict(
                        SyncMessage::VersionDifferent(operation),
                        Some(ChangeEvent::replace(
                            &local_event.namespace,
                            document_id,
                            document,
                            false,
                        )),
                    )),
                    Ok(None) => Ok(Push::Deleted { acknowledged: false }),
                    Err(e) => failed(e),
                },
                Ok(_) => Ok(Push::Deleted { acknowledged: true }),
                Err(e) => failed(e),
            },
            OperationType::Unknown => Ok(Push::Paused(
                SyncMessage::UnknownOptype(operation),
                SyncError::Decoding(SyncMessage::UnknownOptype(operation).to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::listener::{BoxError, ConflictPolicy};
    use crate::{ConflictHandler, MemoryRemote, SyncConfig, Synchronizer};
    use docsync_protocol::{
        doc, sanitize, ChangeEvent, Document, DocumentId, Filter, Namespace, OperationType, Update,
        UpdateDescription, VersionStamp,
    };
    use docsync_storage::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    type Seen = Arc<Mutex<Vec<(OperationType, OperationType)>>>;

    fn setup(handler: impl ConflictHandler + 'static) -> (Synchronizer, MemoryRemote, Namespace) {
        let remote = MemoryRemote::new();
        let engine = Synchronizer::new(
            SyncConfig::new("l2r").with_background_loop(false),
            Arc::new(MemoryStore::new()),
            Arc::new(remote.clone()),
        )
        .unwrap();
        let ns = Namespace::new("db", "coll");
        engine.configure(&ns, handler, None, None).unwrap();
        (engine, remote, ns)
    }

    /// Records the operation types of each conflict, then keeps the remote state.
    fn recording(seen: Seen) -> impl ConflictHandler {
        move |id: &DocumentId,
              local: &ChangeEvent,
              remote: &ChangeEvent|
              -> Result<Option<Document>, BoxError> {
            seen.lock().push((local.operation_type, remote.operation_type));
            ConflictPolicy::RemoteWins.resolve_conflict(id, local, remote)
        }
    }

    /// Runs the local-to-remote phase alone.
    fn push_pending(engine: &Synchronizer) {
        let logical_t = engine.inner.advance_logical_t();
        engine.inner.sync_local_to_remote(logical_t).unwrap();
    }

    fn synced(engine: &Synchronizer, ns: &Namespace) -> DocumentId {
        let id = engine
            .insert_one(ns, doc(json!({"_id": "x", "a": 1})))
            .unwrap()
            .inserted_id;
        engine.do_sync_pass().unwrap();
        id
    }

    #[test]
    fn buffered_remote_event_conflicts_before_any_push() {
        let seen = Seen::default();
        let (engine, remote, ns) = setup(recording(Arc::clone(&seen)));
        let id = synced(&engine, &ns);

        remote
            .write_as_other_client(&ns, doc(json!({"_id": "x", "a": 2})))
            .unwrap();
        let remote_document = remote.document(&ns, &id).unwrap();
        let entry = engine.inner.instance.get(&ns).unwrap();
        entry
            .buffer
            .enqueue(ChangeEvent::replace(&ns, &id, remote_document.clone(), false));
        engine
            .update_one(&ns, &Filter::by_id(&id), &Update::new().set("a", 3), false)
            .unwrap();
        let writes = remote.write_count();

        push_pending(&engine);

        assert_eq!(*seen.lock(), vec![(OperationType::Update, OperationType::Replace)]);
        assert!(entry.buffer.peek(&id).is_none());
        assert_eq!(remote.write_count(), writes);
        assert_eq!(
            engine.find_one(&ns, &Filter::by_id(&id)).unwrap(),
            Some(sanitize(remote_document))
        );
        assert!(!engine.document_state(&ns, &id).unwrap().has_uncommitted_writes());
    }

    #[test]
    fn duplicate_insert_resolves_against_the_remote_copy() {
        let seen = Seen::default();
        let (engine, remote, ns) = setup(recording(Arc::clone(&seen)));
        remote
            .write_as_other_client(&ns, doc(json!({"_id": "x", "owner": "remote"})))
            .unwrap();
        let id = engine
            .insert_one(&ns, doc(json!({"_id": "x", "owner": "local"})))
            .unwrap()
            .inserted_id;
        let stamp = VersionStamp::extract(&remote.document(&ns, &id).unwrap())
            .unwrap()
            .unwrap();
        let writes = remote.write_count();

        push_pending(&engine);

        assert_eq!(*seen.lock(), vec![(OperationType::Insert, OperationType::Replace)]);
        assert_eq!(remote.write_count(), writes);
        assert_eq!(
            engine.find_one(&ns, &Filter::by_id(&id)).unwrap(),
            Some(doc(json!({"_id": "x", "owner": "remote"})))
        );
        let state = engine.document_state(&ns, &id).unwrap();
        assert!(!state.has_uncommitted_writes());
        assert_eq!(state.last_known_remote_version(), Some(&stamp));
    }

    #[test]
    fn empty_update_is_dropped_without_a_remote_write() {
        let (engine, remote, ns) = setup(ConflictPolicy::RemoteWins);
        let id = synced(&engine, &ns);
        let version = engine
            .document_state(&ns, &id)
            .unwrap()
            .last_known_remote_version()
            .cloned();
        {
            let entry = engine.inner.instance.get(&ns).unwrap();
            let event = ChangeEvent::update(
                &ns,
                &id,
                UpdateDescription::default(),
                doc(json!({"_id": "x", "a": 1})),
                true,
            );
            entry
                .state
                .write()
                .set_pending_write(&id, engine.logical_t(), event)
                .unwrap();
        }
        let writes = remote.write_count();

        push_pending(&engine);

        assert_eq!(remote.write_count(), writes);
        let state = engine.document_state(&ns, &id).unwrap();
        assert!(!state.has_uncommitted_writes());
        assert_eq!(state.last_known_remote_version().cloned(), version);
    }

    #[test]
    fn delete_of_a_remotely_deleted_document_desyncs() {
        let seen = Seen::default();
        let (engine, remote, ns) = setup(recording(Arc::clone(&seen)));
        let id = synced(&engine, &ns);

        engine.delete_one(&ns, &Filter::by_id(&id)).unwrap();
        assert_eq!(remote.delete_as_other_client(&ns, &id).unwrap(), 1);
        // the stream's delete event would be settled remote-to-local first
        engine.inner.instance.get(&ns).unwrap().buffer.dequeue_all();
        let writes = remote.write_count();

        push_pending(&engine);

        assert!(seen.lock().is_empty());
        assert_eq!(remote.write_count(), writes);
        assert!(engine.document_state(&ns, &id).is_none());
        assert!(!engine.synced_ids(&ns).contains(&id));
        assert!(engine.find_one(&ns, &Filter::by_id(&id)).unwrap().is_none());
    }
}
