//! Conflict resolution.

use crate::action::SyncMessage;
use crate::dispatch::Outbox;
use crate::error::{SyncError, SyncResult};
use crate::namespace_state::NamespaceSyncState;
use crate::r2l::{event_version, irrecoverable};
use crate::synchronizer::SyncInner;
use docsync_protocol::{
    sanitize, ChangeEvent, DocumentId, Filter, OperationType, UpdateDescription, ID_FIELD,
};

impl SyncInner {
    /// Hands a diverged document to the namespace's conflict handler and
    /// applies the winner.
    ///
    /// Accepting the remote state commits it locally at the remote version.
    /// Anything else becomes a new pending write whose baseline is the
    /// remote version, so the next local-to-remote phase pushes it over the
    /// remote copy.
    pub(crate) fn resolve_conflict(
        &self,
        logical_t: i64,
        state: &mut NamespaceSyncState,
        document_id: &DocumentId,
        remote_event: ChangeEvent,
        outbox: &mut Outbox,
    ) -> SyncResult<()> {
        let namespace = state.namespace().clone();
        let Some(local_event) = state
            .get(document_id)
            .and_then(|d| d.uncommitted_change_event().cloned())
        else {
            return Ok(());
        };
        let Some(handler) = state.conflict_handler() else {
            tracing::warn!(
                ns = %namespace,
                document_id = %document_id,
                "no conflict handler; leaving conflict unresolved"
            );
            return Ok(());
        };

        let remote_deleted = remote_event.operation_type == OperationType::Delete;
        let remote_version = if remote_deleted {
            None
        } else {
            match event_version(&remote_event) {
                Ok(version) => version,
                Err(_) => {
                    let message = SyncMessage::CannotParseRemoteVersion;
                    outbox.error(irrecoverable(&message), Some(document_id));
                    self.desync_document(state, document_id)?;
                    outbox.relisten();
                    return Ok(());
                }
            }
        };

        let remote_event = remote_event.sanitized();
        tracing::debug!(
            ns = %namespace,
            document_id = %document_id,
            local = local_event.operation_type.as_str(),
            remote = remote_event.operation_type.as_str(),
            "t='{logical_t}': resolving conflict"
        );
        let resolved = match handler.resolve_conflict(document_id, &local_event, &remote_event) {
            Ok(resolved) => resolved.map(sanitize),
            Err(e) => {
                tracing::error!(
                    ns = %namespace,
                    document_id = %document_id,
                    error = %e,
                    "conflict handler failed; pausing document"
                );
                outbox.error(SyncError::Resolution(e.to_string()), Some(document_id));
                return state.pause(document_id);
            }
        };
        self.stats.write().conflicts_resolved += 1;

        let accepts_remote = resolved.as_ref() == remote_event.full_document.as_ref();
        let local = self.local_collection(&namespace)?;
        let listener = state.change_listener();
        let by_id = Filter::by_id(document_id);

        match resolved {
            Some(document) if accepts_remote => {
                self.with_undo(&namespace, document_id, || {
                    local.replace_one(&by_id, document.clone(), true)?;
                    state.commit_pending_write(document_id, remote_version)
                })?;
                outbox.event(
                    listener.as_ref(),
                    document_id,
                    ChangeEvent::replace(&namespace, document_id, document, false),
                );
            }
            Some(mut document) => {
                document.insert(ID_FIELD.to_string(), document_id.as_value().clone());
                let event = match &remote_event.full_document {
                    Some(remote_document) if !remote_deleted => ChangeEvent::update(
                        &namespace,
                        document_id,
                        UpdateDescription::diff(remote_document, &document),
                        document.clone(),
                        true,
                    ),
                    _ => ChangeEvent::insert(&namespace, document_id, document.clone(), true),
                };
                self.with_undo(&namespace, document_id, || {
                    local.replace_one(&by_id, document, true)?;
                    state.set_pending_write_at_version(
                        document_id,
                        logical_t,
                        remote_version,
                        event.clone(),
                    )
                })?;
                outbox.event(listener.as_ref(), document_id, event);
            }
            None if accepts_remote => {
                self.desync_document(state, document_id)?;
                outbox.event(
                    listener.as_ref(),
                    document_id,
                    ChangeEvent::delete(&namespace, document_id, false),
                );
                outbox.relisten();
            }
            None => {
                let event = ChangeEvent::delete(&namespace, document_id, true);
                self.with_undo(&namespace, document_id, || {
                    local.delete_one(&by_id)?;
                    state.set_pending_write_at_version(
                        document_id,
                        logical_t,
                        remote_version,
                        event.clone(),
                    )
                })?;
                outbox.event(listener.as_ref(), document_id, event);
            }
        }
        Ok(())
    }
}
