//! Reconciliation decisions and their log lines.
//!
//! Every branch of the remote-to-local and local-to-remote routines ends in
//! a [`SyncAction`] explained by a [`SyncMessage`]. Both are logged through
//! [`log_decision`] so a pass can be reconstructed from its log.

use docsync_protocol::{DocumentId, Namespace, OperationType};
use std::fmt;

/// Caller name logged for remote-to-local decisions.
pub(crate) const R2L_METHOD: &str = "syncRemoteChangeEventToLocal";
/// Caller name logged for local-to-remote decisions.
pub(crate) const L2R_METHOD: &str = "syncLocalToRemote";

/// What the engine does with one document in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Write the remote document locally and adopt its version.
    ApplyFromRemote,
    /// Stamp an unversioned remote document, then apply it locally.
    ApplyAndVersionFromRemote,
    /// Hand both sides to the conflict handler.
    Conflict,
    /// Apply a remote delete locally and stop synchronizing.
    DeleteLocal,
    /// Delete the local copy and stop synchronizing without emitting.
    DeleteLocalAndDesync,
    /// Ignore the event.
    DropEvent,
    /// Ignore the event and stop synchronizing the document.
    DropEventAndDesync,
    /// Ignore the event and pause the document.
    DropEventAndPause,
    /// Settle the event against a fresh read of the remote document.
    RemoteFind,
    /// Leave the document for the next pass.
    Wait,
}

impl SyncAction {
    /// Returns true for actions that report an error.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, SyncAction::DropEventAndDesync | SyncAction::DropEventAndPause)
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncAction::ApplyFromRemote | SyncAction::ApplyAndVersionFromRemote => {
                "applying changes from the remote document"
            }
            SyncAction::Conflict => "raising conflict",
            SyncAction::DeleteLocal => "applying the remote delete",
            SyncAction::DeleteLocalAndDesync => "deleting and desyncing the document",
            SyncAction::DropEvent => "dropping the event",
            SyncAction::DropEventAndDesync => "dropping the event and desyncing the document",
            SyncAction::DropEventAndPause => "dropping the event and pausing the document",
            SyncAction::RemoteFind => "re-checking against remote collection",
            SyncAction::Wait => "waiting until next pass",
        })
    }
}

/// Why a [`SyncAction`] was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// No pending writes, so the remote state wins.
    ApplyFromRemote,
    /// The remote stamp could not be parsed.
    CannotParseRemoteVersion,
    /// No pending writes, so the remote delete wins.
    DeleteFromRemote,
    /// The pending delete reached the remote store.
    DocumentDeleted,
    /// The pending insert collided with an existing remote document.
    DuplicateKeyException,
    /// Neither side has a stamp yet.
    EmptyVersion,
    /// The pending update changes nothing.
    EmptyUpdateDescription,
    /// A remote write failed.
    ExceptionOnWrite {
        /// The pending operation.
        operation: OperationType,
        /// The failure.
        error: String,
    },
    /// A pending insert, replace or update carries no document.
    ExpectedLocalDocumentToExist,
    /// The remote stamp belongs to another lineage.
    InstanceIdMismatch,
    /// A remote delete arrived while a local write is pending.
    PendingWriteDelete,
    /// One side lacks a stamp while a local write is pending.
    PendingWriteEmptyVersion,
    /// The event echoes a write this engine made.
    ProbablyGeneratedByUs,
    /// The lookup found no remote document.
    RemoteFindDeletedDoc,
    /// The lookup failed.
    RemoteFindFailed,
    /// The lookup found a document from another lineage.
    RemoteFindReplacedDoc,
    /// A write for this document was already handled in this pass.
    SimultaneousWrites,
    /// The remote counter is ahead of the pending local write.
    StaleLocalWrite,
    /// The event is older than what we already have.
    StaleEvent,
    /// The last known stamp uses an unsupported layout.
    StaleProtocolVersion(i32),
    /// The event's operation type is not understood.
    UnknownOptype(OperationType),
    /// The remote stamp uses an unsupported layout.
    UnknownRemoteProtocolVersion(i32),
    /// The guarded remote write matched nothing.
    VersionDifferent(OperationType),
    /// A buffered remote event disagrees with the local baseline.
    VersionDifferentUnprocessedEvent,
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMessage::ApplyFromRemote => f.write_str(
                "replacing local with remote document as there are no local pending writes",
            ),
            SyncMessage::CannotParseRemoteVersion => {
                f.write_str("got a remote document that could not have its version info parsed")
            }
            SyncMessage::DeleteFromRemote => {
                f.write_str("deleting local as there are no local pending writes")
            }
            SyncMessage::DocumentDeleted => f.write_str("remote document successfully deleted"),
            SyncMessage::DuplicateKeyException => f.write_str("duplicate key exception on insert"),
            SyncMessage::EmptyVersion => f.write_str("remote and local have an empty version"),
            SyncMessage::EmptyUpdateDescription => f.write_str("local update description is empty"),
            SyncMessage::ExceptionOnWrite { operation, error } => {
                write!(f, "exception on {}: {error}", operation.as_str())
            }
            SyncMessage::ExpectedLocalDocumentToExist => {
                f.write_str("expected document to exist for local change event")
            }
            SyncMessage::InstanceIdMismatch => {
                f.write_str("remote event created by different device from last seen event")
            }
            SyncMessage::PendingWriteDelete => f.write_str("remote delete but a write is pending"),
            SyncMessage::PendingWriteEmptyVersion => {
                f.write_str("remote or local have an empty version but a write is pending")
            }
            SyncMessage::ProbablyGeneratedByUs => {
                f.write_str("remote change event was generated by us")
            }
            SyncMessage::RemoteFindDeletedDoc => {
                f.write_str("latest document lookup indicates a remote delete occurred")
            }
            SyncMessage::RemoteFindFailed => {
                f.write_str("failed to retrieve latest version of document from remote database")
            }
            SyncMessage::RemoteFindReplacedDoc => {
                f.write_str("latest document lookup indicates a remote replace occurred")
            }
            SyncMessage::SimultaneousWrites => {
                f.write_str("has multiple events at same logical time")
            }
            SyncMessage::StaleLocalWrite => {
                f.write_str("remote event version has higher counter than local pending write")
            }
            SyncMessage::StaleEvent => f.write_str("remote change event is stale"),
            SyncMessage::StaleProtocolVersion(version) => write!(
                f,
                "last seen change event has an unsupported synchronization protocol \
                 version {version}"
            ),
            SyncMessage::UnknownOptype(operation) => {
                write!(f, "unknown operation type: {}", operation.as_str())
            }
            SyncMessage::UnknownRemoteProtocolVersion(version) => write!(
                f,
                "got a remote document with an unsupported synchronization protocol \
                 version {version}"
            ),
            SyncMessage::VersionDifferent(operation) => write!(
                f,
                "version different on {} document or document was deleted",
                operation.as_str()
            ),
            SyncMessage::VersionDifferentUnprocessedEvent => {
                f.write_str("version different on unprocessed change event for document")
            }
        }
    }
}

/// Formats one decision:
/// `t='{logicalT}': {caller} ns={namespace} documentId={id} {message}; {action}`.
pub(crate) fn decision_line(
    logical_t: i64,
    caller: &str,
    namespace: &Namespace,
    document_id: &DocumentId,
    message: &SyncMessage,
    action: SyncAction,
) -> String {
    format!("t='{logical_t}': {caller} ns={namespace} documentId={document_id} {message}; {action}")
}

/// Logs one decision at a level matching its severity.
pub(crate) fn log_decision(
    logical_t: i64,
    caller: &str,
    namespace: &Namespace,
    document_id: &DocumentId,
    message: &SyncMessage,
    action: SyncAction,
) {
    let line = decision_line(logical_t, caller, namespace, document_id, message, action);
    match action {
        SyncAction::DropEventAndDesync | SyncAction::DropEventAndPause => tracing::error!("{line}"),
        SyncAction::Conflict | SyncAction::DeleteLocalAndDesync => tracing::info!("{line}"),
        _ => tracing::debug!("{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_line_shape() {
        let line = decision_line(
            7,
            R2L_METHOD,
            &Namespace::new("db", "coll"),
            &DocumentId::from("x"),
            &SyncMessage::ProbablyGeneratedByUs,
            SyncAction::DropEvent,
        );
        assert_eq!(
            line,
            "t='7': syncRemoteChangeEventToLocal ns=db.coll documentId=x \
             remote change event was generated by us; dropping the event"
        );
    }

    #[test]
    fn messages_render_their_payload() {
        let message = SyncMessage::ExceptionOnWrite {
            operation: OperationType::Insert,
            error: "boom".into(),
        };
        assert_eq!(message.to_string(), "exception on insert: boom");
        assert!(SyncMessage::UnknownRemoteProtocolVersion(3).to_string().ends_with('3'));
        assert!(SyncAction::DropEventAndPause.is_irrecoverable());
        assert!(!SyncAction::Conflict.is_irrecoverable());
    }
}
