//! Conflict handlers and listeners.
//!
//! Each role is a single-method trait. Closures with the matching signature
//! implement them, so hosts can pass either a type or a closure.

use crate::error::SyncError;
use docsync_protocol::{ChangeEvent, Document, DocumentId};

/// Error type returned by user conflict handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Decides the winning state of a document whose local and remote writes
/// diverged.
///
/// Returning the remote event's document (or `None` for a remote delete)
/// accepts the remote state. Any other document becomes a new local write
/// retried on a later pass, and `None` against a remote document becomes a
/// local delete. Events carry no version stamps.
///
/// A failing handler pauses the document and reports the error.
pub trait ConflictHandler: Send + Sync {
    /// Resolves one conflict.
    fn resolve_conflict(
        &self,
        document_id: &DocumentId,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> Result<Option<Document>, BoxError>;
}

impl<F> ConflictHandler for F
where
    F: Fn(&DocumentId, &ChangeEvent, &ChangeEvent) -> Result<Option<Document>, BoxError>
        + Send
        + Sync,
{
    fn resolve_conflict(
        &self,
        document_id: &DocumentId,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> Result<Option<Document>, BoxError> {
        self(document_id, local_event, remote_event)
    }
}

/// Receives every externally visible change to a synchronized document.
pub trait ChangeEventListener: Send + Sync {
    /// Called once per change, after the engine released its locks.
    fn on_event(&self, document_id: &DocumentId, event: &ChangeEvent);
}

impl<F> ChangeEventListener for F
where
    F: Fn(&DocumentId, &ChangeEvent) + Send + Sync,
{
    fn on_event(&self, document_id: &DocumentId, event: &ChangeEvent) {
        self(document_id, event);
    }
}

/// Receives irrecoverable errors. `document_id` is `None` for errors that
/// cannot be attributed to a document.
pub trait ErrorListener: Send + Sync {
    /// Called once per error.
    fn on_error(&self, error: &SyncError, document_id: Option<&DocumentId>);
}

impl<F> ErrorListener for F
where
    F: Fn(&SyncError, Option<&DocumentId>) + Send + Sync,
{
    fn on_error(&self, error: &SyncError, document_id: Option<&DocumentId>) {
        self(error, document_id);
    }
}

/// Built-in conflict handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Keep whatever the remote store holds.
    #[default]
    RemoteWins,
    /// Keep the local write and push it again.
    LocalWins,
}

impl ConflictPolicy {
    /// Stable numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictPolicy::RemoteWins => 0,
            ConflictPolicy::LocalWins => 1,
        }
    }

    /// Parses a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConflictPolicy::RemoteWins),
            1 => Some(ConflictPolicy::LocalWins),
            _ => None,
        }
    }
}

impl ConflictHandler for ConflictPolicy {
    fn resolve_conflict(
        &self,
        _document_id: &DocumentId,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> Result<Option<Document>, BoxError> {
        Ok(match self {
            ConflictPolicy::RemoteWins => remote_event.full_document.clone(),
            ConflictPolicy::LocalWins => local_event.full_document.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{doc, Namespace};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn events() -> (ChangeEvent, ChangeEvent) {
        let ns = Namespace::new("db", "coll");
        let id = DocumentId::from("x");
        (
            ChangeEvent::replace(&ns, &id, doc(json!({"_id": "x", "side": "local"})), true),
            ChangeEvent::delete(&ns, &id, false),
        )
    }

    #[test]
    fn policies_pick_a_side() {
        let (local, remote) = events();
        let id = DocumentId::from("x");
        assert_eq!(
            ConflictPolicy::RemoteWins.resolve_conflict(&id, &local, &remote).unwrap(),
            None
        );
        assert_eq!(
            ConflictPolicy::LocalWins.resolve_conflict(&id, &local, &remote).unwrap(),
            local.full_document
        );
    }

    #[test]
    fn policy_codes() {
        for policy in [ConflictPolicy::RemoteWins, ConflictPolicy::LocalWins] {
            assert_eq!(ConflictPolicy::from_code(policy.to_code()), Some(policy));
        }
        assert_eq!(ConflictPolicy::from_code(9), None);
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::RemoteWins);
    }

    #[test]
    fn closures_are_handlers_and_listeners() {
        let (local, remote) = events();
        let id = DocumentId::from("x");

        let handler: Arc<dyn ConflictHandler> = Arc::new(
            |_: &DocumentId,
             _: &ChangeEvent,
             _: &ChangeEvent|
             -> Result<Option<Document>, BoxError> { Err("refused".into()) },
        );
        assert!(handler.resolve_conflict(&id, &local, &remote).is_err());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let listener: Arc<dyn ChangeEventListener> =
            Arc::new(move |_: &DocumentId, _: &ChangeEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        listener.on_event(&id, &local);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
