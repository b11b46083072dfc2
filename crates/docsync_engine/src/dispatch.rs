//! Delivery of change events and errors to host listeners.
//!
//! Decisions are taken under the namespace lock, but listeners may call back
//! into the engine. Each phase therefore collects its emissions in an
//! [`Outbox`], and the engine hands the outbox to the [`Dispatcher`] once the
//! lock is released. The dispatcher runs listeners on a single thread, so
//! events for one document arrive in the order they were produced.

use crate::error::SyncError;
use crate::listener::{ChangeEventListener, ErrorListener};
use docsync_protocol::{ChangeEvent, DocumentId};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Emissions collected while a namespace lock is held.
#[derive(Default)]
pub(crate) struct Outbox {
    events: Vec<(Arc<dyn ChangeEventListener>, DocumentId, ChangeEvent)>,
    errors: Vec<(SyncError, Option<DocumentId>)>,
    relisten: bool,
}

impl Outbox {
    /// Queues a change event if the namespace has a listener.
    pub(crate) fn event(
        &mut self,
        listener: Option<&Arc<dyn ChangeEventListener>>,
        document_id: &DocumentId,
        event: ChangeEvent,
    ) {
        if let Some(listener) = listener {
            self.events.push((Arc::clone(listener), document_id.clone(), event));
        }
    }

    /// Queues an irrecoverable error.
    pub(crate) fn error(&mut self, error: SyncError, document_id: Option<&DocumentId>) {
        self.errors.push((error, document_id.cloned()));
    }

    /// Requests that the namespace's change stream be reopened.
    pub(crate) fn relisten(&mut self) {
        self.relisten = true;
    }

    pub(crate) fn wants_relisten(&self) -> bool {
        self.relisten
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Vec<(Arc<dyn ChangeEventListener>, DocumentId, ChangeEvent)>,
        Vec<(SyncError, Option<DocumentId>)>,
    ) {
        (self.events, self.errors)
    }
}

enum Job {
    Event(Arc<dyn ChangeEventListener>, DocumentId, ChangeEvent),
    Error(Arc<dyn ErrorListener>, SyncError, Option<DocumentId>),
    Flush(mpsc::Sender<()>),
}

/// Runs listener callbacks on a dedicated thread.
pub(crate) struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl Dispatcher {
    /// Spawns the dispatch thread.
    pub(crate) fn spawn(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name(format!("docsync-dispatch-{name}"))
            .spawn(move || {
                for job in receiver {
                    run(job);
                }
            });
        match spawned {
            Ok(_) => Self {
                sender: Mutex::new(Some(sender)),
            },
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to spawn dispatch thread; listeners will not be called"
                );
                Self {
                    sender: Mutex::new(None),
                }
            }
        }
    }

    fn send(&self, job: Job) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    pub(crate) fn event(
        &self,
        listener: Arc<dyn ChangeEventListener>,
        id: DocumentId,
        event: ChangeEvent,
    ) {
        if !self.send(Job::Event(listener, id.clone(), event)) {
            tracing::warn!(document_id = %id, "dispatcher stopped; change event dropped");
        }
    }

    pub(crate) fn error(
        &self,
        listener: Arc<dyn ErrorListener>,
        error: SyncError,
        id: Option<DocumentId>,
    ) {
        let message = error.to_string();
        if !self.send(Job::Error(listener, error, id)) {
            tracing::warn!(error = %message, "dispatcher stopped; error report dropped");
        }
    }

    /// Blocks until every callback queued so far has run.
    ///
    /// Must not be called from a listener.
    pub(crate) fn flush(&self) {
        let (ack, done) = mpsc::channel();
        if self.send(Job::Flush(ack)) {
            let _ = done.recv();
        }
    }

    /// Stops the dispatch thread once queued callbacks have run.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
    }
}

/// Runs one job. A panicking listener is logged and does not stop later jobs.
fn run(job: Job) {
    let outcome = match job {
        Job::Event(listener, id, event) => {
            panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&id, &event)))
                .map_err(|p| (p, Some(id)))
        }
        Job::Error(listener, error, id) => {
            panic::catch_unwind(AssertUnwindSafe(|| listener.on_error(&error, id.as_ref())))
                .map_err(|p| (p, id))
        }
        Job::Flush(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    };
    if let Err((payload, id)) = outcome {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        match id {
            Some(id) => tracing::error!(document_id = %id, panic = %reason, "listener panicked"),
            None => tracing::error!(panic = %reason, "listener panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::Namespace;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatches_in_order_and_flushes() {
        let dispatcher = Dispatcher::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn ChangeEventListener> =
            Arc::new(move |id: &DocumentId, _: &ChangeEvent| {
                sink.lock().push(id.clone());
            });
        let ns = Namespace::new("db", "coll");
        for i in 0..5 {
            let id = DocumentId::from(i);
            let event = ChangeEvent::delete(&ns, &id, false);
            dispatcher.event(Arc::clone(&listener), id.clone(), event);
        }
        dispatcher.flush();
        let expected: Vec<DocumentId> = (0..5).map(DocumentId::from).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn errors_reach_error_listener() {
        let dispatcher = Dispatcher::spawn("errors");
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let listener: Arc<dyn ErrorListener> =
            Arc::new(move |_: &SyncError, id: Option<&DocumentId>| {
                assert!(id.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            });
        dispatcher.error(listener, SyncError::Fatal("boom".into()), None);
        dispatcher.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        dispatcher.shutdown();
        dispatcher.flush();
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let dispatcher = Dispatcher::spawn("panics");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn ChangeEventListener> =
            Arc::new(move |id: &DocumentId, _: &ChangeEvent| {
                if *id == DocumentId::from("bad") {
                    panic!("listener bug");
                }
                sink.lock().push(id.clone());
            });
        let ns = Namespace::new("db", "coll");
        for name in ["bad", "good"] {
            let id = DocumentId::from(name);
            let event = ChangeEvent::delete(&ns, &id, false);
            dispatcher.event(Arc::clone(&listener), id, event);
        }
        dispatcher.flush();
        assert_eq!(*seen.lock(), vec![DocumentId::from("good")]);
    }

    #[test]
    fn outbox_skips_missing_listener() {
        let ns = Namespace::new("db", "coll");
        let id = DocumentId::from("a");
        let listener: Arc<dyn ChangeEventListener> = Arc::new(|_: &DocumentId, _: &ChangeEvent| {});
        let mut outbox = Outbox::default();
        outbox.event(None, &id, ChangeEvent::delete(&ns, &id, false));
        assert!(!outbox.wants_relisten());

        outbox.event(Some(&listener), &id, ChangeEvent::delete(&ns, &id, false));
        outbox.error(SyncError::NotConnected, Some(&id));
        outbox.relisten();

        assert!(outbox.wants_relisten());
        let (events, errors) = outbox.into_parts();
        assert_eq!(events.len(), 1);
        assert_eq!(errors.len(), 1);
    }
}
