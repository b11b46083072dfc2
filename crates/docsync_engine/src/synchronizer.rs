//! The synchronization engine.

use crate::config::SyncConfig;
use crate::dispatch::{Dispatcher, Outbox};
use crate::doc_state::DocumentSyncState;
use crate::error::{SyncError, SyncResult};
use crate::instance_state::{InstanceSyncState, NamespaceEntry};
use crate::listener::{ChangeEventListener, ConflictHandler, ErrorListener};
use crate::monitor::{AuthMonitor, Connectivity, NetworkMonitor};
use crate::namespace_state::NamespaceSyncState;
use crate::remote::RemoteClient;
use docsync_protocol::{DocumentId, Namespace};
use docsync_storage::{DocumentCollection, LocalStore};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Statistics about sync passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that ran both phases.
    pub passes_completed: u64,
    /// Passes skipped because the engine was unconfigured, offline or
    /// logged out.
    pub passes_skipped: u64,
    /// Conflicts handed to a conflict handler.
    pub conflicts_resolved: u64,
    /// Successful writes to the remote store.
    pub remote_writes: u64,
    /// Last reported error message.
    pub last_error: Option<String>,
}

/// Keeps a local document store consistent with a remote one.
///
/// Cloning is cheap; clones share one engine. The engine stops when the
/// last clone is dropped.
///
/// # Example
///
/// ```rust
/// use docsync_engine::{ConflictPolicy, MemoryRemote, SyncConfig, Synchronizer};
/// use docsync_protocol::{doc, Filter, Namespace};
/// use docsync_storage::MemoryStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let remote = MemoryRemote::new();
/// let engine = Synchronizer::new(
///     SyncConfig::default().with_background_loop(false),
///     Arc::new(MemoryStore::new()),
///     Arc::new(remote.clone()),
/// )
/// .unwrap();
/// let todos = Namespace::new("app", "todos");
/// engine.configure(&todos, ConflictPolicy::RemoteWins, None, None).unwrap();
///
/// engine.insert_one(&todos, doc(json!({"_id": 1, "title": "write docs"}))).unwrap();
/// assert!(engine.do_sync_pass().unwrap());
/// assert_eq!(remote.documents(&todos).len(), 1);
/// assert_eq!(engine.find(&todos, &Filter::All).unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct Synchronizer {
    pub(crate) inner: Arc<SyncInner>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("instance_key", &self.inner.config.instance_key)
            .field("running", &self.is_running())
            .field("logical_t", &self.logical_t())
            .finish()
    }
}

pub(crate) struct SyncInner {
    me: Weak<SyncInner>,
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<dyn RemoteClient>,
    network: Arc<dyn NetworkMonitor>,
    auth: Arc<dyn AuthMonitor>,
    pub(crate) instance: InstanceSyncState,
    logical_t: AtomicI64,
    configured: AtomicBool,
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
    pass_lock: Mutex<()>,
    pub(crate) stats: RwLock<SyncStats>,
    error_listener: RwLock<Option<Arc<dyn ErrorListener>>>,
    /// Recovery failures raised before any error listener was attached.
    unreported: Mutex<Vec<SyncError>>,
    dispatcher: Dispatcher,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

struct Worker {
    handle: JoinHandle<()>,
    signal: Arc<LoopSignal>,
}

/// Wakes the loop thread early when the engine stops.
#[derive(Default)]
struct LoopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl LoopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `timeout` unless stopped first. Returns true once stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

impl Synchronizer {
    /// Creates an engine that is always online and logged in.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
    ) -> SyncResult<Self> {
        let connectivity = Arc::new(Connectivity::new());
        Self::with_monitors(config, store, remote, connectivity.clone(), connectivity)
    }

    /// Creates an engine gated on the given monitors.
    ///
    /// Loads the persisted configuration and starts crash recovery. Returns
    /// once recovery holds every namespace lock, so no call can observe a
    /// namespace before it has been recovered.
    pub fn with_monitors(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        network: Arc<dyn NetworkMonitor>,
        auth: Arc<dyn AuthMonitor>,
    ) -> SyncResult<Self> {
        let instance = InstanceSyncState::load(store.as_ref(), &config)?;
        let dispatcher = Dispatcher::spawn(&config.instance_key);
        let inner = Arc::new_cyclic(|me| SyncInner {
            me: me.clone(),
            config,
            store,
            remote,
            network,
            auth,
            instance,
            logical_t: AtomicI64::new(0),
            configured: AtomicBool::new(false),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            pass_lock: Mutex::new(()),
            stats: RwLock::new(SyncStats::default()),
            error_listener: RwLock::new(None),
            unreported: Mutex::new(Vec::new()),
            dispatcher,
            recovery: Mutex::new(None),
        });
        let recovery = inner.spawn_recovery()?;
        *inner.recovery.lock() = Some(recovery);
        Ok(Self { inner })
    }

    /// Attaches handlers to a namespace and starts the engine.
    ///
    /// The error listener, when given, replaces the engine-wide one.
    pub fn configure(
        &self,
        namespace: &Namespace,
        conflict_handler: impl ConflictHandler + 'static,
        change_listener: Option<Arc<dyn ChangeEventListener>>,
        error_listener: Option<Arc<dyn ErrorListener>>,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let entry = inner.instance.get_or_create(namespace)?;
        if let Some(listener) = error_listener {
            inner.attach_error_listener(listener);
        }
        entry.state.write().configure(Arc::new(conflict_handler), change_listener);
        inner.configured.store(true, Ordering::SeqCst);
        tracing::info!(ns = %namespace, "namespace configured");
        inner.start();
        Ok(())
    }

    /// Starts the loop and opens change streams. Does nothing until a
    /// namespace is configured.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Stops the loop and closes change streams, waiting for an in-flight
    /// pass to finish.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Returns true between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Returns true once any namespace is configured.
    pub fn is_configured(&self) -> bool {
        self.inner.configured.load(Ordering::SeqCst)
    }

    /// Runs one pass: remote-to-local, then local-to-remote.
    ///
    /// Returns `Ok(false)` without doing anything while unconfigured,
    /// offline or logged out.
    ///
    /// # Errors
    ///
    /// Returns the first retryable error; the pass is then abandoned and
    /// retried as a whole.
    pub fn do_sync_pass(&self) -> SyncResult<bool> {
        self.inner.do_sync_pass()
    }

    /// The current logical time.
    pub fn logical_t(&self) -> i64 {
        self.inner.logical_t.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Re-reads the network monitor and starts or stops the engine on a
    /// separate thread.
    pub fn on_network_state_changed(&self) -> SyncResult<JoinHandle<()>> {
        self.inner.spawn_connectivity_check("network")
    }

    /// Re-reads the auth monitor and starts or stops the engine on a
    /// separate thread.
    pub fn on_auth_state_changed(&self) -> SyncResult<JoinHandle<()>> {
        self.inner.spawn_connectivity_check("auth")
    }

    /// Blocks until crash recovery has finished.
    pub fn wait_until_recovered(&self) {
        let handle = self.inner.recovery.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("recovery thread panicked");
            }
        }
    }

    /// Blocks until every listener callback queued so far has run.
    ///
    /// Must not be called from a listener.
    pub fn wait_for_listeners(&self) {
        self.inner.dispatcher.flush();
    }

    /// Every namespace this engine knows about.
    pub fn namespaces(&self) -> Vec<Namespace> {
        self.inner
            .instance
            .entries()
            .iter()
            .map(|e| e.namespace.clone())
            .collect()
    }

    /// The synchronization state of one document.
    pub fn document_state(
        &self,
        namespace: &Namespace,
        document_id: &DocumentId,
    ) -> Option<DocumentSyncState> {
        let entry = self.inner.instance.get(namespace)?;
        let state = entry.state.read();
        state.get(document_id).cloned()
    }

    /// Ids of every synchronized document in `namespace`.
    pub fn synced_ids(&self, namespace: &Namespace) -> HashSet<DocumentId> {
        self.inner
            .instance
            .get(namespace)
            .map(|e| e.state.read().synced_ids())
            .unwrap_or_default()
    }

    /// Ids of every paused document in `namespace`.
    pub fn paused_ids(&self, namespace: &Namespace) -> HashSet<DocumentId> {
        self.inner
            .instance
            .get(namespace)
            .map(|e| e.state.read().paused_ids())
            .unwrap_or_default()
    }

    /// Resumes a paused document. Returns false if it is not synchronized.
    pub fn resume_sync(&self, namespace: &Namespace, document_id: &DocumentId) -> SyncResult<bool> {
        let Some(entry) = self.inner.instance.get(namespace) else {
            return Ok(false);
        };
        let resumed = entry.state.write().resume(document_id)?;
        if resumed {
            tracing::info!(ns = %namespace, document_id = %document_id, "document resumed");
        }
        Ok(resumed)
    }
}

impl SyncInner {
    pub(crate) fn local_collection(
        &self,
        namespace: &Namespace,
    ) -> SyncResult<Arc<dyn DocumentCollection>> {
        Ok(self.store.collection(&SyncConfig::user_collection(namespace))?)
    }

    pub(crate) fn undo_collection(
        &self,
        namespace: &Namespace,
    ) -> SyncResult<Arc<dyn DocumentCollection>> {
        Ok(self.store.collection(&SyncConfig::undo_collection(namespace))?)
    }

    pub(crate) fn current_logical_t(&self) -> i64 {
        self.logical_t.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_logical_t(&self) -> i64 {
        let step = |t: i64| if t == i64::MAX { 0 } else { t + 1 };
        match self
            .logical_t
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(step(t)))
        {
            Ok(previous) | Err(previous) => step(previous),
        }
    }

    fn is_online(&self) -> bool {
        self.network.is_connected() && self.auth.is_logged_in()
    }

    pub(crate) fn do_sync_pass(&self) -> SyncResult<bool> {
        let _pass = self.pass_lock.lock();
        if !self.configured.load(Ordering::SeqCst) || !self.is_online() {
            self.stats.write().passes_skipped += 1;
            tracing::debug!("sync pass skipped: not configured, offline or logged out");
            return Ok(false);
        }
        if self.running.load(Ordering::SeqCst) {
            self.ensure_streams();
        }

        let logical_t = self.advance_logical_t();
        tracing::debug!("t='{logical_t}': sync pass started");
        self.sync_remote_to_local(logical_t)?;
        self.sync_local_to_remote(logical_t)?;
        self.stats.write().passes_completed += 1;
        tracing::debug!("t='{logical_t}': sync pass finished");
        Ok(true)
    }

    /// Runs `phase` for every namespace under its write lock, flushing the
    /// collected emissions after the lock is released.
    pub(crate) fn for_each_namespace(
        &self,
        phase: impl Fn(&NamespaceEntry, &mut NamespaceSyncState, &mut Outbox) -> SyncResult<()>,
    ) -> SyncResult<()> {
        for entry in self.instance.entries() {
            let mut outbox = Outbox::default();
            let result = {
                let mut state = entry.state.write();
                phase(&entry, &mut state, &mut outbox)
            };
            self.flush(&entry, outbox);
            match result {
                Ok(()) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::error!(ns = %entry.namespace, error = %e, "namespace phase failed");
                    self.report_error(e, None);
                }
            }
        }
        Ok(())
    }

    /// Delivers an outbox and reopens the stream if it asked for that.
    pub(crate) fn flush(&self, entry: &NamespaceEntry, outbox: Outbox) {
        let relisten = outbox.wants_relisten();
        let (events, errors) = outbox.into_parts();
        for (error, document_id) in errors {
            self.report_error(error, document_id);
        }
        for (listener, document_id, event) in events {
            self.dispatcher.event(listener, document_id, event);
        }
        if relisten {
            self.trigger_listening(entry);
        }
    }

    /// Logs an error, records it and forwards it to the error listener.
    pub(crate) fn report_error(&self, error: SyncError, document_id: Option<DocumentId>) {
        match &document_id {
            Some(id) => tracing::error!(document_id = %id, error = %error, "sync error"),
            None => tracing::error!(error = %error, "fatal sync error"),
        }
        self.stats.write().last_error = Some(error.to_string());
        let listener = self.error_listener.read().clone();
        if let Some(listener) = listener {
            self.dispatcher.error(listener, error, document_id);
        }
    }

    /// Records a failure that belongs to no document. Without an error
    /// listener it is held and replayed once one is attached.
    pub(crate) fn report_unattributed(&self, error: SyncError) {
        self.stats.write().last_error = Some(error.to_string());
        let mut unreported = self.unreported.lock();
        match self.error_listener.read().clone() {
            Some(listener) => self.dispatcher.error(listener, error, None),
            None => unreported.push(error),
        }
    }

    fn attach_error_listener(&self, listener: Arc<dyn ErrorListener>) {
        let mut unreported = self.unreported.lock();
        *self.error_listener.write() = Some(Arc::clone(&listener));
        for error in unreported.drain(..) {
            self.dispatcher.error(Arc::clone(&listener), error, None);
        }
    }

    /// Reopens the change stream of a namespace over its current ids, or
    /// closes it if the engine is stopped.
    pub(crate) fn trigger_listening(&self, entry: &NamespaceEntry) {
        if self.running.load(Ordering::SeqCst) {
            self.open_stream(entry);
        } else {
            entry.buffer.stop();
        }
    }

    fn open_stream(&self, entry: &NamespaceEntry) {
        let (ids, configured) = {
            let state = entry.state.read();
            (state.synced_ids(), state.is_configured())
        };
        entry.buffer.stop();
        if ids.is_empty() || !configured || !self.is_online() {
            return;
        }
        let ids: Vec<DocumentId> = ids.into_iter().collect();
        if let Err(e) = entry.buffer.start(self.remote.as_ref(), &ids) {
            tracing::warn!(ns = %entry.namespace, error = %e, "failed to open change stream");
        }
    }

    fn ensure_streams(&self) {
        for entry in self.instance.entries() {
            if !entry.buffer.is_open() {
                self.open_stream(&entry);
            }
        }
    }

    pub(crate) fn start(&self) {
        let mut worker = self.worker.lock();
        if !self.configured.load(Ordering::SeqCst) {
            return;
        }
        let was_running = self.running.swap(true, Ordering::SeqCst);
        self.ensure_streams();
        if was_running || worker.is_some() || !self.config.run_background_loop {
            if !was_running {
                tracing::info!(instance = %self.config.instance_key, "sync engine started");
            }
            return;
        }

        let signal = Arc::new(LoopSignal::default());
        let me = self.me.clone();
        let loop_signal = Arc::clone(&signal);
        let spawned = thread::Builder::new()
            .name(format!("docsync-{}", self.config.instance_key))
            .spawn(move || run_loop(me, loop_signal));
        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { handle, signal });
                tracing::info!(instance = %self.config.instance_key, "sync engine started");
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                drop(worker);
                let error = SyncError::Fatal(format!("failed to spawn sync loop: {e}"));
                self.report_error(error, None);
            }
        }
    }

    pub(crate) fn stop(&self) {
        let worker = {
            let mut worker = self.worker.lock();
            self.running.store(false, Ordering::SeqCst);
            worker.take()
        };
        for entry in self.instance.entries() {
            entry.buffer.stop();
        }
        if let Some(worker) = worker {
            worker.signal.stop();
            let on_loop_thread = worker.handle.thread().id() == thread::current().id();
            if !on_loop_thread && worker.handle.join().is_err() {
                tracing::error!("sync loop panicked");
            }
        }
        tracing::info!(instance = %self.config.instance_key, "sync engine stopped");
    }

    fn spawn_connectivity_check(&self, source: &'static str) -> SyncResult<JoinHandle<()>> {
        let me = self.me.clone();
        thread::Builder::new()
            .name(format!("docsync-{source}"))
            .spawn(move || {
                let Some(inner) = me.upgrade() else {
                    return;
                };
                if inner.is_online() {
                    tracing::info!(source, "connectivity restored");
                    inner.start();
                } else {
                    tracing::info!(source, "connectivity lost");
                    inner.stop();
                }
            })
            .map_err(|e| SyncError::Fatal(format!("failed to spawn {source} handler: {e}")))
    }
}

fn run_loop(me: Weak<SyncInner>, signal: Arc<LoopSignal>) {
    tracing::debug!("sync loop started");
    loop {
        let Some(inner) = me.upgrade() else {
            break;
        };
        if signal.is_stopped() {
            break;
        }
        let ran = match inner.do_sync_pass() {
            Ok(ran) => ran,
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "sync pass interrupted; retrying later");
                false
            }
            Err(e) => {
                inner.report_error(e, None);
                false
            }
        };
        let sleep = if ran {
            inner.config.short_sleep
        } else {
            inner.config.long_sleep
        };
        drop(inner);
        if signal.wait(sleep) {
            break;
        }
    }
    tracing::debug!("sync loop exited");
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.signal.stop();
        }
        for entry in self.instance.entries() {
            entry.buffer.stop();
        }
        self.dispatcher.shutdown();
    }
}
