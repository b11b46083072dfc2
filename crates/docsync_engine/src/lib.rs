//! # docsync Engine
//!
//! Offline-first synchronization of a local document store with a remote
//! one.
//!
//! This crate provides:
//! - [`Synchronizer`], the engine: local CRUD, sync passes, start/stop
//! - Per-document sync state with version stamps and pending writes
//! - Remote-to-local and local-to-remote reconciliation
//! - Conflict resolution through user handlers or [`ConflictPolicy`]
//! - Crash recovery from undo records
//! - Network and auth gating, engine registry and typed collections
//! - [`MemoryRemote`], an in-memory remote store for tests and demos
//!
//! ## Architecture
//!
//! Application writes go to the local store first and are recorded as the
//! document's pending write. A background loop runs sync passes:
//! 1. Remote-to-local: buffered change-stream events, plus a lookup of every
//!    stale document, are reconciled against local state
//! 2. Local-to-remote: each pending write is pushed with a write guarded by
//!    the last remote version seen
//!
//! A guarded write that matches nothing, or a remote change that races a
//! pending write, goes to the namespace's conflict handler.
//!
//! ## Key Invariants
//!
//! - Remote writes never overwrite a version they did not expect
//! - A write committed in a pass is never treated as a conflict in that pass
//! - An engine never conflicts with the echo of its own write
//! - Reads never expose the version field
//! - Every local mutation is bracketed by an undo record
//! - Listeners run after all engine locks are released

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod config;
mod crud;
mod dispatch;
mod doc_state;
mod error;
mod event_buffer;
mod instance_state;
mod l2r;
mod listener;
mod monitor;
mod namespace_state;
mod r2l;
mod recovery;
mod registry;
mod remote;
mod resolve;
mod synchronizer;
mod typed;

pub use action::{SyncAction, SyncMessage};
pub use config::SyncConfig;
pub use crud::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
pub use doc_state::DocumentSyncState;
pub use error::{SyncError, SyncResult};
pub use event_buffer::RemoteEventBuffer;
pub use listener::{BoxError, ChangeEventListener, ConflictHandler, ConflictPolicy, ErrorListener};
pub use monitor::{AuthMonitor, Connectivity, NetworkMonitor};
pub use namespace_state::NamespaceSyncState;
pub use registry::SynchronizerRegistry;
pub use remote::{ChangeStreamSink, MemoryRemote, RemoteClient, RemoteCollection, StreamHandle};
pub use synchronizer::{SyncStats, Synchronizer};
pub use typed::SyncCollection;
