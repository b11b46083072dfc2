//! # docsync Storage
//!
//! Local document stores for docsync.
//!
//! Stores hold **schemaless documents** keyed by `_id`. They know nothing
//! about synchronization; the engine keeps user data, undo records and its
//! own configuration in ordinary collections.
//!
//! ## Design Principles
//!
//! - Collections are ordered by insertion
//! - Writes are filter-guarded so callers can express optimistic concurrency
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral storage
//! - [`FileStore`] - One CBOR snapshot per collection in a locked directory
//!
//! ## Example
//!
//! ```rust
//! use docsync_protocol::{doc, Filter, Update};
//! use docsync_storage::{LocalStore, MemoryStore};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let notes = store.collection("notes").unwrap();
//! notes.insert_one(doc(json!({"_id": 1, "text": "hi"}))).unwrap();
//! notes.update_one(&Filter::eq("_id", 1), &Update::new().set("text", "hello"), false).unwrap();
//! assert_eq!(notes.count(&Filter::eq("text", "hello")).unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod error;
mod file;
mod memory;

pub use collection::{DocumentCollection, LocalStore, WriteResult};
pub use error::{StorageError, StorageResult};
pub use file::{
    decode_collection_name, encode_collection_name, read_snapshot, FileCollection, FileStore,
};
pub use memory::{InMemoryCollection, MemoryStore};
