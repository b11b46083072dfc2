//! # docsync Protocol
//!
//! Data model shared by the docsync crates.
//!
//! This crate provides:
//! - [`Document`] and [`DocumentId`] for schemaless documents
//! - [`Namespace`] for `(database, collection)` pairs
//! - [`ChangeEvent`] and [`UpdateDescription`] for single-document writes
//! - [`VersionStamp`] for optimistic concurrency on the remote store
//! - [`Filter`] and [`Update`] for the store-facing query language
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_event;
mod document;
mod error;
mod filter;
mod namespace;
mod version;

pub use change_event::{ChangeEvent, OperationType, UpdateDescription};
pub use document::{
    doc, from_document, require_id, sanitize, to_document, Document, DocumentId, ID_FIELD,
    VERSION_FIELD,
};
pub use error::{ProtocolError, ProtocolResult};
pub use filter::{get_path, Filter, Update};
pub use namespace::Namespace;
pub use version::{VersionOrdering, VersionStamp, SYNC_PROTOCOL_VERSION};
