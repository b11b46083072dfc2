//! Optimistic version stamps.
//!
//! Every document written by the engine to the remote store carries a
//! stamp in [`VERSION_FIELD`]:
//!
//! ```text
//! { "spv": <protocol version>, "id": <instance id>, "v": <counter> }
//! ```
//!
//! The instance id names a lineage of writes; the counter increments by one
//! for every accepted write in that lineage. Stamps from different lineages
//! cannot be ordered and must be settled by reading the remote document.

use crate::document::{Document, DocumentId, VERSION_FIELD};
use crate::error::{ProtocolError, ProtocolResult};
use crate::filter::Filter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only stamp layout this crate reads and writes.
pub const SYNC_PROTOCOL_VERSION: i32 = 1;

/// A version stamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    /// Layout version of the stamp.
    #[serde(rename = "spv")]
    pub protocol_version: i32,
    /// Lineage identifier.
    #[serde(rename = "id")]
    pub instance_id: String,
    /// Write counter within the lineage.
    #[serde(rename = "v")]
    pub counter: i64,
}

/// How one stamp relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    /// Same lineage and counter.
    SameWrite,
    /// Same lineage, strictly greater counter.
    Newer,
    /// Same lineage, strictly smaller counter.
    Older,
    /// Different lineages.
    Unorderable,
}

impl VersionStamp {
    /// Starts a new lineage at counter 0.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            protocol_version: SYNC_PROTOCOL_VERSION,
            instance_id: uuid::Uuid::new_v4().to_string(),
            counter: 0,
        }
    }

    /// The stamp for the next write in this lineage.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            protocol_version: self.protocol_version,
            instance_id: self.instance_id.clone(),
            counter: self.counter.wrapping_add(1),
        }
    }

    /// The stamp for the next write after `stamp`, or a fresh one if there is none.
    #[must_use]
    pub fn next_after(stamp: Option<&VersionStamp>) -> Self {
        stamp.map_or_else(Self::fresh, Self::next)
    }

    /// Returns true if this crate understands the stamp's layout.
    pub fn is_supported(&self) -> bool {
        self.protocol_version == SYNC_PROTOCOL_VERSION
    }

    /// Returns true if both stamps name the same write.
    pub fn is_same_write(&self, other: &VersionStamp) -> bool {
        self.compare(other) == VersionOrdering::SameWrite
    }

    /// Orders `self` relative to `other`.
    pub fn compare(&self, other: &VersionStamp) -> VersionOrdering {
        if self.instance_id != other.instance_id {
            return VersionOrdering::Unorderable;
        }
        match self.counter.cmp(&other.counter) {
            std::cmp::Ordering::Equal => VersionOrdering::SameWrite,
            std::cmp::Ordering::Greater => VersionOrdering::Newer,
            std::cmp::Ordering::Less => VersionOrdering::Older,
        }
    }

    /// Encodes the stamp as a document value.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "spv": self.protocol_version,
            "id": self.instance_id,
            "v": self.counter,
        })
    }

    /// Decodes a stamp value.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        if !value.is_object() {
            return Err(ProtocolError::InvalidVersion(format!(
                "expected a document, found {value}"
            )));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ProtocolError::InvalidVersion(e.to_string()))
    }

    /// Reads the stamp embedded in a document. A missing field is `Ok(None)`.
    pub fn extract(document: &Document) -> ProtocolResult<Option<Self>> {
        document.get(VERSION_FIELD).map(Self::from_value).transpose()
    }

    /// Writes the stamp into the document's version field.
    pub fn stamp(&self, document: &mut Document) {
        document.insert(VERSION_FIELD.to_string(), self.to_value());
    }

    /// The optimistic-concurrency guard for a remote write: the document with
    /// `id` that carries exactly `stamp`, or no stamp at all when `stamp` is
    /// `None`.
    pub fn filter_for(id: &DocumentId, stamp: Option<&VersionStamp>) -> Filter {
        let version = match stamp {
            Some(stamp) => Filter::Eq(VERSION_FIELD.to_string(), stamp.to_value()),
            None => Filter::Exists(VERSION_FIELD.to_string(), false),
        };
        Filter::by_id(id).and(version)
    }
}
