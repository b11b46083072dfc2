//! Database/collection namespaces.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(database, collection)` pair identifying a set of synchronized documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl Namespace {
    /// Creates a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses a `database.collection` string. The collection part may contain dots.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (database, collection) = full_name.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let ns = Namespace::new("app", "todos.archived");
        assert_eq!(ns.to_string(), "app.todos.archived");
        assert_eq!(Namespace::parse("app.todos.archived"), Some(ns));
        assert_eq!(Namespace::parse("nodot"), None);
        assert_eq!(Namespace::parse(".coll"), None);
    }
}
