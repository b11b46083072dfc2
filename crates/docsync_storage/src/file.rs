//! Directory-backed document store.
//!
//! Layout:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK                 # Advisory lock for single-writer
//! ├─ <collection>.cbor    # Snapshot of one collection
//! └─ <collection>.tmp     # Transient, during an atomic snapshot write
//! ```
//!
//! Every write rewrites the collection's snapshot with write-then-rename,
//! so a crash leaves either the old or the new snapshot, never a torn one.

use crate::collection::{DocumentCollection, LocalStore, WriteResult};
use crate::error::{StorageError, StorageResult};
use crate::memory::{delegate_writes, InMemoryCollection};
use docsync_protocol::{Document, DocumentId, Filter, Update};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_EXTENSION: &str = "cbor";
const TEMP_EXTENSION: &str = "tmp";

/// A collection persisted as a CBOR snapshot file.
#[derive(Debug)]
pub struct FileCollection {
    path: PathBuf,
    inner: InMemoryCollection,
}

impl FileCollection {
    fn open(name: &str, path: PathBuf) -> StorageResult<Self> {
        let documents = if path.exists() {
            read_snapshot(&path)?
        } else {
            Vec::new()
        };
        tracing::trace!(collection = name, documents = documents.len(), "loaded snapshot");
        Ok(Self {
            path,
            inner: InMemoryCollection::with_documents(name, documents),
        })
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn collection_name(&self) -> &str {
        self.inner.collection_name()
    }

    fn read_documents(&self, filter: &Filter) -> Vec<Document> {
        self.inner.read_documents(filter)
    }

    fn persist<R>(
        &self,
        f: impl FnOnce(&mut crate::collection::DocumentSet) -> StorageResult<R>,
    ) -> StorageResult<R> {
        self.inner.mutate(f, |documents| write_snapshot(&self.path, documents))
    }
}

delegate_writes!(FileCollection, persist);

/// Reads a snapshot file.
pub fn read_snapshot(path: &Path) -> StorageResult<Vec<Document>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }
    ciborium::from_reader(BufReader::new(file))
        .map_err(|e| StorageError::Codec(format!("{}: {e}", path.display())))
}

/// Writes a snapshot atomically:
/// 1. Write to a temporary file
/// 2. Sync the temporary file to disk
/// 3. Rename it over the snapshot
fn write_snapshot(path: &Path, documents: &[Document]) -> StorageResult<()> {
    let temp_path = path.with_extension(TEMP_EXTENSION);
    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    ciborium::into_writer(&documents, &mut writer).map_err(|e| StorageError::Codec(e.to_string()))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&temp_path, path)?;
    tracing::trace!(path = %path.display(), documents = documents.len(), "wrote snapshot");
    Ok(())
}

/// Encodes a collection name as a file stem. Bytes outside `[A-Za-z0-9._-]`
/// become `%XX`.
pub fn encode_collection_name(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// Reverses [`encode_collection_name`].
pub fn decode_collection_name(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

/// A store of collections inside one locked directory.
///
/// # Thread Safety
///
/// The `FileStore` holds an exclusive lock on its directory. Only one
/// `FileStore` can be open per directory at a time, across processes.
///
/// # Example
///
/// ```no_run
/// use docsync_storage::{FileStore, LocalStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("sync-data"), true).unwrap();
/// let todos = store.collection("sync_user_app.todos").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    collections: RwLock<HashMap<String, Arc<FileCollection>>>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns [`StorageError::Locked`])
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("store directory does not exist: {}", path.display()),
                )));
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            tracing::warn!(path = %path.display(), "store directory is locked by another process");
            return Err(StorageError::Locked);
        }
        tracing::debug!(path = %path.display(), "opened file store");

        Ok(Self {
            path: path.to_path_buf(),
            collections: RwLock::new(HashMap::new()),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.path
            .join(format!("{}.{SNAPSHOT_EXTENSION}", encode_collection_name(name)))
    }
}

impl LocalStore for FileStore {
    fn collection(&self, name: &str) -> StorageResult<Arc<dyn DocumentCollection>> {
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn DocumentCollection>);
        }
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn DocumentCollection>);
        }
        let collection = Arc::new(FileCollection::open(name, self.snapshot_path(name))?);
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    fn collection_names(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_collection_name)
            {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::doc;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn file_documents_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), true).unwrap();
            let coll = store.collection("sync_user_app.todos").unwrap();
            coll.insert_one(doc(json!({"_id": "a", "n": 1, "f": 1.5, "nested": {"x": [1, 2]}})))
                .unwrap();
            coll.update_one(&Filter::eq("_id", "a"), &Update::new().set("n", 2), false)
                .unwrap();
        }

        let store = FileStore::open(dir.path(), false).unwrap();
        let coll = store.collection("sync_user_app.todos").unwrap();
        assert_eq!(
            coll.find(&Filter::All).unwrap(),
            vec![doc(json!({"_id": "a", "n": 2, "f": 1.5, "nested": {"x": [1, 2]}}))]
        );
        assert_eq!(store.collection_names().unwrap(), vec!["sync_user_app.todos"]);
    }

    #[test]
    fn file_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open(dir.path(), true).unwrap();
        assert!(matches!(
            FileStore::open(dir.path(), true),
            Err(StorageError::Locked)
        ));
    }

    #[test]
    fn file_open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(FileStore::open(&missing, false).is_err());
    }

    #[test]
    fn file_failed_write_does_not_persist() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), true).unwrap();
        let coll = store.collection("c").unwrap();
        coll.insert_one(doc(json!({"_id": 1}))).unwrap();
        assert!(coll.insert_one(doc(json!({"_id": 1}))).is_err());
        let on_disk = read_snapshot(&store.snapshot_path("c")).unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[test]
    fn collection_names_encode_to_safe_stems() {
        let name = "sync_config_user/1.documents";
        let stem = encode_collection_name(name);
        assert_eq!(stem, "sync_config_user%2F1.documents");
        assert_eq!(decode_collection_name(&stem).as_deref(), Some(name));
        assert_eq!(decode_collection_name("bad%2"), None);
    }
}
