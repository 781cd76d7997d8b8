//! In-memory implementation of the store traits
//!
//! Store "files" live in a map owned by the provider. Clones of a provider
//! share that map, so a test can keep one clone, hand another to the
//! hierarchy, and inspect rows and commit counts afterwards.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Store, StoreProvider};
use crate::changes::{dir_prefix, Change, ChangeSet, EntityKey};
use crate::error::{StoreError, StoreOpenError, StoreTeardownError};

#[derive(Debug, Default)]
struct MemFile {
    rows: BTreeMap<EntityKey, Vec<u8>>,
    commits: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_open: AtomicBool,
    fail_next_commit: AtomicBool,
    fail_delete: AtomicBool,
}

/// In-memory store provider
///
/// Useful for testing and for single-process use without durability.
#[derive(Debug, Clone, Default)]
pub struct MemStoreProvider {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<MemFile>>>>>,
    faults: Arc<Faults>,
}

impl MemStoreProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a store file exists at `path`
    #[must_use]
    pub fn file_exists(&self, path: impl AsRef<Path>) -> bool {
        self.files.lock().contains_key(path.as_ref())
    }

    /// Snapshot of the committed rows of the file at `path`
    #[must_use]
    pub fn rows(&self, path: impl AsRef<Path>) -> Option<BTreeMap<EntityKey, Vec<u8>>> {
        let file = self.files.lock().get(path.as_ref()).cloned()?;
        let rows = file.lock().rows.clone();
        Some(rows)
    }

    /// Number of successful commits to the file at `path`
    #[must_use]
    pub fn commit_count(&self, path: impl AsRef<Path>) -> u64 {
        self.files
            .lock()
            .get(path.as_ref())
            .map_or(0, |file| file.lock().commits)
    }

    /// Make every following `open` fail until switched off
    pub fn fail_open(&self, fail: bool) {
        self.faults.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make the next commit on any store from this provider fail
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make every following `delete_file` fail until switched off
    pub fn fail_delete(&self, fail: bool) {
        self.faults.fail_delete.store(fail, Ordering::SeqCst);
    }
}

impl StoreProvider for MemStoreProvider {
    type Store = MemStore;

    fn open(&self, path: &Path) -> Result<MemStore, StoreOpenError> {
        if self.faults.fail_open.load(Ordering::SeqCst) {
            return Err(StoreOpenError {
                path: path.to_path_buf(),
                reason: "injected open failure".to_string(),
            });
        }
        let file = Arc::clone(self.files.lock().entry(path.to_path_buf()).or_default());
        Ok(MemStore {
            file,
            faults: Arc::clone(&self.faults),
        })
    }

    fn delete_file(&self, path: &Path) -> Result<(), StoreTeardownError> {
        if self.faults.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreTeardownError {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "injected delete failure"),
            });
        }
        self.files.lock().remove(path);
        Ok(())
    }
}

/// Open handle to an in-memory store file
#[derive(Debug)]
pub struct MemStore {
    file: Arc<Mutex<MemFile>>,
    faults: Arc<Faults>,
}

impl MemStore {
    fn validate(rows: &BTreeMap<EntityKey, Vec<u8>>, changes: &ChangeSet) -> Result<(), StoreError> {
        for (key, change) in changes.iter() {
            match change {
                Change::Insert(_) if rows.contains_key(key) => {
                    return Err(StoreError::Conflict(key.clone()));
                }
                Change::Update(_) | Change::Delete if !rows.contains_key(key) => {
                    return Err(StoreError::Missing(key.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Store for MemStore {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.file.lock().rows.get(key).cloned())
    }

    async fn listdir(&self, dir_name: &str) -> Result<Vec<EntityKey>, StoreError> {
        let prefix = dir_prefix(dir_name);
        let file = self.file.lock();
        let paths = file
            .rows
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        Ok(paths)
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        if self.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }

        let mut file = self.file.lock();
        Self::validate(&file.rows, changes)?;
        for (key, change) in changes.iter() {
            match change {
                Change::Insert(data) | Change::Update(data) => {
                    file.rows.insert(key.clone(), data.clone());
                }
                Change::Delete => {
                    file.rows.remove(key);
                }
            }
        }
        file.commits += 1;
        Ok(())
    }

    fn close(self) -> Result<(), StoreError> {
        // Nothing to flush; rows stay with the provider until the file is deleted
        Ok(())
    }
}
