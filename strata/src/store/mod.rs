//! Persistent store collaborator
//!
//! The Root layer is the only owner of a [`Store`]. Everything it needs from
//! the storage engine goes through the two traits below.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Root layer task                    │
//! │  - pending changes, row cache       │
//! │  - commit() on save                 │
//! └─────────────────────────────────────┘
//!          ▲
//!          │ owns one open Store
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  StoreProvider (store files)        │
//! │  - open(path) / delete_file(path)   │
//! └─────────────────────────────────────┘
//!      ▲                 ▲
//!      │                 │
//!   MemStore        SqliteStore
//! ```

pub mod memstore;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::future::Future;
use std::path::Path;

use crate::changes::{ChangeSet, EntityKey};
use crate::error::{StoreError, StoreOpenError, StoreTeardownError};

pub use memstore::{MemStore, MemStoreProvider};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, SqliteStoreProvider};

/// An open store handle
pub trait Store: Send + Sync + 'static {
    /// Fetch the committed value of an entity.
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// List committed keys under a directory.
    ///
    /// If the name does not end with '/', one is added for matching.
    fn listdir(
        &self,
        dir_name: &str,
    ) -> impl Future<Output = Result<Vec<EntityKey>, StoreError>> + Send;

    /// Apply a change set atomically: all changes land or none do.
    ///
    /// - `Insert` of an existing key fails with `StoreError::Conflict`
    /// - `Update` or `Delete` of a missing key fails with `StoreError::Missing`
    fn commit(&self, changes: &ChangeSet) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Detach the handle from its file.
    fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Opens and deletes store files
pub trait StoreProvider: Send + Sync + 'static {
    type Store: Store;

    /// Open the store file at `path`, creating it (and its schema) if needed.
    fn open(&self, path: &Path) -> Result<Self::Store, StoreOpenError>;

    /// Delete the store file at `path`. A missing file is not an error.
    fn delete_file(&self, path: &Path) -> Result<(), StoreTeardownError>;
}
