//! SQLite-backed implementation of the store traits
//!
//! One table holds every entity as a blob keyed by its path. Each commit is
//! one transaction, so a failing change rolls back the whole change set.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{Store, StoreProvider};
use crate::changes::{dir_prefix, Change, ChangeSet, EntityKey};
use crate::error::{StoreError, StoreOpenError, StoreTeardownError};

fn backend(e: &rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Opens SQLite store files
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteStoreProvider;

impl SqliteStoreProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl StoreProvider for SqliteStoreProvider {
    type Store = SqliteStore;

    /// Creates the database and table if they don't exist.
    fn open(&self, path: &Path) -> Result<SqliteStore, StoreOpenError> {
        let open_error = |e: rusqlite::Error| StoreOpenError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let conn = Connection::open(path).map_err(open_error)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )
        .map_err(open_error)?;

        Ok(SqliteStore {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn delete_file(&self, path: &Path) -> Result<(), StoreTeardownError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreTeardownError {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Open handle to a SQLite store file
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    fn apply(tx: &rusqlite::Transaction<'_>, key: &str, change: &Change) -> Result<(), StoreError> {
        match change {
            Change::Insert(data) => {
                match tx.execute(
                    "INSERT INTO entities (key, data) VALUES (?1, ?2)",
                    params![key, data],
                ) {
                    Ok(_) => Ok(()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Err(StoreError::Conflict(key.to_string()))
                    }
                    Err(e) => Err(backend(&e)),
                }
            }
            Change::Update(data) => {
                let n = tx
                    .execute(
                        "UPDATE entities SET data = ?2 WHERE key = ?1",
                        params![key, data],
                    )
                    .map_err(|e| backend(&e))?;
                if n == 0 {
                    return Err(StoreError::Missing(key.to_string()));
                }
                Ok(())
            }
            Change::Delete => {
                let n = tx
                    .execute("DELETE FROM entities WHERE key = ?1", params![key])
                    .map_err(|e| backend(&e))?;
                if n == 0 {
                    return Err(StoreError::Missing(key.to_string()));
                }
                Ok(())
            }
        }
    }
}

impl Store for SqliteStore {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT data FROM entities WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| backend(&e))
    }

    async fn listdir(&self, dir_name: &str) -> Result<Vec<EntityKey>, StoreError> {
        let prefix = dir_prefix(dir_name);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key FROM entities
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )
            .map_err(|e| backend(&e))?;

        let paths = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(|e| backend(&e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend(&e))?;

        Ok(paths)
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| backend(&e))?;
        for (key, change) in changes.iter() {
            // Dropping `tx` on error rolls the transaction back
            Self::apply(&tx, key, change)?;
        }
        tx.commit().map_err(|e| backend(&e))
    }

    fn close(self) -> Result<(), StoreError> {
        self.conn.into_inner().close().map_err(|(_conn, e)| backend(&e))
    }
}
