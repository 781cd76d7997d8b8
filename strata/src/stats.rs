//! Save counters
//!
//! Layer tasks bump these after each effective save (one that had pending
//! changes). A save with nothing pending is not counted.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::layer::Role;

#[derive(Debug, Default)]
pub(crate) struct SaveCounters {
    root: AtomicU64,
    read: AtomicU64,
    bulk_write: AtomicU64,
    disposable: AtomicU64,
}

impl SaveCounters {
    pub(crate) fn record(&self, role: Role) {
        let counter = match role {
            Role::Root => &self.root,
            Role::Read => &self.read,
            Role::BulkWrite => &self.bulk_write,
            Role::Disposable { .. } => &self.disposable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SaveStats {
        SaveStats {
            root_saves: self.root.load(Ordering::Relaxed),
            read_saves: self.read.load(Ordering::Relaxed),
            bulk_write_saves: self.bulk_write.load(Ordering::Relaxed),
            disposable_saves: self.disposable.load(Ordering::Relaxed),
        }
    }
}

/// Effective saves per role since the hierarchy was opened or last reset
///
/// Every Root save is one store commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub root_saves: u64,
    pub read_saves: u64,
    pub bulk_write_saves: u64,
    pub disposable_saves: u64,
}
