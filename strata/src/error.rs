//! Error types for the layer hierarchy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::changes::EntityKey;
use crate::idgen::LayerId;

/// The store could not be opened or its schema could not be set up.
///
/// No layer can work without the store, so callers treat this as fatal.
#[derive(Debug, Error)]
#[error("cannot open store at {}: {reason}", path.display())]
pub struct StoreOpenError {
    pub path: PathBuf,
    pub reason: String,
}

/// The store file could not be removed during a reset.
#[derive(Debug, Error)]
#[error("cannot remove store file {}: {source}", path.display())]
pub struct StoreTeardownError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Errors reported by a store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    Missing(EntityKey),

    #[error("entity already exists: {0}")]
    Conflict(EntityKey),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Key of a change the store refuses regardless of retries
    #[must_use]
    pub fn rejected_key(&self) -> Option<&str> {
        match self {
            Self::Missing(key) | Self::Conflict(key) => Some(key.as_str()),
            Self::Backend(_) => None,
        }
    }
}

/// A layer's own save failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    /// Root could not commit; its pending changes are kept for a later save.
    #[error("save of {layer} failed: {source}")]
    Store {
        layer: LayerId,
        #[source]
        source: StoreError,
    },

    /// The store refused some changes for good. They were dropped; the rest
    /// of the save was committed.
    #[error("store rejected {} change(s) saved by {layer}", rejected.len())]
    Rejected {
        layer: LayerId,
        rejected: Vec<StoreError>,
    },

    /// The layer, or the layer it merges into, no longer runs.
    #[error("{layer} is detached from its hierarchy")]
    Detached { layer: LayerId },
}

/// Errors of non-saving layer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("{layer} is read-only")]
    ReadOnly { layer: LayerId },

    #[error("{layer} is detached from its hierarchy")]
    Detached { layer: LayerId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SaveError {
    pub(crate) fn from_layer(layer: LayerId, err: LayerError) -> Self {
        match err {
            LayerError::Store(source) => Self::Store { layer, source },
            LayerError::ReadOnly { .. } | LayerError::Detached { .. } => Self::Detached { layer },
        }
    }
}

/// Errors of [`Hierarchy::reset`](crate::Hierarchy::reset).
#[derive(Debug, Error)]
pub enum ResetError {
    /// The old store file could not be deleted. The hierarchy was rebuilt
    /// on top of it, so the old data is still live and readable.
    #[error(transparent)]
    Teardown(#[from] StoreTeardownError),

    /// The fresh store could not be opened.
    #[error(transparent)]
    Reopen(#[from] StoreOpenError),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: String,
    pub value: String,
}
