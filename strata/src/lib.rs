//! Layered change-tracking in front of a single entity store
//!
//! A [`Hierarchy`] owns a tree of [`Layer`]s. Writers record changes in their
//! own layer; saving a layer merges its changes into its parent, and a
//! coordinator task cascades the save up to Root, which commits to the
//! [`Store`].

pub mod changes;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod idgen;
pub mod layer;
pub mod stats;
pub mod store;

// Re-export change types for convenience
pub use changes::{Change, ChangeSet, EntityKey, Lookup};

pub use config::HierarchyConfig;

// Re-export cascade types
pub use coordinator::{route, CascadeReport, Hop, KnownLayers, Route};

pub use error::{
    ConfigError, LayerError, ResetError, SaveError, StoreError, StoreOpenError,
    StoreTeardownError,
};

pub use hierarchy::Hierarchy;
pub use idgen::{IdGen, LayerId};
pub use layer::{AccessMode, Affinity, Layer, ReadView, Role};
pub use stats::SaveStats;

// Re-export store types
pub use store::{MemStore, MemStoreProvider, Store, StoreProvider};
#[cfg(feature = "sqlite")]
pub use store::{SqliteStore, SqliteStoreProvider};
