//! Hierarchy - owns the layer tree of one store
//!
//! [`Hierarchy`] is the entry point. It builds the tree in a fixed order
//! (store, Root, Read, Bulk-Write, coordinator), hands out layer handles,
//! mints disposable writers, and tears everything down on reset.
//!
//! One hierarchy is meant to exist per store file. It is constructed
//! explicitly and shared by reference (e.g. in an `Arc`) with the UI side
//! and the writers; a reset swaps the whole tree behind the same value.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::HierarchyConfig;
use crate::coordinator::{CascadeReport, Coordinator};
use crate::error::{ResetError, SaveError, StoreError, StoreOpenError};
use crate::events::save_event_channel;
use crate::idgen::IdGen;
use crate::layer::{self, Layer, ReadView, Role, Wiring};
use crate::stats::{SaveCounters, SaveStats};
use crate::store::{Store, StoreProvider};

/// Layer handles of one generation of the tree
#[derive(Clone)]
struct Generation {
    root: Layer,
    read: Layer,
    bulk_write: Layer,
    wiring: Wiring,
}

/// Task handles needed to take a generation down
struct Teardown<S> {
    root_task: JoinHandle<S>,
    coordinator_shutdown: oneshot::Sender<()>,
    coordinator_task: JoinHandle<()>,
}

/// Build a generation over an open store, Root first
fn build<S: Store>(
    idgen: &IdGen,
    store: S,
    config: &HierarchyConfig,
    runtime: &Handle,
    ui_runtime: &Handle,
) -> (Generation, Teardown<S>) {
    let (events, events_rx) = save_event_channel(config.event_capacity);
    let wiring = Wiring {
        events,
        counters: Arc::new(SaveCounters::default()),
    };

    let (root, root_task) = layer::spawn_root(idgen.get_next(), store, &wiring, runtime);
    let read = layer::spawn_child(idgen.get_next(), Role::Read, &root, &wiring, ui_runtime);
    let bulk_write =
        layer::spawn_child(idgen.get_next(), Role::BulkWrite, &root, &wiring, runtime);

    let coordinator = Coordinator::new(root.clone(), read.clone(), bulk_write.id(), events_rx);
    let (coordinator_shutdown, shutdown_rx) = oneshot::channel();
    let coordinator_task = runtime.spawn(coordinator.run(shutdown_rx));

    debug!(root = %root.id(), read = %read.id(), bulk_write = %bulk_write.id(), "hierarchy built");

    let generation = Generation {
        root,
        read,
        bulk_write,
        wiring,
    };
    let teardown = Teardown {
        root_task,
        coordinator_shutdown,
        coordinator_task,
    };
    (generation, teardown)
}

/// Layer tree in front of one store file
pub struct Hierarchy<P: StoreProvider> {
    config: HierarchyConfig,
    provider: P,
    /// Shared by all generations, so ids never repeat across resets
    idgen: Arc<IdGen>,
    runtime: Handle,
    ui_runtime: Handle,
    current: RwLock<Generation>,
    teardown: Mutex<Option<Teardown<P::Store>>>,
    reset_lock: tokio::sync::Mutex<()>,
}

impl<P: StoreProvider> Hierarchy<P> {
    /// Open the store and build the layer tree
    ///
    /// # Errors
    ///
    /// Returns `StoreOpenError` if the store cannot be opened. No layer can
    /// work without it; callers are expected to treat this as fatal.
    ///
    /// # Panics
    ///
    /// Panics if `config.runtime` is unset and this is called outside a
    /// tokio runtime.
    pub fn open(config: HierarchyConfig, provider: P) -> Result<Self, StoreOpenError> {
        let runtime = config.runtime.clone().unwrap_or_else(Handle::current);
        let ui_runtime = config
            .ui_runtime
            .clone()
            .unwrap_or_else(|| runtime.clone());

        let store = provider.open(&config.store_path)?;
        info!(path = %config.store_path.display(), "store opened");

        let idgen = Arc::new(IdGen::new());
        let (generation, teardown) = build(&idgen, store, &config, &runtime, &ui_runtime);

        Ok(Self {
            config,
            provider,
            idgen,
            runtime,
            ui_runtime,
            current: RwLock::new(generation),
            teardown: Mutex::new(Some(teardown)),
            reset_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.config.store_path
    }

    /// The Root layer
    #[must_use]
    pub fn root(&self) -> Layer {
        self.current.read().root.clone()
    }

    /// The Read layer, restricted to queries
    #[must_use]
    pub fn read_layer(&self) -> ReadView {
        ReadView::new(self.current.read().read.clone())
    }

    /// The Bulk-Write layer
    #[must_use]
    pub fn bulk_write_layer(&self) -> Layer {
        self.current.read().bulk_write.clone()
    }

    /// Mint a fresh writer layer under the Read layer
    ///
    /// The hierarchy keeps no reference to it; it lives as long as the
    /// returned handle and its clones.
    #[must_use]
    pub fn new_disposable_writer(&self) -> Layer {
        let generation = self.current.read().clone();
        let id = self.idgen.get_next();
        let role = Role::Disposable {
            parent: generation.read.id(),
        };
        trace!(layer = %id, parent = %generation.read.id(), "new disposable writer");
        layer::spawn_child(id, role, &generation.read, &generation.wiring, &self.runtime)
    }

    /// Effective saves per role in the current generation
    #[must_use]
    pub fn stats(&self) -> SaveStats {
        self.current.read().wiring.counters.snapshot()
    }

    /// Flush what the Read layer (or, failing that, Root) has pending
    ///
    /// - Read has changes: save Read; the coordinator cascades to Root.
    /// - Only Root has changes (e.g. after a failed commit): save Root.
    /// - Nothing pending: no-op, no store write.
    ///
    /// Disposable writers are never saved from here.
    ///
    /// # Errors
    ///
    /// The error of the Read or Root save performed, see [`Layer::save`].
    pub async fn save(&self) -> Result<CascadeReport, SaveError> {
        let (read, root) = {
            let generation = self.current.read();
            (generation.read.clone(), generation.root.clone())
        };

        let read_dirty = read
            .has_changes()
            .await
            .map_err(|e| SaveError::from_layer(read.id(), e))?;
        if read_dirty {
            return read.save().await;
        }

        let root_dirty = root
            .has_changes()
            .await
            .map_err(|e| SaveError::from_layer(root.id(), e))?;
        if root_dirty {
            debug!(root = %root.id(), "flushing root");
            return root.save().await;
        }

        trace!("nothing to save");
        Ok(CascadeReport::unchanged(read.id(), read.role()))
    }

    /// Stop the current generation and take the store back from Root
    async fn stop_generation(&self) -> Option<P::Store> {
        let generation = self.current.read().clone();
        let teardown = self.teardown.lock().take()?;

        // Children first, so queued saves still find their parents
        generation.read.shutdown().await;
        generation.bulk_write.shutdown().await;
        generation.root.shutdown().await;

        let store = match teardown.root_task.await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "root task failed");
                None
            }
        };

        let _ = teardown.coordinator_shutdown.send(());
        if let Err(e) = teardown.coordinator_task.await {
            warn!(error = %e, "coordinator task failed");
        }
        store
    }

    fn install(&self, store: P::Store) {
        let (generation, teardown) = build(
            &self.idgen,
            store,
            &self.config,
            &self.runtime,
            &self.ui_runtime,
        );
        *self.current.write() = generation;
        *self.teardown.lock() = Some(teardown);
    }

    /// Tear down the tree and the store file, then build a fresh tree
    ///
    /// Unsaved changes are discarded. Handles obtained before the reset fail
    /// with `Detached` afterwards; fresh handles come from the accessors.
    ///
    /// # Errors
    ///
    /// - `ResetError::Teardown` if the store file could not be deleted. The
    ///   hierarchy is rebuilt over the surviving file and stays usable.
    /// - `ResetError::Reopen` if the fresh store cannot be opened. The
    ///   hierarchy is unusable until a later reset succeeds.
    pub async fn reset(&self) -> Result<(), ResetError> {
        let _guard = self.reset_lock.lock().await;
        let path = self.config.store_path.clone();
        info!(path = %path.display(), "resetting hierarchy");

        if let Some(store) = self.stop_generation().await {
            if let Err(e) = store.close() {
                warn!(error = %e, "closing store failed");
            }
        }

        let teardown = self.provider.delete_file(&path);
        if let Err(e) = &teardown {
            warn!(error = %e, "store file survived reset");
        }

        let store = self.provider.open(&path)?;
        self.install(store);
        teardown?;

        info!(path = %path.display(), "hierarchy reset");
        Ok(())
    }

    /// Stop all layers and close the store, keeping the store file
    ///
    /// Unsaved changes are discarded; call [`save`](Self::save) first.
    ///
    /// # Errors
    ///
    /// Returns the error of closing the store.
    pub async fn shutdown(self) -> Result<(), StoreError> {
        let _guard = self.reset_lock.lock().await;
        match self.stop_generation().await {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }
}
