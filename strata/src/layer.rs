//! Layers and their serial tasks
//!
//! A layer is a cache node holding uncommitted changes. Each layer runs as
//! one tokio task that owns its [`ChangeSet`]; callers talk to it through a
//! cloneable [`Layer`] handle that sends requests and waits for the reply.
//! The task is the only code that touches the layer's state, so requests on
//! one layer are totally ordered and no locking is needed.
//!
//! A layer task reads through to, and saves into, its upstream:
//!
//! ```text
//!   Disposable ──┐
//!   Disposable ──┼─► Read ──┐
//!                           ├─► Root ──► Store
//!              BulkWrite ───┘
//! ```
//!
//! Non-root layers have their parent layer upstream; Root has the store.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::changes::{ChangeSet, EntityKey, Lookup};
use crate::coordinator::CascadeReport;
use crate::error::{LayerError, SaveError, StoreError};
use crate::events::SaveEventSender;
use crate::idgen::LayerId;
use crate::stats::SaveCounters;
use crate::store::Store;

/// Position of a layer in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the store
    Root,
    /// Long-lived front layer for the UI
    Read,
    /// Long-lived layer for writes the UI need not see at once
    BulkWrite,
    /// Short-lived writer for one unit of work
    Disposable { parent: LayerId },
}

impl Role {
    /// Execution context a layer in this role is bound to
    #[must_use]
    pub fn affinity(self) -> Affinity {
        match self {
            Role::Read => Affinity::Cooperative,
            Role::Root | Role::BulkWrite | Role::Disposable { .. } => Affinity::Exclusive,
        }
    }

    #[must_use]
    pub fn access(self) -> AccessMode {
        match self {
            Role::Read => AccessMode::ReadOnly,
            Role::Root | Role::BulkWrite | Role::Disposable { .. } => AccessMode::ReadWrite,
        }
    }
}

/// Where a layer's task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// On the designated UI runtime, shared with other UI work
    Cooperative,
    /// On a private task of the hierarchy's runtime
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

type Job = Box<dyn FnOnce(&mut ChangeSet) + Send>;

/// Requests sent from `Layer` handles to the layer task
pub(crate) enum LayerRequest {
    /// Run a closure against the pending changes
    Perform { job: Job },
    Fetch {
        key: EntityKey,
        response: oneshot::Sender<Result<Option<Vec<u8>>, LayerError>>,
    },
    List {
        dir_name: String,
        response: oneshot::Sender<Result<Vec<EntityKey>, LayerError>>,
    },
    PendingLen { response: oneshot::Sender<usize> },
    Save {
        response: oneshot::Sender<Result<CascadeReport, SaveError>>,
    },
    /// Fold a child's saved changes into the pending changes
    Merge {
        child: LayerId,
        changes: ChangeSet,
        response: oneshot::Sender<()>,
    },
    /// Stop the task after replying
    Shutdown { response: oneshot::Sender<()> },
}

/// Handle to a layer
///
/// Clones address the same layer. Once the layer task has stopped (after a
/// reset or shutdown of the hierarchy), every operation fails with
/// `Detached`.
#[derive(Clone)]
pub struct Layer {
    id: LayerId,
    role: Role,
    parent: Option<LayerId>,
    tx: mpsc::UnboundedSender<LayerRequest>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl Layer {
    #[must_use]
    pub fn id(&self) -> LayerId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Parent layer, `None` for Root
    #[must_use]
    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.role.affinity()
    }

    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.role.access()
    }

    fn detached(&self) -> LayerError {
        LayerError::Detached { layer: self.id }
    }

    /// Send a request and wait for the layer task to answer it
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> LayerRequest,
    ) -> Result<T, LayerError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| self.detached())?;
        rx.await.map_err(|_| self.detached())
    }

    /// Run `f` against the pending changes, on the layer's own task
    ///
    /// # Errors
    ///
    /// `ReadOnly` on the Read layer, `Detached` if the layer task is gone.
    pub async fn perform<F, R>(&self, f: F) -> Result<R, LayerError>
    where
        F: FnOnce(&mut ChangeSet) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.access() == AccessMode::ReadOnly {
            return Err(LayerError::ReadOnly { layer: self.id });
        }
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |changes| {
            let _ = tx.send(f(changes));
        });
        self.tx
            .send(LayerRequest::Perform { job })
            .map_err(|_| self.detached())?;
        rx.await.map_err(|_| self.detached())
    }

    pub async fn insert(
        &self,
        key: impl Into<EntityKey>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), LayerError> {
        let (key, value) = (key.into(), value.into());
        self.perform(move |changes| changes.insert(key, value)).await
    }

    pub async fn update(
        &self,
        key: impl Into<EntityKey>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), LayerError> {
        let (key, value) = (key.into(), value.into());
        self.perform(move |changes| changes.update(key, value)).await
    }

    pub async fn delete(&self, key: impl Into<EntityKey>) -> Result<(), LayerError> {
        let key = key.into();
        self.perform(move |changes| changes.delete(key)).await
    }

    /// Value of an entity as seen from this layer
    ///
    /// Pending changes of this layer win; otherwise the parent answers.
    pub async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, LayerError> {
        let key = key.to_string();
        self.call(|response| LayerRequest::Fetch { key, response })
            .await?
    }

    /// Keys under a directory as seen from this layer, sorted
    pub async fn list(&self, dir_name: &str) -> Result<Vec<EntityKey>, LayerError> {
        let dir_name = dir_name.to_string();
        self.call(|response| LayerRequest::List { dir_name, response })
            .await?
    }

    pub async fn pending_len(&self) -> Result<usize, LayerError> {
        self.call(|response| LayerRequest::PendingLen { response })
            .await
    }

    pub async fn has_changes(&self) -> Result<bool, LayerError> {
        Ok(self.pending_len().await? > 0)
    }

    /// Push pending changes into the parent (Root: commit them to the store)
    ///
    /// Returns after the cascade above this layer has finished. Failures of
    /// hops above this layer do not fail this call; they are listed in the
    /// returned report.
    ///
    /// # Errors
    ///
    /// - `SaveError::Store` if Root's commit failed; pending changes are kept.
    /// - `SaveError::Rejected` if the store refused some of Root's changes
    ///   (`Missing`, `Conflict`). Those are dropped and the rest is committed.
    /// - `SaveError::Detached` if this layer or its parent no longer runs.
    pub async fn save(&self) -> Result<CascadeReport, SaveError> {
        self.call(|response| LayerRequest::Save { response })
            .await
            .map_err(|e| SaveError::from_layer(self.id, e))?
    }

    pub(crate) async fn merge(&self, child: LayerId, changes: ChangeSet) -> Result<(), LayerError> {
        self.call(|response| LayerRequest::Merge {
            child,
            changes,
            response,
        })
        .await
    }

    /// Stop the layer task once the requests queued before this one are done
    pub(crate) async fn shutdown(&self) {
        if self
            .call(|response| LayerRequest::Shutdown { response })
            .await
            .is_err()
        {
            trace!(layer = %self.id, "layer task already stopped");
        }
    }
}

/// Read-only handle to the Read layer
#[derive(Debug, Clone)]
pub struct ReadView {
    layer: Layer,
}

impl ReadView {
    pub(crate) fn new(layer: Layer) -> Self {
        Self { layer }
    }

    #[must_use]
    pub fn id(&self) -> LayerId {
        self.layer.id()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.layer.role()
    }

    #[must_use]
    pub fn parent(&self) -> Option<LayerId> {
        self.layer.parent()
    }

    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.layer.affinity()
    }

    pub async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, LayerError> {
        self.layer.fetch(key).await
    }

    pub async fn list(&self, dir_name: &str) -> Result<Vec<EntityKey>, LayerError> {
        self.layer.list(dir_name).await
    }

    pub async fn has_changes(&self) -> Result<bool, LayerError> {
        self.layer.has_changes().await
    }
}

// ============================================================================
// Upstream: where a layer reads through to and saves into
// ============================================================================

trait Upstream: Send + 'static {
    fn fetch(
        &mut self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, LayerError>> + Send;

    fn list(&mut self, dir_name: &str)
        -> impl Future<Output = Result<Vec<EntityKey>, LayerError>> + Send;

    /// Hand saved changes one level up
    fn push(
        &mut self,
        layer: LayerId,
        changes: &ChangeSet,
    ) -> impl Future<Output = Result<(), SaveError>> + Send;
}

/// Upstream of every non-root layer
struct ParentUpstream {
    parent: Layer,
}

impl Upstream for ParentUpstream {
    async fn fetch(&mut self, key: &str) -> Result<Option<Vec<u8>>, LayerError> {
        self.parent.fetch(key).await
    }

    async fn list(&mut self, dir_name: &str) -> Result<Vec<EntityKey>, LayerError> {
        self.parent.list(dir_name).await
    }

    async fn push(&mut self, layer: LayerId, changes: &ChangeSet) -> Result<(), SaveError> {
        self.parent
            .merge(layer, changes.clone())
            .await
            .map_err(|_| SaveError::Detached { layer })
    }
}

/// Upstream of Root: the store itself
///
/// No row cache; fetches read through to the store.
struct StoreUpstream<S: Store> {
    store: S,
}

impl<S: Store> Upstream for StoreUpstream<S> {
    async fn fetch(&mut self, key: &str) -> Result<Option<Vec<u8>>, LayerError> {
        Ok(self.store.fetch(key).await?)
    }

    async fn list(&mut self, dir_name: &str) -> Result<Vec<EntityKey>, LayerError> {
        Ok(self.store.listdir(dir_name).await?)
    }

    async fn push(&mut self, layer: LayerId, changes: &ChangeSet) -> Result<(), SaveError> {
        self.store
            .commit(changes)
            .await
            .map_err(|source| SaveError::Store { layer, source })
    }
}

// ============================================================================
// Layer task
// ============================================================================

/// Shared by all layers of one hierarchy generation
#[derive(Clone)]
pub(crate) struct Wiring {
    pub events: SaveEventSender,
    pub counters: Arc<SaveCounters>,
}

struct LayerTask<U: Upstream> {
    id: LayerId,
    role: Role,
    pending: ChangeSet,
    upstream: U,
    wiring: Wiring,
    request_rx: mpsc::UnboundedReceiver<LayerRequest>,
}

impl<U: Upstream> LayerTask<U> {
    async fn fetch(&mut self, key: &str) -> Result<Option<Vec<u8>>, LayerError> {
        match self.pending.lookup(key) {
            Lookup::Found(value) => Ok(Some(value.to_vec())),
            Lookup::Deleted => Ok(None),
            Lookup::Unknown => self.upstream.fetch(key).await,
        }
    }

    async fn list(&mut self, dir_name: &str) -> Result<Vec<EntityKey>, LayerError> {
        let keys = self.upstream.list(dir_name).await?;
        Ok(self.pending.apply_listing(dir_name, keys))
    }

    /// Push pending changes upstream, dropping those the store rejects
    ///
    /// A change the store refuses for good (`Missing`, `Conflict`) is taken
    /// out and the rest is pushed again, so one bad change cannot block
    /// later saves. Returns the rejections.
    async fn push_pending(&mut self) -> Result<Vec<StoreError>, SaveError> {
        let mut rejected = Vec::new();
        while !self.pending.is_empty() {
            match self.upstream.push(self.id, &self.pending).await {
                Ok(()) => break,
                Err(SaveError::Store { layer, source }) => {
                    let dropped = source
                        .rejected_key()
                        .and_then(|key| self.pending.remove(key));
                    if dropped.is_none() {
                        return Err(SaveError::Store { layer, source });
                    }
                    warn!(layer = %self.id, error = %source, "store rejected change, dropping it");
                    rejected.push(source);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rejected)
    }

    async fn save(&mut self) -> Result<CascadeReport, SaveError> {
        if self.pending.is_empty() {
            trace!(layer = %self.id, "nothing to save");
            return Ok(CascadeReport::unchanged(self.id, self.role));
        }

        let rejected = match self.push_pending().await {
            Ok(rejected) => rejected,
            Err(e) => {
                warn!(layer = %self.id, role = ?self.role, error = %e, "save failed, keeping pending changes");
                return Err(e);
            }
        };

        let mut hops = Vec::new();
        if !self.pending.is_empty() {
            let saved = self.pending.take();
            self.wiring.counters.record(self.role);
            debug!(layer = %self.id, role = ?self.role, changes = saved.len(), "saved");
            hops = self.wiring.events.publish(self.id, self.role).await;
        }

        if !rejected.is_empty() {
            return Err(SaveError::Rejected {
                layer: self.id,
                rejected,
            });
        }
        Ok(CascadeReport::saved(self.id, self.role, hops))
    }

    /// Main loop - serves requests one at a time until shutdown
    async fn run(mut self) -> U {
        debug!(layer = %self.id, role = ?self.role, "layer task starting");

        while let Some(request) = self.request_rx.recv().await {
            match request {
                LayerRequest::Perform { job } => job(&mut self.pending),
                LayerRequest::Fetch { key, response } => {
                    let result = self.fetch(&key).await;
                    let _ = response.send(result);
                }
                LayerRequest::List { dir_name, response } => {
                    let result = self.list(&dir_name).await;
                    let _ = response.send(result);
                }
                LayerRequest::PendingLen { response } => {
                    let _ = response.send(self.pending.len());
                }
                LayerRequest::Save { response } => {
                    let result = self.save().await;
                    let _ = response.send(result);
                }
                LayerRequest::Merge {
                    child,
                    changes,
                    response,
                } => {
                    trace!(layer = %self.id, child = %child, changes = changes.len(), "merging child changes");
                    self.pending.merge(changes);
                    let _ = response.send(());
                }
                LayerRequest::Shutdown { response } => {
                    if !self.pending.is_empty() {
                        debug!(layer = %self.id, changes = self.pending.len(), "discarding unsaved changes");
                    }
                    let _ = response.send(());
                    break;
                }
            }
        }

        debug!(layer = %self.id, "layer task done");
        self.upstream
    }
}

/// Spawn the Root layer over an open store
///
/// The join handle yields the store back once the task has been shut down.
pub(crate) fn spawn_root<S: Store>(
    id: LayerId,
    store: S,
    wiring: &Wiring,
    runtime: &Handle,
) -> (Layer, JoinHandle<S>) {
    let (tx, request_rx) = mpsc::unbounded_channel();
    let task = LayerTask {
        id,
        role: Role::Root,
        pending: ChangeSet::new(),
        upstream: StoreUpstream { store },
        wiring: wiring.clone(),
        request_rx,
    };
    let join = runtime.spawn(async move { task.run().await.store });
    let layer = Layer {
        id,
        role: Role::Root,
        parent: None,
        tx,
    };
    (layer, join)
}

/// Spawn a non-root layer under `parent`
pub(crate) fn spawn_child(
    id: LayerId,
    role: Role,
    parent: &Layer,
    wiring: &Wiring,
    runtime: &Handle,
) -> Layer {
    let (tx, request_rx) = mpsc::unbounded_channel();
    let task = LayerTask {
        id,
        role,
        pending: ChangeSet::new(),
        upstream: ParentUpstream {
            parent: parent.clone(),
        },
        wiring: wiring.clone(),
        request_rx,
    };
    // Detached: the task ends on shutdown or when the last handle is dropped
    drop(runtime.spawn(task.run()));
    Layer {
        id,
        role,
        parent: Some(parent.id()),
        tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::save_event_channel;
    use crate::store::{MemStoreProvider, StoreProvider};
    use std::path::Path;

    fn wiring() -> (Wiring, crate::events::SaveEventReceiver) {
        let (events, rx) = save_event_channel(8);
        let wiring = Wiring {
            events,
            counters: Arc::new(SaveCounters::default()),
        };
        (wiring, rx)
    }

    #[test]
    fn test_role_affinity_and_access() {
        assert_eq!(Role::Read.affinity(), Affinity::Cooperative);
        assert_eq!(Role::Read.access(), AccessMode::ReadOnly);
        assert_eq!(Role::Root.affinity(), Affinity::Exclusive);
        assert_eq!(Role::BulkWrite.access(), AccessMode::ReadWrite);
        let disposable = Role::Disposable {
            parent: LayerId::new(2),
        };
        assert_eq!(disposable.affinity(), Affinity::Exclusive);
        assert_eq!(disposable.access(), AccessMode::ReadWrite);
    }

    #[tokio::test]
    async fn test_pending_changes_stay_local() {
        let provider = MemStoreProvider::new();
        let store = provider.open(Path::new("t.db")).unwrap();
        let (wiring, _rx) = wiring();
        let runtime = Handle::current();

        let (root, _join) = spawn_root(LayerId::new(1), store, &wiring, &runtime);
        let child = spawn_child(LayerId::new(2), Role::BulkWrite, &root, &wiring, &runtime);

        child.insert("notes/1", "x").await.unwrap();
        assert_eq!(child.fetch("notes/1").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(root.fetch("notes/1").await.unwrap(), None);
        assert_eq!(child.list("notes").await.unwrap(), vec!["notes/1"]);
        assert!(root.list("notes").await.unwrap().is_empty());
        assert!(child.has_changes().await.unwrap());
        assert!(!root.has_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_perform_returns_value() {
        let provider = MemStoreProvider::new();
        let store = provider.open(Path::new("t.db")).unwrap();
        let (wiring, _rx) = wiring();

        let (root, _join) = spawn_root(LayerId::new(1), store, &wiring, &Handle::current());
        let len = root
            .perform(|changes| {
                changes.insert("a", "1");
                changes.insert("b", "2");
                changes.len()
            })
            .await
            .unwrap();
        assert_eq!(len, 2);
    }

    #[tokio::test]
    async fn test_read_layer_rejects_mutation() {
        let provider = MemStoreProvider::new();
        let store = provider.open(Path::new("t.db")).unwrap();
        let (wiring, _rx) = wiring();
        let runtime = Handle::current();

        let (root, _join) = spawn_root(LayerId::new(1), store, &wiring, &runtime);
        let read = spawn_child(LayerId::new(2), Role::Read, &root, &wiring, &runtime);

        let result = read.insert("a", "1").await;
        assert_eq!(result, Err(LayerError::ReadOnly { layer: read.id() }));
    }

    #[tokio::test]
    async fn test_shutdown_detaches_handles() {
        let provider = MemStoreProvider::new();
        let store = provider.open(Path::new("t.db")).unwrap();
        let (wiring, _rx) = wiring();

        let (root, join) = spawn_root(LayerId::new(1), store, &wiring, &Handle::current());
        root.shutdown().await;
        let _store = join.await.unwrap();

        assert_eq!(
            root.fetch("a").await,
            Err(LayerError::Detached { layer: root.id() })
        );
        assert_eq!(
            root.save().await,
            Err(SaveError::Detached { layer: root.id() })
        );
    }
}
