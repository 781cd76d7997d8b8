//! Save propagation coordinator
//!
//! Consumes "layer saved" events and runs the parent save each one calls
//! for. Routing looks only at the role tag of the saved layer and the ids of
//! the current generation's long-lived layers:
//!
//! ```text
//! saved layer                          route       action
//! Root                                 Terminal    none, already durable
//! Disposable { parent: Read }          SaveRead    save Read
//! Read                                 SaveRoot    save Root
//! BulkWrite                            SaveRoot    save Root
//! anything else                        Ignore      none
//! ```
//!
//! "Anything else" covers layers of an earlier generation and layers whose
//! parent is not the current Read layer. No ancestry walk beyond one hop.
//!
//! When Read turns out to have nothing pending (an earlier Read save already
//! carried the disposable's changes up), Root is saved next so the report
//! still says whether the changes are in the store.
//!
//! Parent saves run concurrently inside the coordinator task: a save of Read
//! publishes its own event while the coordinator is still waiting on it, so
//! handling events one at a time would deadlock.

use std::future::Future;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::SaveError;
use crate::events::{SaveEvent, SaveEventReceiver};
use crate::idgen::LayerId;
use crate::layer::{Layer, Role};

/// One parent save performed on behalf of a saved layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// The layer that was saved by the coordinator
    pub layer: LayerId,
    pub role: Role,
    pub outcome: Result<(), SaveError>,
}

/// Result of a successful save and of the cascade it triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    /// The layer whose save produced this report
    pub layer: LayerId,
    pub role: Role,
    /// Whether the layer had pending changes at all
    pub saved: bool,
    /// Parent saves in cascade order, nearest parent first
    pub hops: Vec<Hop>,
}

impl CascadeReport {
    pub(crate) fn unchanged(layer: LayerId, role: Role) -> Self {
        Self {
            layer,
            role,
            saved: false,
            hops: Vec::new(),
        }
    }

    pub(crate) fn saved(layer: LayerId, role: Role, hops: Vec<Hop>) -> Self {
        Self {
            layer,
            role,
            saved: true,
            hops,
        }
    }

    /// True when the saved changes reached the store
    ///
    /// Every hop succeeded and the chain ended at Root. A save with nothing
    /// pending is trivially durable.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        if !self.saved {
            return true;
        }
        self.hops.iter().all(|hop| hop.outcome.is_ok())
            && (self.role == Role::Root || self.reached(Role::Root))
    }

    /// Hops that failed
    pub fn failures(&self) -> impl Iterator<Item = &Hop> {
        self.hops.iter().filter(|hop| hop.outcome.is_err())
    }

    /// True if the cascade saved a layer with the given role
    #[must_use]
    pub fn reached(&self, role: Role) -> bool {
        self.hops
            .iter()
            .any(|hop| hop.role == role && hop.outcome.is_ok())
    }
}

/// Ids of the long-lived layers of one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownLayers {
    pub root: LayerId,
    pub read: LayerId,
    pub bulk_write: LayerId,
}

/// What the coordinator does about one saved event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Root saved: nothing above it
    Terminal,
    /// Save the Read layer
    SaveRead,
    /// Save the Root layer
    SaveRoot,
    /// Not a layer of this generation's tree
    Ignore,
}

/// Decide the cascade step for a saved layer
#[must_use]
pub fn route(layer: LayerId, role: Role, known: &KnownLayers) -> Route {
    match role {
        Role::Root if layer == known.root => Route::Terminal,
        Role::Read if layer == known.read => Route::SaveRoot,
        Role::BulkWrite if layer == known.bulk_write => Route::SaveRoot,
        Role::Disposable { parent } if parent == known.read => Route::SaveRead,
        _ => Route::Ignore,
    }
}

type HopFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Coordinator task state for one generation
pub(crate) struct Coordinator {
    known: KnownLayers,
    root: Layer,
    read: Layer,
    events: SaveEventReceiver,
}

impl Coordinator {
    pub(crate) fn new(root: Layer, read: Layer, bulk_write: LayerId, events: SaveEventReceiver) -> Self {
        let known = KnownLayers {
            root: root.id(),
            read: read.id(),
            bulk_write,
        };
        Self {
            known,
            root,
            read,
            events,
        }
    }

    /// Save `target` on behalf of `layer`, appending the hops taken
    ///
    /// Returns false only if `target` had nothing pending.
    async fn save_target(target: &Layer, layer: LayerId, hops: &mut Vec<Hop>) -> bool {
        match target.save().await {
            Ok(report) => {
                hops.push(Hop {
                    layer: target.id(),
                    role: target.role(),
                    outcome: Ok(()),
                });
                hops.extend(report.hops);
                report.saved
            }
            Err(e) => {
                warn!(layer = %layer, target = %target.id(), error = %e, "cascade hop failed");
                hops.push(Hop {
                    layer: target.id(),
                    role: target.role(),
                    outcome: Err(e),
                });
                true
            }
        }
    }

    /// Save `target` and report the hops to the publisher of `event`
    fn hop(target: Layer, root: Layer, event: SaveEvent) -> HopFuture {
        Box::pin(async move {
            trace!(layer = %event.layer, target = %target.id(), "cascading save");
            let mut hops = Vec::new();
            let saved = Self::save_target(&target, event.layer, &mut hops).await;
            if !saved && target.id() != root.id() {
                // An earlier save of `target` already carried the changes up.
                // Root tells whether they made it into the store.
                Self::save_target(&root, event.layer, &mut hops).await;
            }
            let _ = event.reply.send(hops);
        })
    }

    fn handle(&self, event: SaveEvent) -> Option<HopFuture> {
        let route = route(event.layer, event.role, &self.known);
        debug!(layer = %event.layer, role = ?event.role, route = ?route, "save event");

        match route {
            Route::SaveRead => Some(Self::hop(self.read.clone(), self.root.clone(), event)),
            Route::SaveRoot => Some(Self::hop(self.root.clone(), self.root.clone(), event)),
            Route::Terminal | Route::Ignore => {
                let _ = event.reply.send(Vec::new());
                None
            }
        }
    }

    /// Main event loop - runs until `shutdown` fires or every sender is gone
    pub(crate) async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut in_flight: FuturesUnordered<HopFuture> = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    if !in_flight.is_empty() {
                        debug!(pending = in_flight.len(), "dropping in-flight cascades");
                    }
                    break;
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("event channel closed");
                        break;
                    };
                    if let Some(fut) = self.handle(event) {
                        in_flight.push(fut);
                    }
                }

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }

        info!(root = %self.known.root, "coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> KnownLayers {
        KnownLayers {
            root: LayerId::new(1),
            read: LayerId::new(2),
            bulk_write: LayerId::new(3),
        }
    }

    #[test]
    fn test_route_table() {
        let known = known();
        assert_eq!(route(LayerId::new(1), Role::Root, &known), Route::Terminal);
        assert_eq!(route(LayerId::new(2), Role::Read, &known), Route::SaveRoot);
        assert_eq!(route(LayerId::new(3), Role::BulkWrite, &known), Route::SaveRoot);
        assert_eq!(
            route(
                LayerId::new(10),
                Role::Disposable {
                    parent: LayerId::new(2)
                },
                &known
            ),
            Route::SaveRead
        );
    }

    #[test]
    fn test_route_ignores_stale_layers() {
        let known = known();
        // Long-lived layers of an earlier generation
        assert_eq!(route(LayerId::new(90), Role::Root, &known), Route::Ignore);
        assert_eq!(route(LayerId::new(91), Role::Read, &known), Route::Ignore);
        assert_eq!(route(LayerId::new(92), Role::BulkWrite, &known), Route::Ignore);
        // Disposable writer minted under an old Read layer
        assert_eq!(
            route(
                LayerId::new(93),
                Role::Disposable {
                    parent: LayerId::new(91)
                },
                &known
            ),
            Route::Ignore
        );
    }

    #[test]
    fn test_route_no_ancestry_walk() {
        let known = known();
        // Parent is Root, not Read: not one of the known routes
        assert_eq!(
            route(
                LayerId::new(11),
                Role::Disposable {
                    parent: LayerId::new(1)
                },
                &known
            ),
            Route::Ignore
        );
    }

    #[test]
    fn test_report_helpers() {
        let report = CascadeReport::saved(
            LayerId::new(10),
            Role::Disposable {
                parent: LayerId::new(2),
            },
            vec![
                Hop {
                    layer: LayerId::new(2),
                    role: Role::Read,
                    outcome: Ok(()),
                },
                Hop {
                    layer: LayerId::new(1),
                    role: Role::Root,
                    outcome: Err(SaveError::Detached {
                        layer: LayerId::new(1),
                    }),
                },
            ],
        );
        assert!(report.saved);
        assert!(!report.is_durable());
        assert!(report.reached(Role::Read));
        assert!(!report.reached(Role::Root));
        assert_eq!(report.failures().count(), 1);

        let unchanged = CascadeReport::unchanged(LayerId::new(2), Role::Read);
        assert!(!unchanged.saved);
        assert!(unchanged.is_durable());

        // Ignored by the coordinator: saved, but never reached Root
        let stranded = CascadeReport::saved(LayerId::new(3), Role::BulkWrite, Vec::new());
        assert!(!stranded.is_durable());

        let root = CascadeReport::saved(LayerId::new(1), Role::Root, Vec::new());
        assert!(root.is_durable());
    }
}
