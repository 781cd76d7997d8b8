//! Save event channel
//!
//! Typed, bounded channel carrying "layer saved" events from layer tasks to
//! the coordinator of their hierarchy. The channel is owned by the hierarchy;
//! only layers it builds get a sender, and the coordinator holds the single
//! receiver. Nothing else can subscribe.
//!
//! # Publishing
//!
//! 10. Layer task: merge pending changes into the parent
//! 20. Layer task: call `publish` and wait
//! 30. Coordinator: route the event, save the parent if needed
//! 40. Coordinator: reply with the hops it performed
//! 50. Layer task: wake up and finish its own save
//!
//! Step 20 blocks the saving layer's task. This is what makes a save return
//! only after everything above it has been saved as well.
//!
//! If the coordinator is gone (the hierarchy was reset or shut down), the
//! event cannot be delivered. The publisher then gets a single failed hop
//! naming itself instead of a cascade.

use tokio::sync::{mpsc, oneshot};

use crate::coordinator::Hop;
use crate::error::SaveError;
use crate::idgen::LayerId;
use crate::layer::Role;

/// "Layer X saved" event
pub struct SaveEvent {
    pub layer: LayerId,
    pub role: Role,
    /// Receives the hops performed on behalf of this save
    pub reply: oneshot::Sender<Vec<Hop>>,
}

impl std::fmt::Debug for SaveEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveEvent")
            .field("layer", &self.layer)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Sending side, cloned into every layer of one generation
#[derive(Debug, Clone)]
pub struct SaveEventSender {
    tx: mpsc::Sender<SaveEvent>,
}

/// Receiving side, owned by the coordinator
#[derive(Debug)]
pub struct SaveEventReceiver {
    rx: mpsc::Receiver<SaveEvent>,
}

/// Create a save event channel holding at most `capacity` undelivered events
#[must_use]
pub fn save_event_channel(capacity: usize) -> (SaveEventSender, SaveEventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SaveEventSender { tx }, SaveEventReceiver { rx })
}

impl SaveEventSender {
    /// Publish a saved event and wait until the coordinator has run the cascade
    pub async fn publish(&self, layer: LayerId, role: Role) -> Vec<Hop> {
        let (reply, rx) = oneshot::channel();
        let event = SaveEvent { layer, role, reply };

        if self.tx.send(event).await.is_err() {
            log::warn!("events.publish: coordinator gone, {layer} ({role:?}) not propagated");
            return vec![Self::undelivered(layer, role)];
        }

        match rx.await {
            Ok(hops) => {
                log::debug!("events.publish: {layer} ({role:?}) done, hops: {}", hops.len());
                hops
            }
            Err(_) => {
                // Coordinator stopped with the event in flight
                log::warn!("events.publish: cascade for {layer} ({role:?}) dropped");
                vec![Self::undelivered(layer, role)]
            }
        }
    }

    fn undelivered(layer: LayerId, role: Role) -> Hop {
        Hop {
            layer,
            role,
            outcome: Err(SaveError::Detached { layer }),
        }
    }
}

impl SaveEventReceiver {
    /// Receive the next event, `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<SaveEvent> {
        self.rx.recv().await
    }
}
