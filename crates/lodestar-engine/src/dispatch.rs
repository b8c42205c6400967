//! Per-subscription delivery queues.
//!
//! Each subscription gets one unbounded FIFO and one task draining it, so a
//! subscriber sees its events in sequence order while different subscribers
//! are notified concurrently. Events are queued under the writer role, which
//! is what fixes their order.

use lodestar_types::{EventId, LeaseId, ListenerEndpoint, ServiceEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::events::Delivery;
use crate::listener::{DeliveryError, EventListener, ListenerConnector};
use crate::registry::{Registry, RegistryInner};

pub(crate) struct Dispatcher {
    connector: Arc<dyn ListenerConnector>,
    queues: Mutex<HashMap<EventId, mpsc::UnboundedSender<ServiceEvent>>>,
    registry: Weak<RegistryInner>,
}

impl Dispatcher {
    pub fn new(connector: Arc<dyn ListenerConnector>, registry: Weak<RegistryInner>) -> Self {
        Self {
            connector,
            queues: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Queue events, starting a delivery task for any subscription that has
    /// none yet.
    pub fn enqueue(&self, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        for delivery in deliveries {
            let event_id = delivery.event.event_id;
            let tx = queues.entry(event_id).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(deliver(
                    event_id,
                    delivery.lease_id,
                    delivery.endpoint.clone(),
                    self.connector.clone(),
                    rx,
                    self.registry.clone(),
                ));
                tx
            });
            if tx.send(delivery.event).is_err() {
                debug!(event_id = %event_id, "Delivery task gone, dropping event");
            }
        }
    }

    /// Close a subscription's queue; already-queued events still drain.
    pub fn close(&self, event_id: &EventId) {
        self.queues.lock().remove(event_id);
    }

    pub fn close_all(&self) {
        self.queues.lock().clear();
    }

    pub fn open_queues(&self) -> usize {
        self.queues.lock().len()
    }
}

async fn deliver(
    event_id: EventId,
    lease_id: LeaseId,
    endpoint: ListenerEndpoint,
    connector: Arc<dyn ListenerConnector>,
    mut rx: mpsc::UnboundedReceiver<ServiceEvent>,
    registry: Weak<RegistryInner>,
) {
    let mut listener: Option<Arc<dyn EventListener>> = None;

    while let Some(event) = rx.recv().await {
        let sequence = event.sequence;
        let result = match &listener {
            Some(l) => l.notify(event).await,
            None => match connector.connect(&endpoint).await {
                Ok(l) => {
                    listener = Some(l.clone());
                    l.notify(event).await
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                debug!(event_id = %event_id, sequence, "Event delivered");
            }
            Err(DeliveryError::Transient(reason)) => {
                warn!(
                    event_id = %event_id,
                    sequence,
                    endpoint = %endpoint,
                    reason = %reason,
                    "Transient delivery failure, event dropped"
                );
                listener = None;
            }
            Err(DeliveryError::Definite(reason)) => {
                warn!(
                    event_id = %event_id,
                    endpoint = %endpoint,
                    reason = %reason,
                    "Subscriber rejected event, cancelling subscription"
                );
                if let Some(inner) = registry.upgrade() {
                    match Registry::from_inner(inner)
                        .cancel_event_lease(event_id, lease_id)
                        .await
                    {
                        Ok(()) | Err(RegistryError::UnknownLease) | Err(RegistryError::ShuttingDown) => {}
                        Err(e) => {
                            warn!(event_id = %event_id, error = %e, "Failed to cancel subscription");
                        }
                    }
                }
                break;
            }
        }
    }
}
