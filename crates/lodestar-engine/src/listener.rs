//! Subscriber transport seam.
//!
//! The engine persists a [`ListenerEndpoint`] per subscription and asks a
//! [`ListenerConnector`] to turn it into a live [`EventListener`] when there is
//! something to deliver. Transports implement both traits.

use async_trait::async_trait;
use lodestar_types::{ListenerEndpoint, ServiceEvent};
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a failed delivery attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscriber may accept a later event (timeout, connection reset)
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The subscriber will never accept events; the subscription is cancelled
    #[error("definite delivery failure: {0}")]
    Definite(String),
}

/// A live subscriber.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn notify(&self, event: ServiceEvent) -> Result<(), DeliveryError>;
}

/// Resolves persisted endpoints to live subscribers.
#[async_trait]
pub trait ListenerConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ListenerEndpoint,
    ) -> Result<Arc<dyn EventListener>, DeliveryError>;
}

/// Connector for processes with no subscriber transport.
///
/// Every connection attempt fails transiently, so subscriptions are kept
/// (and persisted) but nothing is delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnreachableConnector;

#[async_trait]
impl ListenerConnector for UnreachableConnector {
    async fn connect(
        &self,
        endpoint: &ListenerEndpoint,
    ) -> Result<Arc<dyn EventListener>, DeliveryError> {
        Err(DeliveryError::Transient(format!(
            "no transport for endpoint {endpoint}"
        )))
    }
}
