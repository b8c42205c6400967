//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use lodestar_engine::{
    DeliveryError, EventListener, ListenerConnector, ManualClock, Registry, RegistryConfig,
};
use lodestar_types::{
    Entry, EntryClass, FieldDesc, ListenerEndpoint, ServiceEvent, ServiceItem, ServiceType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fixed start time so expirations are reproducible across reopen.
pub const T0: i64 = 1_700_000_000_000;

/// Endpoint whose listener rejects every event for good.
pub const REJECTING: &str = "reject://";

/// Endpoint whose first delivery fails transiently; later ones succeed.
pub const FLAKY: &str = "flaky://";

struct ChannelListener {
    endpoint: ListenerEndpoint,
    tx: mpsc::UnboundedSender<(ListenerEndpoint, ServiceEvent)>,
}

#[async_trait]
impl EventListener for ChannelListener {
    async fn notify(&self, event: ServiceEvent) -> Result<(), DeliveryError> {
        self.tx
            .send((self.endpoint.clone(), event))
            .map_err(|_| DeliveryError::Transient("test receiver dropped".into()))
    }
}

struct RejectingListener;

#[async_trait]
impl EventListener for RejectingListener {
    async fn notify(&self, _event: ServiceEvent) -> Result<(), DeliveryError> {
        Err(DeliveryError::Definite("unknown subscription".into()))
    }
}

struct FlakyListener {
    tripped: Arc<AtomicBool>,
    inner: ChannelListener,
}

#[async_trait]
impl EventListener for FlakyListener {
    async fn notify(&self, event: ServiceEvent) -> Result<(), DeliveryError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::Transient("connection reset".into()));
        }
        self.inner.notify(event).await
    }
}

/// Connector that forwards every delivered event into one channel, except
/// for [`REJECTING`] endpoints and the first event sent to [`FLAKY`].
pub struct RecordingConnector {
    tx: mpsc::UnboundedSender<(ListenerEndpoint, ServiceEvent)>,
    flaky_tripped: Arc<AtomicBool>,
}

impl RecordingConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ListenerEndpoint, ServiceEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            tx,
            flaky_tripped: Arc::new(AtomicBool::new(false)),
        };
        (Arc::new(connector), rx)
    }
}

#[async_trait]
impl ListenerConnector for RecordingConnector {
    async fn connect(
        &self,
        endpoint: &ListenerEndpoint,
    ) -> Result<Arc<dyn EventListener>, DeliveryError> {
        if endpoint.0 == REJECTING {
            return Ok(Arc::new(RejectingListener));
        }
        let channel = ChannelListener {
            endpoint: endpoint.clone(),
            tx: self.tx.clone(),
        };
        if endpoint.0 == FLAKY {
            return Ok(Arc::new(FlakyListener {
                tripped: self.flaky_tripped.clone(),
                inner: channel,
            }));
        }
        Ok(Arc::new(channel))
    }
}

pub struct Harness {
    pub registry: Registry,
    pub clock: Arc<ManualClock>,
    pub events: mpsc::UnboundedReceiver<(ListenerEndpoint, ServiceEvent)>,
}

impl Harness {
    pub async fn open(config: RegistryConfig) -> Self {
        Self::open_at(config, Arc::new(ManualClock::new(T0))).await
    }

    pub async fn open_at(config: RegistryConfig, clock: Arc<ManualClock>) -> Self {
        let (connector, events) = RecordingConnector::new();
        let registry = Registry::open_with_clock(config, connector, clock.clone())
            .await
            .expect("registry opens");
        Self {
            registry,
            clock,
            events,
        }
    }

    /// Next delivered event, failing the test after a second of silence.
    pub async fn next_event(&mut self) -> (ListenerEndpoint, ServiceEvent) {
        tokio::time::timeout(Duration::from_secs(1), self.events.recv())
            .await
            .expect("event delivered in time")
            .expect("connector alive")
    }

    /// Assert nothing else arrives within a short grace period.
    pub async fn assert_quiet(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(50), self.events.recv()).await;
        assert!(extra.is_err(), "unexpected event: {:?}", extra);
    }
}

pub fn printer_type() -> ServiceType {
    ServiceType::root("Printer")
}

pub fn location_class() -> EntryClass {
    EntryClass::new(
        "Location",
        None,
        vec![
            FieldDesc::new("building", "String"),
            FieldDesc::new("floor", "Integer"),
        ],
    )
}

pub fn location(building: &str, floor: i64) -> Entry {
    Entry::empty(location_class())
        .with("building", building)
        .and_then(|e| e.with("floor", floor))
        .expect("valid location entry")
}

pub fn printer(building: &str, floor: i64) -> ServiceItem {
    ServiceItem::new(printer_type(), format!("proxy:{building}:{floor}").into_bytes())
        .with_attribute(location(building, floor))
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
