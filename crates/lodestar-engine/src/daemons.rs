//! Background workers: service expiry, event expiry and snapshotting.
//!
//! Each worker holds only a weak reference to the registry and upgrades it
//! for the duration of one pass, so dropping the last [`Registry`] handle
//! lets the workers wind down. Between passes an expiry worker sleeps until
//! the earliest known expiration or until told a sooner one was added.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::error::RegistryError;
use crate::registry::{Registry, RegistryInner};

/// Sleep when nothing is scheduled to expire.
const IDLE_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default)]
pub(crate) struct Wakeups {
    pub service_expiry: Notify,
    pub event_expiry: Notify,
    pub snapshot: Notify,
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    Services,
    Events,
}

impl Expiry {
    fn name(self) -> &'static str {
        match self {
            Expiry::Services => "service-expiry",
            Expiry::Events => "event-expiry",
        }
    }
}

pub(crate) fn spawn(inner: &Arc<RegistryInner>) -> Vec<JoinHandle<()>> {
    let expiry = |kind| {
        tokio::spawn(expiry_loop(
            kind,
            Arc::downgrade(inner),
            inner.wakeups.clone(),
            inner.clock.clone(),
            inner.shutdown_tx.subscribe(),
        ))
    };
    vec![
        expiry(Expiry::Services),
        expiry(Expiry::Events),
        tokio::spawn(snapshot_loop(
            Arc::downgrade(inner),
            inner.wakeups.clone(),
            inner.shutdown_tx.subscribe(),
        )),
    ]
}

async fn expiry_loop(
    kind: Expiry,
    handle: Weak<RegistryInner>,
    wakeups: Arc<Wakeups>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(daemon = kind.name(), "Daemon started");
    loop {
        let Some(inner) = handle.upgrade() else {
            break;
        };
        let registry = Registry::from_inner(inner);
        let sweep = match kind {
            Expiry::Services => registry.sweep_services().await,
            Expiry::Events => registry.sweep_events().await,
        };
        drop(registry);

        let next = match sweep {
            Ok(sweep) => sweep.next_expiration,
            Err(RegistryError::ShuttingDown) => break,
            Err(e) => {
                error!(daemon = kind.name(), error = %e, "Expiry pass failed");
                None
            }
        };
        let wait = next.map_or(IDLE_WAIT, |t| {
            Duration::from_millis(t.saturating_sub(clock.now_millis()).max(0) as u64)
        });

        let woken = match kind {
            Expiry::Services => &wakeups.service_expiry,
            Expiry::Events => &wakeups.event_expiry,
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = woken.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(daemon = kind.name(), "Daemon stopped");
}

async fn snapshot_loop(
    handle: Weak<RegistryInner>,
    wakeups: Arc<Wakeups>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(daemon = "snapshot", "Daemon started");
    loop {
        tokio::select! {
            _ = wakeups.snapshot.notified() => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = handle.upgrade() else {
            break;
        };
        if let Err(e) = Registry::from_inner(inner).snapshot().await {
            error!(daemon = "snapshot", error = %e, "Snapshot failed");
        }
    }
    debug!(daemon = "snapshot", "Daemon stopped");
}
