//! The registry facade.
//!
//! [`Registry`] is a cheap clonable handle. Every operation runs under one of
//! the three roles of the state lock: lookups and enumeration as readers,
//! mutations as writers, lease renewals as priority writers. A mutation
//! applies to memory first, then queues events, then appends its log record.

mod admin;
mod browse;
mod leases;
mod services;
mod subscribe;

pub use admin::RegistryMetrics;
pub use services::Registration;
pub use subscribe::Subscription;

use lodestar_types::ServiceId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::daemons::{self, Wakeups};
use crate::dispatch::Dispatcher;
use crate::error::{RegistryError, Result};
use crate::listener::ListenerConnector;
use crate::lock::{PriorityRwLock, WriteGuard};
use crate::persist::{self, LogRecord, SnapshotHeader, Store};
use crate::state::{RegistryState, SEQUENCE_RECOVERY_OFFSET};

pub(crate) struct RegistryInner {
    pub(crate) state: PriorityRwLock<RegistryState>,
    store: Option<Mutex<Store>>,
    pub(crate) clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    pub(crate) wakeups: Arc<Wakeups>,
    accepting: AtomicBool,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
    snapshots_taken: AtomicU64,
}

/// Handle to a running registry engine.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Open (and, with a data directory, recover) a registry on the system
    /// clock.
    pub async fn open(config: RegistryConfig, connector: Arc<dyn ListenerConnector>) -> Result<Self> {
        Self::open_with_clock(config, connector, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        config: RegistryConfig,
        connector: Arc<dyn ListenerConnector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.lease.validate()?;

        let (state, store) = match &config.data_dir {
            Some(dir) => {
                let (mut store, recovered) =
                    Store::open(dir, config.sync_mode).map_err(|e| RegistryError::Recovery(e.to_string()))?;
                let state = recover(recovered, &config)?;
                persist::blocking(|| {
                    store.write_snapshot(snapshot_header(&state), state.services.iter(), state.events.iter())
                })
                .map_err(|e| RegistryError::Recovery(e.to_string()))?;
                (state, Some(Mutex::new(store)))
            }
            None => (RegistryState::new(ServiceId::new(), config.policy()), None),
        };

        let registrar_id = state.registrar_id;
        let (services, events) = (state.services.len(), state.events.len());
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak| RegistryInner {
            state: PriorityRwLock::new(state),
            store,
            clock,
            dispatcher: Dispatcher::new(connector, weak.clone()),
            wakeups: Arc::new(Wakeups::default()),
            accepting: AtomicBool::new(true),
            shutdown_tx,
            daemons: Mutex::new(Vec::new()),
            snapshots_taken: AtomicU64::new(0),
        });
        *inner.daemons.lock() = daemons::spawn(&inner);

        info!(
            registrar_id = %registrar_id,
            services,
            events,
            persistent = config.data_dir.is_some(),
            "Registry opened"
        );
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Identity of this registry, reserved against client registration.
    pub async fn registrar_id(&self) -> ServiceId {
        self.inner.state.read().await.registrar_id
    }

    /// Write a full snapshot now and reset the log. No-op when in memory.
    pub async fn snapshot(&self) -> Result<()> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        let state = self.inner.state.read().await;
        persist::blocking(|| {
            store
                .lock()
                .write_snapshot(snapshot_header(&state), state.services.iter(), state.events.iter())
        })?;
        self.inner.snapshots_taken.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting mutations, wait for in-flight ones, stop the daemons
    /// and sync the log.
    ///
    /// Queued event deliveries are left to finish on their own.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Registry shutting down");

        drop(self.inner.state.write().await);
        let _ = self.inner.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.inner.daemons.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Daemon task ended abnormally");
            }
        }

        self.inner.dispatcher.close_all();
        if let Some(store) = &self.inner.store {
            persist::blocking(|| store.lock().sync())?;
        }
        info!("Registry shut down");
        Ok(())
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    async fn begin_write(&self) -> Result<WriteGuard<'_, RegistryState>> {
        let guard = self.inner.state.write().await;
        self.check_accepting()?;
        Ok(guard)
    }

    async fn begin_priority_write(&self) -> Result<WriteGuard<'_, RegistryState>> {
        let guard = self.inner.state.priority_write().await;
        self.check_accepting()?;
        Ok(guard)
    }

    fn check_accepting(&self) -> Result<()> {
        if self.inner.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::ShuttingDown)
        }
    }

    /// Append a record for a change already applied to `state`.
    ///
    /// Failures are logged and otherwise ignored: the change stands in memory.
    fn persist(&self, state: &RegistryState, record: LogRecord) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let appended = persist::blocking(|| store.lock().append(&record));
        match appended {
            Ok(since) => {
                let population = state.services.len() + state.events.len();
                if state.policy.snapshot.is_due(since, population) {
                    self.inner.wakeups.snapshot.notify_one();
                }
            }
            Err(e) => {
                error!(record = record.kind(), error = %e, "Failed to append log record");
                // a fresh snapshot brings the disk back in line with memory
                self.inner.wakeups.snapshot.notify_one();
            }
        }
    }
}

fn snapshot_header(state: &RegistryState) -> SnapshotHeader {
    SnapshotHeader {
        registrar_id: state.registrar_id,
        next_event_id: state.next_event_id,
        log_sequence: 0,
        policy: state.policy.clone(),
    }
}

/// Rebuild state from a snapshot and the log records that follow it.
fn recover(recovered: crate::persist::Recovered, config: &RegistryConfig) -> Result<RegistryState> {
    let crate::persist::Recovered {
        header,
        services,
        events,
        log,
    } = recovered;

    let mut state = match &header {
        Some(h) => {
            let mut state = RegistryState::new(h.registrar_id, h.policy.clone());
            state.next_event_id = h.next_event_id;
            state
        }
        None => RegistryState::new(ServiceId::new(), config.policy()),
    };
    state.in_recovery = true;

    for reg in services {
        state.put_service(reg);
    }
    for reg in events {
        state.put_event(reg);
    }
    let replayed = log.len();
    for record in log {
        let kind = record.kind();
        record
            .apply(&mut state)
            .map_err(|e| RegistryError::Recovery(format!("replaying {kind}: {e}")))?;
    }

    state.events.advance_sequences(SEQUENCE_RECOVERY_OFFSET);
    state.in_recovery = false;
    state.refresh_ceilings();

    info!(
        from_snapshot = header.is_some(),
        replayed,
        services = state.services.len(),
        events = state.events.len(),
        "Registry state recovered"
    );
    Ok(state)
}
