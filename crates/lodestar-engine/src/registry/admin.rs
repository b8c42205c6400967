//! Administrative tunables and metrics.

use serde::Serialize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;

use super::Registry;
use crate::clock::millis;
use crate::config::RegistryPolicy;
use crate::error::{RegistryError, Result};
use crate::persist::LogRecord;

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryMetrics {
    pub services: usize,
    pub events: usize,
    pub max_service_lease: Duration,
    pub max_event_lease: Duration,
    pub log_records_since_snapshot: u64,
    pub snapshots_taken: u64,
    pub delivery_queues: usize,
}

fn duration_of(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

impl Registry {
    pub async fn metrics(&self) -> RegistryMetrics {
        let state = self.inner.state.read().await;
        let log_records_since_snapshot = self
            .inner
            .store
            .as_ref()
            .map_or(0, |s| s.lock().records_since_snapshot());
        RegistryMetrics {
            services: state.services.len(),
            events: state.events.len(),
            max_service_lease: duration_of(state.ceilings.max_service_lease_ms),
            max_event_lease: duration_of(state.ceilings.max_event_lease_ms),
            log_records_since_snapshot,
            snapshots_taken: self.inner.snapshots_taken.load(Ordering::Relaxed),
            delivery_queues: self.inner.dispatcher.open_queues(),
        }
    }

    /// The current lease and snapshot tunables.
    pub async fn policy(&self) -> RegistryPolicy {
        self.inner.state.read().await.policy.clone()
    }

    pub async fn min_max_service_lease(&self) -> Duration {
        duration_of(self.inner.state.read().await.policy.lease.min_max_service_lease_ms)
    }

    pub async fn set_min_max_service_lease(&self, value: Duration) -> Result<()> {
        self.update_policy(|p| p.lease.min_max_service_lease_ms = millis(value))
            .await
    }

    pub async fn min_max_event_lease(&self) -> Duration {
        duration_of(self.inner.state.read().await.policy.lease.min_max_event_lease_ms)
    }

    pub async fn set_min_max_event_lease(&self, value: Duration) -> Result<()> {
        self.update_policy(|p| p.lease.min_max_event_lease_ms = millis(value))
            .await
    }

    pub async fn min_renewal_interval(&self) -> Duration {
        duration_of(self.inner.state.read().await.policy.lease.min_renewal_interval_ms)
    }

    pub async fn set_min_renewal_interval(&self, value: Duration) -> Result<()> {
        self.update_policy(|p| p.lease.min_renewal_interval_ms = millis(value))
            .await
    }

    pub async fn snapshot_weight(&self) -> f64 {
        self.inner.state.read().await.policy.snapshot.snapshot_weight
    }

    pub async fn set_snapshot_weight(&self, value: f64) -> Result<()> {
        self.update_policy(|p| p.snapshot.snapshot_weight = value).await
    }

    pub async fn log_to_snapshot_threshold(&self) -> u64 {
        self.inner.state.read().await.policy.snapshot.log_to_snapshot_threshold
    }

    pub async fn set_log_to_snapshot_threshold(&self, value: u64) -> Result<()> {
        self.update_policy(|p| p.snapshot.log_to_snapshot_threshold = value)
            .await
    }

    async fn update_policy(&self, change: impl FnOnce(&mut RegistryPolicy)) -> Result<()> {
        let mut state = self.begin_write().await?;
        let mut policy = state.policy.clone();
        change(&mut policy);
        policy.lease.validate()?;
        if !policy.snapshot.snapshot_weight.is_finite() || policy.snapshot.snapshot_weight < 0.0 {
            return Err(RegistryError::InvalidArgument(
                "snapshot weight must be finite and non-negative".into(),
            ));
        }
        if policy == state.policy {
            return Ok(());
        }

        state.set_policy(policy.clone());
        info!(
            max_service_lease_ms = state.ceilings.max_service_lease_ms,
            max_event_lease_ms = state.ceilings.max_event_lease_ms,
            "Registry policy changed"
        );
        self.persist(&state, LogRecord::PolicyChanged { policy });
        Ok(())
    }
}
