//! Lease renewal, cancellation and expiry.

use lodestar_types::{EventId, LeaseId, ServiceId};
use std::time::Duration;
use tracing::{debug, info};

use super::Registry;
use crate::error::{RegistryError, Result};
use crate::lease::{self, LeaseTarget};
use crate::persist::LogRecord;
use crate::state::RegistryState;

/// Outcome of one expiry pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub expired: usize,
    pub next_expiration: Option<i64>,
}

impl Registry {
    /// Extend a service lease; returns the duration granted.
    pub async fn renew_service_lease(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        duration: Duration,
    ) -> Result<Duration> {
        let mut state = self.begin_priority_write().await?;
        let now = self.now();
        let (granted, expiration) =
            self.renew_locked(&mut state, LeaseTarget::Service(service_id, lease_id), duration, now)?;
        self.persist(
            &state,
            LogRecord::ServiceLeaseRenewed {
                service_id,
                lease_id,
                expiration,
            },
        );
        Ok(granted)
    }

    /// Extend an event lease; returns the duration granted.
    pub async fn renew_event_lease(
        &self,
        event_id: EventId,
        lease_id: LeaseId,
        duration: Duration,
    ) -> Result<Duration> {
        let mut state = self.begin_priority_write().await?;
        let now = self.now();
        let (granted, expiration) =
            self.renew_locked(&mut state, LeaseTarget::Event(event_id, lease_id), duration, now)?;
        self.persist(
            &state,
            LogRecord::EventLeaseRenewed {
                event_id,
                lease_id,
                expiration,
            },
        );
        Ok(granted)
    }

    /// Remove a registration; subscribers see it disappear.
    pub async fn cancel_service_lease(&self, service_id: ServiceId, lease_id: LeaseId) -> Result<()> {
        let mut state = self.begin_write().await?;
        let now = self.now();
        self.cancel_locked(&mut state, LeaseTarget::Service(service_id, lease_id), now)?;
        self.persist(
            &state,
            LogRecord::ServiceLeaseCancelled {
                service_id,
                lease_id,
            },
        );
        Ok(())
    }

    /// Remove a subscription and close its delivery queue.
    pub async fn cancel_event_lease(&self, event_id: EventId, lease_id: LeaseId) -> Result<()> {
        let mut state = self.begin_write().await?;
        let now = self.now();
        self.cancel_locked(&mut state, LeaseTarget::Event(event_id, lease_id), now)?;
        self.persist(&state, LogRecord::EventLeaseCancelled { event_id, lease_id });
        Ok(())
    }

    /// Renew several leases at once.
    ///
    /// `targets` and `durations` are parallel; each element succeeds or fails
    /// on its own.
    pub async fn renew_leases(
        &self,
        targets: &[LeaseTarget],
        durations: &[Duration],
    ) -> Result<Vec<Result<Duration>>> {
        if targets.len() != durations.len() {
            return Err(RegistryError::InvalidArgument(format!(
                "{} leases but {} durations",
                targets.len(),
                durations.len()
            )));
        }
        let mut state = self.begin_priority_write().await?;
        let now = self.now();

        let mut renewed = Vec::new();
        let results = targets
            .iter()
            .zip(durations)
            .map(|(target, duration)| -> Result<Duration> {
                let (granted, expiration) = self.renew_locked(&mut state, *target, *duration, now)?;
                renewed.push((*target, expiration));
                Ok(granted)
            })
            .collect();

        if !renewed.is_empty() {
            self.persist(&state, LogRecord::LeasesRenewed { renewals: renewed });
        }
        Ok(results)
    }

    /// Cancel several leases at once; each element succeeds or fails on its
    /// own.
    pub async fn cancel_leases(&self, targets: &[LeaseTarget]) -> Result<Vec<Result<()>>> {
        let mut state = self.begin_write().await?;
        let now = self.now();

        let mut cancelled = Vec::new();
        let results = targets
            .iter()
            .map(|target| -> Result<()> {
                self.cancel_locked(&mut state, *target, now)?;
                cancelled.push(*target);
                Ok(())
            })
            .collect();

        if !cancelled.is_empty() {
            self.persist(&state, LogRecord::LeasesCancelled { targets: cancelled });
        }
        Ok(results)
    }

    /// Remove every service whose lease has run out; returns how many.
    pub async fn expire_services(&self) -> Result<usize> {
        self.sweep_services().await.map(|s| s.expired)
    }

    /// Remove every subscription whose lease has run out; returns how many.
    pub async fn expire_events(&self) -> Result<usize> {
        self.sweep_events().await.map(|s| s.expired)
    }

    pub(crate) async fn sweep_services(&self) -> Result<Sweep> {
        let mut state = self.begin_write().await?;
        let now = self.now();
        let removed = state.remove_expired_services(now);

        let registrar_id = state.registrar_id;
        for reg in &removed {
            let deliveries = state
                .events
                .transitions(reg.service_id, Some(&reg.item), None, now, registrar_id);
            self.inner.dispatcher.enqueue(deliveries);
        }
        if !removed.is_empty() {
            info!(expired = removed.len(), "Service leases expired");
        }
        Ok(Sweep {
            expired: removed.len(),
            next_expiration: state.services.earliest_expiration(),
        })
    }

    pub(crate) async fn sweep_events(&self) -> Result<Sweep> {
        let mut state = self.begin_write().await?;
        let now = self.now();
        let removed = state.remove_expired_events(now);
        for reg in &removed {
            self.inner.dispatcher.close(&reg.event_id);
        }
        if !removed.is_empty() {
            info!(expired = removed.len(), "Event leases expired");
        }
        Ok(Sweep {
            expired: removed.len(),
            next_expiration: state.events.earliest_expiration(),
        })
    }

    fn renew_locked(
        &self,
        state: &mut RegistryState,
        target: LeaseTarget,
        duration: Duration,
        now: i64,
    ) -> Result<(Duration, i64)> {
        let (granted, expiration, earliest) = match target {
            LeaseTarget::Service(id, lease_id) => {
                let remaining = state.service_for_lease(&id, &lease_id, now)?.expiration - now;
                let granted = lease::renewal(duration, state.ceilings.max_service_lease_ms, remaining)?;
                let earliest = state.services.earliest_expiration();
                let expiration = now.saturating_add(granted);
                state.renew_service_to(&id, &lease_id, now, expiration)?;
                (granted, expiration, earliest)
            }
            LeaseTarget::Event(id, lease_id) => {
                let remaining = state.event_for_lease(&id, &lease_id, now)?.expiration - now;
                let granted = lease::renewal(duration, state.ceilings.max_event_lease_ms, remaining)?;
                let earliest = state.events.earliest_expiration();
                let expiration = now.saturating_add(granted);
                state.renew_event_to(&id, &lease_id, now, expiration)?;
                (granted, expiration, earliest)
            }
        };

        if earliest.map_or(true, |t| expiration < t) {
            match target {
                LeaseTarget::Service(..) => self.inner.wakeups.service_expiry.notify_one(),
                LeaseTarget::Event(..) => self.inner.wakeups.event_expiry.notify_one(),
            }
        }
        debug!(?target, granted_ms = granted, "Lease renewed");
        Ok((Duration::from_millis(granted.max(0) as u64), expiration))
    }

    fn cancel_locked(&self, state: &mut RegistryState, target: LeaseTarget, now: i64) -> Result<()> {
        match target {
            LeaseTarget::Service(id, lease_id) => {
                let reg = state.cancel_service(&id, &lease_id, now)?;
                let registrar_id = state.registrar_id;
                let deliveries = state
                    .events
                    .transitions(id, Some(&reg.item), None, now, registrar_id);
                self.inner.dispatcher.enqueue(deliveries);
            }
            LeaseTarget::Event(id, lease_id) => {
                state.cancel_event(&id, &lease_id, now)?;
                self.inner.dispatcher.close(&id);
            }
        }
        debug!(?target, "Lease cancelled");
        Ok(())
    }
}
