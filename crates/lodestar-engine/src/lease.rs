//! Lease arithmetic and the adaptive lease ceiling.
//!
//! The ceiling grows with the population so that the aggregate renewal rate
//! (services plus subscriptions, each renewing roughly once per ceiling)
//! stays near one renewal per `min_renewal_interval`:
//!
//! ```text
//! max_service = max(min_max_service,
//!                   min_renewal_interval * (services + events * min_max_service / min_max_event))
//! max_event   = max(min_max_event, max_service * min_max_event / min_max_service)
//! ```

use lodestar_types::{EventId, LeaseId, ServiceId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::millis;
use crate::error::{RegistryError, Result};

/// Floors and renewal target for the adaptive lease ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasePolicy {
    /// Lowest ceiling ever applied to service leases
    #[serde(default = "default_min_max_service_lease")]
    pub min_max_service_lease_ms: i64,

    /// Lowest ceiling ever applied to event leases
    #[serde(default = "default_min_max_event_lease")]
    pub min_max_event_lease_ms: i64,

    /// Target average time between renewals, system-wide
    #[serde(default = "default_min_renewal_interval")]
    pub min_renewal_interval_ms: i64,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            min_max_service_lease_ms: default_min_max_service_lease(),
            min_max_event_lease_ms: default_min_max_event_lease(),
            min_renewal_interval_ms: default_min_renewal_interval(),
        }
    }
}

fn default_min_max_service_lease() -> i64 {
    5 * 60 * 1000
}

fn default_min_max_event_lease() -> i64 {
    30 * 60 * 1000
}

fn default_min_renewal_interval() -> i64 {
    100
}

impl LeasePolicy {
    /// Reject non-positive floors and intervals.
    pub fn validate(&self) -> Result<()> {
        if self.min_max_service_lease_ms <= 0
            || self.min_max_event_lease_ms <= 0
            || self.min_renewal_interval_ms <= 0
        {
            return Err(RegistryError::InvalidArgument(
                "lease policy values must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Ceilings for the given population.
    pub fn ceilings(&self, services: usize, events: usize) -> LeaseCeilings {
        let min_service = self.min_max_service_lease_ms;
        let min_event = self.min_max_event_lease_ms;

        let weighted_events = (events as i64).saturating_mul(min_service) / min_event;
        let population = (services as i64).saturating_add(weighted_events);
        let max_service = min_service.max(self.min_renewal_interval_ms.saturating_mul(population));
        let max_event = min_event.max(max_service.saturating_mul(min_event) / min_service);

        LeaseCeilings {
            max_service_lease_ms: max_service,
            max_event_lease_ms: max_event,
        }
    }
}

/// Current maximum lease durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCeilings {
    pub max_service_lease_ms: i64,
    pub max_event_lease_ms: i64,
}

/// Duration granted for a new lease.
pub fn grant(requested: Duration, ceiling_ms: i64) -> Result<i64> {
    if requested.is_zero() {
        return Err(RegistryError::InvalidArgument(
            "lease duration must be positive".into(),
        ));
    }
    Ok(millis(requested).min(ceiling_ms))
}

/// Duration granted on renewal.
///
/// A lease that already has more time left than the current ceiling keeps
/// the right to that much time, so renewal never shortens it below either
/// bound.
pub fn renewal(requested: Duration, ceiling_ms: i64, remaining_ms: i64) -> Result<i64> {
    if requested.is_zero() {
        return Err(RegistryError::InvalidArgument(
            "lease duration must be positive".into(),
        ));
    }
    Ok(millis(requested).min(ceiling_ms.max(remaining_ms)))
}

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    /// Absolute expiration, milliseconds since the epoch
    pub expiration: i64,
    pub granted: Duration,
}

impl Lease {
    pub(crate) fn new(lease_id: LeaseId, now: i64, granted_ms: i64) -> Self {
        Self {
            lease_id,
            expiration: now.saturating_add(granted_ms),
            granted: Duration::from_millis(granted_ms.max(0) as u64),
        }
    }
}

/// The record a lease belongs to, for batched renew/cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseTarget {
    Service(ServiceId, LeaseId),
    Event(EventId, LeaseId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LeasePolicy {
        LeasePolicy {
            min_max_service_lease_ms: 60_000,
            min_max_event_lease_ms: 120_000,
            min_renewal_interval_ms: 100,
        }
    }

    #[test]
    fn small_population_sits_on_the_floors() {
        let c = policy().ceilings(0, 0);
        assert_eq!(c.max_service_lease_ms, 60_000);
        assert_eq!(c.max_event_lease_ms, 120_000);

        let c = policy().ceilings(10, 10);
        assert_eq!(c.max_service_lease_ms, 60_000);
    }

    #[test]
    fn large_population_raises_ceilings_in_ratio() {
        // 1000 services + 1000 events weighted by 60/120 => 1500 * 100ms
        let c = policy().ceilings(1000, 1000);
        assert_eq!(c.max_service_lease_ms, 150_000);
        assert_eq!(c.max_event_lease_ms, 300_000);
    }

    #[test]
    fn ceilings_never_drop_below_floors() {
        for n in [0usize, 1, 10, 100, 599, 600, 601, 10_000] {
            let c = policy().ceilings(n, 3);
            assert!(c.max_service_lease_ms >= 60_000);
            assert!(c.max_event_lease_ms >= 120_000);
        }
    }

    #[test]
    fn grant_is_capped_and_rejects_zero() {
        assert_eq!(grant(Duration::from_secs(1_000_000), 60_000).unwrap(), 60_000);
        assert_eq!(grant(Duration::from_secs(10), 60_000).unwrap(), 10_000);
        assert_eq!(grant(Duration::MAX, 60_000).unwrap(), 60_000);
        assert!(matches!(
            grant(Duration::ZERO, 60_000),
            Err(RegistryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn renewal_keeps_longer_remaining_time() {
        // remaining 90s exceeds the 60s ceiling: a long request gets 90s
        assert_eq!(renewal(Duration::from_secs(1000), 60_000, 90_000).unwrap(), 90_000);
        // a short request is honoured as asked
        assert_eq!(renewal(Duration::from_secs(5), 60_000, 90_000).unwrap(), 5_000);
        // remaining below the ceiling: the ceiling applies
        assert_eq!(renewal(Duration::from_secs(1000), 60_000, 10_000).unwrap(), 60_000);
    }
}
