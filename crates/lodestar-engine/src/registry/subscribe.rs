use lodestar_types::{EventId, LeaseId, ListenerEndpoint, ServiceId, ServiceTemplate, TransitionMask};
use std::time::Duration;
use tracing::debug;

use super::Registry;
use crate::error::Result;
use crate::events::EventReg;
use crate::lease::{self, Lease};
use crate::persist::LogRecord;

/// Result of a successful subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event_id: EventId,
    pub lease: Lease,
    /// Sequence number as of subscribing; every event carries a larger one
    pub sequence: u64,
    pub registrar_id: ServiceId,
}

impl Registry {
    /// Subscribe `endpoint` to the transitions in `mask` of items relative to
    /// `template`.
    pub async fn subscribe(
        &self,
        template: ServiceTemplate,
        mask: TransitionMask,
        endpoint: ListenerEndpoint,
        handback: Vec<u8>,
        duration: Duration,
    ) -> Result<Subscription> {
        let mut state = self.begin_write().await?;
        let now = self.now();
        let granted = lease::grant(duration, state.ceilings.max_event_lease_ms)?;

        let event_id = state.allocate_event_id();
        let lease = Lease::new(LeaseId::new(), now, granted);
        let reg = EventReg {
            event_id,
            lease_id: lease.lease_id,
            template,
            mask,
            endpoint,
            handback,
            sequence: 0,
            expiration: lease.expiration,
        };
        let earliest = state.events.earliest_expiration();
        state.put_event(reg.clone());
        self.persist(&state, LogRecord::EventRegistered { reg });

        if earliest.map_or(true, |t| lease.expiration < t) {
            self.inner.wakeups.event_expiry.notify_one();
        }
        debug!(event_id = %event_id, mask = mask.bits(), granted_ms = granted, "Subscription created");
        Ok(Subscription {
            event_id,
            lease,
            sequence: 0,
            registrar_id: state.registrar_id,
        })
    }
}
