//! Replayable command records.

use lodestar_types::{EventId, LeaseId, ServiceId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RegistryPolicy;
use crate::error::{RegistryError, Result};
use crate::events::EventReg;
use crate::index::ServiceReg;
use crate::lease::LeaseTarget;
use crate::state::{AttributeEdit, RegistryState, REPLAY_NOW};

/// One state change, as appended to `registry.log`.
///
/// Records carry absolute expirations, never durations, so applying one does
/// not consult the clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    ServiceRegistered {
        reg: ServiceReg,
    },
    AttributesEdited {
        service_id: ServiceId,
        lease_id: LeaseId,
        edit: AttributeEdit,
    },
    ServiceLeaseRenewed {
        service_id: ServiceId,
        lease_id: LeaseId,
        expiration: i64,
    },
    ServiceLeaseCancelled {
        service_id: ServiceId,
        lease_id: LeaseId,
    },
    EventRegistered {
        reg: EventReg,
    },
    EventLeaseRenewed {
        event_id: EventId,
        lease_id: LeaseId,
        expiration: i64,
    },
    EventLeaseCancelled {
        event_id: EventId,
        lease_id: LeaseId,
    },
    /// Successful elements of a batched renewal
    LeasesRenewed {
        renewals: Vec<(LeaseTarget, i64)>,
    },
    /// Successful elements of a batched cancellation
    LeasesCancelled {
        targets: Vec<LeaseTarget>,
    },
    PolicyChanged {
        policy: RegistryPolicy,
    },
}

impl LogRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::ServiceRegistered { .. } => "service_registered",
            LogRecord::AttributesEdited { .. } => "attributes_edited",
            LogRecord::ServiceLeaseRenewed { .. } => "service_lease_renewed",
            LogRecord::ServiceLeaseCancelled { .. } => "service_lease_cancelled",
            LogRecord::EventRegistered { .. } => "event_registered",
            LogRecord::EventLeaseRenewed { .. } => "event_lease_renewed",
            LogRecord::EventLeaseCancelled { .. } => "event_lease_cancelled",
            LogRecord::LeasesRenewed { .. } => "leases_renewed",
            LogRecord::LeasesCancelled { .. } => "leases_cancelled",
            LogRecord::PolicyChanged { .. } => "policy_changed",
        }
    }

    /// Re-apply this record to recovered state.
    ///
    /// A lease that no longer resolves means the record concerned state that
    /// was already gone when it was logged, so it is skipped.
    pub(crate) fn apply(self, state: &mut RegistryState) -> Result<()> {
        let kind = self.kind();
        let outcome = match self {
            LogRecord::ServiceRegistered { reg } => {
                state.put_service(reg);
                Ok(())
            }
            LogRecord::AttributesEdited {
                service_id,
                lease_id,
                edit,
            } => state
                .edit_attributes(&service_id, &lease_id, REPLAY_NOW, &edit)
                .map(|_| ()),
            LogRecord::ServiceLeaseRenewed {
                service_id,
                lease_id,
                expiration,
            } => state.renew_service_to(&service_id, &lease_id, REPLAY_NOW, expiration),
            LogRecord::ServiceLeaseCancelled {
                service_id,
                lease_id,
            } => state
                .cancel_service(&service_id, &lease_id, REPLAY_NOW)
                .map(|_| ()),
            LogRecord::EventRegistered { reg } => {
                state.put_event(reg);
                Ok(())
            }
            LogRecord::EventLeaseRenewed {
                event_id,
                lease_id,
                expiration,
            } => state.renew_event_to(&event_id, &lease_id, REPLAY_NOW, expiration),
            LogRecord::EventLeaseCancelled { event_id, lease_id } => state
                .cancel_event(&event_id, &lease_id, REPLAY_NOW)
                .map(|_| ()),
            LogRecord::LeasesRenewed { renewals } => {
                for (target, expiration) in renewals {
                    let _ = apply_renewal(state, target, expiration);
                }
                Ok(())
            }
            LogRecord::LeasesCancelled { targets } => {
                for target in targets {
                    let _ = apply_cancel(state, target);
                }
                Ok(())
            }
            LogRecord::PolicyChanged { policy } => {
                state.set_policy(policy);
                Ok(())
            }
        };

        match outcome {
            Err(RegistryError::UnknownLease) => {
                debug!(record = kind, "Replayed record no longer applies");
                Ok(())
            }
            other => other,
        }
    }
}

fn apply_renewal(state: &mut RegistryState, target: LeaseTarget, expiration: i64) -> Result<()> {
    match target {
        LeaseTarget::Service(id, lease) => state.renew_service_to(&id, &lease, REPLAY_NOW, expiration),
        LeaseTarget::Event(id, lease) => state.renew_event_to(&id, &lease, REPLAY_NOW, expiration),
    }
}

fn apply_cancel(state: &mut RegistryState, target: LeaseTarget) -> Result<()> {
    match target {
        LeaseTarget::Service(id, lease) => state.cancel_service(&id, &lease, REPLAY_NOW).map(|_| ()),
        LeaseTarget::Event(id, lease) => state.cancel_event(&id, &lease, REPLAY_NOW).map(|_| ()),
    }
}
