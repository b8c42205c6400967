//! Registration, lookup and attribute edits.

use lodestar_types::{Entry, LeaseId, ServiceId, ServiceItem, ServiceTemplate};
use std::time::Duration;
use tracing::debug;

use super::Registry;
use crate::error::{RegistryError, Result};
use crate::index::ServiceReg;
use crate::lease::{self, Lease};
use crate::matching::{self, Matches};
use crate::persist::LogRecord;
use crate::state::AttributeEdit;

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub service_id: ServiceId,
    pub lease: Lease,
}

impl Registry {
    /// Register an item, or replace the registration with the same service id.
    ///
    /// An item without a service id is assigned a fresh one. Replacement
    /// issues a new lease; subscribers see the old and new item as one
    /// transition.
    pub async fn register(&self, mut item: ServiceItem, duration: Duration) -> Result<Registration> {
        let mut state = self.begin_write().await?;
        if item.service_id == Some(state.registrar_id) {
            return Err(RegistryError::InvalidArgument(
                "service id is reserved by the registrar".into(),
            ));
        }
        let now = self.now();
        let granted = lease::grant(duration, state.ceilings.max_service_lease_ms)?;

        let service_id = match item.service_id {
            Some(id) => id,
            None => loop {
                let id = ServiceId::new();
                if id != state.registrar_id && state.services.get(&id).is_none() {
                    break id;
                }
            },
        };
        item.service_id = Some(service_id);
        item.dedup_attributes();

        let lease = Lease::new(LeaseId::new(), now, granted);
        let reg = ServiceReg {
            service_id,
            item,
            lease_id: lease.lease_id,
            expiration: lease.expiration,
        };
        let earliest = state.services.earliest_expiration();
        let previous = state
            .put_service(reg.clone())
            .filter(|p| p.expiration > now);

        let registrar_id = state.registrar_id;
        let deliveries = state.events.transitions(
            service_id,
            previous.as_ref().map(|p| &p.item),
            Some(&reg.item),
            now,
            registrar_id,
        );
        self.inner.dispatcher.enqueue(deliveries);
        self.persist(&state, LogRecord::ServiceRegistered { reg });

        if earliest.map_or(true, |t| lease.expiration < t) {
            self.inner.wakeups.service_expiry.notify_one();
        }
        debug!(
            service_id = %service_id,
            granted_ms = granted,
            replaced = previous.is_some(),
            "Service registered"
        );
        Ok(Registration { service_id, lease })
    }

    /// The service object of one matching item.
    ///
    /// When the template constrains types only, the item is picked at random
    /// among all matches; otherwise the first match is returned.
    pub async fn lookup(&self, template: &ServiceTemplate) -> Option<Vec<u8>> {
        let state = self.inner.state.read().await;
        matching::lookup_one(&state.services, template, self.now()).map(|r| r.item.service.clone())
    }

    /// Copies of up to `max_matches` matching items plus the total number of
    /// matches.
    pub async fn lookup_matches(&self, template: &ServiceTemplate, max_matches: usize) -> Matches {
        let state = self.inner.state.read().await;
        matching::lookup_matches(&state.services, template, max_matches, self.now())
    }

    /// Append attribute sets not already present on the item.
    pub async fn add_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        entries: Vec<Entry>,
    ) -> Result<()> {
        self.edit_attributes(service_id, lease_id, AttributeEdit::Add { entries })
            .await
    }

    /// For each template, delete the matching attribute sets (`None`) or
    /// overwrite their fields with the non-null fields of the change.
    pub async fn modify_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        templates: Vec<Entry>,
        changes: Vec<Option<Entry>>,
    ) -> Result<()> {
        self.edit_attributes(service_id, lease_id, AttributeEdit::Modify { templates, changes })
            .await
    }

    /// Replace the item's attribute sets.
    pub async fn set_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        entries: Vec<Entry>,
    ) -> Result<()> {
        self.edit_attributes(service_id, lease_id, AttributeEdit::Set { entries })
            .await
    }

    async fn edit_attributes(
        &self,
        service_id: ServiceId,
        lease_id: LeaseId,
        edit: AttributeEdit,
    ) -> Result<()> {
        let mut state = self.begin_write().await?;
        let now = self.now();
        let (pre, post) = state.edit_attributes(&service_id, &lease_id, now, &edit)?;

        let registrar_id = state.registrar_id;
        let deliveries = state
            .events
            .transitions(service_id, Some(&pre), Some(&post), now, registrar_id);
        self.inner.dispatcher.enqueue(deliveries);
        self.persist(
            &state,
            LogRecord::AttributesEdited {
                service_id,
                lease_id,
                edit,
            },
        );
        debug!(service_id = %service_id, attributes = post.attributes.len(), "Attributes edited");
        Ok(())
    }
}
