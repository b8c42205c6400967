//! The registry's mutable state and the primitive mutations on it.
//!
//! Every function here is deterministic given its arguments: the caller
//! supplies `now` and any granted expiration. Live operations and log replay
//! share these functions, which is what makes replay reproduce the original
//! state.

use lodestar_types::{Entry, EventId, LeaseId, ServiceId, ServiceItem};
use serde::{Deserialize, Serialize};

use crate::config::RegistryPolicy;
use crate::error::{RegistryError, Result};
use crate::events::{EventReg, EventTable};
use crate::index::{ServiceIndex, ServiceReg};
use crate::lease::LeaseCeilings;

/// Amount every event sequence number is advanced by after recovery, so the
/// next delivered sequence is above anything delivered before the restart.
pub const SEQUENCE_RECOVERY_OFFSET: u64 = i32::MAX as u64;

/// `now` used during replay: no lease counts as expired.
pub(crate) const REPLAY_NOW: i64 = i64::MIN;

pub(crate) struct RegistryState {
    pub registrar_id: ServiceId,
    pub services: ServiceIndex,
    pub events: EventTable,
    pub next_event_id: u64,
    pub policy: RegistryPolicy,
    pub ceilings: LeaseCeilings,
    /// Population changes do not move the ceilings while set
    pub in_recovery: bool,
}

impl RegistryState {
    pub fn new(registrar_id: ServiceId, policy: RegistryPolicy) -> Self {
        let ceilings = policy.lease.ceilings(0, 0);
        Self {
            registrar_id,
            services: ServiceIndex::new(),
            events: EventTable::new(),
            next_event_id: 1,
            policy,
            ceilings,
            in_recovery: false,
        }
    }

    pub fn refresh_ceilings(&mut self) {
        if self.in_recovery {
            return;
        }
        self.ceilings = self
            .policy
            .lease
            .ceilings(self.services.len(), self.events.len());
    }

    pub fn set_policy(&mut self, policy: RegistryPolicy) {
        self.policy = policy;
        self.refresh_ceilings();
    }

    // ---- services ----

    pub fn service_for_lease(&self, id: &ServiceId, lease_id: &LeaseId, now: i64) -> Result<&ServiceReg> {
        match self.services.get(id) {
            Some(reg) if reg.lease_id == *lease_id && reg.expiration > now => Ok(reg),
            _ => Err(RegistryError::UnknownLease),
        }
    }

    /// Insert or replace a registration.
    pub fn put_service(&mut self, reg: ServiceReg) -> Option<ServiceReg> {
        let previous = self.services.insert(reg);
        if previous.is_none() {
            self.refresh_ceilings();
        }
        previous
    }

    /// Apply an attribute edit, returning the item before and after.
    pub fn edit_attributes(
        &mut self,
        id: &ServiceId,
        lease_id: &LeaseId,
        now: i64,
        edit: &AttributeEdit,
    ) -> Result<(ServiceItem, ServiceItem)> {
        edit.validate()?;
        let pre = self.service_for_lease(id, lease_id, now)?.item.clone();
        let attributes = edit.apply(&pre.attributes);
        self.services.replace_attributes(id, attributes);
        let post = self
            .services
            .get(id)
            .map(|r| r.item.clone())
            .ok_or(RegistryError::UnknownLease)?;
        Ok((pre, post))
    }

    pub fn renew_service_to(
        &mut self,
        id: &ServiceId,
        lease_id: &LeaseId,
        now: i64,
        expiration: i64,
    ) -> Result<()> {
        self.service_for_lease(id, lease_id, now)?;
        self.services.set_expiration(id, expiration);
        Ok(())
    }

    pub fn cancel_service(&mut self, id: &ServiceId, lease_id: &LeaseId, now: i64) -> Result<ServiceReg> {
        self.service_for_lease(id, lease_id, now)?;
        let reg = self.services.remove(id).ok_or(RegistryError::UnknownLease)?;
        self.refresh_ceilings();
        Ok(reg)
    }

    pub fn remove_expired_services(&mut self, now: i64) -> Vec<ServiceReg> {
        let removed: Vec<ServiceReg> = self
            .services
            .expired(now)
            .iter()
            .filter_map(|id| self.services.remove(id))
            .collect();
        if !removed.is_empty() {
            self.refresh_ceilings();
        }
        removed
    }

    // ---- events ----

    pub fn allocate_event_id(&mut self) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        id
    }

    pub fn put_event(&mut self, reg: EventReg) {
        if reg.event_id.0 >= self.next_event_id {
            self.next_event_id = reg.event_id.0 + 1;
        }
        if self.events.insert(reg).is_none() {
            self.refresh_ceilings();
        }
    }

    pub fn event_for_lease(&self, id: &EventId, lease_id: &LeaseId, now: i64) -> Result<&EventReg> {
        match self.events.get(id) {
            Some(reg) if reg.lease_id == *lease_id && reg.expiration > now => Ok(reg),
            _ => Err(RegistryError::UnknownLease),
        }
    }

    pub fn renew_event_to(
        &mut self,
        id: &EventId,
        lease_id: &LeaseId,
        now: i64,
        expiration: i64,
    ) -> Result<()> {
        self.event_for_lease(id, lease_id, now)?;
        self.events.set_expiration(id, expiration);
        Ok(())
    }

    pub fn cancel_event(&mut self, id: &EventId, lease_id: &LeaseId, now: i64) -> Result<EventReg> {
        self.event_for_lease(id, lease_id, now)?;
        let reg = self.events.remove(id).ok_or(RegistryError::UnknownLease)?;
        self.refresh_ceilings();
        Ok(reg)
    }

    pub fn remove_expired_events(&mut self, now: i64) -> Vec<EventReg> {
        let removed: Vec<EventReg> = self
            .events
            .expired(now)
            .iter()
            .filter_map(|id| self.events.remove(id))
            .collect();
        if !removed.is_empty() {
            self.refresh_ceilings();
        }
        removed
    }
}

/// An edit of a registered item's attribute sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeEdit {
    /// Append entries not already present
    Add { entries: Vec<Entry> },
    /// For each template, delete (`None`) or overwrite the non-null fields of
    /// every stored entry it matches
    Modify {
        templates: Vec<Entry>,
        changes: Vec<Option<Entry>>,
    },
    /// Replace the whole attribute list
    Set { entries: Vec<Entry> },
}

impl AttributeEdit {
    pub fn validate(&self) -> Result<()> {
        let (templates, changes) = match self {
            AttributeEdit::Add { entries } | AttributeEdit::Set { entries } => {
                return entries.iter().try_for_each(check_shape);
            }
            AttributeEdit::Modify { templates, changes } => (templates, changes),
        };
        templates
            .iter()
            .chain(changes.iter().flatten())
            .try_for_each(check_shape)?;
        if templates.len() != changes.len() {
            return Err(RegistryError::InvalidArgument(format!(
                "{} attribute templates but {} changes",
                templates.len(),
                changes.len()
            )));
        }
        for (tmpl, change) in templates.iter().zip(changes) {
            if let Some(change) = change {
                if change.class() != tmpl.class() {
                    return Err(RegistryError::InvalidArgument(format!(
                        "change class {} does not match template class {}",
                        change.class().name(),
                        tmpl.class().name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// The attribute list this edit produces from `current`.
    pub fn apply(&self, current: &[Entry]) -> Vec<Entry> {
        let mut out = match self {
            AttributeEdit::Add { entries } => {
                let mut out = current.to_vec();
                out.extend(entries.iter().cloned());
                out
            }
            AttributeEdit::Set { entries } => entries.clone(),
            AttributeEdit::Modify { templates, changes } => {
                let mut out = current.to_vec();
                for (tmpl, change) in templates.iter().zip(changes) {
                    match change {
                        None => out.retain(|e| !e.matches_template(tmpl)),
                        Some(change) => {
                            for entry in out.iter_mut().filter(|e| e.matches_template(tmpl)) {
                                let slots = entry.fields_mut().iter_mut();
                                for (slot, value) in slots.zip(change.fields()) {
                                    if value.is_some() {
                                        *slot = value.clone();
                                    }
                                }
                            }
                        }
                    }
                }
                out
            }
        };
        dedup_entries(&mut out);
        out
    }
}

fn check_shape(entry: &Entry) -> Result<()> {
    let expected = entry.class().field_count();
    if entry.fields().len() != expected {
        return Err(RegistryError::InvalidArgument(format!(
            "entry of class {} has {} fields, expected {}",
            entry.class().name(),
            entry.fields().len(),
            expected
        )));
    }
    Ok(())
}

fn dedup_entries(entries: &mut Vec<Entry>) {
    let mut kept: Vec<Entry> = Vec::with_capacity(entries.len());
    for entry in entries.drain(..) {
        if !kept.contains(&entry) {
            kept.push(entry);
        }
    }
    *entries = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{name_class, reg};
    use lodestar_types::ServiceType;

    fn name(v: &str) -> Entry {
        Entry::empty(name_class()).with("name", v).unwrap()
    }

    fn state() -> RegistryState {
        RegistryState::new(ServiceId::new(), crate::RegistryConfig::default().policy())
    }

    #[test]
    fn add_skips_existing_entries() {
        let edit = AttributeEdit::Add {
            entries: vec![name("a"), name("b"), name("b")],
        };
        assert_eq!(edit.apply(&[name("a")]), vec![name("a"), name("b")]);
    }

    #[test]
    fn modify_overwrites_and_deletes() {
        let edit = AttributeEdit::Modify {
            templates: vec![name("a"), name("c")],
            changes: vec![Some(name("b")), None],
        };
        assert_eq!(edit.apply(&[name("a"), name("b"), name("c")]), vec![name("b")]);
    }

    #[test]
    fn modify_rejects_mismatched_shapes() {
        let uneven = AttributeEdit::Modify {
            templates: vec![name("a")],
            changes: vec![],
        };
        assert!(matches!(uneven.validate(), Err(RegistryError::InvalidArgument(_))));

        let other = lodestar_types::EntryClass::new("Other", None, vec![]);
        let wrong_class = AttributeEdit::Modify {
            templates: vec![name("a")],
            changes: vec![Some(Entry::empty(other))],
        };
        assert!(matches!(wrong_class.validate(), Err(RegistryError::InvalidArgument(_))));
    }

    #[test]
    fn oversized_change_entry_is_rejected_on_decode() {
        let edit = AttributeEdit::Modify {
            templates: vec![name("a")],
            changes: vec![Some(name("b"))],
        };
        let mut json = serde_json::to_value(&edit).unwrap();
        json["changes"][0]["fields"]
            .as_array_mut()
            .unwrap()
            .extend([serde_json::Value::Null, serde_json::Value::Null]);
        assert!(serde_json::from_value::<AttributeEdit>(json).is_err());
    }

    #[test]
    fn subclass_entries_take_superclass_changes() {
        let sub = lodestar_types::EntryClass::new(
            "Alias",
            Some(name_class()),
            vec![lodestar_types::FieldDesc::new("alias", "String")],
        );
        let stored = Entry::empty(sub.clone())
            .with("name", "a")
            .unwrap()
            .with("alias", "x")
            .unwrap();
        let edit = AttributeEdit::Modify {
            templates: vec![name("a")],
            changes: vec![Some(name("b"))],
        };
        edit.validate().unwrap();
        let out = edit.apply(&[stored]);
        assert_eq!(out[0].get("name"), Some(&"b".into()));
        assert_eq!(out[0].get("alias"), Some(&"x".into()));
    }

    #[test]
    fn lease_checks_reject_stale_and_expired() {
        let mut st = state();
        let r = reg(ServiceType::root("Printer"), vec![], 100);
        let (id, lease) = (r.service_id, r.lease_id);
        st.put_service(r);

        assert!(st.service_for_lease(&id, &lease, 99).is_ok());
        assert!(matches!(st.service_for_lease(&id, &lease, 100), Err(RegistryError::UnknownLease)));
        assert!(matches!(
            st.service_for_lease(&id, &LeaseId::new(), 0),
            Err(RegistryError::UnknownLease)
        ));
        assert!(st.service_for_lease(&id, &lease, REPLAY_NOW).is_ok());
    }

    #[test]
    fn edits_keep_indexes_consistent() {
        let mut st = state();
        let r = reg(ServiceType::root("Printer"), vec![name("a")], 100);
        let (id, lease) = (r.service_id, r.lease_id);
        st.put_service(r);

        let (pre, post) = st
            .edit_attributes(&id, &lease, 0, &AttributeEdit::Set { entries: vec![name("z")] })
            .unwrap();
        assert_eq!(pre.attributes, vec![name("a")]);
        assert_eq!(post.attributes, vec![name("z")]);
        st.services.assert_consistent();

        st.cancel_service(&id, &lease, 0).unwrap();
        assert!(st.services.is_empty());
        st.services.assert_consistent();
    }

    #[test]
    fn ceilings_frozen_during_recovery() {
        let mut st = state();
        st.policy.lease.min_max_service_lease_ms = 100;
        st.policy.lease.min_renewal_interval_ms = 50;
        st.in_recovery = true;
        st.refresh_ceilings();
        for _ in 0..10 {
            st.put_service(reg(ServiceType::root("P"), vec![], 100));
        }
        assert_eq!(st.ceilings.max_service_lease_ms, 5 * 60 * 1000);

        st.in_recovery = false;
        st.refresh_ceilings();
        assert_eq!(st.ceilings.max_service_lease_ms, 500);
    }
}
