//! Event subscriptions and transition evaluation.

use lodestar_types::{
    EventId, LeaseId, ListenerEndpoint, ServiceEvent, ServiceId, ServiceItem, ServiceTemplate,
    Transition, TransitionMask,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A live event subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReg {
    pub event_id: EventId,
    pub lease_id: LeaseId,
    pub template: ServiceTemplate,
    pub mask: TransitionMask,
    pub endpoint: ListenerEndpoint,
    pub handback: Vec<u8>,
    /// Sequence number of the last event issued
    pub sequence: u64,
    pub expiration: i64,
}

/// An event ready to be queued for its subscriber.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub lease_id: LeaseId,
    pub endpoint: ListenerEndpoint,
    pub event: ServiceEvent,
}

#[derive(Debug, Default)]
pub struct EventTable {
    by_id: HashMap<EventId, EventReg>,
    by_expiration: BTreeSet<(i64, EventId)>,
    by_service: HashMap<ServiceId, BTreeSet<EventId>>,
    unscoped: BTreeSet<EventId>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &EventId) -> Option<&EventReg> {
        self.by_id.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventReg> {
        self.by_id.values()
    }

    pub fn earliest_expiration(&self) -> Option<i64> {
        self.by_expiration.first().map(|(t, _)| *t)
    }

    pub fn insert(&mut self, reg: EventReg) -> Option<EventReg> {
        let previous = self.remove(&reg.event_id);
        let id = reg.event_id;
        self.by_expiration.insert((reg.expiration, id));
        match reg.template.service_id {
            Some(sid) => {
                self.by_service.entry(sid).or_default().insert(id);
            }
            None => {
                self.unscoped.insert(id);
            }
        }
        self.by_id.insert(id, reg);
        previous
    }

    pub fn remove(&mut self, id: &EventId) -> Option<EventReg> {
        let reg = self.by_id.remove(id)?;
        self.by_expiration.remove(&(reg.expiration, *id));
        match reg.template.service_id {
            Some(sid) => {
                if let Some(ids) = self.by_service.get_mut(&sid) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.by_service.remove(&sid);
                    }
                }
            }
            None => {
                self.unscoped.remove(id);
            }
        }
        Some(reg)
    }

    pub fn set_expiration(&mut self, id: &EventId, expiration: i64) -> bool {
        let Some(reg) = self.by_id.get_mut(id) else {
            return false;
        };
        self.by_expiration.remove(&(reg.expiration, *id));
        reg.expiration = expiration;
        self.by_expiration.insert((expiration, *id));
        true
    }

    pub fn expired(&self, now: i64) -> Vec<EventId> {
        self.by_expiration
            .range(..(now.saturating_add(1), EventId(0)))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Advance every sequence number by `offset`.
    pub(crate) fn advance_sequences(&mut self, offset: u64) {
        for reg in self.by_id.values_mut() {
            reg.sequence = reg.sequence.saturating_add(offset);
        }
    }

    /// Evaluate the subscriptions affected by a change to `service_id` and
    /// return the events to deliver, in subscription order.
    ///
    /// `pre` and `post` are the item before and after the change; either is
    /// `None` when the item did not exist on that side.
    pub(crate) fn transitions(
        &mut self,
        service_id: ServiceId,
        pre: Option<&ServiceItem>,
        post: Option<&ServiceItem>,
        now: i64,
        registrar_id: ServiceId,
    ) -> Vec<Delivery> {
        let mut candidates: Vec<EventId> = self.unscoped.iter().copied().collect();
        if let Some(scoped) = self.by_service.get(&service_id) {
            candidates.extend(scoped.iter().copied());
            candidates.sort_unstable();
        }

        let mut out = Vec::new();
        for event_id in candidates {
            let Some(reg) = self.by_id.get_mut(&event_id) else {
                continue;
            };
            if reg.expiration <= now {
                continue;
            }
            let before = pre.is_some_and(|p| reg.template.matches(p));
            let after = post.is_some_and(|q| reg.template.matches(q));
            let transition = match (before, after) {
                (false, true) => Transition::NoMatchMatch,
                (true, false) => Transition::MatchNoMatch,
                (true, true) => Transition::MatchMatch,
                (false, false) => continue,
            };
            if !reg.mask.contains(transition) {
                continue;
            }

            reg.sequence += 1;
            out.push(Delivery {
                lease_id: reg.lease_id,
                endpoint: reg.endpoint.clone(),
                event: ServiceEvent {
                    registrar_id,
                    event_id,
                    sequence: reg.sequence,
                    service_id,
                    transition,
                    item: post.cloned(),
                    handback: reg.handback.clone(),
                },
            });
        }
        out
    }
}
