//! Multi-index store of service registrations.
//!
//! Every registration lives in `by_id` and `by_expiration`, under each name in
//! its type hierarchy, and under every `(defining class, field, value)` triple
//! its entries carry (or under its class in `by_empty_attr` for field-less
//! entries). All indexes are derived: mutation goes through [`ServiceIndex`]
//! methods that remove an item from every index before re-adding it.

use lodestar_types::{AttrValue, Entry, EntryClass, LeaseId, ServiceId, ServiceItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Key of an attribute-value bucket: the declaring class hash and the field
/// index within it.
pub(crate) type AttrKey = (u64, usize);

/// A live service registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReg {
    pub service_id: ServiceId,
    /// The registered item; `item.service_id` is always `Some(service_id)`
    pub item: ServiceItem,
    pub lease_id: LeaseId,
    pub expiration: i64,
}

#[derive(Debug, Default)]
pub struct ServiceIndex {
    by_id: HashMap<ServiceId, ServiceReg>,
    by_expiration: BTreeSet<(i64, ServiceId)>,
    by_type_name: HashMap<String, Vec<ServiceId>>,
    by_attr: HashMap<AttrKey, HashMap<Option<AttrValue>, BTreeSet<ServiceId>>>,
    by_empty_attr: HashMap<u64, BTreeSet<ServiceId>>,
    entry_classes: HashMap<u64, (Arc<EntryClass>, usize)>,
}

impl ServiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &ServiceId) -> Option<&ServiceReg> {
        self.by_id.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceReg> {
        self.by_id.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.by_id.keys()
    }

    /// Earliest expiration of any registration.
    pub fn earliest_expiration(&self) -> Option<i64> {
        self.by_expiration.first().map(|(t, _)| *t)
    }

    /// Insert a registration, replacing (and unindexing) any previous one with
    /// the same id.
    pub fn insert(&mut self, reg: ServiceReg) -> Option<ServiceReg> {
        let previous = self.remove(&reg.service_id);
        let id = reg.service_id;

        self.by_expiration.insert((reg.expiration, id));
        let mut seen: Vec<&str> = Vec::new();
        for ty in reg.item.service_type.hierarchy() {
            if seen.contains(&ty.name()) {
                continue;
            }
            seen.push(ty.name());
            self.by_type_name
                .entry(ty.name().to_string())
                .or_default()
                .push(id);
        }
        self.index_attributes(id, &reg.item.attributes);
        self.by_id.insert(id, reg);
        previous
    }

    /// Remove a registration from every index.
    pub fn remove(&mut self, id: &ServiceId) -> Option<ServiceReg> {
        let reg = self.by_id.remove(id)?;

        self.by_expiration.remove(&(reg.expiration, *id));
        for ty in reg.item.service_type.hierarchy() {
            if let Some(ids) = self.by_type_name.get_mut(ty.name()) {
                if let Some(pos) = ids.iter().position(|x| x == id) {
                    ids.swap_remove(pos);
                }
                if ids.is_empty() {
                    self.by_type_name.remove(ty.name());
                }
            }
        }
        self.unindex_attributes(*id, &reg.item.attributes);
        Some(reg)
    }

    /// Move a registration to a new expiration.
    pub fn set_expiration(&mut self, id: &ServiceId, expiration: i64) -> bool {
        let Some(reg) = self.by_id.get_mut(id) else {
            return false;
        };
        self.by_expiration.remove(&(reg.expiration, *id));
        reg.expiration = expiration;
        self.by_expiration.insert((expiration, *id));
        true
    }

    /// Replace an item's attribute sets, keeping every index in step.
    pub fn replace_attributes(&mut self, id: &ServiceId, attributes: Vec<Entry>) -> bool {
        let Some(old) = self.by_id.get(id).map(|r| r.item.attributes.clone()) else {
            return false;
        };
        self.unindex_attributes(*id, &old);
        self.index_attributes(*id, &attributes);
        if let Some(reg) = self.by_id.get_mut(id) {
            reg.item.attributes = attributes;
        }
        true
    }

    /// Registrations expiring at or before `now`, earliest first.
    pub fn expired(&self, now: i64) -> Vec<ServiceId> {
        self.by_expiration
            .range(..(now.saturating_add(1), ServiceId(uuid::Uuid::nil())))
            .map(|(_, id)| *id)
            .collect()
    }

    pub(crate) fn type_bucket(&self, name: &str) -> &[ServiceId] {
        self.by_type_name
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn attr_bucket(&self, key: AttrKey, value: &AttrValue) -> Option<&BTreeSet<ServiceId>> {
        self.by_attr
            .get(&key)
            .and_then(|values| values.get(&Some(value.clone())))
    }

    pub(crate) fn attr_buckets(
        &self,
        key: AttrKey,
    ) -> Option<&HashMap<Option<AttrValue>, BTreeSet<ServiceId>>> {
        self.by_attr.get(&key)
    }

    pub(crate) fn empty_attr_bucket(&self, class_hash: u64) -> Option<&BTreeSet<ServiceId>> {
        self.by_empty_attr.get(&class_hash)
    }

    /// Entry classes with at least one live instance, with instance counts.
    pub(crate) fn live_classes(&self) -> impl Iterator<Item = (&Arc<EntryClass>, usize)> {
        self.entry_classes.values().map(|(c, n)| (c, *n))
    }

    fn index_attributes(&mut self, id: ServiceId, attributes: &[Entry]) {
        for entry in attributes {
            let class = entry.class_arc();
            self.entry_classes
                .entry(class.content_hash())
                .or_insert_with(|| (class.clone(), 0))
                .1 += 1;

            if class.field_count() == 0 {
                self.by_empty_attr
                    .entry(class.content_hash())
                    .or_default()
                    .insert(id);
                continue;
            }
            for (k, value) in entry.fields().iter().enumerate() {
                let key = (class.defining_class(k).content_hash(), k);
                self.by_attr
                    .entry(key)
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(id);
            }
        }
    }

    fn unindex_attributes(&mut self, id: ServiceId, attributes: &[Entry]) {
        for entry in attributes {
            let class = entry.class();
            let hash = class.content_hash();
            if let Some((_, count)) = self.entry_classes.get_mut(&hash) {
                *count -= 1;
                if *count == 0 {
                    self.entry_classes.remove(&hash);
                }
            }

            if class.field_count() == 0 {
                if let Some(ids) = self.by_empty_attr.get_mut(&hash) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.by_empty_attr.remove(&hash);
                    }
                }
                continue;
            }
            for (k, value) in entry.fields().iter().enumerate() {
                let key = (class.defining_class(k).content_hash(), k);
                let Some(values) = self.by_attr.get_mut(&key) else {
                    continue;
                };
                if let Some(ids) = values.get_mut(value) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        values.remove(value);
                    }
                }
                if values.is_empty() {
                    self.by_attr.remove(&key);
                }
            }
        }
    }

    /// Panic unless every index holds exactly what the live registrations
    /// imply.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut rebuilt = ServiceIndex::new();
        for reg in self.by_id.values() {
            rebuilt.insert(reg.clone());
        }

        assert_eq!(self.by_expiration, rebuilt.by_expiration, "by_expiration");
        assert_eq!(self.by_attr, rebuilt.by_attr, "by_attr");
        assert_eq!(self.by_empty_attr, rebuilt.by_empty_attr, "by_empty_attr");

        let sorted = |m: &HashMap<String, Vec<ServiceId>>| {
            let mut out: Vec<(String, Vec<ServiceId>)> = m
                .iter()
                .map(|(k, v)| {
                    let mut v = v.clone();
                    v.sort();
                    (k.clone(), v)
                })
                .collect();
            out.sort();
            out
        };
        assert_eq!(sorted(&self.by_type_name), sorted(&rebuilt.by_type_name), "by_type_name");

        let counts = |m: &HashMap<u64, (Arc<EntryClass>, usize)>| {
            let mut out: Vec<(u64, usize)> = m.iter().map(|(k, (_, n))| (*k, *n)).collect();
            out.sort();
            out
        };
        assert_eq!(counts(&self.entry_classes), counts(&rebuilt.entry_classes), "entry_classes");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lodestar_types::{FieldDesc, ServiceType};

    pub(crate) fn name_class() -> EntryClass {
        EntryClass::new("Name", None, vec![FieldDesc::new("name", "String")])
    }

    pub(crate) fn marker_class() -> EntryClass {
        EntryClass::new("Marker", None, vec![])
    }

    pub(crate) fn reg(ty: ServiceType, attrs: Vec<Entry>, expiration: i64) -> ServiceReg {
        let id = ServiceId::new();
        let mut item = ServiceItem::new(ty, vec![]).with_id(id);
        item.attributes = attrs;
        ServiceReg {
            service_id: id,
            item,
            lease_id: LeaseId::new(),
            expiration,
        }
    }

    fn printer() -> ServiceType {
        ServiceType::new("Printer", Some(ServiceType::root("Device")), vec![])
    }

    #[test]
    fn insert_indexes_whole_hierarchy() {
        let mut index = ServiceIndex::new();
        let r = reg(printer(), vec![Entry::empty(name_class()).with("name", "lp0").unwrap()], 100);
        let id = r.service_id;
        index.insert(r);

        assert_eq!(index.type_bucket("Printer"), &[id]);
        assert_eq!(index.type_bucket("Device"), &[id]);
        let key = (name_class().content_hash(), 0);
        assert!(index.attr_bucket(key, &AttrValue::from("lp0")).unwrap().contains(&id));
        index.assert_consistent();
    }

    #[test]
    fn remove_clears_every_index() {
        let mut index = ServiceIndex::new();
        let r = reg(
            printer(),
            vec![
                Entry::empty(name_class()).with("name", "lp0").unwrap(),
                Entry::empty(marker_class()),
            ],
            100,
        );
        let id = r.service_id;
        index.insert(r);
        assert!(index.remove(&id).is_some());

        assert!(index.is_empty());
        assert!(index.type_bucket("Device").is_empty());
        assert!(index.empty_attr_bucket(marker_class().content_hash()).is_none());
        assert_eq!(index.live_classes().count(), 0);
        index.assert_consistent();
    }

    #[test]
    fn replace_attributes_moves_buckets() {
        let mut index = ServiceIndex::new();
        let r = reg(printer(), vec![Entry::empty(name_class()).with("name", "a").unwrap()], 100);
        let id = r.service_id;
        index.insert(r);

        index.replace_attributes(&id, vec![Entry::empty(name_class()).with("name", "b").unwrap()]);
        let key = (name_class().content_hash(), 0);
        assert!(index.attr_bucket(key, &AttrValue::from("a")).is_none());
        assert!(index.attr_bucket(key, &AttrValue::from("b")).unwrap().contains(&id));
        index.assert_consistent();
    }

    #[test]
    fn expired_is_ordered_and_inclusive() {
        let mut index = ServiceIndex::new();
        let late = reg(printer(), vec![], 300);
        let early = reg(printer(), vec![], 100);
        let (late_id, early_id) = (late.service_id, early.service_id);
        index.insert(late);
        index.insert(early);

        assert_eq!(index.earliest_expiration(), Some(100));
        assert_eq!(index.expired(100), vec![early_id]);
        assert_eq!(index.expired(300), vec![early_id, late_id]);

        index.set_expiration(&early_id, 500);
        assert_eq!(index.expired(300), vec![late_id]);
        index.assert_consistent();
    }

    #[test]
    fn duplicate_type_names_are_indexed_once() {
        let mut index = ServiceIndex::new();
        let odd = ServiceType::new("Device", Some(ServiceType::root("Device")), vec![]);
        let r = reg(odd, vec![], 100);
        let id = r.service_id;
        index.insert(r);
        assert_eq!(index.type_bucket("Device"), &[id]);
        index.remove(&id);
        assert!(index.type_bucket("Device").is_empty());
    }
}
