//! Structural type descriptors.
//!
//! A [`ServiceType`] or [`EntryClass`] is identified by a 64-bit content hash
//! derived from its name, its position in the hierarchy and (for entry classes)
//! its declared fields. Two descriptors produced independently from the same
//! logical type therefore compare equal, and hierarchy tests walk hashes rather
//! than references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const SERVICE_TYPE_DOMAIN: &[u8] = b"lodestar-service-type-v1:";
const ENTRY_CLASS_DOMAIN: &[u8] = b"lodestar-entry-class-v1:";

/// Structural descriptor of a service type (class or interface).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceType {
    name: String,
    hash: u64,
    superclass: Option<Arc<ServiceType>>,
    interfaces: Vec<Arc<ServiceType>>,
}

impl ServiceType {
    /// Build a descriptor and compute its content hash.
    pub fn new(
        name: impl Into<String>,
        superclass: Option<ServiceType>,
        interfaces: Vec<ServiceType>,
    ) -> Self {
        let name = name.into();
        let superclass = superclass.map(Arc::new);
        let interfaces: Vec<Arc<ServiceType>> = interfaces.into_iter().map(Arc::new).collect();

        let mut hasher = blake3::Hasher::new();
        hasher.update(SERVICE_TYPE_DOMAIN);
        hasher.update(&superclass.as_ref().map_or(0, |s| s.hash).to_le_bytes());
        update_str(&mut hasher, &name);

        let mut interface_hashes: Vec<u64> = interfaces.iter().map(|i| i.hash).collect();
        interface_hashes.sort_unstable();
        hasher.update(&(interface_hashes.len() as u32).to_le_bytes());
        for h in interface_hashes {
            hasher.update(&h.to_le_bytes());
        }

        Self {
            hash: truncate(hasher.finalize()),
            name,
            superclass,
            interfaces,
        }
    }

    /// A type with no supertypes.
    pub fn root(name: impl Into<String>) -> Self {
        Self::new(name, None, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_hash(&self) -> u64 {
        self.hash
    }

    pub fn superclass(&self) -> Option<&ServiceType> {
        self.superclass.as_deref()
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &ServiceType> {
        self.interfaces.iter().map(|i| i.as_ref())
    }

    /// True if `other` is this type or one of its subtypes.
    pub fn is_assignable_from(&self, other: &ServiceType) -> bool {
        if self.hash == other.hash {
            return true;
        }
        if let Some(sup) = other.superclass() {
            if self.is_assignable_from(sup) {
                return true;
            }
        }
        other.interfaces().any(|i| self.is_assignable_from(i))
    }

    /// This type followed by every distinct supertype, depth-first.
    pub fn hierarchy(&self) -> Vec<&ServiceType> {
        let mut out: Vec<&ServiceType> = Vec::new();
        collect_service_types(self, &mut out);
        out
    }
}

fn collect_service_types<'a>(ty: &'a ServiceType, out: &mut Vec<&'a ServiceType>) {
    if out.iter().any(|t| t.hash == ty.hash) {
        return;
    }
    out.push(ty);
    if let Some(sup) = ty.superclass() {
        collect_service_types(sup, out);
    }
    for iface in ty.interfaces() {
        collect_service_types(iface, out);
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.name, self.hash)
    }
}

/// A field declared by an entry class.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDesc {
    pub name: String,
    pub type_name: String,
}

impl FieldDesc {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Structural descriptor of an attribute (entry) class.
///
/// Field indexes are global across the hierarchy: superclass fields come
/// first, then the fields this class declares, alphabetically.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "RawEntryClass")]
pub struct EntryClass {
    name: String,
    hash: u64,
    superclass: Option<Arc<EntryClass>>,
    fields: Vec<FieldDesc>,
    field_count: usize,
}

impl EntryClass {
    /// Build a descriptor; declared fields are sorted by name.
    pub fn new(
        name: impl Into<String>,
        superclass: Option<EntryClass>,
        fields: Vec<FieldDesc>,
    ) -> Self {
        Self::build(name.into(), superclass.map(Arc::new), fields)
    }

    fn build(name: String, superclass: Option<Arc<EntryClass>>, mut fields: Vec<FieldDesc>) -> Self {
        fields.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.type_name.cmp(&b.type_name)));

        let mut hasher = blake3::Hasher::new();
        hasher.update(ENTRY_CLASS_DOMAIN);
        hasher.update(&superclass.as_ref().map_or(0, |s| s.hash).to_le_bytes());
        update_str(&mut hasher, &name);
        hasher.update(&(fields.len() as u32).to_le_bytes());
        for field in &fields {
            update_str(&mut hasher, &field.name);
            update_str(&mut hasher, &field.type_name);
        }

        let field_count = superclass.as_ref().map_or(0, |s| s.field_count) + fields.len();

        Self {
            hash: truncate(hasher.finalize()),
            name,
            superclass,
            fields,
            field_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_hash(&self) -> u64 {
        self.hash
    }

    pub fn superclass(&self) -> Option<&EntryClass> {
        self.superclass.as_deref()
    }

    /// Fields declared directly by this class.
    pub fn declared_fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    /// Number of fields including inherited ones.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Field descriptor at a global index.
    pub fn field(&self, index: usize) -> Option<&FieldDesc> {
        if index >= self.field_count {
            return None;
        }
        let inherited = self.field_count - self.fields.len();
        if index >= inherited {
            self.fields.get(index - inherited)
        } else {
            self.superclass().and_then(|s| s.field(index))
        }
    }

    /// Global index of a field by name; subclass declarations shadow
    /// superclass ones.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        let inherited = self.field_count - self.fields.len();
        if let Some(pos) = self.fields.iter().position(|f| f.name == name) {
            return Some(inherited + pos);
        }
        self.superclass().and_then(|s| s.field_index(name))
    }

    /// The class in this hierarchy that declares field `index`.
    pub fn defining_class(&self, index: usize) -> &EntryClass {
        let mut class = self;
        while let Some(sup) = class.superclass() {
            if index >= sup.field_count {
                break;
            }
            class = sup;
        }
        class
    }

    /// True if `other` is this class or one of its subclasses.
    pub fn is_assignable_from(&self, other: &EntryClass) -> bool {
        let mut current = Some(other);
        while let Some(class) = current {
            if class.hash == self.hash {
                return true;
            }
            current = class.superclass();
        }
        false
    }
}

impl PartialEq for EntryClass {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for EntryClass {}

impl Hash for EntryClass {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for EntryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.name, self.hash)
    }
}

/// Wire form of an [`EntryClass`]. The hash and field count are derived, so a
/// decoded class recomputes them instead of trusting the sender.
#[derive(Deserialize)]
struct RawEntryClass {
    name: String,
    superclass: Option<Arc<EntryClass>>,
    fields: Vec<FieldDesc>,
}

impl From<RawEntryClass> for EntryClass {
    fn from(raw: RawEntryClass) -> Self {
        EntryClass::build(raw.name, raw.superclass, raw.fields)
    }
}

fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u32).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn truncate(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_class() -> EntryClass {
        EntryClass::new("Name", None, vec![FieldDesc::new("name", "String")])
    }

    fn location_class() -> EntryClass {
        EntryClass::new(
            "Location",
            None,
            vec![
                FieldDesc::new("room", "String"),
                FieldDesc::new("floor", "String"),
                FieldDesc::new("building", "String"),
            ],
        )
    }

    #[test]
    fn independent_descriptors_are_equal() {
        let a = ServiceType::new("Printer", Some(ServiceType::root("Device")), vec![]);
        let b = ServiceType::new("Printer", Some(ServiceType::root("Device")), vec![]);
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn same_name_different_parent_differs() {
        let a = ServiceType::new("Printer", Some(ServiceType::root("Device")), vec![]);
        let b = ServiceType::new("Printer", Some(ServiceType::root("Gadget")), vec![]);
        assert_ne!(a, b);
    }

    #[test]
    fn interface_order_does_not_matter() {
        let x = ServiceType::root("X");
        let y = ServiceType::root("Y");
        let a = ServiceType::new("Impl", None, vec![x.clone(), y.clone()]);
        let b = ServiceType::new("Impl", None, vec![y, x]);
        assert_eq!(a, b);
    }

    #[test]
    fn assignability_walks_superclasses_and_interfaces() {
        let remote = ServiceType::root("Remote");
        let device = ServiceType::root("Device");
        let printer = ServiceType::new("Printer", Some(device.clone()), vec![remote.clone()]);
        let laser = ServiceType::new("LaserPrinter", Some(printer.clone()), vec![]);

        assert!(device.is_assignable_from(&laser));
        assert!(remote.is_assignable_from(&laser));
        assert!(printer.is_assignable_from(&printer));
        assert!(!laser.is_assignable_from(&printer));

        let names: Vec<&str> = laser.hierarchy().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["LaserPrinter", "Printer", "Device", "Remote"]);
    }

    #[test]
    fn declared_fields_are_sorted() {
        let loc = location_class();
        let names: Vec<&str> = loc.declared_fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["building", "floor", "room"]);
        assert_eq!(loc.field_index("room"), Some(2));
    }

    #[test]
    fn field_indexes_span_hierarchy() {
        let base = name_class();
        let sub = EntryClass::new(
            "ProductName",
            Some(base.clone()),
            vec![FieldDesc::new("vendor", "String"), FieldDesc::new("model", "String")],
        );

        assert_eq!(sub.field_count(), 3);
        assert_eq!(sub.field_index("name"), Some(0));
        assert_eq!(sub.field_index("model"), Some(1));
        assert_eq!(sub.field_index("vendor"), Some(2));
        assert_eq!(sub.field(0).map(|f| f.name.as_str()), Some("name"));
        assert_eq!(sub.defining_class(0), &base);
        assert_eq!(sub.defining_class(2), &sub);
        assert!(base.is_assignable_from(&sub));
        assert!(!sub.is_assignable_from(&base));
    }

    #[test]
    fn field_type_changes_hash() {
        let a = EntryClass::new("Name", None, vec![FieldDesc::new("name", "String")]);
        let b = EntryClass::new("Name", None, vec![FieldDesc::new("name", "Integer")]);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_survives_serialization() {
        let sub = EntryClass::new("Sub", Some(name_class()), vec![FieldDesc::new("x", "int")]);
        let json = serde_json::to_string(&sub).unwrap();
        let back: EntryClass = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
        assert_eq!(back.field_count(), 2);
        assert_eq!(back.superclass(), sub.superclass());
    }

    #[test]
    fn decoded_class_recomputes_derived_fields() {
        let json = serde_json::json!({
            "name": "Name",
            "hash": 1,
            "superclass": null,
            "fields": [{"name": "name", "type_name": "String"}],
            "field_count": 5,
        });
        let back: EntryClass = serde_json::from_value(json).unwrap();
        assert_eq!(back, name_class());
        assert_eq!(back.field_count(), 1);
    }
}
