//! Query templates.

use serde::{Deserialize, Serialize};

use crate::class::ServiceType;
use crate::entry::Entry;
use crate::ids::ServiceId;
use crate::item::ServiceItem;

/// Structural query over registered items.
///
/// Every constraint is optional: an empty template matches every item.
/// Types are ANDed; attribute templates are ANDed, and each must be matched by
/// at least one of the item's entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub service_id: Option<ServiceId>,
    pub service_types: Vec<ServiceType>,
    pub attribute_templates: Vec<Entry>,
}

impl ServiceTemplate {
    /// The all-wildcard template.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn by_id(id: ServiceId) -> Self {
        Self {
            service_id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_type(service_type: ServiceType) -> Self {
        Self {
            service_types: vec![service_type],
            ..Self::default()
        }
    }

    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_types.push(service_type);
        self
    }

    pub fn with_attribute(mut self, entry: Entry) -> Self {
        self.attribute_templates.push(entry);
        self
    }

    /// Only type constraints, at least one of them.
    pub fn is_type_only(&self) -> bool {
        self.service_id.is_none()
            && !self.service_types.is_empty()
            && self.attribute_templates.is_empty()
    }

    /// The matching predicate, evaluated field by field with no index.
    pub fn matches(&self, item: &ServiceItem) -> bool {
        if let Some(id) = self.service_id {
            if item.service_id != Some(id) {
                return false;
            }
        }
        if !self
            .service_types
            .iter()
            .all(|t| t.is_assignable_from(&item.service_type))
        {
            return false;
        }
        self.attribute_templates
            .iter()
            .all(|tmpl| item.attributes.iter().any(|e| e.matches_template(tmpl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{EntryClass, FieldDesc};

    fn name_class() -> EntryClass {
        EntryClass::new("Name", None, vec![FieldDesc::new("name", "String")])
    }

    fn item() -> ServiceItem {
        let device = ServiceType::root("Device");
        let printer = ServiceType::new("Printer", Some(device), vec![]);
        ServiceItem::new(printer, b"proxy".to_vec())
            .with_id(ServiceId::new())
            .with_attribute(Entry::empty(name_class()).with("name", "lp0").unwrap())
            .with_attribute(Entry::empty(name_class()).with("name", "front-desk").unwrap())
    }

    #[test]
    fn empty_template_matches_everything() {
        assert!(ServiceTemplate::any().matches(&item()));
    }

    #[test]
    fn id_must_match() {
        let it = item();
        assert!(ServiceTemplate::by_id(it.service_id.unwrap()).matches(&it));
        assert!(!ServiceTemplate::by_id(ServiceId::new()).matches(&it));
    }

    #[test]
    fn types_are_anded() {
        let it = item();
        let device = ServiceType::root("Device");
        let scanner = ServiceType::root("Scanner");
        assert!(ServiceTemplate::by_type(device.clone()).matches(&it));
        assert!(!ServiceTemplate::by_type(device).with_type(scanner).matches(&it));
    }

    #[test]
    fn attribute_templates_or_across_entries() {
        let it = item();
        let front = Entry::empty(name_class()).with("name", "front-desk").unwrap();
        let lp0 = Entry::empty(name_class()).with("name", "lp0").unwrap();
        let missing = Entry::empty(name_class()).with("name", "lp9").unwrap();

        assert!(ServiceTemplate::any().with_attribute(front.clone()).matches(&it));
        assert!(ServiceTemplate::any()
            .with_attribute(front.clone())
            .with_attribute(lp0)
            .matches(&it));
        assert!(!ServiceTemplate::any()
            .with_attribute(front)
            .with_attribute(missing)
            .matches(&it));
    }
}
