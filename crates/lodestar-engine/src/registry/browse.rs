//! Enumeration over the matching items: types, entry classes, field values.

use lodestar_types::{AttrValue, EntryClass, ServiceTemplate, ServiceType};
use std::collections::HashSet;

use super::Registry;
use crate::error::{RegistryError, Result};
use crate::matching::MatchIter;

impl Registry {
    /// The most specific types of the matching items whose names start with
    /// `prefix`, excluding the template's own types and their supertypes.
    ///
    /// A type that fails the prefix is replaced by its supertypes.
    pub async fn service_types(&self, template: &ServiceTemplate, prefix: &str) -> Vec<ServiceType> {
        let state = self.inner.state.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for reg in MatchIter::new(&state.services, template, self.now()) {
            collect_types(&reg.item.service_type, template, prefix, &mut seen, &mut out);
        }
        out
    }

    /// Classes of the matching items' attribute sets, excluding the template's
    /// entry classes and their superclasses.
    pub async fn entry_classes(&self, template: &ServiceTemplate) -> Vec<EntryClass> {
        let state = self.inner.state.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for reg in MatchIter::new(&state.services, template, self.now()) {
            for entry in &reg.item.attributes {
                let class = entry.class();
                let excluded = template
                    .attribute_templates
                    .iter()
                    .any(|t| class.is_assignable_from(t.class()));
                if !excluded && seen.insert(class.content_hash()) {
                    out.push(class.clone());
                }
            }
        }
        out
    }

    /// Distinct non-null values of `field` across the attribute sets that
    /// match the template's entry at `set_index`, in matching items.
    pub async fn field_values(
        &self,
        template: &ServiceTemplate,
        set_index: usize,
        field: &str,
    ) -> Result<Vec<AttrValue>> {
        let entry_template = template.attribute_templates.get(set_index).ok_or_else(|| {
            RegistryError::InvalidArgument(format!("no attribute template at index {set_index}"))
        })?;
        let k = entry_template.class().field_index(field).ok_or_else(|| {
            RegistryError::InvalidArgument(format!(
                "{} has no field {field}",
                entry_template.class().name()
            ))
        })?;

        let state = self.inner.state.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for reg in MatchIter::new(&state.services, template, self.now()) {
            for entry in &reg.item.attributes {
                if !entry.matches_template(entry_template) {
                    continue;
                }
                if let Some(value) = &entry.fields()[k] {
                    if seen.insert(value.clone()) {
                        out.push(value.clone());
                    }
                }
            }
        }
        Ok(out)
    }
}

fn collect_types(
    ty: &ServiceType,
    template: &ServiceTemplate,
    prefix: &str,
    seen: &mut HashSet<u64>,
    out: &mut Vec<ServiceType>,
) {
    if template.service_types.iter().any(|t| ty.is_assignable_from(t)) {
        return;
    }
    if ty.name().starts_with(prefix) {
        if seen.insert(ty.content_hash()) {
            out.push(ty.clone());
        }
        return;
    }
    if let Some(sup) = ty.superclass() {
        collect_types(sup, template, prefix, seen, out);
    }
    for iface in ty.interfaces() {
        collect_types(iface, template, prefix, seen, out);
    }
}
