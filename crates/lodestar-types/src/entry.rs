//! Attribute instances.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::class::EntryClass;
use crate::error::{Result, TypeError};
use crate::value::AttrValue;

/// An attribute set attached to a service item.
///
/// Fields are positional and follow [`EntryClass`] field order. A `None` field
/// is null: a wildcard when the entry is used as a template, a concrete null
/// when the entry is stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawEntry")]
pub struct Entry {
    class: Arc<EntryClass>,
    fields: Vec<Option<AttrValue>>,
}

#[derive(Deserialize)]
struct RawEntry {
    class: Arc<EntryClass>,
    fields: Vec<Option<AttrValue>>,
}

impl TryFrom<RawEntry> for Entry {
    type Error = TypeError;

    fn try_from(raw: RawEntry) -> Result<Self> {
        Entry::with_class(raw.class, raw.fields)
    }
}

impl Entry {
    /// Build an entry, checking the field count against the class.
    pub fn new(class: EntryClass, fields: Vec<Option<AttrValue>>) -> Result<Self> {
        Self::with_class(Arc::new(class), fields)
    }

    pub fn with_class(class: Arc<EntryClass>, fields: Vec<Option<AttrValue>>) -> Result<Self> {
        if fields.len() != class.field_count() {
            return Err(TypeError::FieldCount {
                class: class.name().to_string(),
                expected: class.field_count(),
                actual: fields.len(),
            });
        }
        Ok(Self { class, fields })
    }

    /// An entry of `class` with every field null.
    pub fn empty(class: EntryClass) -> Self {
        let fields = vec![None; class.field_count()];
        Self {
            class: Arc::new(class),
            fields,
        }
    }

    /// Set a field by name, builder style.
    pub fn with(mut self, field: &str, value: impl Into<AttrValue>) -> Result<Self> {
        self.set(field, Some(value.into()))?;
        Ok(self)
    }

    pub fn set(&mut self, field: &str, value: Option<AttrValue>) -> Result<()> {
        let index = self
            .class
            .field_index(field)
            .ok_or_else(|| TypeError::UnknownField {
                class: self.class.name().to_string(),
                field: field.to_string(),
            })?;
        self.fields[index] = value;
        Ok(())
    }

    pub fn class(&self) -> &EntryClass {
        &self.class
    }

    pub fn class_arc(&self) -> &Arc<EntryClass> {
        &self.class
    }

    pub fn fields(&self) -> &[Option<AttrValue>] {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut [Option<AttrValue>] {
        &mut self.fields
    }

    pub fn get(&self, field: &str) -> Option<&AttrValue> {
        self.class
            .field_index(field)
            .and_then(|i| self.fields.get(i))
            .and_then(|v| v.as_ref())
    }

    /// Template test: the template class is an ancestor of this entry's class
    /// and every non-null template field equals the corresponding field here.
    pub fn matches_template(&self, template: &Entry) -> bool {
        if !template.class.is_assignable_from(&self.class) {
            return false;
        }
        if template.fields.len() > self.fields.len() {
            return false;
        }
        template
            .fields
            .iter()
            .zip(self.fields.iter())
            .all(|(t, v)| t.is_none() || t == v)
    }

    /// True if every field is null.
    pub fn is_wildcard(&self) -> bool {
        self.fields.iter().all(|f| f.is_none())
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.class.content_hash() == other.class.content_hash() && self.fields == other.fields
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.content_hash().hash(state);
        self.fields.hash(state);
    }
}
