use serde::{Deserialize, Serialize};

use crate::class::ServiceType;
use crate::entry::Entry;
use crate::ids::ServiceId;

/// A service as registered with, and returned by, the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    /// Assigned by the registry on first registration when absent.
    pub service_id: Option<ServiceId>,
    pub service_type: ServiceType,
    /// Opaque marshalled service object handed back to lookups.
    pub service: Vec<u8>,
    pub attributes: Vec<Entry>,
}

impl ServiceItem {
    pub fn new(service_type: ServiceType, service: Vec<u8>) -> Self {
        Self {
            service_id: None,
            service_type,
            service,
            attributes: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: ServiceId) -> Self {
        self.service_id = Some(id);
        self
    }

    pub fn with_attribute(mut self, entry: Entry) -> Self {
        self.attributes.push(entry);
        self
    }

    /// Drop attribute sets equal to an earlier one, keeping first occurrences.
    pub fn dedup_attributes(&mut self) {
        let mut kept: Vec<Entry> = Vec::with_capacity(self.attributes.len());
        for entry in self.attributes.drain(..) {
            if !kept.contains(&entry) {
                kept.push(entry);
            }
        }
        self.attributes = kept;
    }
}
