//! Tag registry: known pallets and their physical identifiers.
//!
//! Loaded once from the deployment file. A UWB id found here resolves to the
//! registered [`TagId`]; unknown UWB ids get a synthetic `uwb:<id>` identity.
//! An RFID id found here binds directly to its tag, skipping spatial
//! correlation.

use std::collections::HashMap;

use palletmap_types::{TagId, TagRecord};

#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    records: Vec<TagRecord>,
    by_tag: HashMap<TagId, usize>,
    by_uwb: HashMap<String, usize>,
    by_rfid: HashMap<String, usize>,
}

impl TagRegistry {
    /// Index `records`. Later records win on duplicate identifiers.
    pub fn new(records: Vec<TagRecord>) -> Self {
        let mut registry = Self::default();
        for (i, record) in records.iter().enumerate() {
            registry.by_tag.insert(record.tag_id.clone(), i);
            if let Some(uwb) = &record.uwb_id {
                registry.by_uwb.insert(uwb.clone(), i);
            }
            if let Some(rfid) = &record.rfid_id {
                registry.by_rfid.insert(rfid.clone(), i);
            }
        }
        registry.records = records;
        registry
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, tag: &TagId) -> Option<&TagRecord> {
        self.by_tag.get(tag).map(|&i| &self.records[i])
    }

    pub fn by_uwb(&self, uwb_id: &str) -> Option<&TagRecord> {
        self.by_uwb.get(uwb_id).map(|&i| &self.records[i])
    }

    pub fn by_rfid(&self, rfid_id: &str) -> Option<&TagRecord> {
        self.by_rfid.get(rfid_id).map(|&i| &self.records[i])
    }

    /// Logical identity of a UWB tag.
    pub fn resolve_uwb(&self, uwb_id: &str) -> TagId {
        self.by_uwb(uwb_id)
            .map(|r| r.tag_id.clone())
            .unwrap_or_else(|| TagId::from_uwb(uwb_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TagRegistry {
        TagRegistry::new(vec![
            TagRecord {
                tag_id: TagId::from("PLT-A001"),
                uwb_id: Some("uwb_tag_1".to_string()),
                rfid_id: Some("E200-0001".to_string()),
                pallet_id: Some("PLT-A001".to_string()),
                content_type: Some("Electronics".to_string()),
            },
            TagRecord {
                tag_id: TagId::from("PLT-B002"),
                uwb_id: None,
                rfid_id: Some("E200-0002".to_string()),
                pallet_id: Some("PLT-B002".to_string()),
                content_type: None,
            },
        ])
    }

    #[test]
    fn known_uwb_resolves_to_registered_tag() {
        assert_eq!(registry().resolve_uwb("uwb_tag_1"), TagId::from("PLT-A001"));
    }

    #[test]
    fn unknown_uwb_gets_synthetic_identity() {
        assert_eq!(registry().resolve_uwb("uwb_tag_9"), TagId::from("uwb:uwb_tag_9"));
    }

    #[test]
    fn rfid_lookup_returns_metadata() {
        let r = registry();
        let record = r.by_rfid("E200-0001").unwrap();
        assert_eq!(record.content_type.as_deref(), Some("Electronics"));
        assert!(r.by_rfid("E200-9999").is_none());
        assert_eq!(r.len(), 2);
        assert!(r.get(&TagId::from("PLT-B002")).is_some());
    }
}
