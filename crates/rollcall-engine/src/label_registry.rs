//! Label ↔ identity mapping, frozen per trained model.
//!
//! Labels are dense (0..N-1) and assigned in identity-name order, never in
//! directory enumeration order. A mapping is built once per training job and
//! persisted with the model it labels; inference resolves labels only
//! through the mapping bound to the active model.

use crate::identity::Identity;
use rollcall_core::Label;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub label: Label,
    pub identity: Identity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<LabelEntry>", into = "Vec<LabelEntry>")]
pub struct LabelMapping {
    /// Invariant: `entries[i].label == i` and identities strictly ascending.
    entries: Vec<LabelEntry>,
}

impl LabelMapping {
    /// Assign labels 0..N-1 to the given identities in sorted order.
    /// Duplicates are collapsed.
    pub fn snapshot<'a>(identities: impl IntoIterator<Item = &'a Identity>) -> Self {
        let mut ids: Vec<Identity> = identities.into_iter().cloned().collect();
        ids.sort();
        ids.dedup();

        let entries = ids
            .into_iter()
            .enumerate()
            .map(|(i, identity)| LabelEntry {
                label: i as Label,
                identity,
            })
            .collect();
        Self { entries }
    }

    /// Identity for `label`, or `None` if the label is outside this mapping.
    pub fn resolve(&self, label: Label) -> Option<&Identity> {
        self.entries.get(label as usize).map(|e| &e.identity)
    }

    pub fn label_of(&self, identity: &Identity) -> Option<Label> {
        self.entries
            .binary_search_by(|e| e.identity.cmp(identity))
            .ok()
            .map(|i| self.entries[i].label)
    }

    pub fn entries(&self) -> &[LabelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<LabelEntry>> for LabelMapping {
    type Error = String;

    fn try_from(entries: Vec<LabelEntry>) -> Result<Self, Self::Error> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.label as usize != i {
                return Err(format!("label {} at position {i}: labels must be dense from 0", entry.label));
            }
            if i > 0 && entries[i - 1].identity >= entry.identity {
                return Err(format!("identity {} out of order", entry.identity));
            }
        }
        Ok(Self { entries })
    }
}

impl From<LabelMapping> for Vec<LabelEntry> {
    fn from(mapping: LabelMapping) -> Self {
        mapping.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<Identity> {
        names.iter().map(|n| Identity::parse(n).unwrap()).collect()
    }

    #[test]
    fn test_labels_follow_name_order_not_input_order() {
        let a = LabelMapping::snapshot(&ids(&["carla", "ana", "bruno"]));
        let b = LabelMapping::snapshot(&ids(&["bruno", "carla", "ana"]));
        assert_eq!(a, b);
        assert_eq!(a.resolve(0).unwrap().as_str(), "ana");
        assert_eq!(a.resolve(1).unwrap().as_str(), "bruno");
        assert_eq!(a.resolve(2).unwrap().as_str(), "carla");
    }

    #[test]
    fn test_out_of_range_label_resolves_to_none() {
        let m = LabelMapping::snapshot(&ids(&["ana"]));
        assert!(m.resolve(1).is_none());
        assert!(m.resolve(Label::MAX).is_none());
    }

    #[test]
    fn test_duplicates_collapse() {
        let m = LabelMapping::snapshot(&ids(&["ana", "ana", "bob"]));
        assert_eq!(m.len(), 2);
        assert_eq!(m.label_of(&Identity::parse("bob").unwrap()), Some(1));
    }

    #[test]
    fn test_older_mapping_unaffected_by_new_identities() {
        let v1 = LabelMapping::snapshot(&ids(&["bruno", "carla"]));
        let v2 = LabelMapping::snapshot(&ids(&["ana", "bruno", "carla"]));
        // "ana" shifts every label in v2; v1 must still resolve its own labels.
        assert_eq!(v1.resolve(0).unwrap().as_str(), "bruno");
        assert_eq!(v2.resolve(0).unwrap().as_str(), "ana");
    }

    #[test]
    fn test_persisted_form_is_label_identity_list() {
        let m = LabelMapping::snapshot(&ids(&["bob", "ana"]));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"label": 0, "identity": "ana"},
                {"label": 1, "identity": "bob"},
            ])
        );
        let back: LabelMapping = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_rejects_sparse_or_unordered_records() {
        let sparse = serde_json::json!([{"label": 1, "identity": "ana"}]);
        assert!(serde_json::from_value::<LabelMapping>(sparse).is_err());
        let unordered = serde_json::json!([
            {"label": 0, "identity": "bob"},
            {"label": 1, "identity": "ana"},
        ]);
        assert!(serde_json::from_value::<LabelMapping>(unordered).is_err());
    }
}
