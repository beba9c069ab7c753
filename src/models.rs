//! Core data types that flow from discovery sources to the output writer.
//!
//! A [`TargetGroup`] is produced by a source for every monitorable record.
//! The reconciler flattens groups into [`CustomSdEntry`] values keyed in a
//! [`Snapshot`], which is what ends up in the `file_sd` JSON document.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Label holding the scrape address of a target.
pub const ADDRESS_LABEL: &str = "__address__";
/// Label used to count published targets per metrics bucket.
pub const METRICS_LABEL: &str = "metrics_label";
/// Label carrying the inventory record identifier used for enrichment.
pub const SERVER_ID_LABEL: &str = "server_id";
pub const PROJECT_ID_LABEL: &str = "project_id";
pub const DOMAIN_ID_LABEL: &str = "domain_id";

pub type LabelSet = BTreeMap<String, String>;

/// A set of endpoints sharing one label set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetGroup {
    /// Identifies the record the group came from. Not necessarily unique.
    pub source: String,
    pub labels: LabelSet,
    /// Each entry holds at least an [`ADDRESS_LABEL`].
    pub targets: Vec<LabelSet>,
}

impl TargetGroup {
    /// Builds a group with a single target at `address`.
    pub fn single(source: impl Into<String>, address: impl Into<String>, labels: LabelSet) -> Self {
        let mut target = LabelSet::new();
        target.insert(ADDRESS_LABEL.to_string(), address.into());
        Self {
            source: source.into(),
            labels,
            targets: vec![target],
        }
    }

    /// Addresses of all targets, in order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.targets
            .iter()
            .filter_map(|t| t.get(ADDRESS_LABEL).map(String::as_str))
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// One element of the `file_sd` JSON array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomSdEntry {
    pub targets: Vec<String>,
    pub labels: LabelSet,
}

impl CustomSdEntry {
    pub fn from_group(group: &TargetGroup) -> Self {
        Self {
            targets: group.addresses().map(str::to_string).collect(),
            labels: group.labels.clone(),
        }
    }
}

/// Targets compare as a set of addresses; labels are already a map.
impl PartialEq for CustomSdEntry {
    fn eq(&self, other: &Self) -> bool {
        if self.labels != other.labels {
            return false;
        }
        let ours: BTreeSet<&str> = self.targets.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = other.targets.iter().map(String::as_str).collect();
        ours == theirs
    }
}

impl Eq for CustomSdEntry {}

/// The last published state of one source, keyed by composite group key.
pub type Snapshot = BTreeMap<String, CustomSdEntry>;

/// Ownership data found for one inventory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentResult {
    pub record_id: String,
    pub tenant_id: String,
    /// `None` when the tenant's domain lookup failed or was skipped.
    pub domain_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn entry_from_group_keeps_addresses_in_order() {
        let mut group = TargetGroup::single("a", "10.0.0.1:1234", labels(&[("x", "1")]));
        let mut second = LabelSet::new();
        second.insert(ADDRESS_LABEL.to_string(), "10.0.0.2:1234".to_string());
        group.targets.push(second);

        let entry = CustomSdEntry::from_group(&group);
        assert_eq!(entry.targets, vec!["10.0.0.1:1234", "10.0.0.2:1234"]);
        assert_eq!(entry.labels, labels(&[("x", "1")]));
    }

    #[test]
    fn entry_equality_ignores_target_order() {
        let a = CustomSdEntry {
            targets: vec!["a".into(), "b".into()],
            labels: labels(&[("k", "v")]),
        };
        let b = CustomSdEntry {
            targets: vec!["b".into(), "a".into()],
            labels: labels(&[("k", "v")]),
        };
        assert_eq!(a, b);

        let c = CustomSdEntry {
            targets: vec!["a".into(), "b".into()],
            labels: labels(&[("k", "w")]),
        };
        assert_ne!(a, c);
    }

    #[test]
    fn entry_serializes_targets_before_labels() {
        let entry = CustomSdEntry {
            targets: vec!["10.0.0.1:1234".into()],
            labels: labels(&[("manufacturer", "acme")]),
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"targets":["10.0.0.1:1234"],"labels":{"manufacturer":"acme"}}"#
        );
    }
}
