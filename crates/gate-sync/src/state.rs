//! Cluster resource state entries and diffing

use gate_common::canonical_hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Resource types that take part in change detection
const TRACKED_TYPES: &[&str] = &["node", "qemu", "lxc"];

/// Filtered view of one cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    /// Resource id, e.g. `qemu/101` or `node/pve1`
    pub id: String,
    /// Resource type
    #[serde(rename = "type")]
    pub kind: String,
    /// Status string
    #[serde(default)]
    pub status: Option<String>,
    /// Hosting node
    #[serde(default)]
    pub node: Option<String>,
    /// Resource pool
    #[serde(default)]
    pub pool: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

impl ClusterEntry {
    /// Filter a raw listing item; `None` for untracked or malformed items
    pub fn from_value(value: &Value) -> Option<Self> {
        let entry: ClusterEntry = serde_json::from_value(value.clone()).ok()?;
        TRACKED_TYPES.contains(&entry.kind.as_str()).then_some(entry)
    }

    /// Whether this is a top-level node
    pub fn is_node(&self) -> bool {
        self.kind == "node"
    }

    /// Content hash over the filtered fields
    pub fn content_hash(&self) -> String {
        canonical_hash(self)
    }
}

/// Filter a raw cluster listing
pub fn filter_listing(listing: &[Value]) -> Vec<ClusterEntry> {
    listing.iter().filter_map(ClusterEntry::from_value).collect()
}

/// Hash of a whole filtered listing, independent of listing order
pub fn state_hash(entries: &[ClusterEntry]) -> String {
    let mut sorted: Vec<&ClusterEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    canonical_hash(&sorted)
}

/// One retained generation of cluster state, keyed by resource id
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<String, (ClusterEntry, String)>,
}

impl Snapshot {
    /// Build from filtered entries
    pub fn new(entries: Vec<ClusterEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| {
                let hash = entry.content_hash();
                (entry.id.clone(), (entry, hash))
            })
            .collect();
        Self { entries }
    }

    /// Number of tracked resources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that are new, changed, or gone relative to `previous`
    ///
    /// Gone entries are reported with their last known state so their pool
    /// can still be notified.
    pub fn changed_since<'a>(&'a self, previous: &'a Snapshot) -> Vec<&'a ClusterEntry> {
        let mut changed: Vec<&ClusterEntry> = self
            .entries
            .iter()
            .filter(|(id, (_, hash))| previous.entries.get(*id).map(|(_, old)| old) != Some(hash))
            .map(|(_, (entry, _))| entry)
            .collect();

        changed.extend(
            previous
                .entries
                .iter()
                .filter(|(id, _)| !self.entries.contains_key(*id))
                .map(|(_, (entry, _))| entry),
        );
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vm(id: u32, status: &str, pool: &str) -> Value {
        json!({
            "id": format!("qemu/{}", id), "type": "qemu", "status": status,
            "node": "pve1", "pool": pool, "name": format!("vm{}", id), "cpu": 0.25
        })
    }

    #[test]
    fn test_hash_ignores_field_order_and_unfiltered_fields() {
        let a = ClusterEntry::from_value(&vm(101, "running", "a")).unwrap();
        let mut reordered = json!({ "pool": "a", "name": "vm101", "node": "pve1",
            "status": "running", "type": "qemu", "id": "qemu/101" });
        reordered["mem"] = json!(4096);
        let b = ClusterEntry::from_value(&reordered).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let stopped = ClusterEntry::from_value(&vm(101, "stopped", "a")).unwrap();
        assert_ne!(a.content_hash(), stopped.content_hash());
    }

    #[test]
    fn test_state_hash_order_independent() {
        let one = filter_listing(&[vm(101, "running", "a"), vm(102, "stopped", "b")]);
        let two = filter_listing(&[vm(102, "stopped", "b"), vm(101, "running", "a")]);
        assert_eq!(state_hash(&one), state_hash(&two));

        let three = filter_listing(&[vm(102, "running", "b"), vm(101, "running", "a")]);
        assert_ne!(state_hash(&one), state_hash(&three));
    }

    #[test]
    fn test_untracked_types_filtered() {
        let listing = vec![
            json!({ "id": "storage/pve1/local", "type": "storage", "node": "pve1" }),
            json!({ "id": "node/pve1", "type": "node", "status": "online", "node": "pve1" }),
            json!("garbage"),
        ];
        let entries = filter_listing(&listing);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_node());
    }

    #[test]
    fn test_changed_since() {
        let before = Snapshot::new(filter_listing(&[vm(101, "running", "a"), vm(102, "running", "b")]));
        let after = Snapshot::new(filter_listing(&[vm(101, "stopped", "a"), vm(103, "running", "c")]));

        let mut ids: Vec<_> = after.changed_since(&before).iter().map(|e| e.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["qemu/101", "qemu/102", "qemu/103"]);

        assert!(after.changed_since(&after).is_empty());
    }
}
