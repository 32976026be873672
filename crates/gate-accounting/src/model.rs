//! Accounting Data Model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Resource that collects network interface rate limits
pub const NETWORK_RESOURCE: &str = "network";
/// Resource that collects passthrough device names
pub const PCI_RESOURCE: &str = "pci";

/// Resource dimension kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResourceKind {
    /// Summed numeric quantity (cores, memory, rate)
    Numeric,
    /// Disk volumes on one storage, claimed by config key prefix
    Storage {
        /// Disk key prefixes (`scsi`, `sata`, `virtio`, `rootfs`, `mp`, ...)
        disks: Vec<String>,
    },
    /// Set of named devices
    List {
        /// true: requests must match the allow-list; false: block-list
        whitelist: bool,
    },
}

impl ResourceKind {
    /// Whether this kind is accounted as a number
    pub fn is_amount(&self) -> bool {
        !matches!(self, ResourceKind::List { .. })
    }
}

/// Process-wide resource descriptors, keyed by resource name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceCatalog(pub BTreeMap<String, ResourceKind>);

impl ResourceCatalog {
    /// Look up a descriptor
    pub fn get(&self, name: &str) -> Option<&ResourceKind> {
        self.0.get(name)
    }

    /// Iterate descriptors
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceKind)> {
        self.0.iter()
    }

    /// Whether any storage descriptor claims this disk prefix
    pub fn claims_disk_prefix(&self, prefix: &str) -> bool {
        self.0.values().any(|kind| match kind {
            ResourceKind::Storage { disks } => disks.iter().any(|d| d == prefix),
            _ => false,
        })
    }

    /// Storage resource owning a disk with this prefix on this storage id
    pub fn storage_for(&self, prefix: &str, storage: &str) -> Option<&str> {
        match self.0.get_key_value(storage) {
            Some((name, ResourceKind::Storage { disks })) if disks.iter().any(|d| d == prefix) => {
                Some(name.as_str())
            }
            _ => None,
        }
    }

    /// Catalog used when no descriptors are configured
    pub fn standard() -> Self {
        let disks = ["rootfs", "mp", "sata", "mmc", "scsi", "ide", "virtio", "unused"]
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>();
        let mut map = BTreeMap::new();
        map.insert("cores".to_string(), ResourceKind::Numeric);
        map.insert("memory".to_string(), ResourceKind::Numeric);
        map.insert("swap".to_string(), ResourceKind::Numeric);
        map.insert("local".to_string(), ResourceKind::Storage { disks });
        map.insert(NETWORK_RESOURCE.to_string(), ResourceKind::Numeric);
        map.insert(PCI_RESOURCE.to_string(), ResourceKind::List { whitelist: true });
        Self(map)
    }
}

/// A numeric amount or a set of identifiers
///
/// Used for quota ceilings, usage totals, headroom and requested deltas alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    /// Numeric amount
    Amount(f64),
    /// Identifier set
    Set(Vec<String>),
}

impl Quantity {
    /// Numeric value, if any
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            Quantity::Amount(v) => Some(*v),
            Quantity::Set(_) => None,
        }
    }

    /// Identifier set, if any
    pub fn as_set(&self) -> Option<&[String]> {
        match self {
            Quantity::Set(v) => Some(v),
            Quantity::Amount(_) => None,
        }
    }
}

/// Resource name → quantity
pub type QuantityMap = BTreeMap<String, Quantity>;

/// Requested change, constructed per mutating call
pub type ResourceDelta = QuantityMap;

/// Permitted instance id range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmidRange {
    /// Lowest permitted id
    pub min: u32,
    /// Highest permitted id
    pub max: u32,
}

impl Default for VmidRange {
    fn default() -> Self {
        Self { min: 100, max: 999_999_999 }
    }
}

/// Per-tenant quota record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRecord {
    /// Ceiling per resource
    pub max: QuantityMap,
    /// Nodes the tenant may place instances on
    pub nodes: Vec<String>,
    /// Instance id range
    pub vmid: VmidRange,
    /// Resource pool used to scope notifications
    pub pool: Option<String>,
    /// Provisioning templates per instance type
    pub templates: BTreeMap<String, Value>,
}

impl QuotaRecord {
    /// Whether the tenant may use this node
    pub fn allows_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Whether the instance id falls in the tenant's range
    pub fn allows_vmid(&self, vmid: u32) -> bool {
        (self.vmid.min..=self.vmid.max).contains(&vmid)
    }

    /// Provisioning template for an instance type
    pub fn template(&self, kind: &str) -> Option<&Value> {
        self.templates.get(kind)
    }
}
