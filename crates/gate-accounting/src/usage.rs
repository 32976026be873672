//! Usage snapshots and headroom

use crate::model::{Quantity, QuantityMap, ResourceCatalog, ResourceKind};
use std::collections::BTreeMap;

/// Usage computed for one accounting call; never persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    totals: QuantityMap,
}

impl UsageSnapshot {
    /// Empty snapshot with every catalog resource at zero
    pub fn new(catalog: &ResourceCatalog) -> Self {
        let totals = catalog
            .iter()
            .map(|(name, kind)| {
                let zero = match kind {
                    ResourceKind::List { .. } => Quantity::Set(Vec::new()),
                    _ => Quantity::Amount(0.0),
                };
                (name.clone(), zero)
            })
            .collect();
        Self { totals }
    }

    /// Add to a numeric total; ignored for unknown or list resources
    pub fn add(&mut self, resource: &str, amount: f64) {
        if let Some(Quantity::Amount(total)) = self.totals.get_mut(resource) {
            *total += amount;
        }
    }

    /// Append an identifier; ignored for unknown or numeric resources
    pub fn push(&mut self, resource: &str, id: impl Into<String>) {
        if let Some(Quantity::Set(ids)) = self.totals.get_mut(resource) {
            ids.push(id.into());
        }
    }

    /// Usage for one resource
    pub fn get(&self, resource: &str) -> Option<&Quantity> {
        self.totals.get(resource)
    }

    /// All totals
    pub fn totals(&self) -> &QuantityMap {
        &self.totals
    }
}

/// Headroom per resource: `max - used`, or the shrinking allow-list for lists
///
/// Resources without a ceiling in `max` are absent from the result, which
/// makes any request for them fail admission.
pub fn availability(catalog: &ResourceCatalog, max: &QuantityMap, used: &UsageSnapshot) -> QuantityMap {
    let mut avail = BTreeMap::new();

    for (name, kind) in catalog.iter() {
        let Some(ceiling) = max.get(name) else { continue };

        match (kind, ceiling) {
            (ResourceKind::List { .. }, Quantity::Set(allowed)) => {
                let mut remaining = allowed.clone();
                let used_ids = used.get(name).and_then(Quantity::as_set).unwrap_or_default();
                for id in used_ids {
                    if let Some(pos) = remaining.iter().position(|entry| fuzzy_match(id, entry)) {
                        remaining.remove(pos);
                    }
                }
                avail.insert(name.clone(), Quantity::Set(remaining));
            }
            (_, Quantity::Amount(ceiling)) if kind.is_amount() => {
                let used = used.get(name).and_then(Quantity::as_amount).unwrap_or(0.0);
                avail.insert(name.clone(), Quantity::Amount(ceiling - used));
            }
            _ => {
                tracing::warn!(resource = %name, "quota ceiling does not match resource kind");
            }
        }
    }

    avail
}

/// Whether an identifier matches an allow-list entry (substring match)
pub fn fuzzy_match(id: &str, entry: &str) -> bool {
    id.contains(entry)
}

// =============================================================================
// Instance configuration parsing
// =============================================================================

/// Split `scsi0` into (`scsi`, 0)
pub fn split_indexed(key: &str) -> Option<(&str, u32)> {
    let digits = key.len() - key.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits == key.len() {
        return None;
    }
    let (prefix, index) = key.split_at(key.len() - digits);
    Some((prefix, index.parse().ok()?))
}

/// Split `local:vm-100-disk-0,size=8G,ssd=1` into its head and `k=v` options
pub fn parse_options(value: &str) -> (&str, BTreeMap<&str, &str>) {
    let mut parts = value.split(',');
    let head = parts.next().unwrap_or_default();
    let options = parts.filter_map(|part| part.split_once('=')).collect();
    (head, options)
}

/// Network rate limit carried by a `netN` value
pub fn network_rate(value: &str) -> Option<f64> {
    let (_, options) = parse_options(value);
    options.get("rate")?.parse().ok()
}

/// Storage id and volume id of a disk value, unless it is removable media
pub fn disk_volume(value: &str) -> Option<(&str, &str)> {
    let (head, options) = parse_options(value);
    if options.get("media") == Some(&"cdrom") {
        return None;
    }
    let (storage, _) = head.split_once(':')?;
    Some((storage, head))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ResourceCatalog {
        ResourceCatalog::standard()
    }

    #[test]
    fn test_split_indexed() {
        assert_eq!(split_indexed("scsi0"), Some(("scsi", 0)));
        assert_eq!(split_indexed("hostpci12"), Some(("hostpci", 12)));
        assert_eq!(split_indexed("cores"), None);
        assert_eq!(split_indexed("42"), None);
    }

    #[test]
    fn test_disk_volume() {
        assert_eq!(
            disk_volume("local:vm-100-disk-0,size=8G"),
            Some(("local", "local:vm-100-disk-0"))
        );
        assert_eq!(disk_volume("local:iso/debian.iso,media=cdrom"), None);
        assert_eq!(disk_volume("none,media=cdrom"), None);
    }

    #[test]
    fn test_network_rate() {
        assert_eq!(network_rate("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,rate=50"), Some(50.0));
        assert_eq!(network_rate("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"), None);
    }

    #[test]
    fn test_numeric_availability() {
        let mut used = UsageSnapshot::new(&catalog());
        used.add("cores", 2.0);
        used.add("cores", 1.0);

        let mut max = QuantityMap::new();
        max.insert("cores".into(), Quantity::Amount(8.0));

        let avail = availability(&catalog(), &max, &used);
        assert_eq!(avail["cores"], Quantity::Amount(5.0));
        // no ceiling, no headroom entry
        assert!(!avail.contains_key("memory"));
    }

    #[test]
    fn test_list_availability_shrinks() {
        let mut used = UsageSnapshot::new(&catalog());
        used.push("pci", "NVIDIA GPU2 Ti");

        let mut max = QuantityMap::new();
        max.insert("pci".into(), Quantity::Set(vec!["GPU2".into(), "GPU2".into(), "GPU3".into()]));

        let avail = availability(&catalog(), &max, &used);
        assert_eq!(avail["pci"], Quantity::Set(vec!["GPU2".into(), "GPU3".into()]));
    }

    #[test]
    fn test_unknown_resource_ignored_in_snapshot() {
        let mut used = UsageSnapshot::new(&catalog());
        used.add("gpu-hours", 3.0);
        used.push("cores", "x");
        assert!(used.get("gpu-hours").is_none());
        assert_eq!(used.get("cores"), Some(&Quantity::Amount(0.0)));
    }
}
