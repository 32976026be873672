//! Resource Accounting Engine
//!
//! Usage is recomputed from live cluster state on every call; nothing is
//! cached or reserved between an approval and the mutation it guards.

use crate::model::{
    Quantity, QuantityMap, QuotaRecord, ResourceCatalog, ResourceDelta, ResourceKind,
    NETWORK_RESOURCE, PCI_RESOURCE,
};
use crate::usage::{availability, disk_volume, fuzzy_match, network_rate, parse_options, split_indexed, UsageSnapshot};
use gate_common::{Credentials, GateError, GateResult};
use gate_fabric::FabricClient;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accounting engine
pub struct AccountingEngine {
    fabric: Arc<FabricClient>,
    catalog: Arc<ResourceCatalog>,
}

/// One line of a tenant's resource report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLine {
    /// Current usage
    pub used: Quantity,
    /// Remaining headroom
    pub avail: Option<Quantity>,
    /// Ceiling
    pub max: Option<Quantity>,
}

/// Used, available and maximum per resource
pub type ResourceReport = BTreeMap<String, ResourceLine>;

impl AccountingEngine {
    /// Create engine over the process-wide descriptors
    pub fn new(fabric: Arc<FabricClient>, catalog: Arc<ResourceCatalog>) -> Self {
        Self { fabric, catalog }
    }

    /// Resource descriptors
    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    /// Sum usage over every instance visible to the tenant's session
    ///
    /// Instances whose configuration cannot be fetched, and disks or devices
    /// that no longer resolve, are left out of the totals.
    pub async fn compute_usage(&self, credentials: &Credentials) -> GateResult<UsageSnapshot> {
        let listing = self
            .fabric
            .cluster_resources(credentials, Some("vm"))
            .await
            .into_result()?;

        let mut usage = UsageSnapshot::new(&self.catalog);

        for instance in listing.as_array().map(Vec::as_slice).unwrap_or_default() {
            let (Some(node), Some(kind), Some(vmid)) = (
                instance["node"].as_str(),
                instance["type"].as_str(),
                instance["vmid"].as_u64(),
            ) else {
                continue;
            };

            let response = self
                .fabric
                .instance_config(node, kind, vmid as u32, credentials)
                .await;
            if !response.is_success() {
                tracing::debug!(node, kind, vmid, status = response.status, "excluding instance from usage");
                continue;
            }

            if let Some(config) = response.data.as_object() {
                for (key, value) in config {
                    self.account_key(&mut usage, node, key, value).await;
                }
            }
        }

        Ok(usage)
    }

    async fn account_key(&self, usage: &mut UsageSnapshot, node: &str, key: &str, value: &Value) {
        if let Some(ResourceKind::Numeric) = self.catalog.get(key) {
            if let Some(amount) = as_number(value) {
                usage.add(key, amount);
            }
            return;
        }

        let Some(value) = value.as_str() else { return };
        // `rootfs` carries no index
        let prefix = split_indexed(key).map(|(prefix, _)| prefix).unwrap_or(key);

        if self.catalog.claims_disk_prefix(prefix) {
            let Some((storage, volid)) = disk_volume(value) else { return };
            let Some(resource) = self.catalog.storage_for(prefix, storage) else { return };

            let response = self.fabric.volume(node, storage, volid).await;
            match response.data["size"].as_f64() {
                Some(size) if response.is_success() => usage.add(resource, size),
                // disk no longer exists
                _ => tracing::debug!(node, volid, "excluding unresolved disk from usage"),
            }
        } else if prefix == "net" {
            if let Some(rate) = network_rate(value) {
                usage.add(NETWORK_RESOURCE, rate);
            }
        } else if prefix == "hostpci" {
            let (device_id, _) = parse_options(value);
            match self.fabric.pci_device(node, device_id).await {
                Some(device) => {
                    if let Some(name) = device["device_name"].as_str() {
                        usage.push(PCI_RESOURCE, name);
                    }
                }
                None => tracing::debug!(node, device_id, "excluding unresolved device from usage"),
            }
        }
    }

    /// Remaining headroom for the tenant
    pub async fn compute_availability(
        &self,
        quota: &QuotaRecord,
        credentials: &Credentials,
    ) -> GateResult<QuantityMap> {
        let used = self.compute_usage(credentials).await?;
        Ok(availability(&self.catalog, &quota.max, &used))
    }

    /// Used, available and maximum per resource
    pub async fn report(&self, quota: &QuotaRecord, credentials: &Credentials) -> GateResult<ResourceReport> {
        let used = self.compute_usage(credentials).await?;
        let avail = availability(&self.catalog, &quota.max, &used);

        Ok(used
            .totals()
            .iter()
            .map(|(name, used)| {
                let line = ResourceLine {
                    used: used.clone(),
                    avail: avail.get(name).cloned(),
                    max: quota.max.get(name).cloned(),
                };
                (name.clone(), line)
            })
            .collect())
    }

    /// Approve or deny a proposed change against fresh headroom
    pub async fn approve(
        &self,
        quota: &QuotaRecord,
        credentials: &Credentials,
        delta: &ResourceDelta,
    ) -> GateResult<()> {
        let avail = self.compute_availability(quota, credentials).await?;

        match evaluate(&self.catalog, &avail, delta) {
            Ok(()) => {
                tracing::debug!(?delta, "admission approved");
                Ok(())
            }
            Err(reason) => {
                tracing::info!(?delta, %reason, "admission denied");
                let request = serde_json::to_value(delta).unwrap_or(Value::Null);
                Err(GateError::denied(reason, request))
            }
        }
    }
}

/// Decide a delta against headroom; every requested key must pass
pub fn evaluate(catalog: &ResourceCatalog, avail: &QuantityMap, delta: &ResourceDelta) -> Result<(), String> {
    for (name, requested) in delta {
        let Some(available) = avail.get(name) else {
            return Err(format!("{} is not an available resource", name));
        };

        match (catalog.get(name), available, requested) {
            (Some(ResourceKind::List { whitelist }), Quantity::Set(remaining), Quantity::Set(ids)) => {
                let overlaps = ids
                    .iter()
                    .any(|id| remaining.iter().any(|entry| fuzzy_match(id, entry)));
                if overlaps != *whitelist {
                    return Err(if *whitelist {
                        format!("{} {:?} is not in the remaining allow-list", name, ids)
                    } else {
                        format!("{} {:?} is blocked", name, ids)
                    });
                }
            }
            (Some(kind), Quantity::Amount(available), Quantity::Amount(amount)) if kind.is_amount() => {
                if !available.is_finite() || !amount.is_finite() {
                    return Err(format!("{} is not a valid number", name));
                }
                if available - amount < 0.0 {
                    return Err(format!("{} requested {} exceeds available {}", name, amount, available));
                }
            }
            _ => return Err(format!("{} request does not match the resource kind", name)),
        }
    }

    Ok(())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_fabric::FabricConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn amount(v: f64) -> Quantity {
        Quantity::Amount(v)
    }

    fn set(ids: &[&str]) -> Quantity {
        Quantity::Set(ids.iter().map(|s| s.to_string()).collect())
    }

    fn map(entries: Vec<(&str, Quantity)>) -> QuantityMap {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn catalog_with_pci(whitelist: bool) -> ResourceCatalog {
        let mut catalog = ResourceCatalog::standard();
        catalog.0.insert("storageA".into(), ResourceKind::Storage { disks: vec!["scsi".into()] });
        catalog.0.insert(PCI_RESOURCE.into(), ResourceKind::List { whitelist });
        catalog
    }

    #[test]
    fn test_numeric_approval() {
        let catalog = catalog_with_pci(true);
        let avail = map(vec![("storageA", amount(20.0))]);

        assert!(evaluate(&catalog, &avail, &map(vec![("storageA", amount(30.0))])).is_err());
        assert!(evaluate(&catalog, &avail, &map(vec![("storageA", amount(15.0))])).is_ok());
        assert!(evaluate(&catalog, &avail, &map(vec![("storageA", amount(20.0))])).is_ok());
        // negative deltas release capacity
        assert!(evaluate(&catalog, &avail, &map(vec![("storageA", amount(-5.0))])).is_ok());
    }

    #[test]
    fn test_invalid_numbers_denied() {
        let catalog = catalog_with_pci(true);
        let avail = map(vec![("cores", amount(4.0))]);
        assert!(evaluate(&catalog, &avail, &map(vec![("cores", amount(f64::NAN))])).is_err());
        assert!(evaluate(&catalog, &avail, &map(vec![("cores", set(&["4"]))])).is_err());

        let broken = map(vec![("cores", amount(f64::NAN))]);
        assert!(evaluate(&catalog, &broken, &map(vec![("cores", amount(1.0))])).is_err());
    }

    #[test]
    fn test_list_whitelist() {
        let catalog = catalog_with_pci(true);
        let avail = map(vec![("pci", set(&["GPU2"]))]);
        assert!(evaluate(&catalog, &avail, &map(vec![("pci", set(&["GPU2"]))])).is_ok());
        assert!(evaluate(&catalog, &avail, &map(vec![("pci", set(&["GPU3"]))])).is_err());
    }

    #[test]
    fn test_list_blacklist() {
        let catalog = catalog_with_pci(false);
        let avail = map(vec![("pci", set(&["GPU2"]))]);
        assert!(evaluate(&catalog, &avail, &map(vec![("pci", set(&["GPU2"]))])).is_err());
        assert!(evaluate(&catalog, &avail, &map(vec![("pci", set(&["GPU3"]))])).is_ok());
    }

    #[test]
    fn test_unknown_resource_denied() {
        let catalog = catalog_with_pci(true);
        let avail = map(vec![("cores", amount(100.0))]);
        let delta = map(vec![("cores", amount(1.0)), ("gpu-hours", amount(1.0))]);
        let reason = evaluate(&catalog, &avail, &delta).unwrap_err();
        assert!(reason.contains("gpu-hours"));
    }

    #[test]
    fn test_empty_delta_approved() {
        let catalog = catalog_with_pci(true);
        assert!(evaluate(&catalog, &QuantityMap::new(), &ResourceDelta::new()).is_ok());
    }

    // =========================================================================
    // Live scan against a mocked fabric
    // =========================================================================

    async fn mock_cluster(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/resources"))
            .and(query_param("type", "vm"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [
                { "id": "qemu/100", "vmid": 100, "node": "pve1", "type": "qemu" },
                { "id": "lxc/101", "vmid": 101, "node": "pve1", "type": "lxc" },
                { "id": "qemu/102", "vmid": 102, "node": "pve1", "type": "qemu" }
            ] })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/qemu/100/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {
                "cores": 2,
                "memory": "2048",
                "scsi0": "local:vm-100-disk-0,size=8G",
                "scsi1": "local:vm-100-disk-1,size=4G",
                "ide2": "local:iso/debian.iso,media=cdrom",
                "net0": "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,rate=50",
                "hostpci0": "0000:01:00,pcie=1"
            } })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/lxc/101/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {
                "cores": 1,
                "memory": 512,
                "swap": 512,
                "rootfs": "local:subvol-101-disk-0,size=4G",
                "net0": "name=eth0,bridge=vmbr0"
            } })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/qemu/102/config"))
            .respond_with(ResponseTemplate::new(500))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/storage/local/content/local:vm-100-disk-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "size": 8000 } })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/storage/local/content/local:subvol-101-disk-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "size": 4000 } })))
            .mount(server)
            .await;
        // local:vm-100-disk-1 is gone
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/storage/local/content/local:vm-100-disk-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/hardware/pci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [
                { "id": "0000:01:00.0", "device_name": "NVIDIA GPU2" }
            ] })))
            .mount(server)
            .await;
    }

    fn engine(server: &MockServer) -> AccountingEngine {
        let fabric = FabricClient::new(FabricConfig {
            url: server.uri(),
            token: Some(gate_fabric::ServiceToken {
                id: "gate@pve!acct".into(),
                secret: "s".into(),
            }),
            ..FabricConfig::default()
        })
        .unwrap();
        AccountingEngine::new(Arc::new(fabric), Arc::new(ResourceCatalog::standard()))
    }

    fn tenant() -> Credentials {
        Credentials::Cookies {
            ticket: "PVE:alice@pve:T".into(),
            csrf: "c".into(),
        }
    }

    #[tokio::test]
    async fn test_compute_usage() {
        let server = MockServer::start().await;
        mock_cluster(&server).await;

        let usage = engine(&server).compute_usage(&tenant()).await.unwrap();
        assert_eq!(usage.get("cores"), Some(&amount(3.0)));
        assert_eq!(usage.get("memory"), Some(&amount(2560.0)));
        assert_eq!(usage.get("swap"), Some(&amount(512.0)));
        assert_eq!(usage.get("local"), Some(&amount(12000.0)));
        assert_eq!(usage.get("network"), Some(&amount(50.0)));
        assert_eq!(usage.get("pci"), Some(&set(&["NVIDIA GPU2"])));
    }

    #[tokio::test]
    async fn test_approve_against_live_usage() {
        let server = MockServer::start().await;
        mock_cluster(&server).await;

        let quota = QuotaRecord {
            max: map(vec![("cores", amount(4.0)), ("pci", set(&["GPU2", "GPU2"]))]),
            ..QuotaRecord::default()
        };
        let engine = engine(&server);

        assert!(engine.approve(&quota, &tenant(), &map(vec![("cores", amount(1.0))])).await.is_ok());
        let denied = engine.approve(&quota, &tenant(), &map(vec![("cores", amount(2.0))])).await;
        assert!(matches!(denied, Err(GateError::Denied { .. })));

        // one GPU2 in use, one left
        assert!(engine.approve(&quota, &tenant(), &map(vec![("pci", set(&["GPU2"]))])).await.is_ok());

        let report = engine.report(&quota, &tenant()).await.unwrap();
        assert_eq!(report["cores"].avail, Some(amount(1.0)));
        assert_eq!(report["pci"].avail, Some(set(&["GPU2"])));
        assert_eq!(report["memory"].max, None);
    }

    #[tokio::test]
    async fn test_unauthenticated_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/resources"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = engine(&server).compute_usage(&tenant()).await;
        assert!(matches!(result, Err(GateError::Unauthenticated)));
    }
}
