//! Gateway Configuration

use gate_accounting::ResourceCatalog;
use gate_common::{GateError, GateResult};
use gate_fabric::FabricConfig;
use gate_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address
    pub listen: String,
    /// Compute fabric connection
    pub fabric: FabricConfig,
    /// Resource descriptors by name
    pub resources: ResourceCatalog,
    /// Ordered directory backends per realm
    pub realms: BTreeMap<String, Vec<String>>,
    /// Backends every login must pass
    pub sessions: Vec<String>,
    /// Backend definitions by name
    pub backends: BTreeMap<String, BackendConfig>,
    /// WebSocket rate bounds
    pub sync: SyncConfig,
    /// Job polling
    pub jobs: JobsConfig,
    /// Admission control
    pub admission: AdmissionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert("fabric".into(), BackendConfig::Fabric);
        backends.insert(
            "local".into(),
            BackendConfig::Local {
                path: "/var/lib/fabricgate/identity.json".into(),
            },
        );

        let mut realms = BTreeMap::new();
        realms.insert("pve".into(), vec!["local".into()]);

        Self {
            listen: "0.0.0.0:8081".into(),
            fabric: FabricConfig::default(),
            resources: ResourceCatalog::standard(),
            realms,
            sessions: vec!["fabric".into()],
            backends,
            sync: SyncConfig::default(),
            jobs: JobsConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from file
    pub fn load(path: &str) -> GateResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| GateError::Config(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> GateResult<()> {
        self.sync
            .validate()
            .map_err(|e| GateError::Config(format!("sync: {}", e)))
    }
}

/// Identity backend definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Sessions against the compute fabric
    Fabric,
    /// JSON document directory
    Local {
        /// Document path
        path: String,
    },
    /// Remote directory service
    Remote {
        /// Service base URL
        url: String,
    },
}

/// Job polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Delay between status polls
    pub poll_interval_ms: u64,
    /// Stop waiting and answer 202 after this long; unset waits forever
    pub max_wait_secs: Option<u64>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_wait_secs: None,
        }
    }
}

/// Admission control settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Run each tenant's mutations one at a time
    pub serialize_per_tenant: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: GatewayConfig = serde_json::from_value(json!({
            "fabric": { "url": "https://pve1:8006" },
            "backends": {
                "fabric": { "type": "fabric" },
                "ldap": { "type": "remote", "url": "http://ldap-gw:8082" }
            },
            "realms": { "corp": ["ldap"] },
            "jobs": { "max_wait_secs": 120 }
        }))
        .unwrap();

        assert_eq!(config.fabric.url, "https://pve1:8006");
        assert_eq!(config.fabric.timeout_secs, 30);
        assert_eq!(config.sessions, vec!["fabric".to_string()]);
        assert_eq!(
            config.backends["ldap"],
            BackendConfig::Remote { url: "http://ldap-gw:8082".into() }
        );
        assert_eq!(config.jobs.poll_interval_ms, 500);
        assert_eq!(config.jobs.max_wait_secs, Some(120));
        assert!(!config.admission.serialize_per_tenant);
        assert!(config.resources.get("cores").is_some());
    }

    #[test]
    fn test_zero_rate_bound_rejected() {
        let path = std::env::temp_dir().join(format!("fabricgate-sync-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "sync": { "min_rate_secs": 0 } }"#).unwrap();

        let result = GatewayConfig::load(path.to_str().unwrap());
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            GatewayConfig::load("/nonexistent/fabricgate.json"),
            Err(GateError::Io(_))
        ));
    }
}
