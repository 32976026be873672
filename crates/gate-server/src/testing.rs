//! Shared gateway fixture for handler and socket tests

use crate::config::GatewayConfig;
use crate::AppState;
use gate_fabric::{FabricClient, FabricConfig, ServiceToken};
use gate_identity::{Attributes, Backend, FabricSessionBackend, IdentityDocument, LocalDirectoryBackend, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// alice's live session
pub const COOKIES: &str = "PVEAuthCookie=PVE:alice@pve:65000000::SIG; CSRFPreventionToken=C; username=alice@pve";

fn attrs(value: Value) -> Attributes {
    value.as_object().cloned().unwrap_or_default()
}

/// Gateway against a mock fabric; alice has 4 cores and 4 GiB on pve1, bob has far more
pub fn state(server: &MockServer) -> AppState {
    let mut config = GatewayConfig::default();
    config.fabric = FabricConfig {
        url: server.uri(),
        token: Some(ServiceToken {
            id: "root@pam!gate".into(),
            secret: "s".into(),
        }),
        ..FabricConfig::default()
    };
    config.jobs.poll_interval_ms = 10;

    let mut doc = IdentityDocument::default();
    doc.users.insert(
        "alice@pve".into(),
        attrs(json!({
            "name": "Alice",
            "quota": {
                "max": { "cores": 4, "memory": 4096 },
                "nodes": ["pve1"],
                "vmid": { "min": 100, "max": 199 },
                "pool": "alice"
            }
        })),
    );
    doc.users.insert(
        "bob@pve".into(),
        attrs(json!({ "quota": { "max": { "cores": 100, "memory": 65536 }, "nodes": ["pve1"] } })),
    );

    let fabric = Arc::new(FabricClient::new(config.fabric.clone()).unwrap());
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(FabricSessionBackend::new("fabric", fabric.clone())),
        Arc::new(LocalDirectoryBackend::new("local", Arc::new(MemoryStore::new(doc)))),
    ];
    AppState::assemble(&config, fabric, backends).unwrap()
}

/// Fabric accepts every presented ticket
pub async fn mount_session(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api2/json/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "version": "8.1" } })))
        .mount(server)
        .await;
}
