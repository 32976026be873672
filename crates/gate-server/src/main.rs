//! fabricgate - governance gateway for a virtualization cluster
//!
//! Authenticates tenants, enforces per-tenant quotas before mutations reach
//! the cluster, and pushes change notifications to connected clients.

use axum::{
    routing::{get, post},
    Router,
};
use gate_accounting::{AccountingEngine, AdmissionLocks};
use gate_common::{GateError, GateResult};
use gate_fabric::{FabricClient, JobWatcher};
use gate_identity::{
    Backend, FabricSessionBackend, IdentityAggregator, JsonFileStore, LocalDirectoryBackend, RemoteDirectoryBackend,
};
use gate_sync::{SyncHandle, SyncHub};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod config;
mod error;
mod handlers;
mod ws;

#[cfg(test)]
mod testing;

use config::{BackendConfig, GatewayConfig};
use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub fabric: Arc<FabricClient>,
    pub identity: Arc<IdentityAggregator>,
    pub accounting: Arc<AccountingEngine>,
    pub jobs: Arc<JobWatcher>,
    pub admission: Arc<AdmissionLocks>,
    pub sync: SyncHandle,
}

impl AppState {
    /// Wire every component from configuration; spawns the sync hub
    pub fn build(config: &GatewayConfig) -> GateResult<Self> {
        let fabric = FabricClient::new(config.fabric.clone()).map_err(|e| GateError::Config(e.to_string()))?;
        let fabric = Arc::new(fabric);

        let backends = config
            .backends
            .iter()
            .map(|(name, backend)| -> GateResult<Arc<dyn Backend>> {
                let backend: Arc<dyn Backend> = match backend {
                    BackendConfig::Fabric => Arc::new(FabricSessionBackend::new(name.as_str(), fabric.clone())),
                    BackendConfig::Local { path } => Arc::new(LocalDirectoryBackend::new(
                        name.as_str(),
                        Arc::new(JsonFileStore::new(path)),
                    )),
                    BackendConfig::Remote { url } => Arc::new(
                        RemoteDirectoryBackend::new(name.as_str(), url)
                            .map_err(|e| GateError::Config(e.to_string()))?,
                    ),
                };
                Ok(backend)
            })
            .collect::<GateResult<Vec<_>>>()?;

        Self::assemble(config, fabric, backends)
    }

    fn assemble(config: &GatewayConfig, fabric: Arc<FabricClient>, backends: Vec<Arc<dyn Backend>>) -> GateResult<Self> {
        config.validate()?;
        let identity = IdentityAggregator::new(
            backends,
            config.realms.clone(),
            config.sessions.clone(),
            fabric.clone(),
        )?;
        let accounting = AccountingEngine::new(fabric.clone(), Arc::new(config.resources.clone()));
        let jobs = JobWatcher::new(fabric.clone(), Duration::from_millis(config.jobs.poll_interval_ms))
            .with_max_wait(config.jobs.max_wait_secs.map(Duration::from_secs));
        let sync = SyncHub::spawn(&config.sync, fabric.clone());

        Ok(Self {
            fabric,
            identity: Arc::new(identity),
            accounting: Arc::new(accounting),
            jobs: Arc::new(jobs),
            admission: Arc::new(AdmissionLocks::new(config.admission.serialize_per_tenant)),
            sync,
        })
    }
}

/// HTTP surface
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))

        // Access
        .route("/api/access/ticket", post(login).delete(logout))

        // User
        .route("/api/user/config", get(user_config))
        .route("/api/user/resources", get(user_resources))

        // Instances
        .route("/api/cluster/:node/:type/:vmid/create", post(create_instance))
        .route("/api/cluster/:node/:type/:vmid/resources", post(set_resources))
        .route("/api/cluster/:node/:type/:vmid/disk/:disk/resize", post(resize_disk))
        .route("/api/cluster/:node/:type/:vmid/net/:netid", post(set_network))
        .route("/api/cluster/:node/:type/:vmid/pci/:hostpci", post(attach_pci))
        .route("/api/cluster/:node/:type/:vmid/status/:action", post(power))

        // Sync
        .route("/api/sync/hash", get(sync_hash))
        .route("/api/sync/interrupt", get(ws::interrupt))

        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("fabricgate v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/fabricgate/config.json".into());

    let config = GatewayConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Config not loaded, using defaults");
        GatewayConfig::default()
    });

    let state = AppState::build(&config)?;
    let app = router(state);

    tracing::info!("fabricgate listening on {}", config.listen);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
