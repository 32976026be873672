//! API Handlers
//!
//! Every mutating endpoint follows the same path: resolve the tenant's
//! quota, check the target is in scope, turn the request into a resource
//! delta, approve it against fresh usage, submit to the fabric, and follow
//! the job to completion.

use crate::auth::{expire_cookie, set_cookie, Session};
use crate::error::{completion_response, ApiResult};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gate_accounting::model::{NETWORK_RESOURCE, PCI_RESOURCE};
use gate_accounting::usage::{disk_volume, network_rate, parse_options, split_indexed};
use gate_accounting::{Quantity, QuotaRecord, ResourceDelta};
use gate_common::credentials::USERNAME_COOKIE;
use gate_common::{AuthToken, GateError, GateResult, UserId};
use gate_fabric::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Power actions a tenant may request
const POWER_ACTIONS: &[&str] = &["start", "stop", "shutdown", "reboot", "reset", "suspend", "resume"];

// =============================================================================
// Health
// =============================================================================

pub async fn health() -> &'static str {
    "OK"
}

// =============================================================================
// Access
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<Response> {
    let user: UserId = req.username.parse().map_err(|_| GateError::Unauthenticated)?;
    let mut tokens = state.identity.open_session(&user, &req.password).await?;

    if !tokens.iter().any(|t| t.name == USERNAME_COOKIE) {
        let ttl = tokens
            .iter()
            .map(|t| t.expires_at - chrono::Utc::now())
            .min()
            .unwrap_or_else(|| chrono::Duration::hours(2));
        tokens.push(AuthToken::new(USERNAME_COOKIE, user.to_string(), ttl));
    }

    let mut headers = HeaderMap::new();
    for token in &tokens {
        if let Ok(value) = HeaderValue::from_str(&set_cookie(token)) {
            headers.append(SET_COOKIE, value);
        }
    }
    Ok((headers, Json(json!({ "username": user.to_string() }))).into_response())
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let session = Session::from_headers(&headers)?;
    state.identity.close_session(&session.user, &session.tokens).await?;

    let mut response_headers = HeaderMap::new();
    for token in &session.tokens {
        if let Ok(value) = HeaderValue::from_str(&expire_cookie(&token.name)) {
            response_headers.append(SET_COOKIE, value);
        }
    }
    Ok((response_headers, Json(json!({}))).into_response())
}

// =============================================================================
// User
// =============================================================================

pub async fn user_config(State(state): State<AppState>, session: Session) -> ApiResult<Json<Value>> {
    let quota = state.identity.quota(&session.user, Some(&session.tokens)).await?;
    Ok(Json(json!({
        "user": session.user.to_string(),
        "quota": quota,
        "resources": state.accounting.catalog(),
    })))
}

pub async fn user_resources(State(state): State<AppState>, session: Session) -> ApiResult<Json<Value>> {
    let quota = state.identity.quota(&session.user, Some(&session.tokens)).await?;
    let report = state.accounting.report(&quota, &session.credentials).await?;
    Ok(Json(json!(report)))
}

// =============================================================================
// Instances
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ResourcesRequest {
    pub cores: Option<f64>,
    pub memory: Option<f64>,
    pub swap: Option<f64>,
}

pub async fn set_resources(
    State(state): State<AppState>,
    session: Session,
    Path((node, kind, vmid)): Path<(String, String, u32)>,
    Json(req): Json<ResourcesRequest>,
) -> ApiResult<Response> {
    let quota = tenant_scope(&state, &session, &node, &kind, vmid).await?;
    if req.swap.is_some() && kind != "lxc" {
        return Err(GateError::InvalidTarget("swap applies to containers only".into()).into());
    }
    let config = instance_config(&state, &session, &node, &kind, vmid).await?;

    let mut delta = ResourceDelta::new();
    let mut body = Map::new();
    for (key, requested) in [("cores", req.cores), ("memory", req.memory), ("swap", req.swap)] {
        let Some(requested) = requested else { continue };
        let current = config.get(key).and_then(as_number).unwrap_or(0.0);
        delta.insert(key.to_string(), Quantity::Amount(requested - current));
        body.insert(key.to_string(), json!(requested));
    }

    let path = format!("/nodes/{}/{}/{}/config", node, kind, vmid);
    admit_and_submit(&state, &session, &quota, delta, &path, config_method(&kind), Value::Object(body)).await
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub size_gb: f64,
}

pub async fn resize_disk(
    State(state): State<AppState>,
    session: Session,
    Path((node, kind, vmid, disk)): Path<(String, String, u32, String)>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<Response> {
    let quota = tenant_scope(&state, &session, &node, &kind, vmid).await?;
    if !req.size_gb.is_finite() || req.size_gb <= 0.0 {
        return Err(GateError::InvalidTarget("size must be a positive number".into()).into());
    }
    let config = instance_config(&state, &session, &node, &kind, vmid).await?;

    let value = config
        .get(&disk)
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::InvalidTarget(format!("disk {} does not exist", disk)))?;
    let prefix = split_indexed(&disk).map(|(prefix, _)| prefix).unwrap_or(disk.as_str());
    let (storage, _) = disk_volume(value)
        .ok_or_else(|| GateError::InvalidTarget(format!("{} is not a resizable disk", disk)))?;
    let resource = state
        .accounting
        .catalog()
        .storage_for(prefix, storage)
        .ok_or_else(|| GateError::InvalidTarget(format!("storage {} is not available", storage)))?;

    let mut delta = ResourceDelta::new();
    delta.insert(resource.to_string(), Quantity::Amount(req.size_gb * GIB));

    let path = format!("/nodes/{}/{}/{}/resize", node, kind, vmid);
    let body = json!({ "disk": disk, "size": format!("+{}G", req.size_gb) });
    admit_and_submit(&state, &session, &quota, delta, &path, Method::PUT, body).await
}

#[derive(Debug, Deserialize)]
pub struct NetworkRequest {
    pub rate: f64,
}

pub async fn set_network(
    State(state): State<AppState>,
    session: Session,
    Path((node, kind, vmid, netid)): Path<(String, String, u32, String)>,
    Json(req): Json<NetworkRequest>,
) -> ApiResult<Response> {
    let quota = tenant_scope(&state, &session, &node, &kind, vmid).await?;
    if !netid.starts_with("net") || split_indexed(&netid).is_none() {
        return Err(GateError::InvalidTarget(format!("{} is not a network interface", netid)).into());
    }
    let config = instance_config(&state, &session, &node, &kind, vmid).await?;

    let value = config
        .get(&netid)
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::InvalidTarget(format!("interface {} does not exist", netid)))?;
    let current = network_rate(value).unwrap_or(0.0);

    let mut delta = ResourceDelta::new();
    delta.insert(NETWORK_RESOURCE.to_string(), Quantity::Amount(req.rate - current));

    let path = format!("/nodes/{}/{}/{}/config", node, kind, vmid);
    let body = json!({ &netid: with_option(value, "rate", &req.rate.to_string()) });
    admit_and_submit(&state, &session, &quota, delta, &path, config_method(&kind), body).await
}

#[derive(Debug, Deserialize)]
pub struct PciRequest {
    pub device: String,
    #[serde(default)]
    pub pcie: bool,
}

pub async fn attach_pci(
    State(state): State<AppState>,
    session: Session,
    Path((node, kind, vmid, hostpci)): Path<(String, String, u32, String)>,
    Json(req): Json<PciRequest>,
) -> ApiResult<Response> {
    let quota = tenant_scope(&state, &session, &node, &kind, vmid).await?;
    if kind != "qemu" {
        return Err(GateError::InvalidTarget("device passthrough requires a virtual machine".into()).into());
    }
    if !hostpci.starts_with("hostpci") || split_indexed(&hostpci).is_none() {
        return Err(GateError::InvalidTarget(format!("{} is not a passthrough slot", hostpci)).into());
    }
    let config = instance_config(&state, &session, &node, &kind, vmid).await?;
    if config.contains_key(&hostpci) {
        return Err(GateError::InvalidTarget(format!("{} is already in use", hostpci)).into());
    }

    let device = state
        .fabric
        .pci_device(&node, &req.device)
        .await
        .ok_or_else(|| GateError::InvalidTarget(format!("device {} does not exist", req.device)))?;
    let name = device["device_name"].as_str().unwrap_or(req.device.as_str()).to_string();

    let mut delta = ResourceDelta::new();
    delta.insert(PCI_RESOURCE.to_string(), Quantity::Set(vec![name]));

    let mut value = req.device.clone();
    if req.pcie {
        value.push_str(",pcie=1");
    }
    let path = format!("/nodes/{}/{}/{}/config", node, kind, vmid);
    admit_and_submit(&state, &session, &quota, delta, &path, Method::POST, json!({ &hostpci: value })).await
}

pub async fn power(
    State(state): State<AppState>,
    session: Session,
    Path((node, kind, vmid, action)): Path<(String, String, u32, String)>,
) -> ApiResult<Response> {
    let quota = tenant_scope(&state, &session, &node, &kind, vmid).await?;
    if !POWER_ACTIONS.contains(&action.as_str()) {
        return Err(GateError::InvalidTarget(format!("unknown action {}", action)).into());
    }

    let path = format!("/nodes/{}/{}/{}/status/{}", node, kind, vmid, action);
    admit_and_submit(&state, &session, &quota, ResourceDelta::new(), &path, Method::POST, json!({})).await
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub cores: f64,
    pub memory: f64,
    #[serde(default)]
    pub swap: Option<f64>,
}

pub async fn create_instance(
    State(state): State<AppState>,
    session: Session,
    Path((node, kind, vmid)): Path<(String, String, u32)>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<Response> {
    let quota = tenant_scope(&state, &session, &node, &kind, vmid).await?;
    let template = quota
        .template(&kind)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut delta = template_disks(&state, &template);
    delta.insert("cores".into(), Quantity::Amount(req.cores));
    delta.insert("memory".into(), Quantity::Amount(req.memory));

    let mut body = template;
    body.insert("vmid".into(), json!(vmid));
    body.insert("cores".into(), json!(req.cores));
    body.insert("memory".into(), json!(req.memory));
    if let Some(pool) = &quota.pool {
        body.insert("pool".into(), json!(pool));
    }
    if kind == "lxc" {
        let swap = req.swap.unwrap_or(0.0);
        delta.insert("swap".into(), Quantity::Amount(swap));
        body.insert("swap".into(), json!(swap));
        body.insert("hostname".into(), json!(req.name));
    } else {
        body.insert("name".into(), json!(req.name));
    }

    let path = format!("/nodes/{}/{}", node, kind);
    admit_and_submit(&state, &session, &quota, delta, &path, Method::POST, Value::Object(body)).await
}

// =============================================================================
// Sync
// =============================================================================

pub async fn sync_hash(State(state): State<AppState>, session: Session) -> ApiResult<Json<Value>> {
    let listing = state
        .fabric
        .cluster_resources(&session.credentials, None)
        .await
        .into_result()?;
    let items = listing.as_array().map(Vec::as_slice).unwrap_or_default();
    let hash = gate_sync::state_hash(&gate_sync::filter_listing(items));
    Ok(Json(json!({ "hash": hash })))
}

// =============================================================================
// Helpers
// =============================================================================

/// Quota of the caller, after checking the target is within it
async fn tenant_scope(
    state: &AppState,
    session: &Session,
    node: &str,
    kind: &str,
    vmid: u32,
) -> GateResult<QuotaRecord> {
    if kind != "qemu" && kind != "lxc" {
        return Err(GateError::InvalidTarget(format!("unknown instance type {}", kind)));
    }
    let quota = state.identity.quota(&session.user, Some(&session.tokens)).await?;
    if !quota.allows_node(node) {
        return Err(GateError::InvalidTarget(format!("node {} is not available", node)));
    }
    if !quota.allows_vmid(vmid) {
        return Err(GateError::InvalidTarget(format!("instance id {} is out of range", vmid)));
    }
    Ok(quota)
}

async fn instance_config(
    state: &AppState,
    session: &Session,
    node: &str,
    kind: &str,
    vmid: u32,
) -> GateResult<Map<String, Value>> {
    match state
        .fabric
        .instance_config(node, kind, vmid, &session.credentials)
        .await
        .into_result()?
    {
        Value::Object(config) => Ok(config),
        _ => Err(GateError::InvalidTarget(format!("{}/{} has no configuration", kind, vmid))),
    }
}

/// Approve, submit and follow the mutation to completion
async fn admit_and_submit(
    state: &AppState,
    session: &Session,
    quota: &QuotaRecord,
    delta: ResourceDelta,
    path: &str,
    method: Method,
    body: Value,
) -> ApiResult<Response> {
    let tenant = session.user.to_string();
    let _guard = state.admission.acquire(&tenant).await;

    if !delta.is_empty() {
        state.accounting.approve(quota, &session.credentials, &delta).await?;
    }

    tracing::info!(%tenant, %path, "submitting mutation");
    let submission = state
        .fabric
        .request(path, method, &session.credentials, Some(&body))
        .await;
    let completion = state.jobs.resolve(submission, &session.credentials).await;

    if completion.is_success() {
        // push the change to connected clients without waiting for a tick
        let _ = state.sync.poke();
    }
    Ok(completion_response(completion))
}

/// Disk sizes a creation template allocates, per storage resource
fn template_disks(state: &AppState, template: &Map<String, Value>) -> ResourceDelta {
    let catalog = state.accounting.catalog();
    let mut delta = ResourceDelta::new();
    for (key, value) in template {
        let prefix = split_indexed(key).map(|(prefix, _)| prefix).unwrap_or(key.as_str());
        let Some(value) = value.as_str() else { continue };
        if !catalog.claims_disk_prefix(prefix) {
            continue;
        }
        // new volumes are written `storage:<size in GiB>`
        let (head, _) = parse_options(value);
        let Some((storage, size)) = head.split_once(':') else { continue };
        let (Some(resource), Ok(size)) = (catalog.storage_for(prefix, storage), size.parse::<f64>()) else {
            continue;
        };
        let total = delta
            .get(resource)
            .and_then(Quantity::as_amount)
            .unwrap_or(0.0);
        delta.insert(resource.to_string(), Quantity::Amount(total + size * GIB));
    }
    delta
}

/// Virtual machine config writes run as jobs; container writes are synchronous
fn config_method(kind: &str) -> Method {
    if kind == "lxc" {
        Method::PUT
    } else {
        Method::POST
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str()?.parse().ok())
}

/// Replace or append one `key=value` option of a config value
fn with_option(value: &str, key: &str, option: &str) -> String {
    let prefix = format!("{}=", key);
    let mut parts: Vec<String> = value
        .split(',')
        .filter(|part| !part.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    parts.push(format!("{}{}", prefix, option));
    parts.join(",")
}
