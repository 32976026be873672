//! Compute Fabric API Client
//!
//! HTTP client for the virtualization cluster control plane. Every call
//! returns a [`FabricResponse`]; transport failures are folded into the
//! response instead of surfacing as errors.

use crate::{FabricConfig, FabricError};
use gate_common::credentials::{CSRF_COOKIE, TICKET_COOKIE};
use gate_common::{Credentials, GateError, GateResult};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, COOKIE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// API prefix of the fabric control plane
const API_PREFIX: &str = "/api2/json";

/// Cached root tickets are refreshed well before their two hour lifetime ends
const ROOT_TICKET_REFRESH: Duration = Duration::from_secs(90 * 60);

/// Normalized fabric response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricResponse {
    /// Upstream HTTP status
    pub status: u16,
    /// Unwrapped `data` payload, or the error body for failures
    pub data: Value,
}

impl FabricResponse {
    /// Response synthesized by the gateway itself
    pub fn local_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            data: json!({ "error": message.into() }),
        }
    }

    /// Whether the upstream answered 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert into the payload, mapping failures to [`GateError::Upstream`]
    pub fn into_result(self) -> GateResult<Value> {
        if self.is_success() {
            Ok(self.data)
        } else if self.status == 401 {
            Err(GateError::Unauthenticated)
        } else {
            Err(GateError::Upstream {
                status: self.status,
                body: self.data,
            })
        }
    }
}

/// Session ticket returned by `POST /access/ticket`
#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    /// Session ticket
    pub ticket: String,
    /// CSRF prevention token
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf: String,
    /// Authenticated user name
    pub username: String,
}

struct CachedTicket {
    ticket: Ticket,
    issued: Instant,
}

/// Compute fabric client
pub struct FabricClient {
    client: reqwest::Client,
    base_url: String,
    config: FabricConfig,
    root_ticket: Mutex<Option<CachedTicket>>,
}

impl FabricClient {
    /// Create new fabric client
    pub fn new(config: FabricConfig) -> Result<Self, FabricError> {
        if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
            return Err(FabricError::ConfigError(format!("invalid fabric url {:?}", config.url)));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
            root_ticket: Mutex::new(None),
        })
    }

    /// Issue an authenticated request against the fabric
    pub async fn request(
        &self,
        path: &str,
        method: Method,
        credentials: &Credentials,
        body: Option<&Value>,
    ) -> FabricResponse {
        let credentials = match credentials {
            Credentials::Root => match self.elevated().await {
                Ok(creds) => creds,
                Err(response) => return response,
            },
            other => other.clone(),
        };

        let url = format!("{}{}{}", self.base_url, API_PREFIX, path);
        let mut builder = self.client.request(method.clone(), &url);

        match &credentials {
            Credentials::Cookies { ticket, csrf } => {
                builder = builder.header(COOKIE, format!("{}={}", TICKET_COOKIE, ticket));
                if method != Method::GET {
                    builder = builder.header(CSRF_COOKIE, csrf);
                }
            }
            Credentials::Token { id, secret } => {
                builder = builder.header(AUTHORIZATION, format!("PVEAPIToken={}={}", id, secret));
            }
            // resolved by elevated()
            Credentials::Root => {}
        }

        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%url, error = %e, "fabric request failed");
                return FabricResponse::local_error(500, e.to_string());
            }
        };

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        let data = if (200..300).contains(&status) {
            match parsed {
                Value::Object(mut map) if map.contains_key("data") => {
                    map.remove("data").unwrap_or(Value::Null)
                }
                other => other,
            }
        } else {
            match parsed {
                Value::Object(map) if !map.is_empty() => Value::Object(map),
                _ if !text.is_empty() => json!({ "error": text }),
                _ => json!({ "error": format!("upstream returned {}", status) }),
            }
        };

        FabricResponse { status, data }
    }

    /// Log in with a user name and password
    pub async fn login(&self, username: &str, password: &str) -> GateResult<Ticket> {
        let url = format!("{}{}/access/ticket", self.base_url, API_PREFIX);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| GateError::Upstream {
                status: 500,
                body: json!({ "error": e.to_string() }),
            })?;

        let status = response.status().as_u16();
        if status == 401 {
            return Err(GateError::Unauthenticated);
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GateError::Upstream {
                status,
                body: json!({ "error": text }),
            });
        }

        #[derive(Deserialize)]
        struct Envelope {
            data: Ticket,
        }
        let envelope: Envelope = response.json().await.map_err(|e| GateError::Upstream {
            status: 500,
            body: json!({ "error": e.to_string() }),
        })?;
        Ok(envelope.data)
    }

    /// Check whether credentials carry a live session
    pub async fn check_session(&self, credentials: &Credentials) -> bool {
        self.request("/version", Method::GET, credentials, None)
            .await
            .is_success()
    }

    // =========================================================================
    // Cluster reads
    // =========================================================================

    /// List cluster resources, optionally filtered by type (`vm`, `node`, ...)
    pub async fn cluster_resources(&self, credentials: &Credentials, kind: Option<&str>) -> FabricResponse {
        let path = match kind {
            Some(kind) => format!("/cluster/resources?type={}", kind),
            None => "/cluster/resources".to_string(),
        };
        self.request(&path, Method::GET, credentials, None).await
    }

    /// Fetch instance configuration
    pub async fn instance_config(
        &self,
        node: &str,
        kind: &str,
        vmid: u32,
        credentials: &Credentials,
    ) -> FabricResponse {
        let path = format!("/nodes/{}/{}/{}/config", node, kind, vmid);
        self.request(&path, Method::GET, credentials, None).await
    }

    /// Fetch storage volume metadata
    pub async fn volume(&self, node: &str, storage: &str, volid: &str) -> FabricResponse {
        let path = format!("/nodes/{}/storage/{}/content/{}", node, storage, volid);
        self.request(&path, Method::GET, &Credentials::Root, None).await
    }

    /// Fetch passthrough device metadata
    ///
    /// A device id without a function suffix matches the first function of
    /// that device.
    pub async fn pci_device(&self, node: &str, id: &str) -> Option<Value> {
        let path = format!("/nodes/{}/hardware/pci", node);
        let response = self.request(&path, Method::GET, &Credentials::Root, None).await;
        if !response.is_success() {
            return None;
        }
        response
            .data
            .as_array()?
            .iter()
            .find(|device| {
                device["id"]
                    .as_str()
                    .map(|device_id| device_id.starts_with(id))
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Fetch job status
    pub async fn task_status(&self, node: &str, upid: &str, credentials: &Credentials) -> FabricResponse {
        let path = format!("/nodes/{}/tasks/{}/status", node, upid);
        self.request(&path, Method::GET, credentials, None).await
    }

    /// Fetch job log
    pub async fn task_log(&self, node: &str, upid: &str, credentials: &Credentials) -> FabricResponse {
        let path = format!("/nodes/{}/tasks/{}/log", node, upid);
        self.request(&path, Method::GET, credentials, None).await
    }

    // =========================================================================
    // Elevated credentials
    // =========================================================================

    async fn elevated(&self) -> Result<Credentials, FabricResponse> {
        if let Some(token) = &self.config.token {
            return Ok(Credentials::Token {
                id: token.id.clone(),
                secret: token.secret.clone(),
            });
        }

        let root = match &self.config.root {
            Some(root) => root,
            None => return Err(FabricResponse::local_error(401, "no elevated credentials configured")),
        };

        if let Some(cached) = self.root_ticket.lock().as_ref() {
            if cached.issued.elapsed() < ROOT_TICKET_REFRESH {
                return Ok(Credentials::Cookies {
                    ticket: cached.ticket.ticket.clone(),
                    csrf: cached.ticket.csrf.clone(),
                });
            }
        }

        tracing::debug!(user = %root.username, "refreshing elevated fabric ticket");
        let ticket = self
            .login(&root.username, &root.password)
            .await
            .map_err(|e| FabricResponse::local_error(e.status_code(), e.to_string()))?;

        let creds = Credentials::Cookies {
            ticket: ticket.ticket.clone(),
            csrf: ticket.csrf.clone(),
        };
        *self.root_ticket.lock() = Some(CachedTicket {
            ticket,
            issued: Instant::now(),
        });
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RootLogin, ServiceToken};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> FabricConfig {
        FabricConfig {
            url: url.to_string(),
            ..FabricConfig::default()
        }
    }

    fn cookies() -> Credentials {
        Credentials::Cookies {
            ticket: "PVE:alice@pve:T".into(),
            csrf: "csrf-1".into(),
        }
    }

    #[tokio::test]
    async fn test_request_unwraps_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .and(header("cookie", "PVEAuthCookie=PVE:alice@pve:T"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "version": "8.1" } })))
            .mount(&server)
            .await;

        let client = FabricClient::new(config(&server.uri())).unwrap();
        let response = client.request("/version", Method::GET, &cookies(), None).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.data["version"], "8.1");
        assert!(client.check_session(&cookies()).await);
    }

    #[tokio::test]
    async fn test_mutation_sends_csrf() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api2/json/nodes/pve1/qemu/100/config"))
            .and(header("CSRFPreventionToken", "csrf-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": null })))
            .mount(&server)
            .await;

        let client = FabricClient::new(config(&server.uri())).unwrap();
        let response = client
            .request("/nodes/pve1/qemu/100/config", Method::PUT, &cookies(), Some(&json!({ "cores": 2 })))
            .await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_upstream_error_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = FabricClient::new(config(&server.uri())).unwrap();
        let response = client.request("/version", Method::GET, &cookies(), None).await;
        assert_eq!(response.status, 401);
        assert!(!client.check_session(&cookies()).await);
        assert!(matches!(response.into_result(), Err(GateError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_transport_error_is_response() {
        // nothing listens on port 9
        let client = FabricClient::new(config("http://127.0.0.1:9")).unwrap();
        let response = client.request("/version", Method::GET, &cookies(), None).await;
        assert_eq!(response.status, 500);
        assert!(response.data["error"].is_string());
    }

    #[tokio::test]
    async fn test_service_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/resources"))
            .and(query_param("type", "vm"))
            .and(header("authorization", "PVEAPIToken=gate@pve!sync=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.token = Some(ServiceToken {
            id: "gate@pve!sync".into(),
            secret: "s3cret".into(),
        });
        let client = FabricClient::new(cfg).unwrap();
        let response = client.cluster_resources(&Credentials::Root, Some("vm")).await;
        assert!(response.is_success());
        assert_eq!(response.data, json!([]));
    }

    #[tokio::test]
    async fn test_root_ticket_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "ticket": "PVE:root@pam:R", "CSRFPreventionToken": "rc", "username": "root@pam" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/hardware/pci"))
            .and(header("cookie", "PVEAuthCookie=PVE:root@pam:R"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "id": "0000:00:02.0", "device_name": "Integrated" },
                    { "id": "0000:01:00.0", "device_name": "GPU2 Ti" }
                ]
            })))
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.root = Some(RootLogin {
            username: "root@pam".into(),
            password: "pw".into(),
        });
        let client = FabricClient::new(cfg).unwrap();

        let device = client.pci_device("pve1", "0000:01:00").await.unwrap();
        assert_eq!(device["device_name"], "GPU2 Ti");
        assert!(client.pci_device("pve1", "0000:05:00").await.is_none());
    }

    #[tokio::test]
    async fn test_root_without_configuration() {
        let client = FabricClient::new(config("http://127.0.0.1:9")).unwrap();
        let response = client.volume("pve1", "local", "local:vm-100-disk-0").await;
        assert_eq!(response.status, 401);
    }
}
