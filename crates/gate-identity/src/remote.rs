//! Remote directory service backend
//!
//! Talks to a directory service over HTTP:
//!
//! | call | endpoint |
//! |------|----------|
//! | open session | `POST /ticket` |
//! | close session | `DELETE /ticket` |
//! | get user | `GET /users/{id}` |
//! | add user | `PUT /users/{id}` |
//! | modify user | `POST /users/{id}` |
//! | delete user | `DELETE /users/{id}` |
//!
//! The service has no local notion of groups.

use crate::backend::{
    Attributes, Backend, Capabilities, DirectoryBackend, OpResult, PendingChange, SessionBackend, SessionResult,
};
use async_trait::async_trait;
use gate_common::{AuthToken, TokenSet, UserId};
use reqwest::header::COOKIE;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Cookie carrying the directory session ticket
pub const DIRECTORY_TICKET_COOKIE: &str = "DirectoryAuthTicket";

/// Attributes the directory service stores
const DIRECTORY_ATTRIBUTES: &[&str] = &["cn", "sn", "mail", "userpassword"];

const TICKET_TTL_HOURS: i64 = 2;

/// Remote directory backend
pub struct RemoteDirectoryBackend {
    name: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: String,
}

impl RemoteDirectoryBackend {
    /// Create backend for the service at `base_url`
    pub fn new(name: impl Into<String>, base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn ticket<'a>(&self, tokens: Option<&'a TokenSet>) -> Option<&'a str> {
        tokens?
            .iter()
            .find(|t| t.name == DIRECTORY_TICKET_COOKIE)
            .map(|t| t.value.as_str())
    }

    async fn call(&self, method: Method, path: &str, tokens: Option<&TokenSet>, body: Option<&Value>) -> OpResult {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, &url);
        if let Some(ticket) = self.ticket(tokens) {
            builder = builder.header(COOKIE, format!("{}={}", DIRECTORY_TICKET_COOKIE, ticket));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => OpResult::success(),
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                OpResult::failure(status, text)
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, %url, error = %e, "directory request failed");
                OpResult::failure(500, e.to_string())
            }
        }
    }

    fn user_path(user: &UserId) -> String {
        format!("/users/{}", user.id)
    }
}

impl Backend for RemoteDirectoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            session: true,
            users: true,
            groups: false,
        }
    }

    fn session(&self) -> Option<&dyn SessionBackend> {
        Some(self)
    }

    fn directory(&self) -> Option<&dyn DirectoryBackend> {
        Some(self)
    }
}

#[async_trait]
impl SessionBackend for RemoteDirectoryBackend {
    async fn open_session(&self, user: &UserId, secret: &str) -> SessionResult {
        let url = format!("{}/ticket", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "username": user.id, "password": secret }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return SessionResult::failure(500, e.to_string()),
        };
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return SessionResult::failure(status, text);
        }

        match response.json::<TicketResponse>().await {
            Ok(body) => SessionResult::opened(vec![AuthToken::new(
                DIRECTORY_TICKET_COOKIE,
                body.ticket,
                chrono::Duration::hours(TICKET_TTL_HOURS),
            )]),
            Err(e) => SessionResult::failure(500, e.to_string()),
        }
    }

    async fn close_session(&self, tokens: &TokenSet) -> OpResult {
        if self.ticket(Some(tokens)).is_none() {
            return OpResult::success();
        }
        self.call(Method::DELETE, "/ticket", Some(tokens), None).await
    }
}

#[async_trait]
impl DirectoryBackend for RemoteDirectoryBackend {
    async fn get_user(&self, user: &UserId, tokens: Option<&TokenSet>) -> Option<Attributes> {
        let url = format!("{}{}", self.base_url, Self::user_path(user));
        let mut builder = self.client.get(&url);
        if let Some(ticket) = self.ticket(tokens) {
            builder = builder.header(COOKIE, format!("{}={}", DIRECTORY_TICKET_COOKIE, ticket));
        }

        let response = builder.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        match response.json::<Value>().await.ok()? {
            Value::Object(attrs) => Some(attrs),
            _ => None,
        }
    }

    async fn prepare_user_change(
        &self,
        user: &UserId,
        attrs: &Attributes,
        tokens: Option<&TokenSet>,
    ) -> PendingChange {
        let payload: Attributes = attrs
            .iter()
            .filter(|(key, _)| DIRECTORY_ATTRIBUTES.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if payload.is_empty() {
            return PendingChange::skip();
        }

        // only fetch current values when there is something to write
        let current = self.get_user(user, tokens).await.unwrap_or_default();
        let rollback = payload
            .keys()
            .filter(|key| key.as_str() != "userpassword")
            .filter_map(|key| current.get(key).map(|value| (key.clone(), value.clone())))
            .collect();
        PendingChange::apply(payload, rollback)
    }

    async fn commit_user_change(&self, user: &UserId, change: PendingChange, tokens: Option<&TokenSet>) -> OpResult {
        let body = Value::Object(change.payload);
        self.call(Method::POST, &Self::user_path(user), tokens, Some(&body)).await
    }

    async fn add_user(&self, user: &UserId, attrs: &Attributes, tokens: Option<&TokenSet>) -> OpResult {
        let body: Attributes = attrs
            .iter()
            .filter(|(key, _)| DIRECTORY_ATTRIBUTES.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.call(Method::PUT, &Self::user_path(user), tokens, Some(&Value::Object(body)))
            .await
    }

    async fn del_user(&self, user: &UserId, tokens: Option<&TokenSet>) -> OpResult {
        self.call(Method::DELETE, &Self::user_path(user), tokens, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tokens() -> TokenSet {
        vec![AuthToken::new(DIRECTORY_TICKET_COOKIE, "dt", chrono::Duration::hours(1))]
    }

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_open_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ticket"))
            .and(body_json(json!({ "username": "alice", "password": "pw" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ticket": "dt" })))
            .mount(&server)
            .await;

        let backend = RemoteDirectoryBackend::new("ldap", &server.uri()).unwrap();
        let result = backend.open_session(&UserId::new("alice", "ldap"), "pw").await;
        assert!(result.ok);
        assert_eq!(result.tokens[0].name, DIRECTORY_TICKET_COOKIE);
        assert_eq!(result.tokens[0].value, "dt");
    }

    #[tokio::test]
    async fn test_get_user_with_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/alice"))
            .and(header("cookie", "DirectoryAuthTicket=dt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "mail": "a@x", "cn": "Alice" })))
            .mount(&server)
            .await;

        let backend = RemoteDirectoryBackend::new("ldap", &server.uri()).unwrap();
        let alice = UserId::new("alice", "ldap");
        let user = backend.get_user(&alice, Some(&tokens())).await.unwrap();
        assert_eq!(user["mail"], "a@x");
        assert!(backend.get_user(&UserId::new("ghost", "ldap"), Some(&tokens())).await.is_none());
    }

    #[tokio::test]
    async fn test_irrelevant_change_skipped_without_round_trip() {
        let server = MockServer::start().await;
        let backend = RemoteDirectoryBackend::new("ldap", &server.uri()).unwrap();
        let alice = UserId::new("alice", "ldap");

        let change = backend
            .prepare_user_change(&alice, &attrs(json!({ "quota": { "max": {} } })), Some(&tokens()))
            .await;
        assert!(!change.approved);

        let result = backend.set_user(&alice, &attrs(json!({ "quota": {} })), Some(&tokens())).await;
        assert!(result.ok);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_user_posts_relevant_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "mail": "old@x" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users/alice"))
            .and(body_json(json!({ "mail": "new@x" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = RemoteDirectoryBackend::new("ldap", &server.uri()).unwrap();
        let alice = UserId::new("alice", "ldap");
        let new_attrs = attrs(json!({ "mail": "new@x", "quota": {} }));

        let change = backend.prepare_user_change(&alice, &new_attrs, Some(&tokens())).await;
        assert_eq!(change.rollback["mail"], "old@x");

        let result = backend.commit_user_change(&alice, change, Some(&tokens())).await;
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_failure_reported() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/users/alice"))
            .respond_with(ResponseTemplate::new(403).set_body_string("insufficient access"))
            .mount(&server)
            .await;

        let backend = RemoteDirectoryBackend::new("ldap", &server.uri()).unwrap();
        let result = backend.del_user(&UserId::new("alice", "ldap"), Some(&tokens())).await;
        assert!(!result.ok);
        assert_eq!(result.status, 403);
        assert_eq!(result.message.as_deref(), Some("insufficient access"));
        assert!(!backend.capabilities().groups);
    }
}
