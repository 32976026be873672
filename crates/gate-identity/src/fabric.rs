//! Compute fabric session backend

use crate::backend::{Backend, Capabilities, OpResult, SessionBackend, SessionResult};
use async_trait::async_trait;
use gate_common::credentials::{CSRF_COOKIE, TICKET_COOKIE, USERNAME_COOKIE};
use gate_common::{AuthToken, GateError, TokenSet, UserId};
use gate_fabric::FabricClient;
use std::sync::Arc;

/// Fabric tickets live for two hours
const TICKET_TTL_HOURS: i64 = 2;

/// Session backend that logs tenants into the compute fabric
pub struct FabricSessionBackend {
    name: String,
    fabric: Arc<FabricClient>,
}

impl FabricSessionBackend {
    /// Create backend
    pub fn new(name: impl Into<String>, fabric: Arc<FabricClient>) -> Self {
        Self {
            name: name.into(),
            fabric,
        }
    }
}

impl Backend for FabricSessionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            session: true,
            users: false,
            groups: false,
        }
    }

    fn session(&self) -> Option<&dyn SessionBackend> {
        Some(self)
    }
}

#[async_trait]
impl SessionBackend for FabricSessionBackend {
    async fn open_session(&self, user: &UserId, secret: &str) -> SessionResult {
        match self.fabric.login(&user.to_string(), secret).await {
            Ok(ticket) => {
                let ttl = chrono::Duration::hours(TICKET_TTL_HOURS);
                SessionResult::opened(vec![
                    AuthToken::new(TICKET_COOKIE, ticket.ticket, ttl),
                    AuthToken::new(CSRF_COOKIE, ticket.csrf, ttl),
                    AuthToken::new(USERNAME_COOKIE, ticket.username, ttl),
                ])
            }
            Err(GateError::Unauthenticated) => SessionResult::failure(401, "invalid credentials"),
            Err(e) => SessionResult::failure(e.status_code(), e.to_string()),
        }
    }

    async fn close_session(&self, _tokens: &TokenSet) -> OpResult {
        // fabric tickets cannot be revoked; the caller drops the cookies
        OpResult::success()
    }
}
