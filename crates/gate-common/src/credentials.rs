//! Credentials and credential token sets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cookie carrying the fabric session ticket
pub const TICKET_COOKIE: &str = "PVEAuthCookie";
/// Cookie carrying the fabric CSRF prevention token
pub const CSRF_COOKIE: &str = "CSRFPreventionToken";
/// Cookie carrying the tenant identity
pub const USERNAME_COOKIE: &str = "username";

/// Credentials presented to the compute fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Tenant session cookie pair
    Cookies {
        /// Session ticket
        ticket: String,
        /// CSRF prevention token, required on mutating calls
        csrf: String,
    },
    /// Long-lived service token
    Token {
        /// Token id (`user@realm!name`)
        id: String,
        /// Token secret
        secret: String,
    },
    /// Elevated root credentials, fetched on demand by the client
    Root,
}

impl Credentials {
    /// Cookie credentials from a token set, if it carries a fabric ticket
    pub fn from_tokens(tokens: &[AuthToken]) -> Option<Self> {
        let find = |name: &str| {
            tokens
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.value.clone())
        };
        Some(Credentials::Cookies {
            ticket: find(TICKET_COOKIE)?,
            csrf: find(CSRF_COOKIE).unwrap_or_default(),
        })
    }

    /// Identity the fabric issued these credentials to
    ///
    /// Tickets are signed `PVE:<user@realm>:<timestamp>::<signature>`, so the
    /// embedded owner is authoritative once the fabric accepts the ticket.
    /// Token ids are `<user@realm>!<name>`.
    pub fn principal(&self) -> Option<String> {
        match self {
            Credentials::Cookies { ticket, .. } => {
                // browsers may hand the cookie back percent-encoded
                let ticket = ticket.replace("%3A", ":").replace("%40", "@");
                let mut fields = ticket.split(':');
                match (fields.next(), fields.next()) {
                    (Some("PVE"), Some(owner)) if !owner.is_empty() => Some(owner.to_string()),
                    _ => None,
                }
            }
            Credentials::Token { id, .. } => id.split_once('!').map(|(owner, _)| owner.to_string()),
            Credentials::Root => None,
        }
    }
}

/// One `{name, value, expiresAt}` token returned by a session backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Create token expiring after `ttl`
    pub fn new(name: impl Into<String>, value: impl Into<String>, ttl: chrono::Duration) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Whether the token has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Credential token set
pub type TokenSet = Vec<AuthToken>;
