//! Cookie sessions

use crate::error::ApiError;
use crate::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use gate_common::credentials::USERNAME_COOKIE;
use gate_common::{AuthToken, Credentials, GateError, TokenSet, UserId};
use std::collections::BTreeMap;

/// Cookies from a request, by name
pub fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// `Set-Cookie` value for an issued token
pub fn set_cookie(token: &AuthToken) -> String {
    format!(
        "{}={}; Path=/; Secure; SameSite=Strict; Expires={}",
        token.name,
        token.value,
        token.expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}

/// `Set-Cookie` value that removes a cookie
pub fn expire_cookie(name: &str) -> String {
    format!("{}=; Path=/; Secure; SameSite=Strict; Max-Age=0", name)
}

/// Caller session reconstructed from cookies
#[derive(Debug, Clone)]
pub struct Session {
    /// Tenant identity
    pub user: UserId,
    /// Fabric credentials
    pub credentials: Credentials,
    /// Every cookie presented, for backends that keep their own tickets
    pub tokens: TokenSet,
}

impl Session {
    /// Parse without validating against the fabric
    ///
    /// The tenant is the owner embedded in the fabric ticket; a `username`
    /// cookie naming anyone else is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, GateError> {
        let tokens: TokenSet = parse_cookies(headers)
            .into_iter()
            .map(|(name, value)| AuthToken::new(name, value, chrono::Duration::zero()))
            .collect();

        let claimed = tokens
            .iter()
            .find(|t| t.name == USERNAME_COOKIE)
            .and_then(|t| t.value.parse::<UserId>().ok())
            .ok_or(GateError::Unauthenticated)?;
        let credentials = Credentials::from_tokens(&tokens).ok_or(GateError::Unauthenticated)?;
        let user = credentials
            .principal()
            .and_then(|owner| owner.parse::<UserId>().ok())
            .ok_or(GateError::Unauthenticated)?;
        if user != claimed {
            tracing::warn!(ticket_owner = %user, claimed = %claimed, "username cookie does not match ticket");
            return Err(GateError::Unauthenticated);
        }

        Ok(Self {
            user,
            credentials,
            tokens,
        })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session = Session::from_headers(&parts.headers)?;
        if !state.identity.check_session(&session.credentials).await {
            tracing::debug!(tenant = %session.user, "session rejected by fabric");
            return Err(GateError::Unauthenticated.into());
        }
        Ok(session)
    }
}
