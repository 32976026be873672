//! Backend capability contracts
//!
//! A backend declares which capabilities it implements and hands out the
//! matching trait object. Callers check the declared set before invoking,
//! so a backend never needs to stub out operations it does not model.

use async_trait::async_trait;
use gate_common::{TokenSet, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form identity attributes
pub type Attributes = Map<String, Value>;

/// Capabilities a backend implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Opens and closes credentialed sessions
    pub session: bool,
    /// Models users
    pub users: bool,
    /// Models groups
    pub groups: bool,
}

/// `{ok, status, message}` result of a backend operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    /// Whether the operation succeeded
    pub ok: bool,
    /// HTTP-style status
    pub status: u16,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OpResult {
    /// Successful result
    pub fn success() -> Self {
        Self {
            ok: true,
            status: 200,
            message: None,
        }
    }

    /// Failed result
    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            message: Some(message.into()),
        }
    }
}

/// Result of opening a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    /// Whether the session was opened
    pub ok: bool,
    /// HTTP-style status
    pub status: u16,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Tokens to hand back to the caller
    pub tokens: TokenSet,
}

impl SessionResult {
    /// Successful session with tokens
    pub fn opened(tokens: TokenSet) -> Self {
        Self {
            ok: true,
            status: 200,
            message: None,
            tokens,
        }
    }

    /// Failed session
    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            message: Some(message.into()),
            tokens: Vec::new(),
        }
    }
}

/// A computed but not yet applied change
///
/// Separates deciding what a mutation means for one backend from applying
/// it. A backend with nothing to change returns an unapproved change and is
/// skipped; one that cannot apply the change at all (unknown user) returns a
/// rejection, which callers report as a failure. Commit consumes the change,
/// so it can be applied at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Whether there is anything to apply
    pub approved: bool,
    /// Attributes this backend will write
    pub payload: Attributes,
    /// Previous values of the written attributes
    pub rollback: Attributes,
    /// Why the change cannot be applied
    pub rejection: Option<OpResult>,
}

impl PendingChange {
    /// Nothing relevant to this backend
    pub fn skip() -> Self {
        Self {
            approved: false,
            payload: Attributes::new(),
            rollback: Attributes::new(),
            rejection: None,
        }
    }

    /// Change to apply
    pub fn apply(payload: Attributes, rollback: Attributes) -> Self {
        Self {
            approved: !payload.is_empty(),
            payload,
            rollback,
            rejection: None,
        }
    }

    /// Change that cannot be applied
    pub fn reject(status: u16, message: impl Into<String>) -> Self {
        Self {
            rejection: Some(OpResult::failure(status, message)),
            ..Self::skip()
        }
    }
}

/// Session capability
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Open a session for an identity
    async fn open_session(&self, user: &UserId, secret: &str) -> SessionResult;

    /// Close a session identified by its tokens
    async fn close_session(&self, tokens: &TokenSet) -> OpResult;
}

/// Directory capability
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// Fetch a user's attributes; `None` for unknown users
    async fn get_user(&self, user: &UserId, tokens: Option<&TokenSet>) -> Option<Attributes>;

    /// Compute what setting `attrs` means for this backend
    async fn prepare_user_change(
        &self,
        user: &UserId,
        attrs: &Attributes,
        tokens: Option<&TokenSet>,
    ) -> PendingChange;

    /// Apply a prepared change
    async fn commit_user_change(&self, user: &UserId, change: PendingChange, tokens: Option<&TokenSet>) -> OpResult;

    /// Prepare and, if approved, commit
    async fn set_user(&self, user: &UserId, attrs: &Attributes, tokens: Option<&TokenSet>) -> OpResult {
        let change = self.prepare_user_change(user, attrs, tokens).await;
        if let Some(rejection) = change.rejection {
            return rejection;
        }
        if !change.approved {
            return OpResult::success();
        }
        self.commit_user_change(user, change, tokens).await
    }

    /// Create a user
    async fn add_user(&self, user: &UserId, attrs: &Attributes, tokens: Option<&TokenSet>) -> OpResult;

    /// Delete a user
    async fn del_user(&self, user: &UserId, tokens: Option<&TokenSet>) -> OpResult;

    /// Fetch a group's attributes and members
    async fn get_group(&self, _group: &str, _tokens: Option<&TokenSet>) -> Option<Attributes> {
        None
    }

    /// Create a group
    async fn add_group(&self, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        OpResult::failure(501, format!("groups not supported: {}", group))
    }

    /// Update a group's attributes
    async fn set_group(&self, group: &str, _attrs: &Attributes, _tokens: Option<&TokenSet>) -> OpResult {
        OpResult::failure(501, format!("groups not supported: {}", group))
    }

    /// Delete a group
    async fn del_group(&self, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        OpResult::failure(501, format!("groups not supported: {}", group))
    }

    /// Add a user to a group
    async fn add_user_to_group(&self, _user: &UserId, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        OpResult::failure(501, format!("groups not supported: {}", group))
    }

    /// Remove a user from a group
    async fn del_user_from_group(&self, _user: &UserId, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        OpResult::failure(501, format!("groups not supported: {}", group))
    }
}

/// A named backend with a declared capability set
pub trait Backend: Send + Sync {
    /// Backend name used in realm configuration
    fn name(&self) -> &str;

    /// Declared capabilities
    fn capabilities(&self) -> Capabilities;

    /// Session capability, if declared
    fn session(&self) -> Option<&dyn SessionBackend> {
        None
    }

    /// Directory capability, if declared
    fn directory(&self) -> Option<&dyn DirectoryBackend> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_change_approval() {
        assert!(!PendingChange::skip().approved);

        let mut payload = Attributes::new();
        payload.insert("mail".into(), json!("a@x"));
        assert!(PendingChange::apply(payload, Attributes::new()).approved);
        assert!(!PendingChange::apply(Attributes::new(), Attributes::new()).approved);
    }

    #[test]
    fn test_op_result_json() {
        assert_eq!(serde_json::to_value(OpResult::success()).unwrap(), json!({ "ok": true, "status": 200 }));
        let failed = serde_json::to_value(OpResult::failure(404, "no such user")).unwrap();
        assert_eq!(failed["message"], "no such user");
    }
}
