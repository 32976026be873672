//! Tenant identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tenant identity in `user@realm` form
///
/// The realm selects which directory backends describe the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId {
    /// User name within the realm
    pub id: String,
    /// Realm name
    pub realm: String,
}

impl UserId {
    /// Create identity from parts
    pub fn new(id: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            realm: realm.into(),
        }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.realm)
    }
}

/// Identity parse error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identity {0:?}: expected user@realm")]
pub struct InvalidUserId(pub String);

impl FromStr for UserId {
    type Err = InvalidUserId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // user names may themselves contain '@', realms may not
        match s.rsplit_once('@') {
            Some((id, realm)) if !id.is_empty() && !realm.is_empty() => Ok(Self::new(id, realm)),
            _ => Err(InvalidUserId(s.to_string())),
        }
    }
}

impl TryFrom<String> for UserId {
    type Error = InvalidUserId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.to_string()
    }
}
