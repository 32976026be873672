//! Multi-backend identity aggregator
//!
//! Presents the ordered directory backends of a realm as one logical
//! identity. Reads fold backend results with first-wins precedence; writes
//! walk backends in order and stop at the first failure.

use crate::backend::{Attributes, Backend, DirectoryBackend, OpResult, SessionBackend};
use gate_accounting::QuotaRecord;
use gate_common::{Credentials, GateError, GateResult, TokenSet, UserId};
use gate_fabric::FabricClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// User attribute holding the tenant quota record
pub const QUOTA_ATTRIBUTE: &str = "quota";

/// Fold `next` into `merged`, keeping keys already present
pub fn merge_first_wins(merged: &mut Attributes, next: Attributes) {
    for (key, value) in next {
        merged.entry(key).or_insert(value);
    }
}

/// Identity aggregator
pub struct IdentityAggregator {
    backends: HashMap<String, Arc<dyn Backend>>,
    realms: BTreeMap<String, Vec<String>>,
    sessions: Vec<String>,
    fabric: Arc<FabricClient>,
}

impl IdentityAggregator {
    /// Create aggregator
    ///
    /// `realms` maps each realm to its ordered backend names; `sessions`
    /// lists backends every login must pass regardless of realm. Every
    /// referenced name must be registered.
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        realms: BTreeMap<String, Vec<String>>,
        sessions: Vec<String>,
        fabric: Arc<FabricClient>,
    ) -> GateResult<Self> {
        let backends: HashMap<_, _> = backends
            .into_iter()
            .map(|backend| (backend.name().to_string(), backend))
            .collect();

        let referenced = realms.values().flatten().chain(sessions.iter());
        for name in referenced {
            if !backends.contains_key(name) {
                return Err(GateError::Config(format!("unknown identity backend {:?}", name)));
            }
        }
        for name in &sessions {
            if !backends[name].capabilities().session {
                return Err(GateError::Config(format!("backend {:?} cannot open sessions", name)));
            }
        }

        Ok(Self {
            backends,
            realms,
            sessions,
            fabric,
        })
    }

    /// Configured realm names
    pub fn realms(&self) -> impl Iterator<Item = &str> {
        self.realms.keys().map(String::as_str)
    }

    fn realm(&self, realm: &str) -> GateResult<&[String]> {
        self.realms
            .get(realm)
            .map(Vec::as_slice)
            .ok_or_else(|| GateError::InvalidTarget(format!("unknown realm {}", realm)))
    }

    /// Realm backends that model users, in configured order
    fn user_directories(&self, realm: &str) -> GateResult<Vec<(&str, &dyn DirectoryBackend)>> {
        Ok(self
            .realm(realm)?
            .iter()
            .filter_map(|name| {
                let backend = &self.backends[name];
                if !backend.capabilities().users {
                    return None;
                }
                backend.directory().map(|dir| (name.as_str(), dir))
            })
            .collect())
    }

    /// Realm backends that model groups, in configured order
    fn group_directories(&self, realm: &str) -> GateResult<Vec<(&str, &dyn DirectoryBackend)>> {
        Ok(self
            .realm(realm)?
            .iter()
            .filter_map(|name| {
                let backend = &self.backends[name];
                if !backend.capabilities().groups {
                    return None;
                }
                backend.directory().map(|dir| (name.as_str(), dir))
            })
            .collect())
    }

    /// Global session backends followed by the realm's, without duplicates
    fn session_backends(&self, realm: &str) -> GateResult<Vec<(&str, &dyn SessionBackend)>> {
        let mut names: Vec<&String> = self.sessions.iter().collect();
        for name in self.realm(realm)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        Ok(names
            .into_iter()
            .filter_map(|name| {
                let backend = &self.backends[name];
                if !backend.capabilities().session {
                    return None;
                }
                backend.session().map(|session| (name.as_str(), session))
            })
            .collect())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a session on every session backend; all must succeed
    pub async fn open_session(&self, user: &UserId, secret: &str) -> GateResult<TokenSet> {
        let backends = self.session_backends(&user.realm).map_err(|_| GateError::Unauthenticated)?;

        let mut tokens = TokenSet::new();
        for (name, backend) in backends {
            let result = backend.open_session(user, secret).await;
            if !result.ok {
                tracing::info!(tenant = %user, backend = name, status = result.status, "session refused");
                if result.status == 401 {
                    return Err(GateError::Unauthenticated);
                }
                return Err(GateError::PartialAggregation {
                    backend: name.to_string(),
                    status: result.status,
                    message: result.message.unwrap_or_default(),
                });
            }
            tokens.extend(result.tokens);
        }

        tracing::info!(tenant = %user, tokens = tokens.len(), "session opened");
        Ok(tokens)
    }

    /// Close the session on every session backend
    pub async fn close_session(&self, user: &UserId, tokens: &TokenSet) -> GateResult<()> {
        for (name, backend) in self.session_backends(&user.realm)? {
            check(name, backend.close_session(tokens).await)?;
        }
        tracing::info!(tenant = %user, "session closed");
        Ok(())
    }

    /// Whether the credentials carry a live fabric session
    pub async fn check_session(&self, credentials: &Credentials) -> bool {
        self.fabric.check_session(credentials).await
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Merged user attributes; `None` when no backend knows the user
    pub async fn get_user(&self, user: &UserId, tokens: Option<&TokenSet>) -> GateResult<Option<Attributes>> {
        let mut merged: Option<Attributes> = None;
        for (_, directory) in self.user_directories(&user.realm)? {
            if let Some(attrs) = directory.get_user(user, tokens).await {
                merge_first_wins(merged.get_or_insert_with(Attributes::new), attrs);
            }
        }
        Ok(merged)
    }

    /// Apply attributes on every backend in order
    ///
    /// Stops at the first failure. Backends already written keep their
    /// changes.
    pub async fn set_user(&self, user: &UserId, attrs: &Attributes, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.user_directories(&user.realm)? {
            let mut change = directory.prepare_user_change(user, attrs, tokens).await;
            if let Some(rejection) = change.rejection.take() {
                check(name, rejection)?;
            }
            if !change.approved {
                tracing::debug!(tenant = %user, backend = name, "no relevant changes");
                continue;
            }
            check(name, directory.commit_user_change(user, change, tokens).await)?;
        }
        Ok(())
    }

    /// Create the user on every backend in order
    pub async fn add_user(&self, user: &UserId, attrs: &Attributes, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.user_directories(&user.realm)? {
            check(name, directory.add_user(user, attrs, tokens).await)?;
        }
        tracing::info!(tenant = %user, "user created");
        Ok(())
    }

    /// Delete the user on every backend in order
    pub async fn del_user(&self, user: &UserId, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.user_directories(&user.realm)? {
            check(name, directory.del_user(user, tokens).await)?;
        }
        tracing::info!(tenant = %user, "user deleted");
        Ok(())
    }

    /// Tenant quota record
    ///
    /// Unknown tenants are unauthenticated; a known tenant without a quota
    /// attribute gets the empty record.
    pub async fn quota(&self, user: &UserId, tokens: Option<&TokenSet>) -> GateResult<QuotaRecord> {
        let attrs = self.get_user(user, tokens).await?.ok_or(GateError::Unauthenticated)?;
        match attrs.get(QUOTA_ATTRIBUTE) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| GateError::Store(format!("malformed quota for {}: {}", user, e))),
            None => Ok(QuotaRecord::default()),
        }
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Merged group attributes within a realm
    pub async fn get_group(&self, realm: &str, group: &str, tokens: Option<&TokenSet>) -> GateResult<Option<Attributes>> {
        let mut merged: Option<Attributes> = None;
        for (_, directory) in self.group_directories(realm)? {
            if let Some(attrs) = directory.get_group(group, tokens).await {
                merge_first_wins(merged.get_or_insert_with(Attributes::new), attrs);
            }
        }
        Ok(merged)
    }

    /// Create a group within a realm
    pub async fn add_group(&self, realm: &str, group: &str, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.group_directories(realm)? {
            check(name, directory.add_group(group, tokens).await)?;
        }
        Ok(())
    }

    /// Update a group within a realm
    pub async fn set_group(
        &self,
        realm: &str,
        group: &str,
        attrs: &Attributes,
        tokens: Option<&TokenSet>,
    ) -> GateResult<()> {
        for (name, directory) in self.group_directories(realm)? {
            check(name, directory.set_group(group, attrs, tokens).await)?;
        }
        Ok(())
    }

    /// Delete a group within a realm
    pub async fn del_group(&self, realm: &str, group: &str, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.group_directories(realm)? {
            check(name, directory.del_group(group, tokens).await)?;
        }
        Ok(())
    }

    /// Add a user to a group of the user's realm
    pub async fn add_user_to_group(&self, user: &UserId, group: &str, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.group_directories(&user.realm)? {
            check(name, directory.add_user_to_group(user, group, tokens).await)?;
        }
        Ok(())
    }

    /// Remove a user from a group of the user's realm
    pub async fn del_user_from_group(&self, user: &UserId, group: &str, tokens: Option<&TokenSet>) -> GateResult<()> {
        for (name, directory) in self.group_directories(&user.realm)? {
            check(name, directory.del_user_from_group(user, group, tokens).await)?;
        }
        Ok(())
    }
}

fn check(backend: &str, result: OpResult) -> GateResult<()> {
    if result.ok {
        return Ok(());
    }
    tracing::warn!(backend, status = result.status, message = ?result.message, "backend operation failed");
    Err(GateError::PartialAggregation {
        backend: backend.to_string(),
        status: result.status,
        message: result.message.unwrap_or_default(),
    })
}
