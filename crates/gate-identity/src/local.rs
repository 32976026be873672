//! Local document-store directory
//!
//! Owns tenant quota records and groups. Passwords are never stored here.

use crate::backend::{Attributes, Backend, Capabilities, DirectoryBackend, OpResult, PendingChange};
use crate::store::{DocumentStore, GroupRecord, IdentityDocument};
use async_trait::async_trait;
use gate_common::{TokenSet, UserId};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Attributes the local directory refuses to hold
const FOREIGN_ATTRIBUTES: &[&str] = &["userpassword"];

/// Local directory backend
pub struct LocalDirectoryBackend {
    name: String,
    store: Arc<dyn DocumentStore>,
    /// serializes load-modify-save cycles
    write_lock: Mutex<()>,
}

impl LocalDirectoryBackend {
    /// Create backend over a document store
    pub fn new(name: impl Into<String>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            name: name.into(),
            store,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Option<IdentityDocument> {
        match self.store.load().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::error!(backend = %self.name, error = %e, "failed to load identity document");
                None
            }
        }
    }

    async fn modify<F>(&self, f: F) -> OpResult
    where
        F: FnOnce(&mut IdentityDocument) -> OpResult + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut doc = match self.store.load().await {
            Ok(doc) => doc,
            Err(e) => return OpResult::failure(500, e.to_string()),
        };

        let result = f(&mut doc);
        if !result.ok {
            return result;
        }

        match self.store.save(&doc).await {
            Ok(()) => result,
            Err(e) => OpResult::failure(500, e.to_string()),
        }
    }
}

impl Backend for LocalDirectoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            session: false,
            users: true,
            groups: true,
        }
    }

    fn directory(&self) -> Option<&dyn DirectoryBackend> {
        Some(self)
    }
}

#[async_trait]
impl DirectoryBackend for LocalDirectoryBackend {
    async fn get_user(&self, user: &UserId, _tokens: Option<&TokenSet>) -> Option<Attributes> {
        let doc = self.load().await?;
        let mut attrs = doc.user(&user.to_string())?.clone();

        let groups: Vec<_> = doc
            .groups
            .iter()
            .filter(|(_, group)| group.members.contains(&user.to_string()))
            .map(|(name, _)| serde_json::Value::String(name.clone()))
            .collect();
        if !groups.is_empty() {
            attrs.insert("groups".into(), serde_json::Value::Array(groups));
        }
        Some(attrs)
    }

    async fn prepare_user_change(
        &self,
        user: &UserId,
        attrs: &Attributes,
        _tokens: Option<&TokenSet>,
    ) -> PendingChange {
        let Some(doc) = self.load().await else {
            return PendingChange::reject(500, "identity document unavailable");
        };
        let Some(current) = doc.user(&user.to_string()) else {
            return PendingChange::reject(404, format!("user {} does not exist", user));
        };

        let mut payload = Attributes::new();
        let mut rollback = Attributes::new();
        for (key, value) in attrs {
            if FOREIGN_ATTRIBUTES.contains(&key.as_str()) || current.get(key) == Some(value) {
                continue;
            }
            payload.insert(key.clone(), value.clone());
            if let Some(previous) = current.get(key) {
                rollback.insert(key.clone(), previous.clone());
            }
        }
        PendingChange::apply(payload, rollback)
    }

    async fn commit_user_change(&self, user: &UserId, change: PendingChange, _tokens: Option<&TokenSet>) -> OpResult {
        let id = user.to_string();
        self.modify(move |doc| match doc.users.get_mut(&id) {
            Some(record) => {
                record.extend(change.payload);
                OpResult::success()
            }
            None => OpResult::failure(404, format!("user {} does not exist", id)),
        })
        .await
    }

    async fn add_user(&self, user: &UserId, attrs: &Attributes, _tokens: Option<&TokenSet>) -> OpResult {
        let id = user.to_string();
        let mut record = attrs.clone();
        record.retain(|key, _| !FOREIGN_ATTRIBUTES.contains(&key.as_str()));

        self.modify(move |doc| {
            if doc.users.contains_key(&id) {
                return OpResult::failure(409, format!("user {} already exists", id));
            }
            doc.users.insert(id, record);
            OpResult::success()
        })
        .await
    }

    async fn del_user(&self, user: &UserId, _tokens: Option<&TokenSet>) -> OpResult {
        let id = user.to_string();
        self.modify(move |doc| {
            if doc.users.remove(&id).is_none() {
                return OpResult::failure(404, format!("user {} does not exist", id));
            }
            for group in doc.groups.values_mut() {
                group.members.retain(|member| member != &id);
            }
            OpResult::success()
        })
        .await
    }

    async fn get_group(&self, group: &str, _tokens: Option<&TokenSet>) -> Option<Attributes> {
        let doc = self.load().await?;
        let record = doc.groups.get(group)?;
        let mut attrs = record.attributes.clone();
        attrs.insert(
            "members".into(),
            serde_json::Value::Array(record.members.iter().cloned().map(serde_json::Value::String).collect()),
        );
        Some(attrs)
    }

    async fn add_group(&self, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        let name = group.to_string();
        self.modify(move |doc| {
            if doc.groups.contains_key(&name) {
                return OpResult::failure(409, format!("group {} already exists", name));
            }
            doc.groups.insert(name, GroupRecord::default());
            OpResult::success()
        })
        .await
    }

    async fn set_group(&self, group: &str, attrs: &Attributes, _tokens: Option<&TokenSet>) -> OpResult {
        let name = group.to_string();
        let attrs = attrs.clone();
        self.modify(move |doc| match doc.groups.get_mut(&name) {
            Some(record) => {
                record.attributes.extend(attrs);
                OpResult::success()
            }
            None => OpResult::failure(404, format!("group {} does not exist", name)),
        })
        .await
    }

    async fn del_group(&self, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        let name = group.to_string();
        self.modify(move |doc| match doc.groups.remove(&name) {
            Some(_) => OpResult::success(),
            None => OpResult::failure(404, format!("group {} does not exist", name)),
        })
        .await
    }

    async fn add_user_to_group(&self, user: &UserId, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        let id = user.to_string();
        let name = group.to_string();
        self.modify(move |doc| {
            if !doc.users.contains_key(&id) {
                return OpResult::failure(404, format!("user {} does not exist", id));
            }
            match doc.groups.get_mut(&name) {
                Some(record) => {
                    if !record.members.contains(&id) {
                        record.members.push(id);
                    }
                    OpResult::success()
                }
                None => OpResult::failure(404, format!("group {} does not exist", name)),
            }
        })
        .await
    }

    async fn del_user_from_group(&self, user: &UserId, group: &str, _tokens: Option<&TokenSet>) -> OpResult {
        let id = user.to_string();
        let name = group.to_string();
        self.modify(move |doc| match doc.groups.get_mut(&name) {
            Some(record) => {
                record.members.retain(|member| member != &id);
                OpResult::success()
            }
            None => OpResult::failure(404, format!("group {} does not exist", name)),
        })
        .await
    }
}
