//! Identity document store
//!
//! The local directory keeps its users and groups in one document that is
//! loaded, modified and saved whole.

use crate::backend::Attributes;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document is not valid JSON
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Group record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupRecord {
    /// Group attributes
    pub attributes: Attributes,
    /// Member identities (`user@realm`)
    pub members: Vec<String>,
}

/// The identity document, keyed by tenant identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityDocument {
    /// Users by `user@realm`
    pub users: BTreeMap<String, Attributes>,
    /// Groups by name
    pub groups: BTreeMap<String, GroupRecord>,
}

impl IdentityDocument {
    /// User attributes; `None` for unknown tenants
    pub fn user(&self, id: &str) -> Option<&Attributes> {
        self.users.get(id)
    }
}

/// Document store contract
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the whole document
    async fn load(&self) -> StoreResult<IdentityDocument>;

    /// Replace the whole document
    async fn save(&self, document: &IdentityDocument) -> StoreResult<()>;
}

/// JSON file store
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`; a missing file reads as an empty document
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self) -> StoreResult<IdentityDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IdentityDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &IdentityDocument) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(document)?;
        // write-then-rename so readers never see a partial document
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory store (for testing and development)
#[derive(Default)]
pub struct MemoryStore {
    document: RwLock<IdentityDocument>,
}

impl MemoryStore {
    /// Store seeded with a document
    pub fn new(document: IdentityDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self) -> StoreResult<IdentityDocument> {
        Ok(self.document.read().clone())
    }

    async fn save(&self, document: &IdentityDocument) -> StoreResult<()> {
        *self.document.write() = document.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_user_reads_none() {
        let store = MemoryStore::default();
        let doc = store.load().await.unwrap();
        assert!(doc.user("ghost@pve").is_none());
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let path = std::env::temp_dir().join(format!("fabricgate-store-{}.json", std::process::id()));
        let store = JsonFileStore::new(&path);

        // missing file is an empty document
        assert_eq!(store.load().await.unwrap(), IdentityDocument::default());

        let mut doc = IdentityDocument::default();
        let mut attrs = Attributes::new();
        attrs.insert("mail".into(), json!("alice@example.com"));
        doc.users.insert("alice@pve".into(), attrs);
        store.save(&doc).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.user("alice@pve").unwrap()["mail"], "alice@example.com");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_malformed_document() {
        let path = std::env::temp_dir().join(format!("fabricgate-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Malformed(_))));
        let _ = std::fs::remove_file(&path);
    }
}
