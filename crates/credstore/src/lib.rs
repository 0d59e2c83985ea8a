//! Charter credential store: permission-scoped escrow for plan values,
//! cluster credentials and binding documents.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use charter_core::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

mod credhub;

pub use credhub::{CredHubConfig, CredHubStore};

/// A grant of operations on one path to one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub actor: String,
    pub operations: Vec<String>,
}

#[async_trait::async_trait]
pub trait CredStore: Send + Sync {
    /// Current value at `path`. Documents come back as JSON text.
    async fn get(&self, path: &str) -> Result<String>;

    async fn put(&self, path: &str, value: &Value) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn add_permission(&self, path: &str, actor: &str, operations: &[&str]) -> Result<()>;

    /// Revoke the grants previously added on `path`.
    async fn delete_permission(&self, path: &str) -> Result<()>;
}

/// Text form of a stored value: strings verbatim, everything else as JSON.
pub fn value_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Ok(serde_json::to_string(other)?),
    }
}

#[derive(Debug, Default)]
struct Entry {
    value: Option<Value>,
    permissions: Vec<Permission>,
}

/// Process-local store. Grants are recorded but not enforced.
#[derive(Debug, Default)]
pub struct MemoryCredStore {
    entries: Mutex<FxHashMap<String, Entry>>,
}

impl MemoryCredStore {
    pub fn new() -> Self { Self::default() }

    fn with<T>(&self, f: impl FnOnce(&mut FxHashMap<String, Entry>) -> Result<T>) -> Result<T> {
        let mut guard = self.entries.lock().map_err(|_| anyhow!("credential store lock poisoned"))?;
        f(&mut guard)
    }

    /// Value stored at `path`, if any.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.with(|m| Ok(m.get(path).and_then(|e| e.value.clone()))).ok().flatten()
    }

    pub fn permissions(&self, path: &str) -> Vec<Permission> {
        self.with(|m| Ok(m.get(path).map(|e| e.permissions.clone()).unwrap_or_default())).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CredStore for MemoryCredStore {
    async fn get(&self, path: &str) -> Result<String> {
        let v = self.with(|m| {
            m.get(path)
                .and_then(|e| e.value.clone())
                .ok_or_else(|| anyhow!("credential {} not found", path))
        })?;
        value_text(&v)
    }

    async fn put(&self, path: &str, value: &Value) -> Result<()> {
        self.with(|m| {
            m.entry(path.to_string()).or_default().value = Some(value.clone());
            Ok(())
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.with(|m| match m.get_mut(path) {
            Some(e) if e.value.is_some() => {
                e.value = None;
                if e.permissions.is_empty() {
                    m.remove(path);
                }
                Ok(())
            }
            _ => Err(anyhow!("credential {} not found", path)),
        })
    }

    async fn add_permission(&self, path: &str, actor: &str, operations: &[&str]) -> Result<()> {
        self.with(|m| {
            let entry = m.entry(path.to_string()).or_default();
            entry.permissions.retain(|p| p.actor != actor);
            entry.permissions.push(Permission {
                actor: actor.to_string(),
                operations: operations.iter().map(|o| o.to_string()).collect(),
            });
            Ok(())
        })
    }

    async fn delete_permission(&self, path: &str) -> Result<()> {
        self.with(|m| {
            if let Some(e) = m.get_mut(path) {
                e.permissions.clear();
                if e.value.is_none() {
                    m.remove(path);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charter_core::Document;

    #[tokio::test]
    async fn strings_come_back_verbatim_and_documents_as_json() {
        let store = MemoryCredStore::new();
        store.put("/c/x/values", &Value::String("replicas: 2\n".into())).await.unwrap();
        assert_eq!(store.get("/c/x/values").await.unwrap(), "replicas: 2\n");

        let mut doc = Document::new();
        doc.insert("user".into(), "admin".into());
        store.put("/c/x/doc", &Value::Map(doc)).await.unwrap();
        assert_eq!(store.get("/c/x/doc").await.unwrap(), r#"{"user":"admin"}"#);
    }

    #[tokio::test]
    async fn missing_credentials_error() {
        let store = MemoryCredStore::new();
        assert!(store.get("/nope").await.is_err());
        assert!(store.delete("/nope").await.is_err());
    }

    #[tokio::test]
    async fn permissions_are_replaced_per_actor_and_revoked_together() {
        let store = MemoryCredStore::new();
        store.put("/p", &Value::Null).await.unwrap();
        store.add_permission("/p", "mtls-app:a", &["read"]).await.unwrap();
        store.add_permission("/p", "mtls-app:a", &["read", "write"]).await.unwrap();
        store.add_permission("/p", "mtls-app:b", &["read"]).await.unwrap();
        let perms = store.permissions("/p");
        assert_eq!(perms.len(), 2);
        assert_eq!(perms[0].operations, vec!["read", "write"]);

        store.delete_permission("/p").await.unwrap();
        assert!(store.permissions("/p").is_empty());
        assert_eq!(store.value("/p"), Some(Value::Null));
        store.delete("/p").await.unwrap();
        assert_eq!(store.value("/p"), None);
    }
}
