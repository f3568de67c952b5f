//! Secret Store.
//!
//! Certificate and opaque secret material read by the Cache Builder when a
//! `secret` resource is generated from a reference. Fetch failures are
//! reported as [`SecretError`]; the builder classifies all of them as
//! transient.

use crate::api::ObjectKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretData {
    /// TLS certificate chain and private key (PEM), plus an optional CA bundle.
    Tls {
        certificate: String,
        private_key: String,
        ca: Option<String>,
    },
    /// Arbitrary key/value material.
    Opaque(BTreeMap<String, String>),
}

impl SecretData {
    pub fn tls(certificate: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self::Tls {
            certificate: certificate.into(),
            private_key: private_key.into(),
            ca: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Tls { .. } => "tls",
            Self::Opaque(_) => "opaque",
        }
    }
}

/// Secret fetch failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(ObjectKey),

    #[error("secret {key} has type {found}, expected {expected}")]
    WrongType {
        key: ObjectKey,
        expected: &'static str,
        found: &'static str,
    },

    #[error("secret {key} has no key {field}")]
    MissingKey { key: ObjectKey, field: String },
}

/// Read access to secret material.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, key: &ObjectKey) -> Result<SecretData, SecretError>;

    /// Subscribe to keys of changed or removed secrets.
    fn subscribe(&self) -> broadcast::Receiver<ObjectKey>;
}

/// Shared handle to a secret store.
pub type SharedSecretStore = Arc<dyn SecretStore>;

/// In-memory secret store.
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<ObjectKey, SecretData>>,
    changes: broadcast::Sender<ObjectKey>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            secrets: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Insert or replace a secret. Notifies only when the data changed.
    pub fn put(&self, key: ObjectKey, data: SecretData) {
        let previous = self.secrets.write().insert(key.clone(), data.clone());
        if previous.as_ref() != Some(&data) {
            tracing::debug!(secret = %key, "secret updated");
            let _ = self.changes.send(key);
        }
    }

    pub fn remove(&self, key: &ObjectKey) -> bool {
        let removed = self.secrets.write().remove(key).is_some();
        if removed {
            tracing::debug!(secret = %key, "secret removed");
            let _ = self.changes.send(key.clone());
        }
        removed
    }

    /// Keys of every stored secret.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.secrets.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, key: &ObjectKey) -> Result<SecretData, SecretError> {
        self.secrets
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(key.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectKey> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove() {
        let store = MemorySecretStore::new();
        let key = ObjectKey::new("default", "cert");
        let mut changes = store.subscribe();

        store.put(key.clone(), SecretData::tls("CERT", "KEY"));
        store.put(key.clone(), SecretData::tls("CERT", "KEY"));
        assert_eq!(
            store.get_secret(&key).await.unwrap(),
            SecretData::tls("CERT", "KEY")
        );

        assert!(store.remove(&key));
        assert_eq!(
            store.get_secret(&key).await.unwrap_err(),
            SecretError::NotFound(key.clone())
        );

        // One notification for the put, one for the remove.
        assert_eq!(changes.recv().await.unwrap(), key);
        assert_eq!(changes.recv().await.unwrap(), key);
        assert!(changes.try_recv().is_err());
    }
}
