use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Cache key: a protocol session belongs to one wallet on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub device_id: String,
    pub passphrase_state: Option<String>,
}

impl SessionKey {
    pub fn new(device_id: impl Into<String>, passphrase_state: Option<&str>) -> Self {
        Self {
            device_id: device_id.into(),
            passphrase_state: passphrase_state.map(str::to_string),
        }
    }
}

/// Remembers protocol session ids so a handshake can resume them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &SessionKey) -> Option<String>;
    async fn put(&self, key: SessionKey, session_id: String);
    async fn remove(&self, key: &SessionKey);
    /// Drops every entry for the device, whatever its passphrase state.
    async fn remove_device(&self, device_id: &str);
}

#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<HashMap<SessionKey, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &SessionKey) -> Option<String> {
        self.inner.read().get(key).cloned()
    }

    async fn put(&self, key: SessionKey, session_id: String) {
        self.inner.write().insert(key, session_id);
    }

    async fn remove(&self, key: &SessionKey) {
        self.inner.write().remove(key);
    }

    async fn remove_device(&self, device_id: &str) {
        self.inner.write().retain(|key, _| key.device_id != device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passphrase_states_never_collide() {
        let store = MemorySessionStore::new();
        store
            .put(SessionKey::new("dev", None), "standard".into())
            .await;
        store
            .put(SessionKey::new("dev", Some("hidden-a")), "a".into())
            .await;
        store
            .put(SessionKey::new("dev", Some("hidden-b")), "b".into())
            .await;

        assert_eq!(
            store.get(&SessionKey::new("dev", None)).await.as_deref(),
            Some("standard")
        );
        assert_eq!(
            store
                .get(&SessionKey::new("dev", Some("hidden-a")))
                .await
                .as_deref(),
            Some("a")
        );

        store.remove(&SessionKey::new("dev", Some("hidden-a"))).await;
        assert_eq!(store.get(&SessionKey::new("dev", Some("hidden-a"))).await, None);
        assert_eq!(store.len(), 2);

        store.remove_device("dev").await;
        assert!(store.is_empty());
    }
}
