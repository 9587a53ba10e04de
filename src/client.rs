//! Desired-State Client (Section 4.B): typed CRUD against a generic
//! declarative record store, plus a cached variant backed by a background
//! watcher.
//!
//! The production record store is a Kubernetes-style API server reached
//! through `kube::Api<K>`; this crate talks to it through the same
//! generic verbs but, since the test harness runs against a throwaway
//! virtual lab rather than a shared cluster, keeps its own in-process
//! store (`InMemoryStore`) that reproduces the store's optimistic
//! concurrency semantics without round-tripping to an API server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::StoreError;

/// Identifies a record's name for store indexing. `KIND` is used only for
/// error messages.
pub trait Named: Clone + Send + Sync + std::fmt::Debug + 'static {
    const KIND: &'static str;
    fn object_name(&self) -> &str;
}

/// Outcome of [`DesiredStateClient::create_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// The generic verbs the core depends on. Implemented by the in-memory
/// store used throughout this crate, and could equally be implemented by a
/// `kube::Api<K>`-backed store against a live cluster.
#[async_trait]
pub trait Store<K: Named>: Send + Sync {
    async fn list(&self) -> Result<Vec<K>, StoreError>;
    async fn get(&self, name: &str) -> Result<K, StoreError>;
    async fn create(&self, obj: K) -> Result<K, StoreError>;
    async fn update(&self, obj: K) -> Result<K, StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Versioned<K> {
    obj: K,
    version: u64,
}

/// In-process record store keyed by object name, with an incrementing
/// version counter standing in for the record store's optimistic
/// concurrency token.
#[derive(Debug)]
pub struct InMemoryStore<K: Named> {
    objects: DashMap<String, Versioned<K>>,
}

impl<K: Named> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }
}

impl<K: Named> InMemoryStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(objs: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        for obj in objs {
            store.objects.insert(
                obj.object_name().to_string(),
                Versioned { obj, version: 0 },
            );
        }
        store
    }
}

#[async_trait]
impl<K: Named> Store<K> for InMemoryStore<K> {
    async fn list(&self) -> Result<Vec<K>, StoreError> {
        Ok(self.objects.iter().map(|e| e.value().obj.clone()).collect())
    }

    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.objects
            .get(name)
            .map(|e| e.value().obj.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: K::KIND,
                name: name.to_string(),
            })
    }

    async fn create(&self, obj: K) -> Result<K, StoreError> {
        let name = obj.object_name().to_string();
        if self.objects.contains_key(&name) {
            return Err(StoreError::Conflict {
                kind: K::KIND,
                name,
            });
        }
        self.objects.insert(
            name,
            Versioned {
                obj: obj.clone(),
                version: 0,
            },
        );
        Ok(obj)
    }

    async fn update(&self, obj: K) -> Result<K, StoreError> {
        let name = obj.object_name().to_string();
        let mut entry = self.objects.get_mut(&name).ok_or_else(|| StoreError::NotFound {
            kind: K::KIND,
            name: name.clone(),
        })?;
        entry.obj = obj.clone();
        entry.version += 1;
        Ok(obj)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: K::KIND,
                name: name.to_string(),
            })
    }
}

/// Typed client over a generic [`Store`].
pub struct DesiredStateClient<K: Named> {
    store: Arc<dyn Store<K>>,
}

impl<K: Named> Clone for DesiredStateClient<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K: Named> DesiredStateClient<K> {
    pub fn new(store: Arc<dyn Store<K>>) -> Self {
        Self { store }
    }

    pub fn in_memory(objs: impl IntoIterator<Item = K>) -> Self {
        Self::new(Arc::new(InMemoryStore::seed(objs)))
    }

    pub async fn list(&self) -> Result<Vec<K>, StoreError> {
        self.store.list().await
    }

    pub async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.store.get(name).await
    }

    pub async fn create(&self, obj: K) -> Result<K, StoreError> {
        self.store.create(obj).await
    }

    pub async fn update(&self, obj: K) -> Result<K, StoreError> {
        self.store.update(obj).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.store.delete(name).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { .. }) => Ok(()), // callers ignore not-found on delete
            Err(e) => Err(e),
        }
    }

    /// Fetches the current object by name, applies `mutate` to a clone, and
    /// issues `create` or `update` as appropriate.
    pub async fn create_or_update<F>(
        &self,
        name: &str,
        default: impl FnOnce() -> K,
        mutate: F,
    ) -> Result<(K, ApplyOutcome), StoreError>
    where
        F: FnOnce(&mut K),
    {
        match self.store.get(name).await {
            Ok(mut existing) => {
                let before = format!("{:?}", existing);
                mutate(&mut existing);
                if format!("{:?}", existing) == before {
                    return Ok((existing, ApplyOutcome::Unchanged));
                }
                let updated = self.store.update(existing).await?;
                Ok((updated, ApplyOutcome::Updated))
            }
            Err(StoreError::NotFound { .. }) => {
                let mut obj = default();
                mutate(&mut obj);
                let created = self.store.create(obj).await?;
                Ok((created, ApplyOutcome::Created))
            }
            Err(e) => Err(e),
        }
    }

    /// A read-only view backed by a background poller standing in for a
    /// watch; call `.stop()` (or cancel the token passed to `cached_with`)
    /// to tear it down.
    pub fn cached(&self, poll_interval: Duration) -> CachedClient<K> {
        CachedClient::spawn(self.store.clone(), poll_interval, CancellationToken::new())
    }
}

/// Read-only cache populated by a background poll loop, cancellable on
/// teardown.
pub struct CachedClient<K: Named> {
    cache: Arc<RwLock<HashMap<String, K>>>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl<K: Named> CachedClient<K> {
    fn spawn(store: Arc<dyn Store<K>>, poll_interval: Duration, cancel: CancellationToken) -> Self {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let cache_writer = cache.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!(kind = K::KIND, "cached client watcher cancelled");
                        break;
                    }
                    _ = time::sleep(poll_interval) => {
                        match store.list().await {
                            Ok(objs) => {
                                let mut guard = cache_writer.write().await;
                                guard.clear();
                                for obj in objs {
                                    guard.insert(obj.object_name().to_string(), obj);
                                }
                            }
                            Err(e) => warn!(kind = K::KIND, error = %e, "cached client refresh failed"),
                        }
                    }
                }
            }
        });
        Self {
            cache,
            cancel,
            handle,
        }
    }

    pub async fn get(&self, name: &str) -> Option<K> {
        self.cache.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<K> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Cancels the background watcher. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<K: Named> Drop for CachedClient<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Thing {
        name: String,
        value: u32,
    }

    impl Named for Thing {
        const KIND: &'static str = "Thing";
        fn object_name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn create_or_update_reports_created_then_unchanged() {
        let client = DesiredStateClient::<Thing>::in_memory(vec![]);
        let (_, outcome) = client
            .create_or_update(
                "a",
                || Thing {
                    name: "a".into(),
                    value: 0,
                },
                |t| t.value = 1,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);

        let (_, outcome) = client
            .create_or_update(
                "a",
                || unreachable!("object already exists"),
                |t| t.value = 1,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn create_or_update_reports_updated_on_change() {
        let client = DesiredStateClient::in_memory(vec![Thing {
            name: "a".into(),
            value: 0,
        }]);
        let (obj, outcome) = client
            .create_or_update("a", || unreachable!(), |t| t.value = 42)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(obj.value, 42);
    }

    #[tokio::test]
    async fn delete_ignores_not_found() {
        let client = DesiredStateClient::<Thing>::in_memory(vec![]);
        assert!(client.delete("missing").await.is_ok());
    }

    #[tokio::test]
    async fn get_not_found_is_typed() {
        let client = DesiredStateClient::<Thing>::in_memory(vec![]);
        let err = client.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
