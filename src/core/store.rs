//! Key-value persistence collaborator.
//!
//! The engine only ever needs `get` and `put`. Durability is best-effort:
//! callers wrap every call in [`with_timeout`] and treat failures as transient.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use redis::AsyncCommands;
use thiserror::Error;

/// Errors returned by persistence backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

pub trait PersistenceStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Run a store call with a deadline
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// In-process store. Can be switched into failing or hanging mode to exercise
/// the engine's degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every call pend forever
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Read a value directly, bypassing fault injection
    pub fn raw_get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    /// Write a value directly, bypassing fault injection
    pub fn raw_put(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
    }

    fn check_faults(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store in failing mode".to_string()));
        }
        Ok(())
    }
}

impl PersistenceStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        if self.hanging.load(Ordering::SeqCst) {
            return futures::future::pending().boxed();
        }
        let result = self.check_faults().map(|_| self.raw_get(key));
        futures::future::ready(result).boxed()
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>> {
        if self.hanging.load(Ordering::SeqCst) {
            return futures::future::pending().boxed();
        }
        let result = self.check_faults().map(|_| self.raw_put(key, value));
        futures::future::ready(result).boxed()
    }
}

/// Redis-backed store
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(redis::Client::open(url)?))
    }
}

impl PersistenceStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        async move {
            let mut conn = self.client.get_async_connection().await?;
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        }
        .boxed()
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let mut conn = self.client.get_async_connection().await?;
            conn.set::<_, _, ()>(key, value).await?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_ok!(store.put("k", "v".to_string()).await);
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert_err!(store.put("k", "v".to_string()).await);
        assert_eq!(store.raw_get("k"), None);
        store.set_failing(false);
        assert_ok!(store.put("k", "v".to_string()).await);
    }

    #[tokio::test]
    async fn test_timeout_on_hanging_store() {
        let store = MemoryStore::new();
        store.set_hanging(true);
        let result = with_timeout(Duration::from_millis(20), store.get("k")).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
