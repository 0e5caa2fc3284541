use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// The shared key-value store the lock is built on.
///
/// Only single-key operations are assumed: each one is individually
/// consistent (a `get` observes the latest completed `set`/`delete` of that
/// key) but nothing is atomic across keys and there is no compare-and-swap.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;
    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct InMemoryStorage {
    data: dashmap::DashMap<String, Bytes>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: dashmap::DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }
}
