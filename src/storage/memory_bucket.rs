use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use super::BucketBackend;

/// In-process bucket used by tests and memory-backed runs.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    failing: RwLock<BTreeSet<String>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write and delete of `key` fail.
    pub async fn fail_on(&self, key: &str) {
        self.failing.write().await.insert(key.to_string());
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    async fn check(&self, key: &str) -> Result<()> {
        if self.failing.read().await.contains(key) {
            return Err(anyhow!("injected failure for {}", key));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BucketBackend for MemoryBucket {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.check(key).await?;
        self.objects.write().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(key).await?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}
