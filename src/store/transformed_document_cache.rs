use crate::model::{TransformedDocument, TransformedDocumentKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
struct CacheEntry {
    document: TransformedDocument,
    last_accessed: Instant,
}

/// In-memory front of the transformed-document table with TTL, indexed by
/// group so that a group change evicts every build type and format at once.
#[derive(Debug)]
pub struct TransformedDocumentCache {
    entries: Arc<RwLock<HashMap<TransformedDocumentKey, CacheEntry>>>,
    /// group id -> cached keys of that group
    by_group: Arc<RwLock<HashMap<String, BTreeSet<TransformedDocumentKey>>>>,
    ttl: Duration,
}

impl TransformedDocumentCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(3600))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            by_group: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Get a document if present and not expired
    pub async fn get(&self, key: &TransformedDocumentKey) -> Option<TransformedDocument> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key) {
            if entry.last_accessed.elapsed() > self.ttl {
                entries.remove(key);
                return None;
            }
            entry.last_accessed = Instant::now();
            Some(entry.document.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, document: TransformedDocument) {
        let key = document.key.clone();
        let mut entries = self.entries.write().await;
        let mut by_group = self.by_group.write().await;

        by_group
            .entry(key.group_id.clone())
            .or_default()
            .insert(key.clone());
        entries.insert(
            key,
            CacheEntry {
                document,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Drop every cached document of a group
    pub async fn invalidate_group(&self, group_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let mut by_group = self.by_group.write().await;

        let Some(keys) = by_group.remove(group_id) else {
            return 0;
        };
        keys.iter().filter(|k| entries.remove(*k).is_some()).count()
    }

    pub async fn clear_expired(&self) {
        let mut entries = self.entries.write().await;
        let mut by_group = self.by_group.write().await;

        let now = Instant::now();
        let ttl = self.ttl;
        let expired: Vec<TransformedDocumentKey> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_accessed) > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
            if let Some(keys) = by_group.get_mut(&key.group_id) {
                keys.remove(key);
                if keys.is_empty() {
                    by_group.remove(&key.group_id);
                }
            }
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let mut by_group = self.by_group.write().await;
        entries.clear();
        by_group.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for TransformedDocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildFormat, BuildType};

    fn document(group_id: &str, format: BuildFormat) -> TransformedDocument {
        TransformedDocument {
            key: TransformedDocumentKey {
                package_id: "acme.pay.gw".to_string(),
                version: "2025.1@1".to_string(),
                api_type: "rest".to_string(),
                group_id: group_id.to_string(),
                build_type: BuildType::ReducedSourceSpecifications,
                format,
            },
            build_id: "build-1".to_string(),
            documents: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = TransformedDocumentCache::new();
        let doc = document("g1", BuildFormat::Json);

        cache.put(doc.clone()).await;
        assert_eq!(cache.get(&doc.key).await, Some(doc.clone()));

        cache.put(document("g1", BuildFormat::Yaml)).await;
        cache.put(document("g2", BuildFormat::Json)).await;
        assert_eq!(cache.invalidate_group("g1").await, 2);
        assert!(cache.get(&doc.key).await.is_none());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let cache = TransformedDocumentCache::with_ttl(Duration::from_millis(0));
        let doc = document("g1", BuildFormat::Json);
        cache.put(doc.clone()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.clear_expired().await;
        assert_eq!(cache.len().await, 0);
    }
}
