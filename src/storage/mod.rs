pub mod memory_bucket;
pub mod s3_bucket;

pub use memory_bucket::MemoryBucket;
pub use s3_bucket::S3Bucket;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::model::{Id, StorageMigrationReport};
use crate::store::traits::BlobStore;

/// Source archives of published revisions.
pub const PUBLISHED_SOURCES_TABLE: &str = "published-sources";
/// Export and build results.
pub const BUILD_RESULT_TABLE: &str = "build-result";

pub const MIGRATION_BATCH_SIZE: i64 = 100;

/// Object path of an entity inside the bucket.
pub fn object_key(table: &str, id: &str) -> String {
    format!("{}/{}.zip", table, id)
}

/// S3-compatible object store.
#[async_trait::async_trait]
pub trait BucketBackend: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    /// `None` when the object does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Uniform access to stored bytes over the row store and an optional bucket.
pub struct ObjectStorage<S: BlobStore> {
    store: Arc<S>,
    bucket: Option<Arc<dyn BucketBackend>>,
    store_only_build_result: bool,
    migration_in_progress: AtomicBool,
}

/// Clears the migration flag when the migration ends, however it ends.
struct MigrationGuard<'a>(&'a AtomicBool);

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: BlobStore> ObjectStorage<S> {
    /// Row store only.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            bucket: None,
            store_only_build_result: false,
            migration_in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_bucket(store: Arc<S>, bucket: Arc<dyn BucketBackend>, store_only_build_result: bool) -> Self {
        Self {
            store,
            bucket: Some(bucket),
            store_only_build_result,
            migration_in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_bucket_active(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn is_migration_in_progress(&self) -> bool {
        self.migration_in_progress.load(Ordering::SeqCst)
    }

    fn bucket_for(&self, table: &str) -> Option<&Arc<dyn BucketBackend>> {
        match &self.bucket {
            Some(bucket) if !self.store_only_build_result || table == BUILD_RESULT_TABLE => Some(bucket),
            _ => None,
        }
    }

    pub async fn put_file(&self, table: &str, id: &str, data: &[u8]) -> CatalogResult<()> {
        match self.bucket_for(table) {
            Some(bucket) => bucket
                .put(&object_key(table, id), data)
                .await
                .map_err(|e| storage_unavailable(table, id, e)),
            None => Ok(self.store.put_blob(table, id, data).await?),
        }
    }

    /// Read from the bucket when active, falling back to rows not migrated yet.
    pub async fn get_file(&self, table: &str, id: &str) -> CatalogResult<Option<Vec<u8>>> {
        if let Some(bucket) = self.bucket_for(table) {
            let found = bucket
                .get(&object_key(table, id))
                .await
                .map_err(|e| storage_unavailable(table, id, e))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(self.store.get_blob(table, id).await?)
    }

    /// Bulk delete from both backends; every failure is reported together.
    pub async fn remove_files(&self, table: &str, ids: &[Id]) -> CatalogResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut failures = Vec::new();
        let mut removed = 0;
        if let Some(bucket) = self.bucket_for(table) {
            for id in ids {
                match bucket.delete(&object_key(table, id)).await {
                    Ok(()) => removed += 1,
                    Err(e) => failures.push(format!("{}: {}", id, e)),
                }
            }
        }
        match self.store.delete_blobs(table, ids).await {
            Ok(count) => removed = removed.max(count),
            Err(e) => failures.push(format!("rows: {}", e)),
        }
        if !failures.is_empty() {
            return Err(CatalogError::dependency(
                codes::STORAGE_UNAVAILABLE,
                format!("Failed to remove files from '{}': {}", table, failures.join("; ")),
            )
            .with_param("table", table));
        }
        Ok(removed)
    }

    /// One-way move of row-stored bytes into the bucket. Stops at the first
    /// failure; objects moved so far stay moved.
    pub async fn upload_files_to_bucket(&self, table: &str) -> CatalogResult<StorageMigrationReport> {
        let bucket = self.bucket_for(table).cloned().ok_or_else(|| {
            CatalogError::validation(
                codes::STORAGE_UNAVAILABLE,
                format!("Object storage is not active for '{}'", table),
            )
            .with_param("table", table)
        })?;
        if self.migration_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CatalogError::conflict(
                codes::MIGRATION_IN_PROGRESS,
                "Storage migration is already in progress",
            ));
        }
        let _guard = MigrationGuard(&self.migration_in_progress);

        log::info!("Starting migration of '{}' into object storage", table);
        let mut report = StorageMigrationReport {
            table: table.to_string(),
            moved: 0,
            error: None,
        };
        loop {
            // moved rows are deleted, so every page starts at offset zero
            let ids = self.store.list_blob_ids(table, 0, MIGRATION_BATCH_SIZE).await?;
            if ids.is_empty() {
                break;
            }
            for id in ids {
                if let Err(e) = self.migrate_one(bucket.as_ref(), table, &id).await {
                    log::error!("Storage migration of '{}' aborted at {}: {}", table, id, e);
                    report.error = Some(format!("{}: {}", id, e));
                    return Ok(report);
                }
                report.moved += 1;
            }
        }
        log::info!("Migrated {} objects of '{}' into object storage", report.moved, table);
        Ok(report)
    }

    async fn migrate_one(&self, bucket: &dyn BucketBackend, table: &str, id: &str) -> Result<()> {
        let Some(data) = self.store.get_blob(table, id).await? else {
            return Ok(());
        };
        bucket.put(&object_key(table, id), &data).await?;
        self.store.delete_blobs(table, &[id.to_string()]).await?;
        Ok(())
    }
}

fn storage_unavailable(table: &str, id: &str, e: anyhow::Error) -> CatalogError {
    log::error!("Object storage failure for {}: {:#}", object_key(table, id), e);
    CatalogError::dependency(codes::STORAGE_UNAVAILABLE, format!("Object storage unavailable: {}", e))
        .with_param("table", table)
        .with_param("id", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_row_store_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let storage = ObjectStorage::new(store);
        storage.put_file(BUILD_RESULT_TABLE, "b1", b"payload").await.unwrap();
        assert_eq!(
            storage.get_file(BUILD_RESULT_TABLE, "b1").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert_eq!(
            storage
                .remove_files(BUILD_RESULT_TABLE, &["b1".to_string(), "b2".to_string()])
                .await
                .unwrap(),
            1
        );
        assert_eq!(storage.get_file(BUILD_RESULT_TABLE, "b1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_only_build_result_keeps_sources_in_rows() {
        let store = Arc::new(MemoryStore::new());
        let bucket = Arc::new(MemoryBucket::new());
        let storage = ObjectStorage::with_bucket(store.clone(), bucket.clone(), true);
        storage.put_file(PUBLISHED_SOURCES_TABLE, "p1", b"src").await.unwrap();
        storage.put_file(BUILD_RESULT_TABLE, "b1", b"out").await.unwrap();
        assert!(bucket.contains("build-result/b1.zip").await);
        assert!(!bucket.contains("published-sources/p1.zip").await);
        assert_eq!(store.get_blob(PUBLISHED_SOURCES_TABLE, "p1").await.unwrap(), Some(b"src".to_vec()));
    }

    #[tokio::test]
    async fn test_migration_stops_at_first_failure() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b", "c"] {
            store.put_blob(BUILD_RESULT_TABLE, id, id.as_bytes()).await.unwrap();
        }
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_on("build-result/b.zip").await;
        let storage = ObjectStorage::with_bucket(store.clone(), bucket.clone(), false);

        let report = storage.upload_files_to_bucket(BUILD_RESULT_TABLE).await.unwrap();
        assert_eq!(report.moved, 1);
        assert!(report.error.is_some());
        assert!(bucket.contains("build-result/a.zip").await);
        assert_eq!(store.get_blob(BUILD_RESULT_TABLE, "a").await.unwrap(), None);
        assert!(store.get_blob(BUILD_RESULT_TABLE, "b").await.unwrap().is_some());
        assert!(!storage.is_migration_in_progress());
    }
}
