pub mod activity;
pub mod archive;
pub mod authorization;
pub mod background;
pub mod builds;
pub mod cleanup;
pub mod comparison;
pub mod exports;
pub mod groups;
pub mod operations;
pub mod package_graph;
pub mod transform;
pub mod versions;
pub mod worker;

pub use activity::{ActivityFeed, ActivityTracker};
pub use authorization::Authorization;
pub use background::BackgroundExecutor;
pub use builds::BuildController;
pub use cleanup::CleanupScheduler;
pub use comparison::ComparisonService;
pub use exports::ExportService;
pub use groups::GroupService;
pub use operations::OperationService;
pub use package_graph::PackageGraph;
pub use versions::VersionService;
pub use worker::{BuildProcessor, BuildWorkerPool};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::CatalogResult;
use crate::storage::{BucketBackend, ObjectStorage};
use crate::store::traits::Store;
use crate::store::TransformedDocumentCache;

const BACKGROUND_CONCURRENCY: usize = 16;

/// Every catalog service wired over one store.
pub struct Catalog<S: Store> {
    pub store: Arc<S>,
    pub config: Arc<AppConfig>,
    pub storage: Arc<ObjectStorage<S>>,
    pub cache: Arc<TransformedDocumentCache>,
    pub background: BackgroundExecutor,
    pub activity: ActivityTracker<S>,
    pub feed: ActivityFeed<S>,
    pub auth: Authorization<S>,
    pub packages: PackageGraph<S>,
    pub versions: VersionService<S>,
    pub operations: OperationService<S>,
    pub comparisons: ComparisonService<S>,
    pub groups: GroupService<S>,
    pub builds: BuildController<S>,
    pub exports: ExportService<S>,
    pub workers: BuildWorkerPool<S>,
    pub cleanup: CleanupScheduler<S>,
    shutdown: CancellationToken,
}

impl<S: Store + 'static> Catalog<S> {
    pub fn new(store: Arc<S>, config: AppConfig, bucket: Option<Arc<dyn BucketBackend>>) -> Self {
        let config = Arc::new(config);
        let storage = Arc::new(match bucket {
            Some(bucket) => ObjectStorage::with_bucket(store.clone(), bucket, config.storage.store_only_build_result),
            None => ObjectStorage::new(store.clone()),
        });
        let cache = Arc::new(TransformedDocumentCache::new());
        let background = BackgroundExecutor::new(BACKGROUND_CONCURRENCY);
        let activity = ActivityTracker::new(store.clone(), background.clone());
        let auth = Authorization::new(store.clone(), activity.clone());
        let feed = ActivityFeed::new(store.clone(), auth.clone());
        let packages = PackageGraph::new(
            store.clone(),
            config.clone(),
            auth.clone(),
            activity.clone(),
            background.clone(),
            cache.clone(),
        );
        let versions = VersionService::new(
            store.clone(),
            storage.clone(),
            config.clone(),
            auth.clone(),
            activity.clone(),
            cache.clone(),
        );
        let operations = OperationService::new(store.clone(), auth.clone());
        let comparisons = ComparisonService::new(store.clone(), auth.clone());
        let builds = BuildController::new(store.clone(), storage.clone(), config.clone());
        let groups = GroupService::new(
            store.clone(),
            config.clone(),
            auth.clone(),
            activity.clone(),
            cache.clone(),
            builds.clone(),
            background.clone(),
        );
        let exports = ExportService::new(store.clone(), auth.clone(), builds.clone());
        let processor = BuildProcessor::new(store.clone(), builds.clone(), versions.clone(), cache.clone());
        let workers = BuildWorkerPool::new(
            store.clone(),
            processor,
            config.builds.workers,
            Duration::from_millis(config.builds.poll_interval_ms.max(1)),
            Duration::from_secs(config.builds.lease_timeout_sec.max(1)),
        );
        let cleanup = CleanupScheduler::new(
            store.clone(),
            storage.clone(),
            cache.clone(),
            config.clone(),
            background.clone(),
        );
        Self {
            store,
            config,
            storage,
            cache,
            background,
            activity,
            feed,
            auth,
            packages,
            versions,
            operations,
            comparisons,
            groups,
            builds,
            exports,
            workers,
            cleanup,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start build workers and the cleanup schedule.
    pub fn start(&self) -> CatalogResult<Vec<JoinHandle<()>>> {
        let mut handles = self.workers.start(self.shutdown.child_token());
        handles.push(self.cleanup.start(self.shutdown.child_token())?);
        Ok(handles)
    }

    /// Token cancelled when the catalog shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Stop background loops, then give pending background jobs `grace` to
    /// finish.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>, grace: Duration) {
        self.shutdown.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Background loop ended abnormally: {}", e);
            }
        }
        self.background.shutdown(grace).await;
        log::info!("Catalog stopped");
    }
}
